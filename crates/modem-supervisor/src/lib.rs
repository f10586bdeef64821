//! Cellular Modem Supervisor
//!
//! Runs a [`ModemSession`] under a recovery policy, installs logging and
//! optionally forwards console input to the modem for manual AT work.

mod settings;

pub use settings::{LoggingSettings, RecoveryPolicy, Settings, ENV_PREFIX};

use modem_protocol::{at, Connector, LinkHandle, ModemError, ModemSession, PowerKey, SerialLink, StatusLine};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Supervisor errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error(transparent)]
    Modem(#[from] ModemError),

    #[error("Giving up after {restarts} restart(s)")]
    RestartsExhausted {
        restarts: u32,
        #[source]
        last: ModemError,
    },
}

/// Install the global tracing subscriber
pub fn init_logging(settings: &LoggingSettings) -> Result<(), SupervisorError> {
    let level: Level = settings
        .level
        .parse()
        .map_err(|_| SupervisorError::Logging(format!("unknown level {:?}", settings.level)))?;

    let installed = if settings.json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    };

    installed.map_err(|e| SupervisorError::Logging(e.to_string()))
}

/// Start the session and keep it running according to `policy`.
///
/// Returns only when the policy gives up or an error is not recoverable.
pub async fn supervise<K, S, C>(
    session: &mut ModemSession<K, S, C>,
    policy: &RecoveryPolicy,
) -> Result<(), SupervisorError>
where
    K: PowerKey,
    S: StatusLine,
    C: Connector,
{
    let mut failed_starts = 0u32;

    loop {
        let err = match session.start().await {
            Ok(report) => {
                failed_starts = 0;
                info!("Modem ready (baud locked after {} probe(s))", report.baud_attempts);
                match session.run().await {
                    Ok(()) => return Ok(()),
                    Err(e) => e,
                }
            }
            Err(e) => {
                failed_starts += 1;
                e
            }
        };

        error!("Modem session failed: {}", err);
        if !err.is_recoverable() {
            return Err(err.into());
        }

        match policy {
            RecoveryPolicy::Halt => return Err(err.into()),
            RecoveryPolicy::Restart { max_restarts, .. } => {
                if failed_starts > *max_restarts {
                    return Err(SupervisorError::RestartsExhausted {
                        restarts: *max_restarts,
                        last: err,
                    });
                }

                if let Err(e) = session.stop().await {
                    warn!("Could not switch modem off before restart: {}", e);
                }
                let backoff = policy.backoff().unwrap_or_default();
                warn!("Restarting modem session in {:?}", backoff);
                sleep(backoff).await;
            }
        }
    }
}

/// Forward lines read from `input` to whichever link is current.
///
/// Each line is sent with the AT line ending. Lines arriving while no link
/// is open are dropped.
pub fn spawn_passthrough<R>(input: R, mut links: watch::Receiver<Option<LinkHandle>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(input).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("Passthrough input closed");
                    return;
                }
                Err(e) => {
                    warn!("Passthrough input failed: {}", e);
                    return;
                }
            };

            let current = links.borrow_and_update().clone();
            let Some(mut link) = current else {
                warn!("No modem link open, dropping {:?}", line);
                continue;
            };

            let mut frame = line.into_bytes();
            frame.extend_from_slice(at::LINE_ENDING.as_bytes());
            if let Err(e) = link.write_all(&frame).await {
                warn!("Passthrough write failed: {}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use modem_protocol::sim::{LoopbackPort, SimulatedConnector, SimulatedModem, SimulatedPower};
    use modem_protocol::{spawn_pump, LinkConfig, ModemConfig, RxRing, SessionState};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    type SimSession = ModemSession<SimulatedPower, SimulatedPower, SimulatedConnector>;

    fn session(power: &SimulatedPower, modem: SimulatedModem) -> (SimSession, SimulatedConnector) {
        let connector = SimulatedConnector::new(modem);
        let session = ModemSession::new(power.clone(), power.clone(), connector.clone(), ModemConfig::default());
        (session, connector)
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_policy_returns_first_error() {
        let power = SimulatedPower::unresponsive(false);
        let (mut session, _) = session(&power, SimulatedModem::default());

        let err = supervise(&mut session, &RecoveryPolicy::Halt).await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Modem(ModemError::PowerToggleTimeout { .. })
        ));
        assert_eq!(power.presses(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_policy_is_bounded() {
        let power = SimulatedPower::new(false);
        let modem = SimulatedModem {
            unresponsive: true,
            ..Default::default()
        };
        let (mut session, connector) = session(&power, modem);
        let policy = RecoveryPolicy::Restart {
            max_restarts: 2,
            backoff_ms: 100,
        };

        let err = supervise(&mut session, &policy).await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::RestartsExhausted {
                restarts: 2,
                last: ModemError::Handshake { .. }
            }
        ));
        assert_eq!(connector.connects(), 3);
        assert_eq!(session.state(), SessionState::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_waits_for_policy_backoff() {
        let power = SimulatedPower::new(false);
        let modem = SimulatedModem {
            unresponsive: true,
            ..Default::default()
        };
        let (mut session, connector) = session(&power, modem);
        let policy = RecoveryPolicy::Restart {
            max_restarts: 1,
            backoff_ms: 600_000,
        };

        let started = tokio::time::Instant::now();
        let err = supervise(&mut session, &policy).await.unwrap_err();
        assert!(matches!(err, SupervisorError::RestartsExhausted { restarts: 1, .. }));
        assert_eq!(connector.connects(), 2);
        assert!(started.elapsed() >= Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_power_down() {
        let power = SimulatedPower::new(false);
        let (mut session, connector) = session(&power, SimulatedModem::booting());
        let policy = RecoveryPolicy::Restart {
            max_restarts: 1,
            backoff_ms: 100,
        };

        let injector = connector.clone();
        let cutter = power.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            cutter.cut();
            injector.inject(b"\r\nNORMAL POWER DOWN\r\n");
        });

        let supervised = tokio::time::timeout(Duration::from_secs(30), supervise(&mut session, &policy)).await;
        assert!(supervised.is_err(), "supervisor keeps the session alive");
        assert_eq!(connector.connects(), 2);
        assert_eq!(session.state(), SessionState::Ready);
        assert!(power.is_on());
    }

    #[tokio::test]
    async fn test_passthrough_forwards_lines() {
        let (port, mut modem) = duplex(256);
        let (producer, _consumer) = RxRing::new().split();
        let (link, _pump) = spawn_pump(LoopbackPort::new(port), producer, &LinkConfig::default());
        let (_current, links) = watch::channel(Some(link));

        let (mut console, input) = duplex(64);
        let task = spawn_passthrough(input, links);

        console.write_all(b"AT+CSQ\n").await.unwrap();
        let mut sent = [0u8; 8];
        modem.read_exact(&mut sent).await.unwrap();
        assert_eq!(&sent, b"AT+CSQ\r\n");

        drop(console);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_passthrough_without_link_drops_lines() {
        let (_current, links) = watch::channel(None);
        let (mut console, input) = duplex(64);
        let task = spawn_passthrough(input, links);

        console.write_all(b"AT\n").await.unwrap();
        drop(console);
        task.await.unwrap();
    }

    #[test]
    fn test_bad_log_level_is_rejected() {
        let settings = LoggingSettings {
            level: "loud".to_string(),
            json: false,
        };
        assert!(matches!(init_logging(&settings), Err(SupervisorError::Logging(_))));
    }
}
