//! Modem Supervisor - Main Entry Point

use anyhow::Context;
use clap::Parser;
use modem_protocol::sim::{SimulatedConnector, SimulatedModem, SimulatedPower};
use modem_protocol::{Connector, ControlLines, ModemConfig, ModemSession, PowerKey, SerialConnector, StatusLine};
use modem_supervisor::{init_logging, spawn_passthrough, supervise, RecoveryPolicy, Settings};
use std::path::PathBuf;
use tracing::{info, warn};

/// Cellular modem supervisor
#[derive(Parser, Debug)]
#[command(name = "modem-supervisor", version, about)]
struct Cli {
    /// Settings file (TOML); missing files are skipped
    #[arg(long, default_value = "modem.toml")]
    config: PathBuf,

    /// Run against a simulated modem instead of serial hardware
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Forward stdin lines to the modem
    #[arg(long, default_value_t = false)]
    passthrough: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;
    settings.passthrough |= cli.passthrough;
    init_logging(&settings.logging)?;

    info!("=== Modem Supervisor v{} ===", env!("CARGO_PKG_VERSION"));

    if cli.simulate {
        info!("Running against a simulated modem");
        if settings.passthrough {
            warn!("Passthrough is not available in simulation mode");
        }
        let power = SimulatedPower::new(false);
        let connector = SimulatedConnector::new(SimulatedModem::booting());
        let config = ModemConfig {
            link: settings.link.clone(),
            ..ModemConfig::fast()
        };
        let session = ModemSession::new(power.clone(), power, connector, config);
        return run(session, &settings.recovery).await;
    }

    info!("Modem on {} (control lines on {})", settings.device, settings.control_device);
    let key = ControlLines::open(&settings.control_device)?;
    let status = key.try_clone()?;
    let connector = SerialConnector::new(&settings.device, settings.link.clone());
    if settings.passthrough {
        info!("Forwarding stdin to the modem");
        spawn_passthrough(tokio::io::stdin(), connector.subscribe());
    }

    let session = ModemSession::new(key, status, connector, settings.modem_config());
    run(session, &settings.recovery).await
}

async fn run<K, S, C>(mut session: ModemSession<K, S, C>, policy: &RecoveryPolicy) -> anyhow::Result<()>
where
    K: PowerKey,
    S: StatusLine,
    C: Connector,
{
    let outcome = tokio::select! {
        result = supervise(&mut session, policy) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
            Ok(())
        }
    };

    if let Err(e) = session.stop().await {
        warn!("Could not switch modem off: {}", e);
    }
    outcome?;
    Ok(())
}
