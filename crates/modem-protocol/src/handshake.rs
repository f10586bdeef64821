//! AT handshake
//!
//! After power-on the modem autobauds on the first `AT` it can decode, so the
//! probe is repeated until it answers. Echo is then disabled and RTS/CTS flow
//! control is configured on both ends.

use crate::at::OK;
use crate::command::{CommandChannel, CommandExchange};
use crate::config::HandshakeConfig;
use crate::error::ModemError;
use crate::link::SerialLink;
use std::fmt;
use tracing::{error, info};

/// Handshake phase, reported when a step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    BaudDetection,
    EchoDisable,
    FlowControl,
}

impl HandshakeStep {
    /// Command sent during this step
    pub fn command(&self) -> &'static str {
        match self {
            HandshakeStep::BaudDetection => "AT",
            HandshakeStep::EchoDisable => "ATE0",
            HandshakeStep::FlowControl => "AT+IFC=2,2",
        }
    }
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeStep::BaudDetection => "baud detection",
            HandshakeStep::EchoDisable => "echo disable",
            HandshakeStep::FlowControl => "flow control",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeReport {
    /// `AT` probes sent before the modem answered
    pub baud_attempts: u32,
}

/// Runs the three handshake steps in order
#[derive(Debug, Clone, Default)]
pub struct HandshakeSequencer {
    config: HandshakeConfig,
}

impl HandshakeSequencer {
    pub fn new(config: HandshakeConfig) -> Self {
        Self { config }
    }

    pub async fn run<L: SerialLink>(&self, channel: &mut CommandChannel<L>) -> Result<HandshakeReport, ModemError> {
        let baud_attempts = self
            .step(
                channel,
                HandshakeStep::BaudDetection,
                CommandExchange::once(HandshakeStep::BaudDetection.command(), OK, self.config.baud_timeout())
                    .retries(self.config.baud_attempts),
            )
            .await?;
        info!("Modem answered after {} probe(s)", baud_attempts);

        self.step(
            channel,
            HandshakeStep::EchoDisable,
            CommandExchange::once(HandshakeStep::EchoDisable.command(), OK, self.config.command_timeout()),
        )
        .await?;

        channel.link_mut().enable_hardware_flow_control().await?;
        self.step(
            channel,
            HandshakeStep::FlowControl,
            CommandExchange::once(HandshakeStep::FlowControl.command(), OK, self.config.command_timeout()),
        )
        .await?;

        info!("Handshake complete");
        Ok(HandshakeReport { baud_attempts })
    }

    async fn step<L: SerialLink>(
        &self,
        channel: &mut CommandChannel<L>,
        step: HandshakeStep,
        exchange: CommandExchange<'_>,
    ) -> Result<u32, ModemError> {
        match channel.exchange(&exchange).await {
            Ok(attempt) => Ok(attempt),
            Err(ModemError::CommandTimeout { attempts, .. }) => {
                error!("Handshake {} failed after {} attempt(s)", step, attempts);
                Err(ModemError::Handshake { step, attempts })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Connector;
    use crate::sim::{SimulatedConnector, SimulatedLink, SimulatedModem};
    use std::time::Duration;
    use tokio::time::Instant;

    async fn run(modem: SimulatedModem) -> (Result<HandshakeReport, ModemError>, SimulatedConnector) {
        let mut connector = SimulatedConnector::new(modem);
        let (link, rx) = connector.connect(115_200).await.unwrap();
        let mut channel: CommandChannel<SimulatedLink> = CommandChannel::new(link, rx, Duration::from_millis(5));
        let result = HandshakeSequencer::default().run(&mut channel).await;
        (result, connector)
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_sends_steps_in_order() {
        let (result, connector) = run(SimulatedModem::default()).await;

        assert_eq!(result.unwrap(), HandshakeReport { baud_attempts: 1 });
        assert_eq!(connector.commands(), vec!["AT", "ATE0", "AT+IFC=2,2"]);
        assert!(connector.flow_control_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_baud_detection_succeeds_on_every_allowed_attempt() {
        for k in 1..=11 {
            let modem = SimulatedModem {
                silent_probes: k - 1,
                ..Default::default()
            };
            let (result, _) = run(modem).await;
            assert_eq!(result.unwrap().baud_attempts, k, "answer on probe {}", k);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_baud_detection_gives_up_after_eleven_probes() {
        let modem = SimulatedModem {
            silent_probes: 11,
            ..Default::default()
        };
        let started = Instant::now();
        let (result, connector) = run(modem).await;

        assert!(matches!(
            result,
            Err(ModemError::Handshake {
                step: HandshakeStep::BaudDetection,
                attempts: 11
            })
        ));
        assert_eq!(started.elapsed(), Duration::from_millis(1100));
        assert_eq!(connector.commands().len(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_disable_failure_stops_handshake() {
        let modem = SimulatedModem {
            reject_echo_disable: true,
            ..Default::default()
        };
        let (result, connector) = run(modem).await;

        assert!(matches!(
            result,
            Err(ModemError::Handshake {
                step: HandshakeStep::EchoDisable,
                attempts: 1
            })
        ));
        assert_eq!(connector.commands(), vec!["AT", "ATE0"]);
        assert!(!connector.flow_control_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow_control_rejection_names_step() {
        let modem = SimulatedModem {
            reject_flow_control: true,
            ..Default::default()
        };
        let (result, _) = run(modem).await;
        assert!(matches!(
            result,
            Err(ModemError::Handshake {
                step: HandshakeStep::FlowControl,
                attempts: 1
            })
        ));
    }

    #[test]
    fn test_step_display() {
        assert_eq!(HandshakeStep::EchoDisable.to_string(), "echo disable");
        assert_eq!(HandshakeStep::FlowControl.command(), "AT+IFC=2,2");
    }
}
