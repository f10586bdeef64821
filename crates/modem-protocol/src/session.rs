//! Modem session state machine
//!
//! Owns the power sequencer, the connector and, once the link is up, the
//! command channel. `start()` walks the modem from off to a completed
//! handshake; `run()` then services unsolicited lines and periodic
//! connection maintenance until something goes wrong.

use crate::command::CommandChannel;
use crate::config::ModemConfig;
use crate::error::ModemError;
use crate::gpio::{PowerKey, StatusLine};
use crate::handshake::{HandshakeReport, HandshakeSequencer};
use crate::link::{Connector, SerialLink};
use crate::notification::Notification;
use crate::power::{PowerSequencer, PowerState};
use std::fmt;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Lifecycle of a [`ModemSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Off,
    PoweringOn,
    LinkOpen,
    Handshaking,
    Ready,
    GprsConnecting,
    GprsConnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Off => "off",
            SessionState::PoweringOn => "powering_on",
            SessionState::LinkOpen => "link_open",
            SessionState::Handshaking => "handshaking",
            SessionState::Ready => "ready",
            SessionState::GprsConnecting => "gprs_connecting",
            SessionState::GprsConnected => "gprs_connected",
        };
        f.write_str(name)
    }
}

pub struct ModemSession<K, S, C: Connector> {
    power: PowerSequencer<K, S>,
    connector: C,
    handshake: HandshakeSequencer,
    channel: Option<CommandChannel<C::Link>>,
    config: ModemConfig,
    state: SessionState,
    gsm_initialized: bool,
    gprs_connected: bool,
    last_maintenance: Option<Instant>,
}

impl<K, S, C> ModemSession<K, S, C>
where
    K: PowerKey,
    S: StatusLine,
    C: Connector,
{
    pub fn new(key: K, status: S, connector: C, config: ModemConfig) -> Self {
        Self {
            power: PowerSequencer::new(key, status, config.power.clone()),
            connector,
            handshake: HandshakeSequencer::new(config.handshake.clone()),
            channel: None,
            config,
            state: SessionState::Off,
            gsm_initialized: false,
            gprs_connected: false,
            last_maintenance: None,
        }
    }

    /// Power the modem on, open the link and run the handshake.
    ///
    /// On failure the session is back in [`SessionState::Off`] and can be
    /// started again.
    pub async fn start(&mut self) -> Result<HandshakeReport, ModemError> {
        if self.state != SessionState::Off {
            return Err(ModemError::InvalidState {
                expected: SessionState::Off,
                actual: self.state,
            });
        }

        match self.bring_up().await {
            Ok(report) => {
                self.transition(SessionState::Ready);
                Ok(report)
            }
            Err(e) => {
                warn!("Modem start failed in state {}: {}", self.state, e);
                self.mark_off();
                Err(e)
            }
        }
    }

    async fn bring_up(&mut self) -> Result<HandshakeReport, ModemError> {
        self.transition(SessionState::PoweringOn);
        self.power.ensure_state(PowerState::On).await?;

        self.transition(SessionState::LinkOpen);
        let (link, rx) = self.connector.connect(self.config.link.baud_rate).await?;
        let channel = self
            .channel
            .insert(CommandChannel::new(link, rx, self.config.link.rx_poll_interval()));

        info!("Session state {} -> {}", self.state, SessionState::Handshaking);
        self.state = SessionState::Handshaking;
        self.handshake.run(channel).await
    }

    /// Drain complete lines from the receive buffer and act on them
    pub fn service(&mut self) -> Result<(), ModemError> {
        let channel = self.channel.as_mut().ok_or(ModemError::InvalidState {
            expected: SessionState::Ready,
            actual: self.state,
        })?;

        let mut power_down = None;
        while channel.rx().has_string() {
            let raw = channel.rx_mut().pop_string();
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            match Notification::parse(line) {
                Notification::SmsReady => {
                    if !self.gsm_initialized {
                        info!("GSM initialized");
                        self.gsm_initialized = true;
                    }
                }
                Notification::CallReady | Notification::SimReady => info!("Modem: {}", line),
                Notification::PowerDown(reason) => {
                    power_down = Some(reason);
                    break;
                }
                Notification::Other(other) => debug!("Unhandled line {:?}", other),
            }
        }
        let health = channel.link().health();

        if let Some(reason) = power_down {
            warn!("Modem powered down: {}", reason);
            self.mark_off();
            return Err(ModemError::UnexpectedPowerDown(reason));
        }
        if let Err(e) = health {
            warn!("Serial link lost: {}", e);
            self.mark_off();
            return Err(e);
        }
        Ok(())
    }

    /// Periodic connection maintenance, at most once per maintenance interval
    pub async fn maintain(&mut self, now: Instant) -> Result<(), ModemError> {
        if !self.gsm_initialized {
            return Ok(());
        }
        if let Some(last) = self.last_maintenance {
            if now.saturating_duration_since(last) < self.config.session.maintenance_interval() {
                return Ok(());
            }
        }
        self.last_maintenance = Some(now);
        debug!("Connection maintenance");

        if self.config.session.gprs_enabled && !self.gprs_connected {
            match self.connect_gprs().await {
                Err(ModemError::Unsupported(what)) => warn!("Skipping {}", what),
                other => other?,
            }
        }
        Ok(())
    }

    /// Bring up the GPRS bearer
    pub async fn connect_gprs(&mut self) -> Result<(), ModemError> {
        Err(ModemError::Unsupported("GPRS bring-up"))
    }

    /// Service the link until an error ends the session
    pub async fn run(&mut self) -> Result<(), ModemError> {
        let mut ticker = interval(self.config.session.service_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Session running");
        loop {
            ticker.tick().await;
            self.service()?;
            self.maintain(Instant::now()).await?;
        }
    }

    /// Close the link and switch the modem off
    pub async fn stop(&mut self) -> Result<(), ModemError> {
        info!("Stopping modem session");
        self.mark_off();
        self.power.ensure_state(PowerState::Off).await
    }

    /// Stop then start again
    pub async fn reset(&mut self) -> Result<HandshakeReport, ModemError> {
        self.stop().await?;
        self.start().await
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_gsm_initialized(&self) -> bool {
        self.gsm_initialized
    }

    pub fn is_gprs_connected(&self) -> bool {
        self.gprs_connected
    }

    pub fn last_maintenance(&self) -> Option<Instant> {
        self.last_maintenance
    }

    pub fn power_state(&mut self) -> Result<PowerState, ModemError> {
        self.power.query_power_state()
    }

    /// Command channel of the open link
    pub fn channel_mut(&mut self) -> Option<&mut CommandChannel<C::Link>> {
        self.channel.as_mut()
    }

    fn transition(&mut self, next: SessionState) {
        info!("Session state {} -> {}", self.state, next);
        self.state = next;
    }

    fn mark_off(&mut self) {
        self.channel = None;
        self.state = SessionState::Off;
        self.gsm_initialized = false;
        self.gprs_connected = false;
        self.last_maintenance = None;
    }
}
