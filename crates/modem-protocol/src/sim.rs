//! Simulated modem hardware
//!
//! Stand-ins for the power pins and the serial link, used by the tests and
//! by bench runs without a modem attached. Timing follows the tokio clock so
//! paused-time tests see the same pulse and boot delays as real hardware.

use crate::at::OK;
use crate::error::ModemError;
use crate::gpio::{PowerKey, StatusLine};
use crate::link::{Connector, FlowControlled, RxConsumer, RxProducer, RxRing, SerialLink};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Shortest power key pulse the modem reacts to
pub const MIN_PULSE: Duration = Duration::from_millis(1000);

/// Delay between releasing the key and the status pin flipping
pub const BOOT_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct PowerModel {
    on: bool,
    responsive: bool,
    pressed_at: Option<Instant>,
    flip_at: Option<Instant>,
    presses: u32,
}

impl PowerModel {
    fn settle(&mut self) {
        if let Some(at) = self.flip_at {
            if Instant::now() >= at {
                self.on = !self.on;
                self.flip_at = None;
            }
        }
    }
}

/// Power key and status pin of a simulated modem.
///
/// Clones share state, so one clone can serve as the key and another as the
/// status line.
#[derive(Debug, Clone)]
pub struct SimulatedPower {
    model: Arc<Mutex<PowerModel>>,
}

impl SimulatedPower {
    /// Modem that toggles after a long enough pulse
    pub fn new(on: bool) -> Self {
        Self::with_response(on, true)
    }

    /// Modem that ignores the power key
    pub fn unresponsive(on: bool) -> Self {
        Self::with_response(on, false)
    }

    fn with_response(on: bool, responsive: bool) -> Self {
        Self {
            model: Arc::new(Mutex::new(PowerModel {
                on,
                responsive,
                pressed_at: None,
                flip_at: None,
                presses: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PowerModel> {
        self.model.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_on(&self) -> bool {
        let mut model = self.lock();
        model.settle();
        model.on
    }

    pub fn is_pressed(&self) -> bool {
        self.lock().pressed_at.is_some()
    }

    /// Number of times the key has been pressed
    pub fn presses(&self) -> u32 {
        self.lock().presses
    }

    /// The modem switches itself off (brown-out, thermal shutdown)
    pub fn cut(&self) {
        let mut model = self.lock();
        model.on = false;
        model.flip_at = None;
    }
}

impl PowerKey for SimulatedPower {
    fn press(&mut self) -> Result<(), ModemError> {
        let mut model = self.lock();
        model.settle();
        model.pressed_at = Some(Instant::now());
        model.presses += 1;
        Ok(())
    }

    fn release(&mut self) -> Result<(), ModemError> {
        let mut model = self.lock();
        model.settle();
        if let Some(pressed_at) = model.pressed_at.take() {
            let now = Instant::now();
            if model.responsive && now.duration_since(pressed_at) >= MIN_PULSE {
                model.flip_at = Some(now + BOOT_DELAY);
            }
        }
        Ok(())
    }
}

impl StatusLine for SimulatedPower {
    fn is_high(&mut self) -> Result<bool, ModemError> {
        Ok(self.is_on())
    }
}

/// Behaviour of the simulated modem's command interpreter
#[derive(Debug, Clone)]
pub struct SimulatedModem {
    /// `AT` probes ignored before the modem locks onto the baud rate
    pub silent_probes: u32,
    /// Never answer anything
    pub unresponsive: bool,
    /// Answer `ATE0` with `ERROR`
    pub reject_echo_disable: bool,
    /// Answer `AT+IFC` with `ERROR`
    pub reject_flow_control: bool,
    /// Echo commands back until `ATE0`
    pub echo: bool,
    /// Lines sent once flow control is configured
    pub boot_lines: Vec<String>,
}

impl Default for SimulatedModem {
    fn default() -> Self {
        Self {
            silent_probes: 0,
            unresponsive: false,
            reject_echo_disable: false,
            reject_flow_control: false,
            echo: true,
            boot_lines: Vec::new(),
        }
    }
}

impl SimulatedModem {
    /// Modem that reports the usual ready lines after the handshake
    pub fn booting() -> Self {
        Self {
            boot_lines: vec![
                "+CPIN: READY".to_string(),
                "Call Ready".to_string(),
                crate::at::SMS_READY.to_string(),
            ],
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct LinkState {
    producer: Option<RxProducer>,
    commands: Vec<String>,
    echo: bool,
    probes: u32,
    flow_control: bool,
    connects: u32,
    fault: Option<ModemError>,
}

impl LinkState {
    fn push(&mut self, bytes: &[u8]) {
        let Some(producer) = self.producer.as_mut() else {
            return;
        };
        for &byte in bytes {
            if producer.push(byte).is_err() {
                warn!("Simulated modem output dropped, receive ring full");
                return;
            }
        }
    }
}

/// Connector producing [`SimulatedLink`]s. Clones share the same modem.
#[derive(Debug, Clone)]
pub struct SimulatedConnector {
    modem: SimulatedModem,
    state: Arc<Mutex<LinkState>>,
}

impl SimulatedConnector {
    pub fn new(modem: SimulatedModem) -> Self {
        Self {
            modem,
            state: Arc::new(Mutex::new(LinkState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed bytes into the receive ring as if the modem sent them
    pub fn inject(&self, bytes: &[u8]) {
        self.lock().push(bytes);
    }

    /// Commands received so far, without line endings
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Break the current link, as a pump stopping with `error` would
    pub fn fail_link(&self, error: ModemError) {
        self.lock().fault = Some(error);
    }

    pub fn flow_control_enabled(&self) -> bool {
        self.lock().flow_control
    }

    /// Number of times a link was opened
    pub fn connects(&self) -> u32 {
        self.lock().connects
    }
}

impl Connector for SimulatedConnector {
    type Link = SimulatedLink;

    async fn connect(&mut self, baud_rate: u32) -> Result<(SimulatedLink, RxConsumer), ModemError> {
        debug!("Simulated link opened at {} baud", baud_rate);
        let (producer, consumer) = RxRing::new().split();

        let mut state = self.lock();
        state.producer = Some(producer);
        state.echo = self.modem.echo;
        state.probes = 0;
        state.flow_control = false;
        state.connects += 1;
        state.fault = None;
        drop(state);

        Ok((
            SimulatedLink {
                modem: self.modem.clone(),
                state: Arc::clone(&self.state),
            },
            consumer,
        ))
    }
}

/// Outbound half of a simulated link; replies land in the receive ring
#[derive(Debug, Clone)]
pub struct SimulatedLink {
    modem: SimulatedModem,
    state: Arc<Mutex<LinkState>>,
}

impl SimulatedLink {
    fn respond(&self, state: &mut LinkState, command: &str) -> Vec<u8> {
        if self.modem.unresponsive {
            return Vec::new();
        }
        if command == "AT" {
            state.probes += 1;
            if state.probes <= self.modem.silent_probes {
                return Vec::new();
            }
        }

        let mut out = Vec::new();
        if state.echo {
            out.extend_from_slice(command.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        let accepted = match command {
            "AT" => true,
            "ATE0" if self.modem.reject_echo_disable => false,
            "ATE0" => {
                state.echo = false;
                true
            }
            "ATE1" => {
                state.echo = true;
                true
            }
            "AT+IFC=2,2" => !self.modem.reject_flow_control,
            _ => false,
        };

        if accepted {
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(OK.as_bytes());
            out.extend_from_slice(b"\n");
        } else {
            out.extend_from_slice(b"\r\nERROR\r\n");
        }

        if accepted && command == "AT+IFC=2,2" {
            for line in &self.modem.boot_lines {
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(line.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }
        out
    }
}

impl SerialLink for SimulatedLink {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ModemError> {
        let text = String::from_utf8_lossy(bytes);
        let command = text.trim_end_matches(['\r', '\n']);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(fault) = &state.fault {
            return Err(fault.clone());
        }
        state.commands.push(command.to_string());
        let reply = self.respond(&mut state, command);
        state.push(&reply);
        Ok(())
    }

    async fn enable_hardware_flow_control(&mut self) -> Result<(), ModemError> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).flow_control = true;
        Ok(())
    }

    fn health(&self) -> Result<(), ModemError> {
        match &self.state.lock().unwrap_or_else(PoisonError::into_inner).fault {
            Some(fault) => Err(fault.clone()),
            None => Ok(()),
        }
    }
}

/// In-memory port for exercising the serial pump
#[derive(Debug)]
pub struct LoopbackPort {
    io: DuplexStream,
    flow_control: Arc<AtomicBool>,
}

impl LoopbackPort {
    pub fn new(io: DuplexStream) -> Self {
        Self {
            io,
            flow_control: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag set once hardware flow control is enabled
    pub fn flow_control_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flow_control)
    }
}

impl FlowControlled for LoopbackPort {
    fn enable_hardware_flow_control(&mut self) -> Result<(), ModemError> {
        self.flow_control.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl AsyncRead for LoopbackPort {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for LoopbackPort {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}
