//! Power key sequencing
//!
//! The modem toggles between on and off each time its power key is held low
//! for about a second. The status pin confirms the transition.

use crate::config::PowerConfig;
use crate::error::ModemError;
use crate::gpio::{PowerKey, StatusLine};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::sleep;
use tracing::{debug, error, info};

/// Modem power state as reported by the status pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Off,
    On,
}

impl From<bool> for PowerState {
    fn from(high: bool) -> Self {
        if high {
            PowerState::On
        } else {
            PowerState::Off
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::Off => f.write_str("off"),
            PowerState::On => f.write_str("on"),
        }
    }
}

/// Drives the power key and confirms transitions on the status pin
pub struct PowerSequencer<K, S> {
    key: K,
    status: S,
    config: PowerConfig,
}

impl<K: PowerKey, S: StatusLine> PowerSequencer<K, S> {
    pub fn new(key: K, status: S, config: PowerConfig) -> Self {
        Self { key, status, config }
    }

    /// Read the status pin
    pub fn query_power_state(&mut self) -> Result<PowerState, ModemError> {
        Ok(PowerState::from(self.status.is_high()?))
    }

    /// Pulse the power key and wait for the status pin to flip.
    ///
    /// Returns the new state, or [`ModemError::PowerToggleTimeout`] once the
    /// poll budget is spent without a change.
    pub async fn toggle(&mut self) -> Result<PowerState, ModemError> {
        let start = self.query_power_state()?;
        match start {
            PowerState::On => info!("Modem is on - turning off"),
            PowerState::Off => info!("Modem is off - turning on"),
        }

        self.key.press()?;
        sleep(self.config.pulse()).await;
        self.key.release()?;

        for attempt in 1..=self.config.poll_attempts {
            sleep(self.config.poll_interval()).await;
            let now = self.query_power_state()?;
            if now != start {
                info!("Modem is now {} (poll {})", now, attempt);
                return Ok(now);
            }
        }

        error!(
            "Modem did not respond to power key, still {} after {} polls",
            start, self.config.poll_attempts
        );
        Err(ModemError::PowerToggleTimeout {
            from: start,
            attempts: self.config.poll_attempts,
        })
    }

    /// Bring the modem into `target`.
    ///
    /// Switching on from an already-on modem power-cycles it first so the
    /// session always starts from a cold boot.
    pub async fn ensure_state(&mut self, target: PowerState) -> Result<(), ModemError> {
        let current = self.query_power_state()?;

        match (current, target) {
            (PowerState::On, PowerState::On) => {
                info!("Modem already on - resetting");
                self.toggle().await?;
                sleep(self.config.settle()).await;
                self.expect(PowerState::Off)?;
                self.toggle().await?;
            }
            (PowerState::Off, PowerState::Off) => {
                debug!("Modem already off");
            }
            _ => {
                self.toggle().await?;
            }
        }

        self.expect(target)
    }

    fn expect(&mut self, expected: PowerState) -> Result<(), ModemError> {
        let actual = self.query_power_state()?;
        if actual != expected {
            error!("Modem power state is {}, expected {}", actual, expected);
            return Err(ModemError::PowerStateMismatch { expected, actual });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedPower;
    use tokio::time::{Duration, Instant};

    fn sequencer(power: &SimulatedPower) -> PowerSequencer<SimulatedPower, SimulatedPower> {
        PowerSequencer::new(power.clone(), power.clone(), PowerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_turns_on() {
        let power = SimulatedPower::new(false);
        let mut seq = sequencer(&power);

        assert_eq!(seq.query_power_state().unwrap(), PowerState::Off);
        assert_eq!(seq.toggle().await.unwrap(), PowerState::On);
        assert!(power.is_on());
        assert_eq!(power.presses(), 1);
        assert!(!power.is_pressed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_stuck_modem_is_bounded() {
        let power = SimulatedPower::unresponsive(false);
        let mut seq = sequencer(&power);

        let started = Instant::now();
        let err = seq.toggle().await.unwrap_err();
        assert!(matches!(
            err,
            ModemError::PowerToggleTimeout {
                from: PowerState::Off,
                attempts: 20
            }
        ));
        // 1s pulse + 20 polls of 100ms
        assert_eq!(started.elapsed(), Duration::from_millis(3000));
        assert!(!power.is_pressed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_pulse_is_ignored_by_modem() {
        let power = SimulatedPower::new(false);
        let mut seq = PowerSequencer::new(
            power.clone(),
            power.clone(),
            PowerConfig {
                pulse_ms: 200,
                poll_attempts: 3,
                ..Default::default()
            },
        );
        assert!(seq.toggle().await.is_err());
        assert!(!power.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_on_resets_running_modem() {
        let power = SimulatedPower::new(true);
        let mut seq = sequencer(&power);

        seq.ensure_state(PowerState::On).await.unwrap();
        assert!(power.is_on());
        assert_eq!(power.presses(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_on_from_off_toggles_once() {
        let power = SimulatedPower::new(false);
        let mut seq = sequencer(&power);

        seq.ensure_state(PowerState::On).await.unwrap();
        assert_eq!(power.presses(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_off_is_idempotent() {
        let power = SimulatedPower::new(false);
        let mut seq = sequencer(&power);

        seq.ensure_state(PowerState::Off).await.unwrap();
        assert_eq!(power.presses(), 0);

        let power = SimulatedPower::new(true);
        let mut seq = sequencer(&power);
        seq.ensure_state(PowerState::Off).await.unwrap();
        assert_eq!(power.presses(), 1);
        assert!(!power.is_on());
    }
}
