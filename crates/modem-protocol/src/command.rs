//! Command/response exchange over the serial link

use crate::at::LINE_ENDING;
use crate::error::ModemError;
use crate::link::{RxConsumer, SerialLink};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// One command with its expected reply, timeout and attempt budget
#[derive(Debug, Clone)]
pub struct CommandExchange<'a> {
    pub command: &'a str,
    pub expected: &'a str,
    pub timeout: Duration,
    pub attempts: u32,
}

impl<'a> CommandExchange<'a> {
    /// Single-attempt exchange
    pub fn once(command: &'a str, expected: &'a str, timeout: Duration) -> Self {
        Self {
            command,
            expected,
            timeout,
            attempts: 1,
        }
    }

    /// Retry the exchange up to `attempts` times
    pub fn retries(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// Writes commands to the link and scans the receive ring for replies
pub struct CommandChannel<L> {
    link: L,
    rx: RxConsumer,
    poll_interval: Duration,
}

impl<L: SerialLink> CommandChannel<L> {
    pub fn new(link: L, rx: RxConsumer, poll_interval: Duration) -> Self {
        Self {
            link,
            rx,
            poll_interval,
        }
    }

    /// Write `command` followed by CRLF
    pub async fn send(&mut self, command: &str) -> Result<(), ModemError> {
        debug!(">> {}", command);
        let mut frame = Vec::with_capacity(command.len() + LINE_ENDING.len());
        frame.extend_from_slice(command.as_bytes());
        frame.extend_from_slice(LINE_ENDING.as_bytes());
        self.link.write_all(&frame).await
    }

    /// Send `command` and wait up to `timeout` for `expected` to show up.
    ///
    /// `Ok(false)` means the reply did not arrive in time; only link
    /// failures are errors.
    pub async fn send_and_await(
        &mut self,
        command: &str,
        expected: &str,
        timeout: Duration,
    ) -> Result<bool, ModemError> {
        self.send(command).await?;
        Ok(self.await_response(expected, timeout).await)
    }

    /// Consume received bytes until `expected` has been read or `timeout`
    /// elapses. Bytes after the match stay in the ring.
    pub async fn await_response(&mut self, expected: &str, timeout: Duration) -> bool {
        let expected = expected.as_bytes();
        if expected.is_empty() {
            return true;
        }

        let deadline = Instant::now() + timeout;
        let mut window: VecDeque<u8> = VecDeque::with_capacity(expected.len());

        loop {
            while let Some(byte) = self.rx.pop() {
                if window.len() == expected.len() {
                    window.pop_front();
                }
                window.push_back(byte);
                if window.iter().eq(expected.iter()) {
                    debug!("<< matched {:?}", String::from_utf8_lossy(expected));
                    return true;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Run `exchange`, retrying on timeout. Returns the attempt that succeeded.
    pub async fn exchange(&mut self, exchange: &CommandExchange<'_>) -> Result<u32, ModemError> {
        let attempts = exchange.attempts.max(1);

        for attempt in 1..=attempts {
            if self
                .send_and_await(exchange.command, exchange.expected, exchange.timeout)
                .await?
            {
                return Ok(attempt);
            }
            if attempt < attempts {
                warn!(
                    "No {:?} after {} (attempt {}/{})",
                    exchange.expected, exchange.command, attempt, attempts
                );
            }
        }

        Err(ModemError::CommandTimeout {
            command: exchange.command.to_string(),
            expected: exchange.expected.to_string(),
            timeout_ms: saturating_millis(exchange.timeout),
            attempts,
        })
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn rx(&self) -> &RxConsumer {
        &self.rx
    }

    pub fn rx_mut(&mut self) -> &mut RxConsumer {
        &mut self.rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::at::OK;
    use crate::sim::{SimulatedConnector, SimulatedModem};
    use crate::link::Connector;

    async fn channel(modem: SimulatedModem) -> (CommandChannel<crate::sim::SimulatedLink>, SimulatedConnector) {
        let mut connector = SimulatedConnector::new(modem);
        let (link, rx) = connector.connect(115_200).await.unwrap();
        (CommandChannel::new(link, rx, Duration::from_millis(5)), connector)
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_appends_crlf() {
        let (mut channel, connector) = channel(SimulatedModem::default()).await;
        channel.send("ATI").await.unwrap();
        assert_eq!(connector.commands(), vec!["ATI".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_await_matches_ok() {
        let (mut channel, _connector) = channel(SimulatedModem::default()).await;
        assert!(channel
            .send_and_await("AT", OK, Duration::from_millis(100))
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_leaves_following_bytes() {
        let (mut channel, connector) = channel(SimulatedModem::default()).await;
        connector.inject(b"junk OK\r\nSMS Ready\r\n");

        assert!(channel.await_response(OK, Duration::from_millis(10)).await);
        assert!(channel.rx().has_string());
        assert_eq!(channel.rx_mut().pop_string(), "SMS Ready");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_consumes_everything() {
        let (mut channel, connector) = channel(SimulatedModem::default()).await;
        connector.inject(b"ERROR\r\n");

        let started = Instant::now();
        assert!(!channel.await_response(OK, Duration::from_millis(250)).await);
        assert_eq!(started.elapsed(), Duration::from_millis(250));
        assert!(channel.rx().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_within_timeout() {
        let (mut channel, connector) = channel(SimulatedModem::default()).await;
        let injector = connector.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(40)).await;
            injector.inject(b"O");
            sleep(Duration::from_millis(10)).await;
            injector.inject(b"K\r\n");
        });

        assert!(channel.await_response(OK, Duration::from_millis(100)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_counts_attempts() {
        let modem = SimulatedModem {
            silent_probes: 2,
            ..Default::default()
        };
        let (mut channel, _connector) = channel(modem).await;

        let exchange = CommandExchange::once("AT", OK, Duration::from_millis(100)).retries(5);
        assert_eq!(channel.exchange(&exchange).await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_exhausts_budget() {
        let modem = SimulatedModem {
            unresponsive: true,
            ..Default::default()
        };
        let (mut channel, connector) = channel(modem).await;

        let exchange = CommandExchange::once("ATE0", OK, Duration::from_millis(100)).retries(3);
        let err = channel.exchange(&exchange).await.unwrap_err();
        assert!(matches!(
            err,
            ModemError::CommandTimeout { attempts: 3, timeout_ms: 100, .. }
        ));
        assert_eq!(connector.commands().len(), 3);
    }

    #[test]
    fn test_timeout_millis_saturate() {
        assert_eq!(saturating_millis(Duration::from_millis(250)), 250);
        assert_eq!(saturating_millis(Duration::MAX), u64::MAX);
    }
}
