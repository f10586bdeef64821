//! Serial link to the modem
//!
//! A pump task owns the serial port. It is the only producer into the
//! receive ring, standing in for the UART receive interrupt, and it executes
//! write requests queued through a [`LinkHandle`]. The session keeps the
//! ring's consumer half and reads responses and status lines from it.

use crate::config::{LinkConfig, OverflowPolicy};
use crate::error::ModemError;
use ring_buffer::{ByteRing, Consumer, Producer};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_serial::{FlowControl, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, warn};

/// Receive ring size in bytes
pub const RX_BUFFER_SIZE: usize = 512;

pub type RxRing = ByteRing<RX_BUFFER_SIZE>;
pub type RxProducer = Producer<u8, RX_BUFFER_SIZE>;
pub type RxConsumer = Consumer<u8, RX_BUFFER_SIZE>;

/// Outbound half of a serial link
#[allow(async_fn_in_trait)]
pub trait SerialLink {
    /// Write raw bytes to the modem
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ModemError>;

    /// Switch the transport to RTS/CTS handshaking
    async fn enable_hardware_flow_control(&mut self) -> Result<(), ModemError>;

    /// Error the receive side has stopped with, if any
    fn health(&self) -> Result<(), ModemError>;
}

/// Opens a serial link and hands back its outbound half and receive ring
#[allow(async_fn_in_trait)]
pub trait Connector {
    type Link: SerialLink;

    async fn connect(&mut self, baud_rate: u32) -> Result<(Self::Link, RxConsumer), ModemError>;
}

/// Ports whose flow control mode can be changed after opening
pub trait FlowControlled {
    fn enable_hardware_flow_control(&mut self) -> Result<(), ModemError>;
}

impl FlowControlled for SerialStream {
    fn enable_hardware_flow_control(&mut self) -> Result<(), ModemError> {
        self.set_flow_control(FlowControl::Hardware)?;
        Ok(())
    }
}

/// Requests executed by the pump on behalf of a [`LinkHandle`]
#[derive(Debug)]
pub enum LinkRequest {
    Write {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<(), ModemError>>,
    },
    EnableFlowControl {
        reply: oneshot::Sender<Result<(), ModemError>>,
    },
}

/// Cloneable outbound handle to a running pump
#[derive(Debug, Clone)]
pub struct LinkHandle {
    requests: mpsc::Sender<LinkRequest>,
    exit: watch::Receiver<Option<Result<(), ModemError>>>,
    dropped: Arc<AtomicU64>,
}

impl LinkHandle {
    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), ModemError>>) -> LinkRequest,
    ) -> Result<(), ModemError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(make(reply))
            .await
            .map_err(|_| ModemError::LinkClosed)?;
        response.await.map_err(|_| ModemError::LinkClosed)?
    }

    /// Whether the pump has stopped
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    /// Result the pump stopped with, `None` while it runs
    pub fn exit_status(&self) -> Option<Result<(), ModemError>> {
        self.exit.borrow().clone()
    }

    /// Bytes discarded under the drop-newest policy
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl SerialLink for LinkHandle {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ModemError> {
        let bytes = bytes.to_vec();
        self.request(|reply| LinkRequest::Write { bytes, reply }).await
    }

    async fn enable_hardware_flow_control(&mut self) -> Result<(), ModemError> {
        self.request(|reply| LinkRequest::EnableFlowControl { reply }).await
    }

    fn health(&self) -> Result<(), ModemError> {
        if let Some(status) = self.exit_status() {
            return status.and(Err(ModemError::LinkClosed));
        }
        if !self.is_closed() {
            return Ok(());
        }
        // The pump publishes its exit before dropping the request queue
        match self.exit_status() {
            Some(Err(e)) => Err(e),
            _ => Err(ModemError::LinkClosed),
        }
    }
}

/// Task body moving bytes between the port and the receive ring
pub struct SerialPump<P> {
    port: P,
    producer: RxProducer,
    requests: mpsc::Receiver<LinkRequest>,
    policy: OverflowPolicy,
    /// Bytes read from the port that did not fit yet (wait policy)
    pending: VecDeque<u8>,
    retry_interval: Duration,
    dropped: Arc<AtomicU64>,
    exit: watch::Sender<Option<Result<(), ModemError>>>,
}

impl<P> SerialPump<P>
where
    P: AsyncRead + AsyncWrite + FlowControlled + Unpin,
{
    pub fn new(port: P, producer: RxProducer, requests: mpsc::Receiver<LinkRequest>, config: &LinkConfig) -> Self {
        Self {
            port,
            producer,
            requests,
            policy: config.overflow,
            pending: VecDeque::new(),
            retry_interval: config.rx_poll_interval(),
            dropped: Arc::new(AtomicU64::new(0)),
            exit: watch::channel(None).0,
        }
    }

    /// Handle sending requests to this pump through `requests`
    pub fn link_handle(&self, requests: mpsc::Sender<LinkRequest>) -> LinkHandle {
        LinkHandle {
            requests,
            exit: self.exit.subscribe(),
            dropped: Arc::clone(&self.dropped),
        }
    }

    /// Run until every handle is dropped, the consumer goes away, or the
    /// port fails. The outcome is published to every [`LinkHandle`].
    pub async fn run(mut self) -> Result<(), ModemError> {
        let result = self.pump().await;
        let dropped = self.dropped();
        if dropped > 0 {
            warn!("Receive overflow discarded {} byte(s) in total", dropped);
        }
        self.exit.send_replace(Some(result.clone()));
        result
    }

    async fn pump(&mut self) -> Result<(), ModemError> {
        let mut chunk = [0u8; 64];

        loop {
            if self.producer.is_abandoned() {
                debug!("Receive consumer dropped, stopping pump");
                return Ok(());
            }

            self.flush_pending();
            let can_read = self.pending.is_empty();

            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.execute(request).await,
                    None => {
                        debug!("All link handles dropped, stopping pump");
                        return Ok(());
                    }
                },
                read = self.port.read(&mut chunk), if can_read => {
                    let n = read?;
                    if n == 0 {
                        warn!("Serial port reached end of stream");
                        return Err(ModemError::LinkClosed);
                    }
                    self.ingest(&chunk[..n])?;
                }
                _ = tokio::time::sleep(self.retry_interval), if !can_read => {}
            }
        }
    }

    /// Bytes discarded under the drop-newest policy
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn ingest(&mut self, bytes: &[u8]) -> Result<(), ModemError> {
        for (i, &byte) in bytes.iter().enumerate() {
            if self.producer.push(byte).is_ok() {
                continue;
            }
            match self.policy {
                OverflowPolicy::Wait => {
                    debug!("Receive ring full, holding {} bytes", bytes.len() - i);
                    self.pending.extend(&bytes[i..]);
                    return Ok(());
                }
                OverflowPolicy::DropNewest => {
                    if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                        warn!("Receive ring full, dropping incoming bytes");
                    }
                }
                OverflowPolicy::Fail => {
                    error!("Receive ring overflow");
                    return Err(ModemError::RxOverflow {
                        capacity: self.producer.capacity(),
                    });
                }
            }
        }
        Ok(())
    }

    fn flush_pending(&mut self) {
        while let Some(&byte) = self.pending.front() {
            if self.producer.push(byte).is_err() {
                break;
            }
            self.pending.pop_front();
        }
    }

    async fn execute(&mut self, request: LinkRequest) {
        match request {
            LinkRequest::Write { bytes, reply } => {
                let result = async {
                    self.port.write_all(&bytes).await?;
                    self.port.flush().await?;
                    Ok::<(), ModemError>(())
                }
                .await;
                let _ = reply.send(result);
            }
            LinkRequest::EnableFlowControl { reply } => {
                let _ = reply.send(self.port.enable_hardware_flow_control());
            }
        }
    }
}

/// Spawn a pump over `port` and return a handle to it
pub fn spawn_pump<P>(
    port: P,
    producer: RxProducer,
    config: &LinkConfig,
) -> (LinkHandle, JoinHandle<Result<(), ModemError>>)
where
    P: AsyncRead + AsyncWrite + FlowControlled + Unpin + Send + 'static,
{
    let (requests, inbox) = mpsc::channel(config.request_queue.max(1));
    let pump = SerialPump::new(port, producer, inbox, config);
    let handle = pump.link_handle(requests);
    let task = tokio::spawn(async move {
        let result = pump.run().await;
        if let Err(e) = &result {
            error!("Serial pump stopped: {}", e);
        }
        result
    });
    (handle, task)
}

/// Opens the modem's data port through `tokio-serial`
pub struct SerialConnector {
    device: String,
    config: LinkConfig,
    pump: Option<JoinHandle<Result<(), ModemError>>>,
    current: watch::Sender<Option<LinkHandle>>,
}

impl SerialConnector {
    pub fn new(device: &str, config: LinkConfig) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            device: device.to_string(),
            config,
            pump: None,
            current,
        }
    }

    /// Follow the handle of the most recently opened link
    pub fn subscribe(&self) -> watch::Receiver<Option<LinkHandle>> {
        self.current.subscribe()
    }
}

impl Connector for SerialConnector {
    type Link = LinkHandle;

    async fn connect(&mut self, baud_rate: u32) -> Result<(LinkHandle, RxConsumer), ModemError> {
        if let Some(old) = self.pump.take() {
            old.abort();
        }

        info!("Opening serial port {} at {} baud", self.device, baud_rate);
        let port = tokio_serial::new(&self.device, baud_rate)
            .flow_control(FlowControl::None)
            .open_native_async()?;

        let (producer, consumer) = RxRing::new().split();
        let (link, task) = spawn_pump(port, producer, &self.config);
        self.pump = Some(task);
        self.current.send_replace(Some(link.clone()));

        Ok((link, consumer))
    }
}

impl Drop for SerialConnector {
    fn drop(&mut self) {
        if let Some(task) = self.pump.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::LoopbackPort;
    use tokio::io::duplex;

    fn config(overflow: OverflowPolicy) -> LinkConfig {
        LinkConfig {
            overflow,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_pump_moves_bytes_both_ways() {
        let (port, mut modem) = duplex(256);
        let (producer, mut consumer) = RxRing::new().split();
        let (mut link, _task) = spawn_pump(LoopbackPort::new(port), producer, &LinkConfig::default());

        link.write_all(b"AT\r\n").await.unwrap();
        let mut sent = [0u8; 4];
        modem.read_exact(&mut sent).await.unwrap();
        assert_eq!(&sent, b"AT\r\n");

        modem.write_all(b"\r\nOK\r\n").await.unwrap();
        while !consumer.has_string() {
            tokio::task::yield_now().await;
        }
        assert_eq!(consumer.pop_string(), "OK");
    }

    #[tokio::test]
    async fn test_pump_enables_flow_control() {
        let (port, _modem) = duplex(64);
        let port = LoopbackPort::new(port);
        let flow = port.flow_control_flag();
        let (producer, _consumer) = RxRing::new().split();
        let (mut link, _task) = spawn_pump(port, producer, &LinkConfig::default());

        link.enable_hardware_flow_control().await.unwrap();
        assert!(flow.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_pump_stops_when_handles_dropped() {
        let (port, _modem) = duplex(64);
        let (producer, _consumer) = RxRing::new().split();
        let (link, task) = spawn_pump(LoopbackPort::new(port), producer, &LinkConfig::default());

        drop(link);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_pump_end_of_stream_closes_link() {
        let (port, modem) = duplex(64);
        let (producer, _consumer) = RxRing::new().split();
        let (link, task) = spawn_pump(LoopbackPort::new(port), producer, &LinkConfig::default());

        assert!(link.health().is_ok());
        drop(modem);
        assert!(matches!(task.await.unwrap(), Err(ModemError::LinkClosed)));
        assert!(link.is_closed());
        assert!(matches!(link.health(), Err(ModemError::LinkClosed)));
    }

    #[tokio::test]
    async fn test_wait_policy_holds_bytes_until_space() {
        let (port, mut modem) = duplex(2048);
        let (producer, mut consumer) = RxRing::new().split();
        let (_link, _task) = spawn_pump(LoopbackPort::new(port), producer, &config(OverflowPolicy::Wait));

        let payload: Vec<u8> = (0..RX_BUFFER_SIZE + 100).map(|i| b'a' + (i % 26) as u8).collect();
        modem.write_all(&payload).await.unwrap();

        let mut received = Vec::new();
        while received.len() < payload.len() {
            match consumer.pop() {
                Some(byte) => received.push(byte),
                None => tokio::time::sleep(Duration::from_millis(1)).await,
            }
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_fail_policy_reports_overflow() {
        let (port, mut modem) = duplex(2048);
        let (producer, _consumer) = RxRing::new().split();
        let (link, task) = spawn_pump(LoopbackPort::new(port), producer, &config(OverflowPolicy::Fail));

        modem.write_all(&[b'x'; RX_BUFFER_SIZE + 10]).await.unwrap();
        assert!(matches!(
            task.await.unwrap(),
            Err(ModemError::RxOverflow { capacity }) if capacity == RX_BUFFER_SIZE - 1
        ));
        assert!(matches!(link.health(), Err(ModemError::RxOverflow { .. })));
    }

    #[tokio::test]
    async fn test_drop_newest_policy_keeps_oldest() {
        let (port, mut modem) = duplex(2048);
        let (producer, mut consumer) = RxRing::new().split();
        let (link, _task) = spawn_pump(LoopbackPort::new(port), producer, &config(OverflowPolicy::DropNewest));

        let mut payload = vec![b'a'; RX_BUFFER_SIZE - 1];
        payload.extend_from_slice(b"zzzz");
        modem.write_all(&payload).await.unwrap();

        while consumer.available() < RX_BUFFER_SIZE - 1 {
            tokio::task::yield_now().await;
        }
        // Let the pump see the overflow bytes before draining
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(link.dropped(), 4);
        assert!(link.health().is_ok());

        let received: Vec<u8> = std::iter::from_fn(|| consumer.pop()).collect();
        assert_eq!(received.len(), RX_BUFFER_SIZE - 1);
        assert!(received.iter().all(|&b| b == b'a'));
    }
}
