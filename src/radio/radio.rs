//! Uniform façade over a host-OS BLE radio and an external sniffer radio.
//! The production bindings for either transport are out of scope here;
//! this module defines the trait C4/C5 depend on plus two test doubles.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, trace};

use crate::proto::{DeviceAddress, PacketClass, PacketSource, RawPacket};

/// A stream of [`RawPacket`]s, boxed for trait-object use.
pub type PacketStream = Pin<Box<dyn Stream<Item = RawPacket> + Send>>;

/// Push-delivery callback registered via [`RadioInterface::register_callback`].
pub type PacketCallback = Arc<dyn Fn(RawPacket) + Send + Sync>;

/// Errors a [`RadioInterface`] implementation may report. Both variants are
/// retryable from C5's point of view — neither indicates policy exhaustion.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RadioError {
    #[error("transient radio error: {0}")]
    Transient(String),
    #[error("radio operation timed out")]
    Timeout,
}

/// A device discovered via scanning or `get_devices`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Device {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub rssi: i16,
    pub services: Vec<String>,
}

/// Uniform async façade over a BLE radio, whether host-OS or an external
/// sniffer dongle. Boxed as `dyn RadioInterface` by C5, hence `async_trait`
/// rather than native async-fn-in-trait (not yet dyn-compatible).
#[async_trait]
pub trait RadioInterface: Send + Sync {
    async fn initialize(&self) -> Result<(), RadioError>;
    async fn start_scanning(&self, passive: bool) -> Result<(), RadioError>;
    async fn stop_scanning(&self) -> Result<(), RadioError>;
    async fn connect(&self, address: DeviceAddress) -> Result<bool, RadioError>;
    async fn disconnect(&self, address: DeviceAddress) -> Result<(), RadioError>;
    async fn get_devices(&self) -> Result<Vec<Device>, RadioError>;
    fn packet_stream(&self) -> PacketStream;
    fn register_callback(&self, cb: PacketCallback);
}

/// Scripted outcome for one [`MockRadio::connect`] call.
#[derive(Clone, Debug)]
pub enum ConnectOutcome {
    Success(Duration),
    Failure(Duration),
    Timeout(Duration),
    Error(Duration, String),
}

/// Deterministic, scriptable [`RadioInterface`] for tests: each address gets
/// a queue of [`ConnectOutcome`]s consumed in order by successive `connect`
/// calls, falling back to an immediate success once the queue is drained.
#[derive(Debug)]
pub struct MockRadio {
    scripts: AsyncMutex<std::collections::HashMap<DeviceAddress, Vec<ConnectOutcome>>>,
    events: broadcast::Sender<RawPacket>,
}

impl MockRadio {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            scripts: AsyncMutex::new(std::collections::HashMap::new()),
            events,
        }
    }

    /// Queues outcomes for subsequent `connect(address)` calls, consumed
    /// front-to-back.
    pub async fn script(&self, address: DeviceAddress, outcomes: Vec<ConnectOutcome>) {
        self.scripts.lock().await.insert(address, outcomes);
    }

    /// Injects a packet as if the radio had just received it.
    pub fn push_packet(&self, packet: RawPacket) {
        let _ = self.events.send(packet);
    }
}

#[async_trait]
impl RadioInterface for MockRadio {
    async fn initialize(&self) -> Result<(), RadioError> {
        trace!("mock radio initialized");
        Ok(())
    }

    async fn start_scanning(&self, passive: bool) -> Result<(), RadioError> {
        debug!(passive, "mock radio scanning");
        Ok(())
    }

    async fn stop_scanning(&self) -> Result<(), RadioError> {
        Ok(())
    }

    async fn connect(&self, address: DeviceAddress) -> Result<bool, RadioError> {
        let outcome = {
            let mut scripts = self.scripts.lock().await;
            scripts.get_mut(&address).filter(|q| !q.is_empty()).map(|q| q.remove(0))
        };
        match outcome {
            None => Ok(true),
            Some(ConnectOutcome::Success(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(true)
            }
            Some(ConnectOutcome::Failure(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(false)
            }
            Some(ConnectOutcome::Timeout(delay)) => {
                tokio::time::sleep(delay).await;
                Err(RadioError::Timeout)
            }
            Some(ConnectOutcome::Error(delay, msg)) => {
                tokio::time::sleep(delay).await;
                Err(RadioError::Transient(msg))
            }
        }
    }

    async fn disconnect(&self, _address: DeviceAddress) -> Result<(), RadioError> {
        Ok(())
    }

    async fn get_devices(&self) -> Result<Vec<Device>, RadioError> {
        Ok(Vec::new())
    }

    fn packet_stream(&self) -> PacketStream {
        let rx = self.events.subscribe();
        Box::pin(tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(|r| async move { r.ok() }))
    }

    fn register_callback(&self, _cb: PacketCallback) {}
}

/// Replays a fixed sequence of [`RawPacket`]s once per `packet_stream()`
/// call; `connect`/`disconnect` always succeed immediately. Used to drive
/// C4 against recorded traffic in tests.
#[derive(Debug)]
pub struct ReplayRadio {
    packets: Vec<RawPacket>,
}

impl ReplayRadio {
    #[must_use]
    pub fn new(packets: Vec<RawPacket>) -> Self {
        Self { packets }
    }
}

#[async_trait]
impl RadioInterface for ReplayRadio {
    async fn initialize(&self) -> Result<(), RadioError> {
        Ok(())
    }

    async fn start_scanning(&self, _passive: bool) -> Result<(), RadioError> {
        Ok(())
    }

    async fn stop_scanning(&self) -> Result<(), RadioError> {
        Ok(())
    }

    async fn connect(&self, _address: DeviceAddress) -> Result<bool, RadioError> {
        Ok(true)
    }

    async fn disconnect(&self, _address: DeviceAddress) -> Result<(), RadioError> {
        Ok(())
    }

    async fn get_devices(&self) -> Result<Vec<Device>, RadioError> {
        Ok(Vec::new())
    }

    fn packet_stream(&self) -> PacketStream {
        Box::pin(tokio_stream::iter(self.packets.clone()))
    }

    fn register_callback(&self, _cb: PacketCallback) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> DeviceAddress {
        DeviceAddress::new([0, 0, 0, 0, 0, n])
    }

    #[tokio::test]
    async fn mock_radio_default_connect_succeeds() {
        let radio = MockRadio::new();
        assert_eq!(radio.connect(addr(1)).await, Ok(true));
    }

    #[tokio::test]
    async fn mock_radio_scripted_outcomes_consumed_in_order() {
        let radio = MockRadio::new();
        radio
            .script(
                addr(2),
                vec![
                    ConnectOutcome::Failure(Duration::from_millis(0)),
                    ConnectOutcome::Success(Duration::from_millis(0)),
                ],
            )
            .await;
        assert_eq!(radio.connect(addr(2)).await, Ok(false));
        assert_eq!(radio.connect(addr(2)).await, Ok(true));
        // Script exhausted: falls back to success.
        assert_eq!(radio.connect(addr(2)).await, Ok(true));
    }

    #[tokio::test]
    async fn mock_radio_scripted_timeout() {
        let radio = MockRadio::new();
        radio
            .script(addr(3), vec![ConnectOutcome::Timeout(Duration::from_millis(0))])
            .await;
        assert_eq!(radio.connect(addr(3)).await, Err(RadioError::Timeout));
    }

    #[tokio::test]
    async fn replay_radio_emits_packets_in_order() {
        let p = |n: u8| RawPacket {
            timestamp: u64::from(n),
            source: PacketSource::SnifferRadio,
            address: addr(n),
            rssi: -40,
            payload: vec![n],
            packet_class: PacketClass::Data,
            attributes: Default::default(),
        };
        let radio = ReplayRadio::new(vec![p(1), p(2), p(3)]);
        let collected: Vec<_> = radio.packet_stream().collect().await;
        assert_eq!(collected.len(), 3);
        assert_eq!(collected[0].payload, vec![1]);
        assert_eq!(collected[2].payload, vec![3]);
    }
}
