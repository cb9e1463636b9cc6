//! Auto-Connect Manager (C5): one state machine per managed address, with
//! retry backoff, health checks, a stability monitor, and an event fan-out
//! to any number of subscribers. Mirrors the cancellation pattern
//! `burble::hci::conn::EventReceiverTask` uses for its own background task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::proto::DeviceAddress;
use crate::radio::RadioInterface;
use crate::{SyncMutex, SyncRwLock};

/// Per-device connection lifecycle state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, strum::Display)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Paused,
}

/// How the delay before a retry attempt grows with `retry_count`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum RetryStrategy {
    Exponential,
    Linear,
    Fixed,
}

/// Immutable per-device connection policy. Built via [`ConnectionConfig::builder`],
/// following `burble::gatt::schema`'s `Builder<T>` convention; per-device
/// overrides clone-and-modify rather than inherit (spec.md §9).
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionConfig {
    pub max_retries: u32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub retry_strategy: RetryStrategy,
    pub connection_timeout: Duration,
    pub stability_check_interval: Duration,
    pub reconnect_on_failure: bool,
    pub health_check_interval: Duration,
    pub max_consecutive_failures: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            retry_strategy: RetryStrategy::Exponential,
            connection_timeout: Duration::from_secs(10),
            stability_check_interval: Duration::from_secs(30),
            reconnect_on_failure: true,
            health_check_interval: Duration::from_secs(15),
            max_consecutive_failures: 10,
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder(Self::default())
    }
}

/// Builder for [`ConnectionConfig`].
#[derive(Clone, Debug)]
pub struct ConnectionConfigBuilder(ConnectionConfig);

macro_rules! builder_field {
    ($name:ident, $ty:ty) => {
        #[must_use]
        pub fn $name(mut self, value: $ty) -> Self {
            self.0.$name = value;
            self
        }
    };
}

impl ConnectionConfigBuilder {
    builder_field!(max_retries, u32);
    builder_field!(initial_retry_delay, Duration);
    builder_field!(max_retry_delay, Duration);
    builder_field!(retry_strategy, RetryStrategy);
    builder_field!(connection_timeout, Duration);
    builder_field!(stability_check_interval, Duration);
    builder_field!(reconnect_on_failure, bool);
    builder_field!(health_check_interval, Duration);
    builder_field!(max_consecutive_failures, u32);

    #[must_use]
    pub fn build(self) -> ConnectionConfig {
        self.0
    }
}

/// Rolling connection metrics for one managed address.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
pub struct ConnectionMetrics {
    pub total_attempts: u64,
    pub successful: u64,
    pub failed: u64,
    pub last_connected_at: Option<u64>,
    pub last_failure_at: Option<u64>,
    pub avg_connection_time: Duration,
    pub uptime: Duration,
    pub stability_score: f64,
    pub consecutive_failures: u32,
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self {
            total_attempts: 0,
            successful: 0,
            failed: 0,
            last_connected_at: None,
            last_failure_at: None,
            avg_connection_time: Duration::ZERO,
            uptime: Duration::ZERO,
            stability_score: 0.0,
            consecutive_failures: 0,
        }
    }
}

/// State and policy for one managed address. One per address, owned by
/// [`AutoConnectManager`].
#[derive(Clone, Debug, PartialEq)]
pub struct ManagedConnection {
    pub address: DeviceAddress,
    pub config: ConnectionConfig,
    pub state: ConnectionState,
    pub metrics: ConnectionMetrics,
    pub retry_count: u32,
    pub connect_started_at: Option<Instant>,
    pub last_activity_at: Option<Instant>,
    pub enabled: bool,
    pub paused_until: Option<Instant>,
}

impl ManagedConnection {
    fn new(address: DeviceAddress, config: ConnectionConfig) -> Self {
        Self {
            address,
            config,
            state: ConnectionState::Disconnected,
            metrics: ConnectionMetrics::default(),
            retry_count: 0,
            connect_started_at: None,
            last_activity_at: None,
            enabled: true,
            paused_until: None,
        }
    }
}

/// Kind tag for [`ConnectionEvent`] (spec.md §4.5's catalogue).
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, strum::Display)]
pub enum ConnectionEventKind {
    DeviceAdded,
    DeviceRemoved,
    DeviceEnabled,
    DeviceDisabled,
    DevicePaused,
    ConnectionAttempt,
    ConnectionSuccess,
    ConnectionFailed,
    ConnectionTimeout,
    ConnectionError,
    ConnectionStale,
    ManagerError,
    StabilityReport,
}

/// Snapshot published periodically by the stability monitor task.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct StabilityReport {
    pub state: ConnectionState,
    pub metrics: ConnectionMetrics,
    pub retry_count: u32,
    pub enabled: bool,
}

/// Payload accompanying a [`ConnectionEvent`].
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub enum EventData {
    None,
    Message(String),
    Stability(StabilityReport),
}

/// An event published on the manager's fan-out channel.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct ConnectionEvent {
    pub address: DeviceAddress,
    pub kind: ConnectionEventKind,
    pub data: EventData,
}

/// An event the radio layer reports for a managed address, outside of the
/// manager's own connect/disconnect calls.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExternalEvent {
    Connection,
    Disconnection,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// `min(initial * 2^retry_count, max)` / `min(initial * (1+retry_count), max)`
/// / `initial`, per spec.md §4.5.
#[must_use]
pub fn retry_delay(config: &ConnectionConfig, retry_count: u32) -> Duration {
    let delay = match config.retry_strategy {
        RetryStrategy::Exponential => {
            let factor = 1u64.checked_shl(retry_count.min(63)).unwrap_or(u64::MAX);
            config.initial_retry_delay.saturating_mul(u32::try_from(factor).unwrap_or(u32::MAX))
        }
        RetryStrategy::Linear => config.initial_retry_delay.saturating_mul(1 + retry_count),
        RetryStrategy::Fixed => config.initial_retry_delay,
    };
    delay.min(config.max_retry_delay)
}

/// All of `enabled ∧ (unpaused ∨ due) ∧ retry_count < max_retries ∧
/// consecutive_failures < max_consecutive_failures` (spec.md §4.5).
#[must_use]
pub fn should_retry(conn: &ManagedConnection, now: Instant) -> bool {
    conn.enabled
        && conn.paused_until.map_or(true, |p| now >= p)
        && conn.retry_count < conn.config.max_retries
        && conn.metrics.consecutive_failures < conn.config.max_consecutive_failures
}

type ConnectionMap = Arc<SyncRwLock<HashMap<DeviceAddress, ManagedConnection>>>;

struct DeviceTask {
    _guard: DropGuard,
}

/// Drives a per-device connection state machine against a `RadioInterface`,
/// publishing lifecycle events and periodic stability reports. One
/// `AutoConnectManager` typically owns every address a process cares about.
pub struct AutoConnectManager {
    radio: Arc<dyn RadioInterface>,
    connections: ConnectionMap,
    tasks: SyncMutex<HashMap<DeviceAddress, DeviceTask>>,
    stability_task: SyncMutex<Option<DeviceTask>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl AutoConnectManager {
    #[must_use]
    pub fn new(radio: Arc<dyn RadioInterface>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            radio,
            connections: Arc::new(SyncRwLock::new(HashMap::new())),
            tasks: SyncMutex::new(HashMap::new()),
            stability_task: SyncMutex::new(None),
            events,
        }
    }

    /// Subscribe to the event fan-out. A slow subscriber only loses its own
    /// backlog (`RecvError::Lagged`); it never blocks the emitter or other
    /// subscribers (spec.md §7's `SubscriberFault` isolation).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, address: DeviceAddress, kind: ConnectionEventKind, data: EventData) {
        // A broadcast::Sender::send error just means there are no
        // subscribers right now; that's not a fault to log or propagate.
        let _ = self.events.send(ConnectionEvent { address, kind, data });
    }

    /// Registers `address` under `config` and spawns its per-device task.
    pub fn add_device(&self, address: DeviceAddress, config: ConnectionConfig) {
        self.connections
            .write()
            .insert(address, ManagedConnection::new(address, config));
        self.spawn_device_task(address);
        self.emit(address, ConnectionEventKind::DeviceAdded, EventData::None);
    }

    /// Cancels `address`'s task and forgets it.
    pub fn remove_device(&self, address: DeviceAddress) {
        self.connections.write().remove(&address);
        self.tasks.lock().remove(&address);
        self.emit(address, ConnectionEventKind::DeviceRemoved, EventData::None);
    }

    pub fn enable_device(&self, address: DeviceAddress) {
        if let Some(c) = self.connections.write().get_mut(&address) {
            c.enabled = true;
        }
        self.emit(address, ConnectionEventKind::DeviceEnabled, EventData::None);
    }

    /// Disables `address` and cancels its in-flight attempt, if any
    /// (spec.md §5's cancellation contract).
    pub fn disable_device(&self, address: DeviceAddress) {
        if let Some(c) = self.connections.write().get_mut(&address) {
            c.enabled = false;
            c.state = ConnectionState::Disconnected;
        }
        self.emit(address, ConnectionEventKind::DeviceDisabled, EventData::None);
    }

    pub fn pause_device(&self, address: DeviceAddress, duration: Duration) {
        if let Some(c) = self.connections.write().get_mut(&address) {
            c.state = ConnectionState::Paused;
            c.paused_until = Some(Instant::now() + duration);
        }
        self.emit(address, ConnectionEventKind::DevicePaused, EventData::None);
    }

    /// Snapshot of one managed address's current state.
    #[must_use]
    pub fn get_connection(&self, address: DeviceAddress) -> Option<ManagedConnection> {
        self.connections.read().get(&address).cloned()
    }

    /// Snapshot of every managed address.
    #[must_use]
    pub fn list_connections(&self) -> Vec<ManagedConnection> {
        self.connections.read().values().cloned().collect()
    }

    /// Applies a `Connection`/`Disconnection` event the radio layer reports
    /// out-of-band for a managed address (spec.md §4.5's external ingestion).
    pub fn notify_external_event(&self, address: DeviceAddress, event: ExternalEvent) {
        let restart_needed = {
            let mut conns = self.connections.write();
            let Some(c) = conns.get_mut(&address) else {
                return;
            };
            c.last_activity_at = Some(Instant::now());
            match event {
                ExternalEvent::Connection => {
                    c.state = ConnectionState::Connected;
                    c.retry_count = 0;
                    false
                }
                ExternalEvent::Disconnection => {
                    if c.config.reconnect_on_failure {
                        c.state = ConnectionState::Disconnected;
                        c.retry_count = 0;
                    }
                    // The single-task-per-device model has no separate
                    // "restart": the task never exited, so it simply
                    // continues its loop and observes the new state.
                    false
                }
            }
        };
        let _ = restart_needed;
    }

    /// Starts the periodic stability-report task. Idempotent: a second call
    /// replaces the previous task (which is cancelled on drop). Takes an
    /// explicit `&Arc<Self>` rather than an `Arc<Self>` receiver since
    /// stable Rust only allows `Self`/`&Self`/`&mut Self`/`Arc<Self>` (by
    /// value) as method receivers.
    pub fn start_stability_monitor(this: &Arc<Self>) {
        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();
        let manager = Arc::clone(this);
        tokio::spawn(async move {
            loop {
                let interval = manager
                    .connections
                    .read()
                    .values()
                    .map(|c| c.config.stability_check_interval)
                    .min()
                    .unwrap_or(Duration::from_secs(30));
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                let reports: Vec<(DeviceAddress, StabilityReport)> = manager
                    .connections
                    .read()
                    .iter()
                    .map(|(addr, c)| {
                        (
                            *addr,
                            StabilityReport {
                                state: c.state,
                                metrics: c.metrics,
                                retry_count: c.retry_count,
                                enabled: c.enabled,
                            },
                        )
                    })
                    .collect();
                for (address, report) in reports {
                    manager.emit(
                        address,
                        ConnectionEventKind::StabilityReport,
                        EventData::Stability(report),
                    );
                }
            }
        });
        *this.stability_task.lock() = Some(DeviceTask { _guard: guard });
    }

    /// Cancels the stability task and every per-device task. Per spec.md
    /// §5, cancellation is expected to settle within a bounded grace period;
    /// the `DropGuard`s here signal cancellation synchronously on drop.
    pub fn stop(&self) {
        self.stability_task.lock().take();
        self.tasks.lock().clear();
    }

    fn spawn_device_task(&self, address: DeviceAddress) {
        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();
        let radio = Arc::clone(&self.radio);
        let connections = Arc::clone(&self.connections);
        let events = self.events.clone();
        tokio::spawn(run_device(address, radio, connections, events, token));
        self.tasks.lock().insert(address, DeviceTask { _guard: guard });
    }
}

fn emit(events: &broadcast::Sender<ConnectionEvent>, address: DeviceAddress, kind: ConnectionEventKind, data: EventData) {
    let _ = events.send(ConnectionEvent { address, kind, data });
}

/// Per-device task body: attempt, (success: health-check loop) / (failure:
/// backoff), repeat. Exits only on cancellation or the address being
/// removed from `connections`.
async fn run_device(
    address: DeviceAddress,
    radio: Arc<dyn RadioInterface>,
    connections: ConnectionMap,
    events: broadcast::Sender<ConnectionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let Some((config, can_attempt)) = ({
            let conns = connections.read();
            conns.get(&address).map(|c| (c.config.clone(), should_retry(c, Instant::now())))
        }) else {
            return;
        };

        if !can_attempt {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
            continue;
        }

        {
            let mut conns = connections.write();
            let Some(c) = conns.get_mut(&address) else { return };
            c.state = ConnectionState::Connecting;
            c.connect_started_at = Some(Instant::now());
        }
        emit(&events, address, ConnectionEventKind::ConnectionAttempt, EventData::None);

        let started = Instant::now();
        let attempt = tokio::time::timeout(config.connection_timeout, radio.connect(address));
        let outcome = tokio::select! {
            () = cancel.cancelled() => return,
            res = attempt => res,
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(true)) => {
                record_success(&connections, address, elapsed);
                emit(&events, address, ConnectionEventKind::ConnectionSuccess, EventData::None);
                if !run_connected_phase(&address, &connections, &events, &cancel, config.health_check_interval).await {
                    return;
                }
            }
            Ok(Ok(false)) => {
                record_failure(&connections, address);
                emit(&events, address, ConnectionEventKind::ConnectionFailed, EventData::None);
                if !backoff(&address, &connections, &cancel).await {
                    return;
                }
            }
            Ok(Err(err)) => {
                record_failure(&connections, address);
                emit(
                    &events,
                    address,
                    ConnectionEventKind::ConnectionError,
                    EventData::Message(err.to_string()),
                );
                if !backoff(&address, &connections, &cancel).await {
                    return;
                }
            }
            Err(_timed_out) => {
                record_failure(&connections, address);
                emit(&events, address, ConnectionEventKind::ConnectionTimeout, EventData::None);
                if !backoff(&address, &connections, &cancel).await {
                    return;
                }
            }
        }
    }
}

/// While `Connected`, periodically checks `last_activity_at` and demotes to
/// `Disconnected` + emits `connection_stale` once it's stale for more than
/// `2 * health_check_interval` (spec.md §4.5's health check, scenario 6).
/// Returns `false` if the task should exit entirely (cancelled or removed).
async fn run_connected_phase(
    address: &DeviceAddress,
    connections: &ConnectionMap,
    events: &broadcast::Sender<ConnectionEvent>,
    cancel: &CancellationToken,
    health_check_interval: Duration,
) -> bool {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return false,
            () = tokio::time::sleep(health_check_interval) => {}
        }

        let mut conns = connections.write();
        let Some(c) = conns.get_mut(address) else { return false };
        if c.state != ConnectionState::Connected {
            return true;
        }
        if let Some(started) = c.connect_started_at {
            c.metrics.uptime = Instant::now().saturating_duration_since(started);
        }
        let stale = c
            .last_activity_at
            .is_some_and(|t| Instant::now().saturating_duration_since(t) > health_check_interval * 2);
        if stale {
            c.state = ConnectionState::Disconnected;
            drop(conns);
            debug!(%address, "connection stale, demoting to disconnected");
            emit(events, *address, ConnectionEventKind::ConnectionStale, EventData::None);
            return true;
        }
    }
}

/// Transitions `Failed -> Reconnecting` for the computed backoff delay,
/// then `Reconnecting -> Disconnected` so the outer loop's `should_retry`
/// check governs the next attempt. Returns `false` if cancelled or removed.
async fn backoff(address: &DeviceAddress, connections: &ConnectionMap, cancel: &CancellationToken) -> bool {
    let Some(delay) = ({
        let mut conns = connections.write();
        let Some(c) = conns.get_mut(address) else { return false };
        c.state = ConnectionState::Reconnecting;
        Some(retry_delay(&c.config, c.retry_count))
    }) else {
        return false;
    };

    tokio::select! {
        () = cancel.cancelled() => return false,
        () = tokio::time::sleep(delay) => {}
    }

    let mut conns = connections.write();
    let Some(c) = conns.get_mut(address) else { return false };
    if c.state == ConnectionState::Reconnecting {
        c.state = ConnectionState::Disconnected;
    }
    true
}

fn record_success(connections: &ConnectionMap, address: DeviceAddress, elapsed: Duration) {
    let mut conns = connections.write();
    let Some(c) = conns.get_mut(&address) else { return };
    c.state = ConnectionState::Connected;
    c.retry_count = 0;
    c.metrics.consecutive_failures = 0;
    c.metrics.total_attempts += 1;
    c.metrics.successful += 1;
    c.metrics.last_connected_at = Some(now_millis());
    #[allow(clippy::cast_precision_loss)]
    let n = c.metrics.successful as f64;
    let prev_avg = c.metrics.avg_connection_time.as_secs_f64();
    let new_avg = prev_avg.mul_add(n - 1.0, elapsed.as_secs_f64()) / n;
    c.metrics.avg_connection_time = Duration::from_secs_f64(new_avg.max(0.0));
    #[allow(clippy::cast_precision_loss)]
    let stability = c.metrics.successful as f64 / (c.metrics.total_attempts.max(1)) as f64;
    c.metrics.stability_score = stability;
    c.last_activity_at = Some(Instant::now());
    c.connect_started_at = Some(Instant::now());
    info!(%address, "connected");
}

fn record_failure(connections: &ConnectionMap, address: DeviceAddress) {
    let mut conns = connections.write();
    let Some(c) = conns.get_mut(&address) else { return };
    c.state = ConnectionState::Failed;
    c.retry_count += 1;
    c.metrics.consecutive_failures += 1;
    c.metrics.total_attempts += 1;
    c.metrics.failed += 1;
    c.metrics.last_failure_at = Some(now_millis());
    #[allow(clippy::cast_precision_loss)]
    let stability = c.metrics.successful as f64 / (c.metrics.total_attempts.max(1)) as f64;
    c.metrics.stability_score = stability;
    warn!(%address, retry_count = c.retry_count, "connection attempt failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{ConnectOutcome, MockRadio};

    fn addr(n: u8) -> DeviceAddress {
        DeviceAddress::new([0, 0, 0, 0, 0, n])
    }

    #[test]
    fn exponential_backoff_delays() {
        let config = ConnectionConfig::builder()
            .initial_retry_delay(Duration::from_secs(1))
            .max_retry_delay(Duration::from_secs(10))
            .retry_strategy(RetryStrategy::Exponential)
            .build();
        let delays: Vec<u64> = [0, 1, 2, 3, 10]
            .iter()
            .map(|&n| retry_delay(&config, n).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10]);
    }

    #[test]
    fn linear_backoff_delays() {
        let config = ConnectionConfig::builder()
            .initial_retry_delay(Duration::from_secs(2))
            .max_retry_delay(Duration::from_secs(100))
            .retry_strategy(RetryStrategy::Linear)
            .build();
        assert_eq!(retry_delay(&config, 0).as_secs(), 2);
        assert_eq!(retry_delay(&config, 2).as_secs(), 6);
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let config = ConnectionConfig::builder()
            .initial_retry_delay(Duration::from_secs(3))
            .retry_strategy(RetryStrategy::Fixed)
            .build();
        assert_eq!(retry_delay(&config, 0).as_secs(), 3);
        assert_eq!(retry_delay(&config, 9).as_secs(), 3);
    }

    #[test]
    fn should_retry_requires_enabled_unpaused_within_limits() {
        let mut conn = ManagedConnection::new(addr(1), ConnectionConfig::default());
        let now = Instant::now();
        assert!(should_retry(&conn, now));

        conn.enabled = false;
        assert!(!should_retry(&conn, now));
        conn.enabled = true;

        conn.paused_until = Some(now + Duration::from_secs(5));
        assert!(!should_retry(&conn, now));
        assert!(should_retry(&conn, now + Duration::from_secs(6)));
        conn.paused_until = None;

        conn.retry_count = conn.config.max_retries;
        assert!(!should_retry(&conn, now));
        conn.retry_count = 0;

        conn.metrics.consecutive_failures = conn.config.max_consecutive_failures;
        assert!(!should_retry(&conn, now));
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_invariant_after_repeated_failures() {
        let radio = Arc::new(MockRadio::new());
        radio
            .script(
                addr(5),
                vec![
                    ConnectOutcome::Failure(Duration::ZERO),
                    ConnectOutcome::Failure(Duration::ZERO),
                    ConnectOutcome::Failure(Duration::ZERO),
                ],
            )
            .await;
        let manager = Arc::new(AutoConnectManager::new(radio));
        let config = ConnectionConfig::builder()
            .initial_retry_delay(Duration::from_millis(10))
            .max_retry_delay(Duration::from_millis(10))
            .max_retries(10)
            .build();
        manager.add_device(addr(5), config);

        for _ in 0..20 {
            tokio::time::advance(Duration::from_millis(50)).await;
            let conn = manager.get_connection(addr(5)).unwrap();
            if conn.metrics.failed >= 3 {
                break;
            }
        }

        let conn = manager.get_connection(addr(5)).unwrap();
        assert_eq!(conn.metrics.successful + conn.metrics.failed, conn.metrics.total_attempts);
        assert!(conn.metrics.failed >= 3);
        assert_eq!(conn.metrics.consecutive_failures as u64, conn.metrics.failed);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_connection_transitions_to_disconnected() {
        let radio = Arc::new(MockRadio::new());
        let manager = Arc::new(AutoConnectManager::new(radio));
        let config = ConnectionConfig::builder()
            .health_check_interval(Duration::from_secs(1))
            .build();
        manager.add_device(addr(7), config);

        let mut rx = manager.subscribe();

        // Let the device connect, then starve it of activity.
        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(200)).await;
            if manager.get_connection(addr(7)).unwrap().state == ConnectionState::Connected {
                break;
            }
        }
        {
            let mut conns = manager.connections.write();
            let c = conns.get_mut(&addr(7)).unwrap();
            c.last_activity_at = Some(Instant::now() - Duration::from_secs(3));
        }

        let mut saw_stale = false;
        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(1)).await;
            while let Ok(event) = rx.try_recv() {
                if event.kind == ConnectionEventKind::ConnectionStale {
                    saw_stale = true;
                }
            }
            if saw_stale {
                break;
            }
        }
        assert!(saw_stale);
    }
}
