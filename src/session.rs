//! The session coordinator.
//!
//! ```text
//! Idle -> Scanning -> Connecting -> Connected -> Monitoring
//!   ^                     |                          |
//!   +---------------------+--------------------------+ (failure, disconnect)
//!
//! any -> AdapterUnavailable (initialization exhausted, left by reset())
//! ```
//!
//! Scan, connect, disconnect and teardown sequences run one at a time under a
//! single async lock. Background tasks only hold a weak reference to the
//! session, so dropping every [`SessionManager`] clone releases it.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;

use crate::adapter::{AdapterHandle, AdapterLifecycle, AdapterState};
use crate::alert::{AlertDispatcher, EmergencyAlert};
use crate::characteristic::{CharacteristicMonitor, MonitorEvent};
use crate::config::SessionConfig;
use crate::connection::ConnectionSession;
use crate::device::{DeviceSet, DiscoveredDevice};
use crate::error::AlertError;
use crate::permission::{PermissionGate, PermissionPrompter};
use crate::retry::{BoundedRetry, RetryDecision};
use crate::scanner::{ScanConfig, ScanEvent, ScanSession};
use crate::transport::AdapterFactory;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Monitoring,
    /// Adapter initialization was exhausted. Only [`SessionManager::reset`]
    /// leaves this state.
    AdapterUnavailable,
}

impl SessionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Monitoring)
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    DeviceDiscovered(DiscoveredDevice),
    Connected(DiscoveredDevice),
    Disconnected {
        device_id: String,
        /// The link dropped instead of being closed by the session.
        unexpected: bool,
    },
    ButtonPressed {
        device_id: String,
    },
    AlertSent(EmergencyAlert),
    AlertFailed(AlertError),
    Error(Error),
}

struct Status {
    state: SessionState,
    device: Option<DiscoveredDevice>,
    /// Bumped on every scan start so a stale scan cannot move the state.
    scan_generation: u64,
}

struct Core {
    scanner: ScanSession,
    connection: ConnectionSession,
    monitor: Option<CharacteristicMonitor>,
}

struct Shared {
    config: SessionConfig,
    scan_config: ScanConfig,
    adapter: AdapterLifecycle,
    permissions: PermissionGate,
    alerts: Arc<AlertDispatcher>,
    core: tokio::sync::Mutex<Core>,
    status: Mutex<Status>,
    devices: Arc<RwLock<DeviceSet>>,
    /// Bumped whenever a monitor is stopped; events from older monitors are
    /// dropped.
    monitor_generation: AtomicU64,
    event_sender: broadcast::Sender<SessionEvent>,
}

/// Handle to the BLE session. Clones share the same session.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        factory: Arc<dyn AdapterFactory>,
        prompter: Arc<dyn PermissionPrompter>,
        alerts: AlertDispatcher,
    ) -> Self {
        let (event_sender, _) = broadcast::channel(64);

        let adapter = AdapterLifecycle::new(factory)
            .with_settle_delay(config.adapter_settle)
            .with_retry_policy(config.adapter_retry_policy());
        let permissions = PermissionGate::new(config.platform, config.simulated_send, prompter);

        let scanner = ScanSession::new();
        let devices = scanner.device_set();
        let connection = ConnectionSession::new(config.connect_timeout);

        Self {
            shared: Arc::new(Shared {
                scan_config: config.scan_config(),
                config,
                adapter,
                permissions,
                alerts: Arc::new(alerts),
                core: tokio::sync::Mutex::new(Core {
                    scanner,
                    connection,
                    monitor: None,
                }),
                status: Mutex::new(Status {
                    state: SessionState::Idle,
                    device: None,
                    scan_generation: 0,
                }),
                devices,
                monitor_generation: AtomicU64::new(0),
                event_sender,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.status.lock().unwrap().state
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.shared.adapter.state()
    }

    /// Devices found by the latest scan that a device list should show.
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.shared
            .devices
            .read()
            .unwrap()
            .iter()
            .filter(|d| self.shared.scan_config.surfaces(d))
            .cloned()
            .collect()
    }

    pub fn connected_device(&self) -> Option<DiscoveredDevice> {
        self.shared.status.lock().unwrap().device.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.event_sender.subscribe()
    }

    /// Create a new stream that receives session events.
    pub fn event_stream(&self) -> Pin<Box<dyn Stream<Item = SessionEvent> + Send>> {
        let receiver = self.shared.event_sender.subscribe();
        Box::pin(BroadcastStream::new(receiver).filter_map(|x| async move { x.ok() }))
    }

    /// Checks permissions, brings the radio up and starts scanning unless a
    /// device is already connected.
    pub async fn start(&self) -> Result<()> {
        let result = self.shared.start().await;
        self.shared.report(result)
    }

    /// Starts a scan. Does nothing while connected or already scanning.
    pub async fn start_scan(&self) -> Result<()> {
        let result = async {
            let mut core = self.shared.core.lock().await;
            self.shared.start_scan_locked(&mut core).await
        }
        .await;
        self.shared.report(result)
    }

    pub async fn stop_scan(&self) -> Result<()> {
        let result = async {
            let mut core = self.shared.core.lock().await;
            self.shared.stop_scan_locked(&mut core).await
        }
        .await;
        self.shared.report(result)
    }

    /// Connects to a device found by the latest scan and starts monitoring
    /// its button.
    pub async fn connect(&self, device_id: &str) -> Result<()> {
        let result = self.shared.connect(device_id).await;
        self.shared.report(result)
    }

    /// Closes the connection. A no-op without one.
    pub async fn disconnect(&self) -> Result<()> {
        let result = async {
            let mut core = self.shared.core.lock().await;
            self.shared.disconnect_locked(&mut core).await
        }
        .await;
        self.shared.report(result)
    }

    /// Releases the monitor, the connection, the scan and the radio, in that
    /// order.
    pub async fn shutdown(&self) {
        self.shared.shutdown().await;
    }

    /// Allows adapter initialization to be attempted again after it was
    /// exhausted.
    pub fn reset(&self) {
        log::info!("Resetting BLE session");
        self.shared.adapter.reset();

        let unavailable = self.state() == SessionState::AdapterUnavailable;
        if unavailable {
            self.shared.set_state(SessionState::Idle);
        }
    }
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        self.event_sender.send(event).ok();
    }

    fn report<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.emit(SessionEvent::Error(e.clone()));
        }
        result
    }

    fn set_state(&self, state: SessionState) {
        let previous = std::mem::replace(&mut self.status.lock().unwrap().state, state);

        if previous != state {
            log::debug!("Session state: {:?} -> {:?}", previous, state);
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn set_device(&self, device: Option<DiscoveredDevice>) {
        self.status.lock().unwrap().device = device;
    }

    async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.permissions.ensure_permissions().await? {
            return Err(Error::PermissionDenied(
                "grant Bluetooth and location access in the system settings".into(),
            ));
        }

        self.ready_adapter().await?;

        let mut core = self.core.lock().await;
        if core.connection.is_active() {
            log::debug!("Device already connected, not scanning");
            return Ok(());
        }
        self.start_scan_locked(&mut core).await
    }

    /// The live radio, initializing it first when needed. Failed attempts are
    /// retried until the lifecycle's cap is reached.
    async fn ready_adapter(&self) -> Result<AdapterHandle> {
        if let Some(handle) = self.adapter.handle() {
            return Ok(handle);
        }

        let policy = self.config.adapter_retry_policy();

        loop {
            let initialized = self.adapter.initialize().await;
            match initialized {
                Ok(handle) => {
                    if self.status.lock().unwrap().state == SessionState::AdapterUnavailable {
                        self.set_state(SessionState::Idle);
                    }
                    return Ok(handle);
                }
                Err(Error::AdapterInitFailure(reason)) if !self.adapter.is_exhausted() => {
                    let delay = policy.delay_after(self.adapter.failures());
                    log::warn!("BLE adapter not ready ({}), retrying in {:?}", reason, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_adapter_init_failure() => {
                    self.set_state(SessionState::AdapterUnavailable);
                    return Err(Error::AdapterUnavailable {
                        attempts: self.adapter.failures(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn start_scan_locked(self: &Arc<Self>, core: &mut Core) -> Result<()> {
        if core.connection.is_active() {
            log::debug!("Device connected, not scanning");
            return Ok(());
        }
        if core.scanner.is_scanning() {
            return Ok(());
        }

        let adapter = self.ready_adapter().await?;

        let events = core.scanner.device_event_stream();
        let mut retry = BoundedRetry::new(self.config.scan_retry_policy());

        loop {
            let started = core
                .scanner
                .start(adapter.clone(), self.scan_config.clone())
                .await;
            match started {
                Ok(()) => break,
                Err(e) => match retry.record_failure() {
                    RetryDecision::RetryAfter(delay) => {
                        log::warn!("Could not start scan: {}. Retrying in {:?}", e, delay);
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::Exhausted => {
                        log::error!(
                            "Could not start scan after {} attempts: {}",
                            retry.failures(),
                            e
                        );
                        drop(events);
                        core.scanner.stop().await.ok();
                        return Err(e);
                    }
                },
            }
        }

        let generation = {
            let mut status = self.status.lock().unwrap();
            status.scan_generation += 1;
            status.scan_generation
        };
        self.set_state(SessionState::Scanning);

        tokio::spawn(forward_scan_events(Arc::downgrade(self), events, generation));

        Ok(())
    }

    async fn stop_scan_locked(&self, core: &mut Core) -> Result<()> {
        self.status.lock().unwrap().scan_generation += 1;
        let result = core.scanner.stop().await;

        if self.status.lock().unwrap().state == SessionState::Scanning {
            self.set_state(SessionState::Idle);
        }
        result
    }

    fn scan_finished(&self, generation: u64) {
        let current = {
            let status = self.status.lock().unwrap();
            status.scan_generation == generation && status.state == SessionState::Scanning
        };
        if current {
            self.set_state(SessionState::Idle);
        }
    }

    async fn connect(self: &Arc<Self>, device_id: &str) -> Result<()> {
        let mut core = self.core.lock().await;

        let device = self
            .devices
            .read()
            .unwrap()
            .get(device_id)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;

        let adapter = self.adapter.handle().ok_or(Error::AdapterNotReady)?;

        if core.scanner.is_scanning() {
            if let Err(e) = self.stop_scan_locked(&mut core).await {
                log::warn!("{}", e);
            }
        }

        if core.connection.is_active() {
            self.disconnect_locked(&mut core).await.ok();
        }

        self.set_state(SessionState::Connecting);

        if let Err(e) = core.connection.connect(&adapter, &device).await {
            self.set_state(SessionState::Idle);
            return Err(e);
        }

        self.set_device(Some(device.clone()));
        self.set_state(SessionState::Connected);
        self.emit(SessionEvent::Connected(device.clone()));

        if !self.config.monitor_delay.is_zero() {
            tokio::time::sleep(self.config.monitor_delay).await;
        }

        match self.start_monitor(&mut core, &adapter).await {
            Ok(()) => {
                core.connection.mark_monitoring();
                self.set_state(SessionState::Monitoring);
                Ok(())
            }
            Err(e) => {
                log::warn!("Could not monitor {}: {}", device.id, e);

                core.connection.disconnect(&adapter).await.ok();
                self.set_device(None);
                self.set_state(SessionState::Idle);
                self.emit(SessionEvent::Disconnected {
                    device_id: device.id.clone(),
                    unexpected: matches!(e, Error::LinkDropped(_)),
                });

                if let Err(scan_error) = self.start_scan_locked(&mut core).await {
                    self.emit(SessionEvent::Error(scan_error));
                }
                Err(e)
            }
        }
    }

    async fn start_monitor(
        self: &Arc<Self>,
        core: &mut Core,
        adapter: &AdapterHandle,
    ) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();

        let monitor = CharacteristicMonitor::start(
            adapter,
            &core.connection,
            self.config.service_uuid,
            self.config.characteristic_uuid,
            tx,
        )
        .await?;

        let generation = self.monitor_generation.load(Ordering::SeqCst);
        core.monitor = Some(monitor);

        tokio::spawn(supervise(Arc::downgrade(self), rx, generation));

        Ok(())
    }

    async fn stop_monitor(&self, core: &mut Core) {
        self.monitor_generation.fetch_add(1, Ordering::SeqCst);

        if let Some(mut monitor) = core.monitor.take() {
            log::debug!("Stopping monitor for {}", monitor.device_id());
            monitor.stop().await;
        }
    }

    async fn disconnect_locked(&self, core: &mut Core) -> Result<()> {
        self.stop_monitor(core).await;

        let result = match self.adapter.handle() {
            Some(adapter) => core.connection.disconnect(&adapter).await,
            None => {
                core.connection.clear();
                Ok(())
            }
        };

        let device = self.status.lock().unwrap().device.take();
        if let Some(device) = device {
            self.emit(SessionEvent::Disconnected {
                device_id: device.id,
                unexpected: false,
            });
        }

        let state = self.status.lock().unwrap().state;
        if matches!(
            state,
            SessionState::Connecting | SessionState::Connected | SessionState::Monitoring
        ) {
            self.set_state(SessionState::Idle);
        }

        result
    }

    async fn recover_link(self: &Arc<Self>, generation: u64, device_id: String, reason: String) {
        let mut core = self.core.lock().await;

        if self.monitor_generation.load(Ordering::SeqCst) != generation {
            log::debug!("Link loss of {} already handled", device_id);
            return;
        }

        log::warn!("Connection to {} lost: {}", device_id, reason);

        self.stop_monitor(&mut core).await;
        match self.adapter.handle() {
            Some(adapter) => {
                core.connection.disconnect(&adapter).await.ok();
            }
            None => core.connection.clear(),
        }

        self.set_device(None);
        self.set_state(SessionState::Idle);
        self.emit(SessionEvent::Disconnected {
            device_id,
            unexpected: true,
        });
        self.emit(SessionEvent::Error(Error::LinkDropped(reason)));

        if let Err(e) = self.start_scan_locked(&mut core).await {
            self.emit(SessionEvent::Error(e));
        }
    }

    async fn shutdown(&self) {
        log::info!("Shutting down BLE session");

        let mut core = self.core.lock().await;

        if let Err(e) = self.disconnect_locked(&mut core).await {
            log::warn!("{}", e);
        }
        if let Err(e) = self.stop_scan_locked(&mut core).await {
            log::warn!("{}", e);
        }
        self.adapter.teardown().await;

        if self.status.lock().unwrap().state != SessionState::AdapterUnavailable {
            self.set_state(SessionState::Idle);
        }
    }

    async fn dispatch_alert(self: Arc<Self>) {
        match self.alerts.dispatch().await {
            Ok(alert) => self.emit(SessionEvent::AlertSent(alert)),
            Err(e) => {
                log::error!("Emergency alert failed: {}", e);
                self.emit(SessionEvent::AlertFailed(e));
            }
        }
    }
}

async fn forward_scan_events(
    shared: Weak<Shared>,
    mut events: impl Stream<Item = ScanEvent> + Unpin,
    generation: u64,
) {
    while let Some(event) = events.next().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };

        match event {
            ScanEvent::Discovered(device) => shared.emit(SessionEvent::DeviceDiscovered(device)),
            ScanEvent::Updated(_) => {}
            ScanEvent::Failed(reason) => shared.emit(SessionEvent::Error(Error::Scan(reason))),
            ScanEvent::Stopped(_) => {
                shared.scan_finished(generation);
                break;
            }
        }
    }
}

async fn supervise(
    shared: Weak<Shared>,
    mut events: mpsc::UnboundedReceiver<MonitorEvent>,
    generation: u64,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };

        if shared.monitor_generation.load(Ordering::SeqCst) != generation {
            break;
        }

        match event {
            MonitorEvent::ButtonPressed { device_id } => {
                shared.emit(SessionEvent::ButtonPressed { device_id });
                tokio::spawn(shared.dispatch_alert());
            }
            MonitorEvent::LinkDropped { device_id, reason } => {
                shared.recover_link(generation, device_id, reason).await;
                break;
            }
        }
    }
}
