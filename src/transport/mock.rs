//! Scripted in-memory transport.
//!
//! [`MockTransport`] is both the [`AdapterFactory`] and the remote control for
//! the adapters it creates: tests and demos push advertisements and
//! notifications through it and inspect what the session asked the radio to do.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use uuid::Uuid;

use super::{
    watch_link, AdapterFactory, Advertisement, AdvertisementStream, BleAdapter, GattService,
    NotificationStream, TransportError, TransportResult,
};
use crate::common::uuids::{BUTTON_CHARACTERISTIC, BUTTON_SERVICE};

/// How the mock answers a connect request for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectBehavior {
    Succeed,
    Fail(TransportError),
    /// The connect call never resolves.
    Hang,
    /// Connect succeeds but the link is gone by the time anyone checks.
    DropAfterConnect,
}

struct MockState {
    creations: u32,
    failing_creations: u32,
    create_delay: Duration,
    destroyed: u32,

    scan_tx: Option<mpsc::UnboundedSender<TransportResult<Advertisement>>>,
    scan_starts: u32,
    failing_scan_starts: u32,
    stop_scans: u32,
    last_scan_filter: Vec<Uuid>,

    connect_behavior: HashMap<String, ConnectBehavior>,
    connected: HashSet<String>,
    connect_calls: u32,
    cancel_calls: u32,
    services: Vec<GattService>,

    notify_tx: Option<mpsc::UnboundedSender<TransportResult<String>>>,
    /// Ids of peripherals the radio reports as gone.
    disconnects: broadcast::Sender<String>,
    subscriptions: u32,
    unsubscriptions: u32,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            creations: 0,
            failing_creations: 0,
            create_delay: Duration::ZERO,
            destroyed: 0,
            scan_tx: None,
            scan_starts: 0,
            failing_scan_starts: 0,
            stop_scans: 0,
            last_scan_filter: Vec::new(),
            connect_behavior: HashMap::new(),
            connected: HashSet::new(),
            connect_calls: 0,
            cancel_calls: 0,
            services: vec![GattService {
                uuid: BUTTON_SERVICE,
                characteristics: vec![BUTTON_CHARACTERISTIC],
            }],
            notify_tx: None,
            disconnects: broadcast::channel(16).0,
            subscriptions: 0,
            unsubscriptions: 0,
        }
    }
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    // --- adapter construction ---

    /// Makes the next `count` adapter constructions fail.
    pub fn fail_next_creations(&self, count: u32) {
        self.with_state(|s| s.failing_creations = count);
    }

    /// Delays every adapter construction.
    pub fn set_create_delay(&self, delay: Duration) {
        self.with_state(|s| s.create_delay = delay);
    }

    /// Number of adapter constructions attempted.
    pub fn creations(&self) -> u32 {
        self.with_state(|s| s.creations)
    }

    pub fn destroyed(&self) -> u32 {
        self.with_state(|s| s.destroyed)
    }

    // --- scanning ---

    /// Reports an advertisement to the active scan. Returns `false` when no
    /// scan is running.
    pub fn advertise(&self, id: &str, name: Option<&str>, rssi: Option<i16>) -> bool {
        let adv = Advertisement {
            id: id.to_string(),
            name: name.map(str::to_string),
            rssi,
        };
        self.with_state(|s| match &s.scan_tx {
            Some(tx) => tx.send(Ok(adv)).is_ok(),
            None => false,
        })
    }

    /// Reports an error on the active scan stream.
    pub fn fail_scan(&self, error: TransportError) -> bool {
        self.with_state(|s| match &s.scan_tx {
            Some(tx) => tx.send(Err(error)).is_ok(),
            None => false,
        })
    }

    /// Makes the next `count` scan starts fail.
    pub fn fail_next_scan_starts(&self, count: u32) {
        self.with_state(|s| s.failing_scan_starts = count);
    }

    pub fn scan_starts(&self) -> u32 {
        self.with_state(|s| s.scan_starts)
    }

    pub fn stop_scans(&self) -> u32 {
        self.with_state(|s| s.stop_scans)
    }

    pub fn is_scanning(&self) -> bool {
        self.with_state(|s| s.scan_tx.is_some())
    }

    pub fn last_scan_filter(&self) -> Vec<Uuid> {
        self.with_state(|s| s.last_scan_filter.clone())
    }

    // --- connections ---

    pub fn set_connect_behavior(&self, device_id: &str, behavior: ConnectBehavior) {
        self.with_state(|s| {
            s.connect_behavior.insert(device_id.to_string(), behavior);
        });
    }

    pub fn set_services(&self, services: Vec<GattService>) {
        self.with_state(|s| s.services = services);
    }

    pub fn connect_calls(&self) -> u32 {
        self.with_state(|s| s.connect_calls)
    }

    pub fn cancel_calls(&self) -> u32 {
        self.with_state(|s| s.cancel_calls)
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.with_state(|s| s.connected.contains(device_id))
    }

    // --- notifications ---

    /// Sends `value` base64-encoded, as a peripheral notification would arrive.
    pub fn notify(&self, value: &str) -> bool {
        self.notify_encoded(&STANDARD.encode(value))
    }

    /// Sends an already-encoded (or deliberately malformed) value.
    pub fn notify_encoded(&self, encoded: &str) -> bool {
        self.with_state(|s| match &s.notify_tx {
            Some(tx) => tx.send(Ok(encoded.to_string())).is_ok(),
            None => false,
        })
    }

    pub fn notify_error(&self, error: TransportError) -> bool {
        self.with_state(|s| match &s.notify_tx {
            Some(tx) => tx.send(Err(error)).is_ok(),
            None => false,
        })
    }

    /// Simulates the peripheral going out of range. The radio reports the
    /// disconnect while the notification channel stays open.
    pub fn drop_link(&self, device_id: &str) -> bool {
        self.with_state(|s| {
            s.connected.remove(device_id);
            s.disconnects.send(device_id.to_string()).is_ok()
        })
    }

    pub fn is_subscribed(&self) -> bool {
        self.with_state(|s| s.notify_tx.is_some())
    }

    pub fn subscriptions(&self) -> u32 {
        self.with_state(|s| s.subscriptions)
    }

    pub fn unsubscriptions(&self) -> u32 {
        self.with_state(|s| s.unsubscriptions)
    }
}

#[async_trait]
impl AdapterFactory for MockTransport {
    async fn create(&self) -> TransportResult<Arc<dyn BleAdapter>> {
        let delay = self.with_state(|s| {
            s.creations += 1;
            s.create_delay
        });

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let fail = self.with_state(|s| {
            if s.failing_creations > 0 {
                s.failing_creations -= 1;
                true
            } else {
                false
            }
        });

        if fail {
            return Err(TransportError::Other("radio is powered off".into()));
        }

        Ok(Arc::new(MockAdapter {
            transport: self.clone(),
            destroyed: AtomicBool::new(false),
        }))
    }
}

pub struct MockAdapter {
    transport: MockTransport,
    destroyed: AtomicBool,
}

impl MockAdapter {
    fn check_alive(&self) -> TransportResult<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(TransportError::Other("adapter has been destroyed".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BleAdapter for MockAdapter {
    async fn start_scan(&self, services: &[Uuid]) -> TransportResult<AdvertisementStream> {
        self.check_alive()?;

        self.transport.with_state(|s| {
            s.scan_starts += 1;
            if s.failing_scan_starts > 0 {
                s.failing_scan_starts -= 1;
                return Err(TransportError::Other("scan could not be started".into()));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            s.scan_tx = Some(tx);
            s.last_scan_filter = services.to_vec();

            let stream: AdvertisementStream = Box::pin(UnboundedReceiverStream::new(rx));
            Ok(stream)
        })
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        self.transport.with_state(|s| {
            s.stop_scans += 1;
            s.scan_tx = None;
        });
        Ok(())
    }

    async fn connect(&self, device_id: &str) -> TransportResult<()> {
        self.check_alive()?;

        let behavior = self.transport.with_state(|s| {
            s.connect_calls += 1;
            s.connect_behavior
                .get(device_id)
                .cloned()
                .unwrap_or(ConnectBehavior::Succeed)
        });

        match behavior {
            ConnectBehavior::Succeed => {
                self.transport.with_state(|s| s.connected.insert(device_id.to_string()));
                Ok(())
            }
            ConnectBehavior::DropAfterConnect => Ok(()),
            ConnectBehavior::Fail(e) => Err(e),
            ConnectBehavior::Hang => {
                futures::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    async fn cancel_connection(&self, device_id: &str) -> TransportResult<()> {
        let was_connected = self.transport.with_state(|s| {
            s.cancel_calls += 1;
            s.notify_tx = None;
            s.connected.remove(device_id)
        });

        if was_connected {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }

    async fn discover_services(&self, device_id: &str) -> TransportResult<Vec<GattService>> {
        self.check_alive()?;

        self.transport.with_state(|s| {
            if s.connected.contains(device_id)
                || s.connect_behavior.get(device_id) == Some(&ConnectBehavior::DropAfterConnect)
            {
                Ok(s.services.clone())
            } else {
                Err(TransportError::Disconnected)
            }
        })
    }

    async fn is_connected(&self, device_id: &str) -> TransportResult<bool> {
        self.check_alive()?;
        Ok(self.transport.is_connected(device_id))
    }

    async fn subscribe(
        &self,
        device_id: &str,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> TransportResult<NotificationStream> {
        self.check_alive()?;

        self.transport.with_state(|s| {
            if !s.connected.contains(device_id) {
                return Err(TransportError::Disconnected);
            }

            let (tx, rx) = mpsc::unbounded_channel();
            s.notify_tx = Some(tx);
            s.subscriptions += 1;

            let disconnects = BroadcastStream::new(s.disconnects.subscribe())
                .filter_map(|id| futures::future::ready(id.ok()));

            Ok(watch_link(
                UnboundedReceiverStream::new(rx),
                disconnects,
                device_id.to_string(),
            ))
        })
    }

    async fn unsubscribe(
        &self,
        _device_id: &str,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> TransportResult<()> {
        self.transport.with_state(|s| {
            s.notify_tx = None;
            s.unsubscriptions += 1;
        });
        Ok(())
    }

    async fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.transport.with_state(|s| {
                s.destroyed += 1;
                s.scan_tx = None;
                s.notify_tx = None;
                s.connected.clear();
            });
        }
    }
}
