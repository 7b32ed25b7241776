use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::{Stream, StreamExt};
use stream_cancel::{Trigger, Valved};
use tokio::sync::broadcast;
use tokio::sync::broadcast::Sender;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::adapter::AdapterHandle;
use crate::common::defaults;
use crate::device::{DeviceSet, DiscoveredDevice, Insertion};
use crate::transport::AdvertisementStream;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Only devices advertising one of these services are reported.
    services: Vec<Uuid>,
    /// Only devices whose name starts with this prefix are surfaced.
    name_prefix: Option<String>,
    /// Unnamed devices are collected but not surfaced.
    require_name: bool,
    /// The scan is stopped when timeout duration is reached.
    timeout: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            name_prefix: None,
            require_name: false,
            timeout: defaults::SCAN_TIMEOUT,
        }
    }
}

impl ScanConfig {
    /// Filter scanned devices based on advertised services
    pub fn filter_by_services(mut self, services: impl IntoIterator<Item = Uuid>) -> Self {
        self.services = services.into_iter().collect();
        self
    }

    /// Surface only devices whose name starts with `prefix`
    pub fn filter_by_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    /// Stop the scan after given duration
    pub fn stop_after_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Require that the surfaced devices have a name
    pub fn require_name(mut self) -> Self {
        self.require_name = true;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn services(&self) -> &[Uuid] {
        &self.services
    }

    pub(crate) fn surfaces(&self, device: &DiscoveredDevice) -> bool {
        if self.require_name && !device.has_name() {
            return false;
        }

        match (&self.name_prefix, &device.name) {
            (Some(prefix), Some(name)) => name.starts_with(prefix.as_str()),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Timeout,
    Failed,
    /// The radio closed the advertisement stream.
    Ended,
}

#[derive(Debug, Clone)]
pub enum ScanEvent {
    Discovered(DiscoveredDevice),
    Updated(DiscoveredDevice),
    Failed(String),
    Stopped(StopReason),
}

/// Time-boxed discovery session on top of an adapter handle.
pub struct ScanSession {
    adapter: Option<AdapterHandle>,
    devices: Arc<RwLock<DeviceSet>>,
    scanning: Arc<AtomicBool>,
    event_sender: Sender<ScanEvent>,
    scan_stopper: Option<Trigger>,
    listener: Option<JoinHandle<()>>,
    device_stream_stoppers: Arc<RwLock<Vec<Trigger>>>,
}

impl Default for ScanSession {
    fn default() -> Self {
        ScanSession::new()
    }
}

impl ScanSession {
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(64);

        Self {
            adapter: None,
            devices: Arc::new(RwLock::new(DeviceSet::new())),
            scanning: Arc::new(AtomicBool::new(false)),
            event_sender,
            scan_stopper: None,
            listener: None,
            device_stream_stoppers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Start scanning for ble devices.
    ///
    /// The discovered-device set is cleared first. The scan stops by itself
    /// once the configured timeout elapses.
    pub async fn start(&mut self, adapter: AdapterHandle, config: ScanConfig) -> Result<()> {
        if self.is_scanning() {
            log::info!("Scanner is already started.");
            return Ok(());
        }
        self.release_listener();

        self.devices.write().unwrap().clear();

        log::info!("Starting the scan");

        let advertisements = adapter
            .start_scan(&config.services)
            .await
            .map_err(|e| Error::Scan(e.to_string()))?;

        let (stopper, advertisements) = Valved::new(advertisements);

        self.scanning.store(true, Ordering::SeqCst);

        let ctx = ScanContext {
            adapter: adapter.clone(),
            config,
            devices: self.devices.clone(),
            scanning: self.scanning.clone(),
            event_sender: self.event_sender.clone(),
            device_stream_stoppers: self.device_stream_stoppers.clone(),
        };

        self.listener = Some(tokio::spawn(ctx.listen(advertisements)));
        self.scan_stopper = Some(stopper);
        self.adapter = Some(adapter);

        Ok(())
    }

    /// Stop scanning for ble devices.
    pub async fn stop(&mut self) -> Result<()> {
        let was_scanning = self.scanning.swap(false, Ordering::SeqCst);
        self.scan_stopper.take();
        self.device_stream_stoppers.write().unwrap().clear();

        if let Some(listener) = self.listener.take() {
            listener.await.ok();
        }

        match self.adapter.take() {
            Some(adapter) if was_scanning => {
                log::info!("Stopping the scan");
                adapter
                    .stop_scan()
                    .await
                    .map_err(|e| Error::Scan(e.to_string()))?;
            }
            _ => log::debug!("Scanner is already stopped"),
        }

        Ok(())
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Every device seen in the current scan, in discovery order.
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.devices.read().unwrap().iter().cloned().collect()
    }

    /// Named devices, the ones a user-facing list shows.
    pub fn surfaced_devices(&self) -> Vec<DiscoveredDevice> {
        self.devices.read().unwrap().named().cloned().collect()
    }

    pub fn device(&self, id: &str) -> Option<DiscoveredDevice> {
        self.devices.read().unwrap().get(id).cloned()
    }

    /// The set this session collects into. It is cleared, never replaced, on
    /// each start.
    pub(crate) fn device_set(&self) -> Arc<RwLock<DeviceSet>> {
        self.devices.clone()
    }

    /// Create a new stream that receives scan events.
    ///
    /// When the scan stops by itself the last item is [`ScanEvent::Stopped`].
    /// [`ScanSession::stop`] ends the stream right away.
    pub fn device_event_stream(
        &mut self,
    ) -> Valved<Pin<Box<dyn Stream<Item = ScanEvent> + Send>>> {
        let stream: Pin<Box<dyn Stream<Item = ScanEvent> + Send>> = Box::pin(self.scan_events());

        let (trigger, stream) = Valved::new(stream);
        self.device_stream_stoppers.write().unwrap().push(trigger);

        stream
    }

    /// Create a new stream that receives newly discovered, surfaced devices.
    pub fn device_stream(
        &mut self,
    ) -> Valved<Pin<Box<dyn Stream<Item = DiscoveredDevice> + Send>>> {
        let stream: Pin<Box<dyn Stream<Item = DiscoveredDevice> + Send>> =
            Box::pin(self.scan_events().filter_map(|event| async move {
                match event {
                    ScanEvent::Discovered(device) => Some(device),
                    _ => None,
                }
            }));

        let (trigger, stream) = Valved::new(stream);
        self.device_stream_stoppers.write().unwrap().push(trigger);

        stream
    }

    /// Events of the current or next scan, up to and including its
    /// [`ScanEvent::Stopped`].
    fn scan_events(&self) -> impl Stream<Item = ScanEvent> + Send {
        BroadcastStream::new(self.event_sender.subscribe())
            .filter_map(|x| async move { x.ok() })
            .scan(false, |stopped, event| {
                let next = (!*stopped).then(|| {
                    *stopped = matches!(event, ScanEvent::Stopped(_));
                    event
                });
                async move { next }
            })
    }

    /// Detaches the listener of a scan that already stopped by itself.
    fn release_listener(&mut self) {
        self.scan_stopper.take();
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        self.adapter.take();
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

struct ScanContext {
    /// Handle the scan runs on, used to stop it on timeout or failure
    adapter: AdapterHandle,
    /// Filters and stop condition
    config: ScanConfig,
    /// Devices collected so far
    devices: Arc<RwLock<DeviceSet>>,
    scanning: Arc<AtomicBool>,
    /// Channel for sending events to the client
    event_sender: Sender<ScanEvent>,
    /// Valves of the streams following this scan
    device_stream_stoppers: Arc<RwLock<Vec<Trigger>>>,
}

impl ScanContext {
    async fn listen(self, mut advertisements: Valved<AdvertisementStream>) {
        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);

        let reason = loop {
            tokio::select! {
                _ = &mut deadline => {
                    log::info!("Scan timeout of {:?} reached.", self.config.timeout);
                    break Some(StopReason::Timeout);
                }
                next = advertisements.next() => match next {
                    Some(Ok(adv)) => self.on_advertisement(adv.into()),
                    Some(Err(e)) => {
                        log::error!("Error while scanning: {}", e);
                        self.event_sender.send(ScanEvent::Failed(e.to_string())).ok();
                        break Some(StopReason::Failed);
                    }
                    // Valve closed by `stop()`, or the radio ended the stream.
                    None => break self.scanning.load(Ordering::SeqCst).then_some(StopReason::Ended),
                },
            }
        };

        let Some(reason) = reason else {
            log::info!("Scanner was stopped.");
            return;
        };

        // Streams end on the `Stopped` event below; their valves are no
        // longer needed. Released before `scanning` drops so a new scan
        // cannot register one in between.
        for trigger in self.device_stream_stoppers.write().unwrap().drain(..) {
            trigger.disable();
        }

        if self.scanning.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.adapter.stop_scan().await {
                log::warn!("Could not stop the scan: {}", e);
            }
        }

        self.event_sender.send(ScanEvent::Stopped(reason)).ok();

        log::info!("Scanner was stopped ({:?}).", reason);
    }

    fn on_advertisement(&self, device: DiscoveredDevice) {
        log::trace!("Device discovered: {:?}", device);

        let insertion = self.devices.write().unwrap().insert(device.clone());

        if !self.config.surfaces(&device) {
            return;
        }

        let event = match insertion {
            Insertion::New => {
                log::info!("Found device: {} ({})", device.display_name(), device.id);
                ScanEvent::Discovered(device)
            }
            Insertion::Updated => ScanEvent::Updated(device),
            Insertion::Unchanged => return,
        };

        self.event_sender.send(event).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterLifecycle;
    use crate::transport::mock::MockTransport;

    async fn ready_adapter(transport: &MockTransport) -> AdapterHandle {
        AdapterLifecycle::new(Arc::new(transport.clone()))
            .with_settle_delay(Duration::ZERO)
            .initialize()
            .await
            .unwrap()
    }

    #[test]
    fn test_config_surfacing() {
        let named = DiscoveredDevice::new("A", Some("ESP32-X".into()), None);
        let unnamed = DiscoveredDevice::new("B", None, None);
        let other = DiscoveredDevice::new("C", Some("Watch".into()), None);

        let config = ScanConfig::default().require_name();
        assert!(config.surfaces(&named));
        assert!(!config.surfaces(&unnamed));

        let config = ScanConfig::default().filter_by_name_prefix("ESP32");
        assert!(config.surfaces(&named));
        assert!(!config.surfaces(&other));
        assert!(!config.surfaces(&unnamed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_advertisements_are_collected_once() {
        let transport = MockTransport::new();
        let adapter = ready_adapter(&transport).await;

        let mut scanner = ScanSession::new();
        let mut discovered = scanner.device_stream();
        scanner
            .start(adapter, ScanConfig::default().require_name())
            .await
            .unwrap();

        transport.advertise("A", Some("ESP32-X"), Some(-60));
        transport.advertise("A", Some("ESP32-X"), Some(-60));
        transport.advertise("B", None, Some(-90));

        let first = discovered.next().await.unwrap();
        assert_eq!(first.id, "A");
        tokio::task::yield_now().await;

        let ids: Vec<_> = scanner.devices().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(scanner.surfaced_devices().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_stops_after_timeout() {
        let transport = MockTransport::new();
        let adapter = ready_adapter(&transport).await;

        let mut scanner = ScanSession::new();
        let mut events = scanner.device_event_stream();
        scanner
            .start(
                adapter,
                ScanConfig::default().stop_after_timeout(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert!(transport.is_scanning());

        let event = events.next().await.unwrap();
        assert!(matches!(event, ScanEvent::Stopped(StopReason::Timeout)));
        assert!(events.next().await.is_none());
        assert!(!scanner.is_scanning());
        assert!(!transport.is_scanning());
        assert_eq!(transport.stop_scans(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_scans_release_stream_valves() {
        let transport = MockTransport::new();
        let adapter = ready_adapter(&transport).await;
        let config = ScanConfig::default().stop_after_timeout(Duration::from_secs(1));

        let mut scanner = ScanSession::new();

        for _ in 0..50 {
            let mut events = scanner.device_event_stream();
            scanner.start(adapter.clone(), config.clone()).await.unwrap();

            assert!(matches!(
                events.next().await,
                Some(ScanEvent::Stopped(StopReason::Timeout))
            ));
            assert!(events.next().await.is_none());
        }

        assert!(scanner.device_stream_stoppers.read().unwrap().is_empty());
        assert_eq!(transport.scan_starts(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_streams() {
        let transport = MockTransport::new();
        let adapter = ready_adapter(&transport).await;

        let mut scanner = ScanSession::new();
        let mut events = scanner.device_event_stream();
        scanner.start(adapter, ScanConfig::default()).await.unwrap();

        scanner.stop().await.unwrap();

        assert!(events.next().await.is_none());
        assert!(scanner.device_stream_stoppers.read().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_error_stops_scan() {
        let transport = MockTransport::new();
        let adapter = ready_adapter(&transport).await;

        let mut scanner = ScanSession::new();
        let mut events = scanner.device_event_stream();
        scanner.start(adapter, ScanConfig::default()).await.unwrap();

        transport.fail_scan(crate::transport::TransportError::Other("gatt 133".into()));

        assert!(matches!(events.next().await, Some(ScanEvent::Failed(_))));
        assert!(matches!(
            events.next().await,
            Some(ScanEvent::Stopped(StopReason::Failed))
        ));
        assert!(!scanner.is_scanning());
        assert!(scanner.device_stream_stoppers.read().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_clears_devices() {
        let transport = MockTransport::new();
        let adapter = ready_adapter(&transport).await;

        let mut scanner = ScanSession::new();
        scanner.start(adapter.clone(), ScanConfig::default()).await.unwrap();
        transport.advertise("A", Some("ESP32-X"), None);
        tokio::task::yield_now().await;
        assert_eq!(scanner.devices().len(), 1);

        scanner.stop().await.unwrap();
        assert!(!transport.is_scanning());

        scanner.start(adapter, ScanConfig::default()).await.unwrap();
        assert!(scanner.devices().is_empty());
        assert_eq!(transport.scan_starts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_idle_is_noop() {
        let mut scanner = ScanSession::new();
        scanner.stop().await.unwrap();
        assert!(!scanner.is_scanning());
    }
}
