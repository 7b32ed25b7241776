use std::time::Duration;

use uuid::Uuid;

use crate::adapter::AdapterHandle;
use crate::common::defaults;
use crate::device::DiscoveredDevice;
use crate::transport::{GattService, TransportError};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Monitoring,
}

/// An established link with its discovered GATT table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    device: DiscoveredDevice,
    services: Vec<GattService>,
}

impl ConnectionHandle {
    pub fn device(&self) -> &DiscoveredDevice {
        &self.device
    }

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn services(&self) -> &[GattService] {
        &self.services
    }

    pub fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.services
            .iter()
            .any(|s| s.uuid == service && s.characteristics.contains(&characteristic))
    }
}

/// The one connection a session may hold.
pub struct ConnectionSession {
    state: ConnectionState,
    handle: Option<ConnectionHandle>,
    /// Id of the device a connect is in progress for.
    pending: Option<String>,
    timeout: Duration,
}

impl Default for ConnectionSession {
    fn default() -> Self {
        Self::new(defaults::CONNECT_TIMEOUT)
    }
}

impl ConnectionSession {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            handle: None,
            pending: None,
            timeout,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.handle.as_ref()
    }

    /// Whether a connection is being established or held.
    pub fn is_active(&self) -> bool {
        self.state != ConnectionState::Disconnected
    }

    /// Connects to `device`, discovers its services and checks the link
    /// survived discovery.
    ///
    /// An existing connection is closed first, and any half-open connection to
    /// `device` is cancelled before the attempt. On failure the state is back
    /// to [`ConnectionState::Disconnected`].
    pub async fn connect(
        &mut self,
        adapter: &AdapterHandle,
        device: &DiscoveredDevice,
    ) -> Result<ConnectionHandle> {
        if self.is_active() {
            self.disconnect(adapter).await.ok();
        }

        log::info!("Connecting to {} ({})", device.display_name(), device.id);

        if adapter.cancel_connection(&device.id).await.is_err() {
            log::debug!("No previous connection to {} to cancel", device.id);
        }

        self.state = ConnectionState::Connecting;
        self.pending = Some(device.id.clone());

        match self.establish(adapter, device).await {
            Ok(handle) => {
                log::info!("Connected to {}", device.display_name());
                self.state = ConnectionState::Connected;
                self.pending = None;
                self.handle = Some(handle.clone());
                Ok(handle)
            }
            Err(e) => {
                log::warn!("Connection to {} failed: {}", device.id, e);
                adapter.cancel_connection(&device.id).await.ok();
                self.clear();
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        adapter: &AdapterHandle,
        device: &DiscoveredDevice,
    ) -> Result<ConnectionHandle> {
        match tokio::time::timeout(self.timeout, adapter.connect(&device.id)).await {
            Err(_) => {
                return Err(Error::ConnectTimeout {
                    device_id: device.id.clone(),
                    timeout: self.timeout,
                })
            }
            Ok(Err(e)) => return Err(Error::ConnectFailure(e.to_string())),
            Ok(Ok(())) => {}
        }

        log::debug!("Discovering services for {}", device.id);
        let services = adapter
            .discover_services(&device.id)
            .await
            .map_err(|e| Error::ConnectFailure(format!("service discovery failed: {}", e)))?;

        for service in &services {
            log::trace!("  Service {}: {:?}", service.uuid, service.characteristics);
        }

        // The link can drop between connect and discovery.
        if !adapter.is_connected(&device.id).await.unwrap_or(false) {
            return Err(Error::ConnectFailure(
                "device disconnected right after connecting".into(),
            ));
        }

        Ok(ConnectionHandle {
            device: device.clone(),
            services,
        })
    }

    /// Closes the connection. Having nothing to close, or a device that is
    /// already gone, counts as success; local state is cleared either way.
    pub async fn disconnect(&mut self, adapter: &AdapterHandle) -> Result<()> {
        let device_id = match (self.handle.take(), self.pending.take()) {
            (Some(handle), _) => handle.device.id,
            (None, Some(pending)) => pending,
            (None, None) => {
                log::debug!("No connected device to disconnect");
                self.state = ConnectionState::Disconnected;
                return Ok(());
            }
        };
        self.state = ConnectionState::Disconnected;

        match adapter.cancel_connection(&device_id).await {
            Ok(()) => {
                log::info!("Disconnected from {}", device_id);
                Ok(())
            }
            Err(TransportError::Disconnected | TransportError::DeviceNotFound) => {
                log::debug!("{} was already disconnected", device_id);
                Ok(())
            }
            Err(e) => {
                log::warn!("Error while disconnecting from {}: {}", device_id, e);
                Err(Error::Disconnect(e.to_string()))
            }
        }
    }

    /// Marks the subscription on this connection as live.
    pub(crate) fn mark_monitoring(&mut self) {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Monitoring;
        }
    }

    /// Forgets the connection without talking to the radio.
    pub fn clear(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.handle = None;
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::adapter::AdapterLifecycle;
    use crate::common::uuids::{BUTTON_CHARACTERISTIC, BUTTON_SERVICE};
    use crate::transport::mock::{ConnectBehavior, MockTransport};

    async fn ready_adapter(transport: &MockTransport) -> AdapterHandle {
        AdapterLifecycle::new(Arc::new(transport.clone()))
            .with_settle_delay(Duration::ZERO)
            .initialize()
            .await
            .unwrap()
    }

    fn device(id: &str) -> DiscoveredDevice {
        DiscoveredDevice::new(id, Some("ESP32-X".into()), Some(-50))
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_discovers_services() {
        let transport = MockTransport::new();
        let adapter = ready_adapter(&transport).await;
        let mut connection = ConnectionSession::default();

        let handle = connection.connect(&adapter, &device("A")).await.unwrap();

        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(handle.device_id(), "A");
        assert!(handle.has_characteristic(BUTTON_SERVICE, BUTTON_CHARACTERISTIC));
        assert!(transport.is_connected("A"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_cancels_partial_connection() {
        let transport = MockTransport::new();
        transport.set_connect_behavior("A", ConnectBehavior::Hang);
        let adapter = ready_adapter(&transport).await;
        let mut connection = ConnectionSession::new(Duration::from_secs(10));

        let started = tokio::time::Instant::now();
        let err = connection.connect(&adapter, &device("A")).await.unwrap_err();

        assert!(matches!(err, Error::ConnectTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        // One cancel before the attempt, one after the timeout.
        assert_eq!(transport.cancel_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_returns_to_disconnected() {
        let transport = MockTransport::new();
        transport.set_connect_behavior(
            "A",
            ConnectBehavior::Fail(TransportError::Other("GATT 133".into())),
        );
        let adapter = ready_adapter(&transport).await;
        let mut connection = ConnectionSession::default();

        let err = connection.connect(&adapter, &device("A")).await.unwrap_err();

        assert!(matches!(err, Error::ConnectFailure(_)));
        assert!(connection.handle().is_none());
        assert!(!connection.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_dropping_during_discovery_is_a_failure() {
        let transport = MockTransport::new();
        transport.set_connect_behavior("A", ConnectBehavior::DropAfterConnect);
        let adapter = ready_adapter(&transport).await;
        let mut connection = ConnectionSession::default();

        let err = connection.connect(&adapter, &device("A")).await.unwrap_err();

        assert!(matches!(err, Error::ConnectFailure(_)));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_without_connection_is_noop() {
        let transport = MockTransport::new();
        let adapter = ready_adapter(&transport).await;
        let mut connection = ConnectionSession::default();

        assert!(connection.disconnect(&adapter).await.is_ok());
        assert!(connection.disconnect(&adapter).await.is_ok());
        assert_eq!(transport.cancel_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_tolerates_already_gone_device() {
        let transport = MockTransport::new();
        let adapter = ready_adapter(&transport).await;
        let mut connection = ConnectionSession::default();
        connection.connect(&adapter, &device("A")).await.unwrap();

        transport.drop_link("A");

        assert!(connection.disconnect(&adapter).await.is_ok());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connecting_elsewhere_closes_existing_link() {
        let transport = MockTransport::new();
        let adapter = ready_adapter(&transport).await;
        let mut connection = ConnectionSession::default();

        connection.connect(&adapter, &device("A")).await.unwrap();
        connection.connect(&adapter, &device("B")).await.unwrap();

        assert!(!transport.is_connected("A"));
        assert!(transport.is_connected("B"));
        assert_eq!(connection.handle().map(|h| h.device_id()), Some("B"));
    }
}
