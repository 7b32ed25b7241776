//! The seam between the session logic and a BLE stack.
//!
//! An [`AdapterFactory`] produces [`BleAdapter`]s; the adapter lifecycle owns
//! the single live one. Notification values cross this boundary
//! base64-encoded, the way the mobile BLE bridges hand them over.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{future, stream, Stream, StreamExt};
use thiserror::Error;
use uuid::Uuid;

#[cfg(feature = "btleplug")]
pub mod btleplug;
pub mod mock;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("device is disconnected")]
    Disconnected,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("device not found")]
    DeviceNotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

impl TransportError {
    /// Whether the error means the link to the peripheral is gone.
    pub fn is_link_dropped(&self) -> bool {
        match self {
            Self::Disconnected => true,
            Self::Other(message) => message.to_lowercase().contains("disconnected"),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Other(message) => message.to_lowercase().contains("operation was cancelled"),
            _ => false,
        }
    }
}

/// One advertisement report from a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// A GATT service and the characteristics discovered under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

pub type AdvertisementStream = Pin<Box<dyn Stream<Item = TransportResult<Advertisement>> + Send>>;

/// Base64-encoded characteristic values, or the error the channel reported.
pub type NotificationStream = Pin<Box<dyn Stream<Item = TransportResult<String>> + Send>>;

#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Starts discovery of devices advertising any of `services`
    /// (all devices when empty).
    async fn start_scan(&self, services: &[Uuid]) -> TransportResult<AdvertisementStream>;

    async fn stop_scan(&self) -> TransportResult<()>;

    async fn connect(&self, device_id: &str) -> TransportResult<()>;

    /// Cancels a pending or established connection.
    async fn cancel_connection(&self, device_id: &str) -> TransportResult<()>;

    async fn discover_services(&self, device_id: &str) -> TransportResult<Vec<GattService>>;

    async fn is_connected(&self, device_id: &str) -> TransportResult<bool>;

    async fn subscribe(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> TransportResult<NotificationStream>;

    async fn unsubscribe(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> TransportResult<()>;

    /// Releases the radio. The adapter is unusable afterwards.
    async fn destroy(&self);
}

#[async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn create(&self) -> TransportResult<Arc<dyn BleAdapter>>;
}

/// Merges the radio's disconnect reports for `device` into its notification
/// stream.
///
/// Some stacks keep the notification channel open after the peripheral is
/// gone, so a [`TransportError::Disconnected`] is yielded as soon as
/// `disconnects` names `device`, whatever the channel does.
pub fn watch_link<S, D, I>(values: S, disconnects: D, device: I) -> NotificationStream
where
    S: Stream<Item = TransportResult<String>> + Send + 'static,
    D: Stream<Item = I> + Send + 'static,
    I: PartialEq + Send + 'static,
{
    let dropped = disconnects
        .filter(move |id| future::ready(*id == device))
        .take(1)
        .map(|_| Err::<String, _>(TransportError::Disconnected));

    Box::pin(stream::select(values, dropped))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_dropped_classification() {
        assert!(TransportError::Disconnected.is_link_dropped());
        assert!(TransportError::Other("Device 12:34 was disconnected".into()).is_link_dropped());
        assert!(!TransportError::Cancelled.is_link_dropped());
        assert!(!TransportError::Other("GATT error 133".into()).is_link_dropped());
    }

    #[test]
    fn test_cancelled_classification() {
        assert!(TransportError::Cancelled.is_cancelled());
        assert!(TransportError::Other("Operation was cancelled".into()).is_cancelled());
        assert!(!TransportError::Disconnected.is_cancelled());
    }

    #[tokio::test]
    async fn test_watch_link_reports_disconnect_of_watched_device() {
        // The notification channel never closes, like BlueZ after a power-off
        let values = stream::iter(vec![Ok("MQ==".to_string())]).chain(stream::pending());
        let disconnects = stream::iter(vec!["B".to_string(), "A".to_string()]);

        let mut link = watch_link(values, disconnects, "A".to_string());

        let mut items = vec![link.next().await.unwrap(), link.next().await.unwrap()];
        items.sort_by_key(|item| item.is_err());

        assert_eq!(
            items,
            vec![Ok("MQ==".to_string()), Err(TransportError::Disconnected)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_link_ignores_other_devices() {
        let values = stream::pending::<TransportResult<String>>();
        let disconnects = stream::iter(vec!["B".to_string(), "C".to_string()]);

        let mut link = watch_link(values, disconnects, "A".to_string());

        let next = tokio::time::timeout(std::time::Duration::from_secs(1), link.next()).await;
        assert!(next.is_err());
    }
}
