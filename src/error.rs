//! Error types for the BLE session and the alert pipeline.
//!
//! BLE-layer failures are [`Error`]. Failures of the downstream alert path are
//! [`AlertError`] so callers can tell "couldn't reach the device" apart from
//! "couldn't send the alert".

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::phone::PhoneError;

/// What the user can do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    /// Nothing to do; the session recovers on its own.
    None,
    /// Offer a retry (rescan or reconnect).
    Retry,
    /// Deep-link into the system settings.
    OpenSettings,
    /// The radio is gone until the application restarts.
    RestartApp,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    // =========================================================================
    // PLATFORM & PERMISSIONS
    // =========================================================================
    #[error("BLE is not supported on this platform")]
    PlatformUnsupported,

    #[error("Bluetooth permissions not granted: {0}")]
    PermissionDenied(String),

    // =========================================================================
    // ADAPTER
    // =========================================================================
    #[error("Failed to initialize BLE adapter: {0}")]
    AdapterInitFailure(String),

    /// Terminal form of [`Error::AdapterInitFailure`].
    #[error("BLE adapter unavailable after {attempts} failed attempts. Restart the application.")]
    AdapterUnavailable { attempts: u32 },

    #[error("BLE adapter is not ready")]
    AdapterNotReady,

    // =========================================================================
    // SCAN & CONNECTION
    // =========================================================================
    #[error("Scan failed: {0}")]
    Scan(String),

    #[error("Device not found: '{0}'")]
    DeviceNotFound(String),

    #[error("Connection to '{device_id}' timed out after {timeout:?}")]
    ConnectTimeout { device_id: String, timeout: Duration },

    #[error("Could not connect: {0}")]
    ConnectFailure(String),

    #[error("Failed to disconnect: {0}")]
    Disconnect(String),

    #[error("Connection lost: {0}")]
    LinkDropped(String),

    // =========================================================================
    // MONITORING
    // =========================================================================
    #[error("Characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },

    #[error("Failed to start monitoring: {0}")]
    Monitor(String),

    #[error("Could not decode characteristic value: {0}")]
    Decode(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Adapter-initialization failures, including the terminal one.
    #[must_use]
    pub fn is_adapter_init_failure(&self) -> bool {
        matches!(
            self,
            Self::AdapterInitFailure(_) | Self::AdapterUnavailable { .. }
        )
    }

    /// Errors the session gets past without user intervention.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Scan(_)
                | Self::ConnectTimeout { .. }
                | Self::ConnectFailure(_)
                | Self::LinkDropped(_)
                | Self::Decode(_)
                | Self::AdapterInitFailure(_)
        )
    }

    /// Errors that stop the session until something outside it changes.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PlatformUnsupported | Self::AdapterUnavailable { .. }
        )
    }

    #[must_use]
    pub fn user_action(&self) -> UserAction {
        match self {
            Self::PermissionDenied(_) => UserAction::OpenSettings,
            Self::AdapterUnavailable { .. } => UserAction::RestartApp,
            Self::Scan(_)
            | Self::DeviceNotFound(_)
            | Self::ConnectTimeout { .. }
            | Self::ConnectFailure(_)
            | Self::Monitor(_)
            | Self::CharacteristicNotFound { .. }
            | Self::AdapterNotReady
            | Self::AdapterInitFailure(_) => UserAction::Retry,
            Self::PlatformUnsupported
            | Self::Disconnect(_)
            | Self::LinkDropped(_)
            | Self::Decode(_) => UserAction::None,
        }
    }

    /// Machine-readable code for bridges that forward errors to a UI layer.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::PlatformUnsupported => "PLATFORM_UNSUPPORTED",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::AdapterInitFailure(_) => "ADAPTER_INIT_FAILURE",
            Self::AdapterUnavailable { .. } => "ADAPTER_UNAVAILABLE",
            Self::AdapterNotReady => "ADAPTER_NOT_READY",
            Self::Scan(_) => "SCAN_FAILED",
            Self::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            Self::ConnectTimeout { .. } => "CONNECT_TIMEOUT",
            Self::ConnectFailure(_) => "CONNECT_FAILED",
            Self::Disconnect(_) => "DISCONNECT_FAILED",
            Self::LinkDropped(_) => "LINK_DROPPED",
            Self::CharacteristicNotFound { .. } => "CHARACTERISTIC_NOT_FOUND",
            Self::Monitor(_) => "MONITOR_FAILED",
            Self::Decode(_) => "DECODE_FAILED",
        }
    }
}

// =============================================================================
// ALERT PIPELINE
// =============================================================================

/// The emergency settings are missing or unusable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Emergency setting '{0}' is missing. Complete the configuration first.")]
    Missing(&'static str),

    #[error("Emergency contact is not a valid phone number: {0}")]
    InvalidContact(#[from] PhoneError),

    #[error("Failed to read settings: {0}")]
    Store(String),

    #[error("Failed to parse settings: {0}")]
    Parse(String),
}

/// The downstream send failed after the configuration was validated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("Could not determine location: {0}")]
    Location(String),

    #[error("Messaging permission not granted")]
    PermissionDenied,

    #[error("Failed to deliver alert: {0}")]
    Delivery(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AlertError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Send(#[from] SendError),
}

impl AlertError {
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_init_classification() {
        assert!(Error::AdapterInitFailure("boom".into()).is_adapter_init_failure());
        assert!(Error::AdapterUnavailable { attempts: 3 }.is_adapter_init_failure());
        assert!(!Error::Scan("x".into()).is_adapter_init_failure());

        assert!(Error::AdapterUnavailable { attempts: 3 }.is_fatal());
        assert!(!Error::AdapterInitFailure("boom".into()).is_fatal());
    }

    #[test]
    fn test_user_actions() {
        assert_eq!(
            Error::PermissionDenied("scan".into()).user_action(),
            UserAction::OpenSettings
        );
        assert_eq!(
            Error::AdapterUnavailable { attempts: 3 }.user_action(),
            UserAction::RestartApp
        );
        assert_eq!(
            Error::ConnectTimeout {
                device_id: "A".into(),
                timeout: Duration::from_secs(10)
            }
            .user_action(),
            UserAction::Retry
        );
        assert_eq!(
            Error::LinkDropped("gone".into()).user_action(),
            UserAction::None
        );
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::LinkDropped("gone".into()).is_recoverable());
        assert!(Error::Decode("bad".into()).is_recoverable());
        assert!(!Error::PlatformUnsupported.is_recoverable());
        assert!(!Error::PermissionDenied("scan".into()).is_recoverable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::PlatformUnsupported.error_code(), "PLATFORM_UNSUPPORTED");
        assert_eq!(
            Error::AdapterUnavailable { attempts: 3 }.error_code(),
            "ADAPTER_UNAVAILABLE"
        );
    }

    #[test]
    fn test_alert_errors_stay_separate() {
        let err: AlertError = ConfigError::Missing("emergencyContact").into();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("emergencyContact"));

        let err: AlertError = SendError::Delivery("503".into()).into();
        assert!(!err.is_config_error());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
        assert_send_sync::<AlertError>();
    }
}
