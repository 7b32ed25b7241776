//! BLE session manager for emergency-button peripherals.
//!
//! The session finds a button over BLE, connects to it, subscribes to its
//! notifying characteristic and turns every press into an emergency alert
//! sent to the configured contact. It keeps going through adapter failures,
//! denied permissions and dropped links.
//!
//! ## Usage
//!
//! Here is an example on how to watch a button with a simulated radio and
//! simulated alert delivery:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use blealert::alert::{AlertDispatcher, JsonSettingsStore, SimulatedSender};
//! use blealert::permission::StaticPrompter;
//! use blealert::transport::mock::MockTransport;
//! use blealert::{Error, SessionConfig, SessionEvent, SessionManager};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     pretty_env_logger::init();
//!
//!     let transport = MockTransport::new();
//!     let alerts = AlertDispatcher::simulated(
//!         Arc::new(JsonSettingsStore::new("settings.json")),
//!         SimulatedSender::new(),
//!     );
//!
//!     let session = SessionManager::new(
//!         SessionConfig::default(),
//!         Arc::new(transport.clone()),
//!         Arc::new(StaticPrompter::granting()),
//!         alerts,
//!     );
//!     let mut events = session.event_stream();
//!
//!     // Start scanning for devices
//!     session.start().await?;
//!
//!     // Connect to the first discovered device
//!     while let Some(event) = events.next().await {
//!         if let SessionEvent::DeviceDiscovered(device) = event {
//!             session.connect(&device.id).await?;
//!             break;
//!         }
//!     }
//!
//!     // Print everything that happens from now on
//!     while let Some(event) = events.next().await {
//!         println!("{:?}", event);
//!     }
//!
//!     Ok(())
//! }
//!```

#![warn(clippy::all, future_incompatible, nonstandard_style, rust_2018_idioms)]

pub use error::{AlertError, ConfigError, Error, Result, SendError, UserAction};

pub use adapter::{AdapterHandle, AdapterLifecycle, AdapterState};
pub use characteristic::{CharacteristicMonitor, MonitorEvent};
pub use config::SessionConfig;
pub use connection::{ConnectionHandle, ConnectionSession, ConnectionState};
pub use device::DiscoveredDevice;
pub use scanner::{ScanConfig, ScanEvent, ScanSession, StopReason};
pub use session::{SessionEvent, SessionManager, SessionState};

mod adapter;
mod characteristic;
mod connection;
mod device;
mod scanner;
mod session;

pub mod alert;
pub mod common;
pub mod config;
pub mod error;
pub mod permission;
pub mod phone;
pub mod retry;
pub mod transport;
