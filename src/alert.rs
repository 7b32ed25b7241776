//! Emergency alert pipeline: settings, location, message and delivery.
//!
//! A button press runs [`AlertDispatcher::dispatch`]: the settings are loaded
//! and validated first, so an incomplete configuration never reaches the
//! sender.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AlertError, ConfigError, SendError};
use crate::phone::validate_phone;

/// Settings record in the shape the settings backend stores it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmergencySettings {
    pub name: Option<String>,
    pub emergency_contact: Option<String>,
    pub emergency_message: Option<String>,
}

/// Validated emergency configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmergencyConfig {
    /// Formatted phone number, e.g. `+57 300 123 4567`.
    pub contact: String,
    pub message: String,
    pub user_name: String,
}

fn required(value: Option<String>, key: &'static str) -> Result<String, ConfigError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(ConfigError::Missing(key)),
    }
}

impl TryFrom<EmergencySettings> for EmergencyConfig {
    type Error = ConfigError;

    fn try_from(settings: EmergencySettings) -> Result<Self, Self::Error> {
        let contact = required(settings.emergency_contact, "emergencyContact")?;
        let message = required(settings.emergency_message, "emergencyMessage")?;
        let user_name = required(settings.name, "name")?;

        Ok(Self {
            contact: validate_phone(&contact)?,
            message,
            user_name,
        })
    }
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self) -> Result<EmergencySettings, ConfigError>;
}

/// Settings read from a JSON file on every load, so edits apply to the next
/// press.
#[derive(Debug, Clone)]
pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self, settings: &EmergencySettings) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(settings)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || std::fs::write(path, json))
            .await
            .map_err(|e| ConfigError::Store(e.to_string()))?
            .map_err(|e| ConfigError::Store(e.to_string()))
    }
}

#[async_trait]
impl SettingsStore for JsonSettingsStore {
    async fn load(&self) -> Result<EmergencySettings, ConfigError> {
        let path = self.path.clone();

        let contents = tokio::task::spawn_blocking(move || std::fs::read_to_string(path))
            .await
            .map_err(|e| ConfigError::Store(e.to_string()))?;

        match contents {
            Ok(contents) => {
                serde_json::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
            }
            // Nothing saved yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No settings at {}", self.path.display());
                Ok(EmergencySettings::default())
            }
            Err(e) => Err(ConfigError::Store(e.to_string())),
        }
    }
}

/// Settings held in memory.
#[derive(Debug, Default)]
pub struct StaticSettings {
    settings: Mutex<EmergencySettings>,
}

impl StaticSettings {
    pub fn new(settings: EmergencySettings) -> Self {
        Self {
            settings: Mutex::new(settings),
        }
    }

    pub fn set(&self, settings: EmergencySettings) {
        *self.settings.lock().unwrap() = settings;
    }
}

#[async_trait]
impl SettingsStore for StaticSettings {
    async fn load(&self) -> Result<EmergencySettings, ConfigError> {
        Ok(self.settings.lock().unwrap().clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn maps_url(&self) -> String {
        format!(
            "https://www.google.com/maps?q={},{}",
            self.latitude, self.longitude
        )
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.latitude, self.longitude)
    }
}

/// Bogotá, reported in simulated mode.
pub const SIMULATED_LOCATION: Location = Location::new(4.7110, -74.0721);

#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_location(&self) -> Result<Location, SendError>;
}

#[derive(Debug, Clone, Copy)]
pub struct FixedLocation(pub Location);

impl Default for FixedLocation {
    fn default() -> Self {
        Self(SIMULATED_LOCATION)
    }
}

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn current_location(&self) -> Result<Location, SendError> {
        Ok(self.0)
    }
}

/// What the downstream sender receives.
#[derive(Debug, Clone, PartialEq)]
pub struct EmergencyAlert {
    pub contact: String,
    pub body: String,
    pub location: Location,
}

pub fn compose_message(config: &EmergencyConfig, location: &Location) -> String {
    format!(
        "{} - Sent by {}\nLocation: {}",
        config.message,
        config.user_name,
        location.maps_url()
    )
}

#[async_trait]
pub trait EmergencySender: Send + Sync {
    async fn send(&self, alert: &EmergencyAlert) -> Result<(), SendError>;
}

/// Logs alerts instead of delivering them, and keeps them for inspection.
#[derive(Debug, Default, Clone)]
pub struct SimulatedSender {
    sent: Arc<Mutex<Vec<EmergencyAlert>>>,
}

impl SimulatedSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<EmergencyAlert> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl EmergencySender for SimulatedSender {
    async fn send(&self, alert: &EmergencyAlert) -> Result<(), SendError> {
        log::info!("Simulated alert to {}:\n{}", alert.contact, alert.body);
        self.sent.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// Turns a button press into a delivered alert.
pub struct AlertDispatcher {
    settings: Arc<dyn SettingsStore>,
    location: Arc<dyn LocationProvider>,
    sender: Arc<dyn EmergencySender>,
}

impl AlertDispatcher {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        location: Arc<dyn LocationProvider>,
        sender: Arc<dyn EmergencySender>,
    ) -> Self {
        Self {
            settings,
            location,
            sender,
        }
    }

    /// Simulated delivery from the fixed simulated location.
    pub fn simulated(settings: Arc<dyn SettingsStore>, sender: SimulatedSender) -> Self {
        Self::new(settings, Arc::new(FixedLocation::default()), Arc::new(sender))
    }

    pub async fn dispatch(&self) -> Result<EmergencyAlert, AlertError> {
        let settings = self.settings.load().await?;
        let config = EmergencyConfig::try_from(settings).map_err(|e| {
            log::warn!("Emergency settings incomplete: {}", e);
            e
        })?;

        let location = self.location.current_location().await?;

        let alert = EmergencyAlert {
            contact: config.contact.clone(),
            body: compose_message(&config, &location),
            location,
        };

        log::info!("Sending emergency alert to {}", alert.contact);
        self.sender.send(&alert).await?;

        Ok(alert)
    }
}
