//! Runtime permission checks before the radio is touched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
    Desktop,
    Web,
}

impl Platform {
    /// Platform this binary was built for.
    pub fn current() -> Self {
        if cfg!(target_os = "android") {
            Self::Android
        } else if cfg!(target_os = "ios") {
            Self::Ios
        } else if cfg!(target_arch = "wasm32") {
            Self::Web
        } else {
            Self::Desktop
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    BluetoothScan,
    BluetoothConnect,
    FineLocation,
    SendMessage,
    /// Keeps the process alive while monitoring in the background.
    BackgroundRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
    /// Denied with "don't ask again"; only the system settings can grant it.
    Blocked,
}

impl PermissionStatus {
    pub fn is_granted(self) -> bool {
        self == Self::Granted
    }
}

/// Shows the system permission dialog for a batch of permissions.
#[async_trait]
pub trait PermissionPrompter: Send + Sync {
    async fn request(
        &self,
        permissions: &[Permission],
    ) -> std::result::Result<HashMap<Permission, PermissionStatus>, String>;
}

/// Answers every request from a fixed table. Permissions not in the table are
/// granted.
#[derive(Debug, Clone, Default)]
pub struct StaticPrompter {
    answers: HashMap<Permission, PermissionStatus>,
    failure: Option<String>,
    requests: Arc<Mutex<Vec<Vec<Permission>>>>,
}

impl StaticPrompter {
    pub fn granting() -> Self {
        Self::default()
    }

    pub fn with(mut self, permission: Permission, status: PermissionStatus) -> Self {
        self.answers.insert(permission, status);
        self
    }

    /// Every request fails with `reason`.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Batches requested so far.
    pub fn requests(&self) -> Vec<Vec<Permission>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PermissionPrompter for StaticPrompter {
    async fn request(
        &self,
        permissions: &[Permission],
    ) -> std::result::Result<HashMap<Permission, PermissionStatus>, String> {
        self.requests.lock().unwrap().push(permissions.to_vec());

        if let Some(reason) = &self.failure {
            return Err(reason.clone());
        }

        Ok(permissions
            .iter()
            .map(|p| {
                let status = self
                    .answers
                    .get(p)
                    .copied()
                    .unwrap_or(PermissionStatus::Granted);
                (*p, status)
            })
            .collect())
    }
}

pub struct PermissionGate {
    platform: Platform,
    simulated_send: bool,
    prompter: Arc<dyn PermissionPrompter>,
}

impl PermissionGate {
    pub fn new(
        platform: Platform,
        simulated_send: bool,
        prompter: Arc<dyn PermissionPrompter>,
    ) -> Self {
        Self {
            platform,
            simulated_send,
            prompter,
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Permissions requested in one batch on Android.
    pub fn required_permissions(&self) -> Vec<Permission> {
        let mut permissions = vec![
            Permission::BluetoothScan,
            Permission::BluetoothConnect,
            Permission::FineLocation,
        ];
        if !self.simulated_send {
            permissions.push(Permission::SendMessage);
            permissions.push(Permission::BackgroundRun);
        }
        permissions
    }

    /// Checks that scanning and connecting are allowed, prompting at most once.
    ///
    /// `Ok(false)` means the user declined; they have to grant the missing
    /// permissions from the system settings.
    pub async fn ensure_permissions(&self) -> Result<bool> {
        match self.platform {
            Platform::Web => return Err(Error::PlatformUnsupported),
            Platform::Ios | Platform::Desktop => return Ok(true),
            Platform::Android => {}
        }

        let requested = self.required_permissions();
        let answers = self
            .prompter
            .request(&requested)
            .await
            .map_err(Error::PermissionDenied)?;

        log::debug!("Permission answers: {:?}", answers);

        let granted = |p: Permission| answers.get(&p).is_some_and(|s| s.is_granted());

        let mut missing: Vec<Permission> = [
            Permission::BluetoothScan,
            Permission::BluetoothConnect,
            Permission::FineLocation,
        ]
        .into_iter()
        .filter(|p| !granted(*p))
        .collect();

        if !self.simulated_send && !granted(Permission::SendMessage) {
            missing.push(Permission::SendMessage);
        }

        if !self.simulated_send && !granted(Permission::BackgroundRun) {
            log::warn!("Background permission not granted; monitoring may stop in the background");
        }

        if missing.is_empty() {
            Ok(true)
        } else {
            log::warn!("Permissions not granted: {:?}", missing);
            Ok(false)
        }
    }
}
