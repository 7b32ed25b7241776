use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::StreamExt;
use stream_cancel::{Trigger, Valved};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::adapter::AdapterHandle;
use crate::common::TRIGGER_VALUE;
use crate::connection::{ConnectionSession, ConnectionState};
use crate::{Error, Result};

/// Decodes a base64 characteristic value into trimmed text.
pub fn decode_payload(encoded: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::Decode(e.to_string()))?;
    let text = String::from_utf8(bytes).map_err(|e| Error::Decode(e.to_string()))?;
    Ok(text.trim().to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ButtonSignal {
    Pressed,
    /// Anything else the peripheral reports, kept for logging.
    Inert(String),
}

impl ButtonSignal {
    pub fn classify(value: &str) -> Self {
        if value == TRIGGER_VALUE {
            Self::Pressed
        } else {
            Self::Inert(value.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    ButtonPressed { device_id: String },
    LinkDropped { device_id: String, reason: String },
}

/// Live notification subscription on the button characteristic.
pub struct CharacteristicMonitor {
    adapter: AdapterHandle,
    device_id: String,
    service: Uuid,
    characteristic: Uuid,
    stopper: Option<Trigger>,
    task: Option<JoinHandle<()>>,
}

impl CharacteristicMonitor {
    /// Subscribes to `characteristic` on the connected device and forwards
    /// button presses and link loss to `events`.
    pub async fn start(
        adapter: &AdapterHandle,
        connection: &ConnectionSession,
        service: Uuid,
        characteristic: Uuid,
        events: UnboundedSender<MonitorEvent>,
    ) -> Result<Self> {
        let handle = match (connection.state(), connection.handle()) {
            (ConnectionState::Connected | ConnectionState::Monitoring, Some(handle)) => handle,
            _ => return Err(Error::Monitor("no connected device".into())),
        };
        let device_id = handle.device_id().to_string();

        if !handle.has_characteristic(service, characteristic) {
            return Err(Error::CharacteristicNotFound {
                service,
                characteristic,
            });
        }

        if !adapter.is_connected(&device_id).await.unwrap_or(false) {
            return Err(Error::LinkDropped(format!(
                "{} disconnected before monitoring started",
                device_id
            )));
        }

        let notifications = adapter
            .subscribe(&device_id, service, characteristic)
            .await
            .map_err(|e| {
                if e.is_link_dropped() {
                    Error::LinkDropped(e.to_string())
                } else {
                    Error::Monitor(e.to_string())
                }
            })?;

        log::info!("Monitoring {} on {}", characteristic, device_id);

        let (stopper, mut notifications) = Valved::new(notifications);

        let task = tokio::spawn({
            let device_id = device_id.clone();

            async move {
                while let Some(next) = notifications.next().await {
                    match next {
                        Ok(encoded) => {
                            let value = match decode_payload(&encoded) {
                                Ok(value) => value,
                                Err(e) => {
                                    log::warn!("Ignoring value from {}: {}", device_id, e);
                                    continue;
                                }
                            };

                            match ButtonSignal::classify(&value) {
                                ButtonSignal::Pressed => {
                                    log::info!("Button pressed on {}", device_id);
                                    let event = MonitorEvent::ButtonPressed {
                                        device_id: device_id.clone(),
                                    };
                                    if events.send(event).is_err() {
                                        break;
                                    }
                                }
                                ButtonSignal::Inert(value) => {
                                    log::debug!("Received '{}' from {}", value, device_id);
                                }
                            }
                        }
                        Err(e) if e.is_cancelled() => {
                            log::debug!("Monitoring of {} cancelled", device_id);
                            break;
                        }
                        Err(e) if e.is_link_dropped() => {
                            log::warn!("Lost connection to {}: {}", device_id, e);
                            events
                                .send(MonitorEvent::LinkDropped {
                                    device_id: device_id.clone(),
                                    reason: e.to_string(),
                                })
                                .ok();
                            break;
                        }
                        Err(e) => log::warn!("Notification error from {}: {}", device_id, e),
                    }
                }

                log::debug!("Monitor for {} finished", device_id);
            }
        });

        Ok(Self {
            adapter: adapter.clone(),
            device_id,
            service,
            characteristic,
            stopper: Some(stopper),
            task: Some(task),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Ends the subscription. No events are delivered once this returns.
    pub async fn stop(&mut self) {
        self.stopper.take();

        if let Some(task) = self.task.take() {
            task.await.ok();

            if let Err(e) = self
                .adapter
                .unsubscribe(&self.device_id, self.service, self.characteristic)
                .await
            {
                log::debug!("Unsubscribe from {} failed: {}", self.device_id, e);
            }
        }
    }
}

impl Drop for CharacteristicMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
