//! Radio backend built on `btleplug`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{stream, StreamExt};
use uuid::Uuid;

use super::{
    watch_link, AdapterFactory, Advertisement, AdvertisementStream, BleAdapter, GattService,
    NotificationStream, TransportError, TransportResult,
};

impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::NotConnected => Self::Disconnected,
            btleplug::Error::DeviceNotFound => Self::DeviceNotFound,
            btleplug::Error::PermissionDenied => Self::PermissionDenied,
            btleplug::Error::NotSupported(what) => Self::Unsupported(what),
            other => Self::Other(other.to_string()),
        }
    }
}

/// Creates adapters from the system's Bluetooth manager.
#[derive(Debug, Default, Clone)]
pub struct BtleplugFactory {
    /// Index of the Bluetooth adapter to use. The first found adapter is used by default.
    adapter_index: usize,
}

impl BtleplugFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of bluetooth adapter to use
    pub fn adapter_index(mut self, index: usize) -> Self {
        self.adapter_index = index;
        self
    }
}

#[async_trait]
impl AdapterFactory for BtleplugFactory {
    async fn create(&self) -> TransportResult<Arc<dyn BleAdapter>> {
        let manager = Manager::new().await?;
        let mut adapters = manager.adapters().await?;

        if self.adapter_index >= adapters.len() {
            return Err(TransportError::Other(format!(
                "no bluetooth adapter at index {}",
                self.adapter_index
            )));
        }

        let adapter = adapters.swap_remove(self.adapter_index);

        log::trace!("Using adapter: {:?}", adapter);

        Ok(Arc::new(BtleplugAdapter {
            _manager: manager,
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
        }))
    }
}

pub struct BtleplugAdapter {
    _manager: Manager,
    adapter: Adapter,
    /// Peripherals seen so far, keyed by the id handed out in advertisements.
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
}

impl BtleplugAdapter {
    fn peripheral(&self, device_id: &str) -> TransportResult<Peripheral> {
        self.peripherals
            .read()
            .unwrap()
            .get(device_id)
            .cloned()
            .ok_or(TransportError::DeviceNotFound)
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
    ) -> TransportResult<btleplug::api::Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic)
            .ok_or_else(|| {
                TransportError::Other(format!(
                    "characteristic {} not found in service {}",
                    characteristic, service
                ))
            })
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn start_scan(&self, services: &[Uuid]) -> TransportResult<AdvertisementStream> {
        let events = self.adapter.events().await?;

        self.adapter
            .start_scan(ScanFilter {
                services: services.to_vec(),
            })
            .await?;

        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();

        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let peripherals = peripherals.clone();

            async move {
                let peripheral_id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => return None,
                };

                let peripheral = match adapter.peripheral(&peripheral_id).await {
                    Ok(peripheral) => peripheral,
                    Err(e) => return Some(Err(e.into())),
                };

                let props = peripheral.properties().await.ok().flatten();
                log::trace!("Device discovered: {:?}", peripheral);

                let id = peripheral_id.to_string();
                peripherals.write().unwrap().insert(id.clone(), peripheral);

                Some(Ok(Advertisement {
                    id,
                    name: props.as_ref().and_then(|p| p.local_name.clone()),
                    rssi: props.and_then(|p| p.rssi),
                }))
            }
        });

        Ok(Box::pin(stream))
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, device_id: &str) -> TransportResult<()> {
        let peripheral = self.peripheral(device_id)?;
        peripheral.connect().await?;
        Ok(())
    }

    async fn cancel_connection(&self, device_id: &str) -> TransportResult<()> {
        let peripheral = self.peripheral(device_id)?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn discover_services(&self, device_id: &str) -> TransportResult<Vec<GattService>> {
        let peripheral = self.peripheral(device_id)?;
        peripheral.discover_services().await?;

        Ok(peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
            })
            .collect())
    }

    async fn is_connected(&self, device_id: &str) -> TransportResult<bool> {
        let peripheral = self.peripheral(device_id)?;
        Ok(peripheral.is_connected().await?)
    }

    async fn subscribe(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> TransportResult<NotificationStream> {
        let peripheral = self.peripheral(device_id)?;
        let target = Self::find_characteristic(&peripheral, service, characteristic)?;

        // Watch before subscribing so a drop in between is not missed.
        let disconnects = self.adapter.events().await?.filter_map(|event| async move {
            match event {
                CentralEvent::DeviceDisconnected(id) => Some(id),
                _ => None,
            }
        });

        peripheral.subscribe(&target).await?;

        let notifications = peripheral.notifications().await?;
        let uuid = target.uuid;

        let values = notifications
            .filter_map(move |n| async move {
                if n.uuid == uuid {
                    Some(Ok(STANDARD.encode(n.value)))
                } else {
                    None
                }
            })
            .chain(stream::once(async { Err(TransportError::Disconnected) }));

        Ok(watch_link(values, disconnects, peripheral.id()))
    }

    async fn unsubscribe(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> TransportResult<()> {
        let peripheral = self.peripheral(device_id)?;
        let target = Self::find_characteristic(&peripheral, service, characteristic)?;
        peripheral.unsubscribe(&target).await?;
        Ok(())
    }

    async fn destroy(&self) {
        self.adapter.stop_scan().await.ok();

        let peripherals: Vec<Peripheral> = self
            .peripherals
            .write()
            .unwrap()
            .drain()
            .map(|(_, peripheral)| peripheral)
            .collect();

        for peripheral in peripherals {
            if peripheral.is_connected().await.unwrap_or(false) {
                peripheral.disconnect().await.ok();
            }
        }
    }
}
