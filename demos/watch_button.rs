//! This example connects to the first emergency button in range using the
//! system Bluetooth adapter and logs every press. Alerts are simulated.
//!
//! Emergency settings are read from `settings.json` in the working directory.

use std::sync::Arc;

use blealert::alert::{AlertDispatcher, JsonSettingsStore, SimulatedSender};
use blealert::permission::StaticPrompter;
use blealert::transport::btleplug::BtleplugFactory;
use blealert::{Error, SessionConfig, SessionEvent, SessionManager};
use futures::StreamExt;

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => SessionConfig::from_toml_file(path).unwrap(),
        None => SessionConfig::default(),
    };

    let session = SessionManager::new(
        config,
        Arc::new(BtleplugFactory::new()),
        Arc::new(StaticPrompter::granting()),
        AlertDispatcher::simulated(
            Arc::new(JsonSettingsStore::new("settings.json")),
            SimulatedSender::new(),
        ),
    );

    let mut event_stream = session.event_stream();

    session.start().await?;

    while let Some(event) = event_stream.next().await {
        match event {
            SessionEvent::DeviceDiscovered(device) => {
                println!("Device discovered: {} ({})", device.display_name(), device.id);
                if let Err(e) = session.connect(&device.id).await {
                    println!("Could not connect: {}", e);
                }
            }
            SessionEvent::ButtonPressed { device_id } => {
                println!("Button pressed on {}", device_id)
            }
            SessionEvent::AlertSent(alert) => println!("Alert sent:\n{}", alert.body),
            SessionEvent::AlertFailed(e) => println!("Alert failed: {}", e),
            SessionEvent::Disconnected { device_id, .. } => {
                println!("Disconnected from {}", device_id)
            }
            SessionEvent::Error(e) if e.is_fatal() => {
                println!("{}", e);
                break;
            }
            _ => {}
        }
    }

    session.shutdown().await;

    Ok(())
}
