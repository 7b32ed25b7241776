//! This example runs a full session against a scripted radio: a button is
//! discovered, connected to and pressed, and the alert is "sent" by the
//! simulated sender.

use std::sync::Arc;

use blealert::alert::{AlertDispatcher, EmergencySettings, SimulatedSender, StaticSettings};
use blealert::permission::StaticPrompter;
use blealert::transport::mock::MockTransport;
use blealert::{Error, SessionConfig, SessionEvent, SessionManager, SessionState};
use futures::StreamExt;
use tokio::time::{sleep, Duration};

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let transport = MockTransport::new();
    let sender = SimulatedSender::new();

    let settings = StaticSettings::new(EmergencySettings {
        name: Some("Ana".into()),
        emergency_contact: Some("+573001234567".into()),
        emergency_message: Some("I need help".into()),
    });

    let session = SessionManager::new(
        SessionConfig::default().simulated_send(true),
        Arc::new(transport.clone()),
        Arc::new(StaticPrompter::granting()),
        AlertDispatcher::simulated(Arc::new(settings), sender.clone()),
    );

    // Print session events in a separate task
    let mut event_stream = session.event_stream();
    let join_handle = tokio::spawn(async move {
        while let Some(event) = event_stream.next().await {
            match event {
                SessionEvent::AlertSent(alert) => {
                    println!("Alert sent to {}:\n{}", alert.contact, alert.body);
                    break;
                }
                SessionEvent::Error(e) => println!("Error: {} ({:?})", e, e.user_action()),
                event => println!("{:?}", event),
            }
        }
    });

    session.start().await?;

    // The button shows up in the scan
    transport.advertise("24:6F:28:AA:BB:CC", Some("ESP32-Button"), Some(-58));
    sleep(Duration::from_millis(100)).await;

    for device in session.devices() {
        println!("Found {} ({})", device.display_name(), device.id);
    }

    session.connect("24:6F:28:AA:BB:CC").await?;
    assert_eq!(session.state(), SessionState::Monitoring);

    // Press the button
    transport.notify("1");

    join_handle.await.unwrap();

    println!("{} alert(s) sent", sender.count());

    session.shutdown().await;

    Ok(())
}
