use crate::codec::{classify, decode, validate, ReadingBounds};
use crate::errors::{Error, Result};
use crate::metrics::{DECODE_ERRORS_TOTAL, MESSAGES_TOTAL, REJECTED_MESSAGES_TOTAL};
use crate::model::UplinkMessage;
use crate::router::{Route, Router};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: String,
}

/// Consume uplinks until the connection fails.
///
/// Failing before the broker ever acknowledged the connection is returned as
/// an error. Later errors are logged and the event loop reconnects.
pub async fn run_mqtt(
    settings: MqttSettings,
    router: Arc<Router>,
    bounds: ReadingBounds,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", settings.broker, settings.port);

    let mut mqtt_options = MqttOptions::new(settings.client_id, settings.broker, settings.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(false);
    if let Some(username) = settings.username {
        mqtt_options.set_credentials(username, settings.password.unwrap_or_default());
    }

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    client
        .subscribe(settings.topic.as_str(), QoS::AtLeastOnce)
        .await
        .map_err(Error::Mqtt)?;

    info!("Subscribed to {} with QoS 1", settings.topic);

    let mut connected = false;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if !connected {
                    info!("Connected to MQTT broker");
                }
                connected = true;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                MESSAGES_TOTAL.inc();

                debug!(
                    "Received uplink on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );

                handle_message(&publish.payload, &router, &bounds).await;
            }
            Ok(_) => {}
            Err(e) if !connected => {
                error!("Could not reach MQTT broker: {}", e);
                return Err(Error::MqttConnection(e));
            }
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc reconnects on the next poll
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Process one uplink and account for why it was dropped, if it was.
async fn handle_message(payload: &[u8], router: &Router, bounds: &ReadingBounds) {
    match process_message(payload, router, bounds).await {
        Ok(route) => debug!("Uplink routed: {:?}", route),
        Err(Error::Rejected(rejection)) => {
            REJECTED_MESSAGES_TOTAL
                .with_label_values(&[rejection.reason()])
                .inc();
            debug!("Dropping invalid uplink: {}", rejection);
        }
        Err(e @ (Error::Decode(_) | Error::Json(_))) => {
            DECODE_ERRORS_TOTAL.inc();
            warn!("Dropping undecodable uplink: {}", e);
        }
        Err(e) => error!("Failed to process uplink: {}", e),
    }
}

/// Decode, classify, validate and route a single uplink message.
async fn process_message(payload: &[u8], router: &Router, bounds: &ReadingBounds) -> Result<Route> {
    let message: UplinkMessage = serde_json::from_slice(payload)?;
    let raw = message.into_raw()?;

    let decoded = decode(&raw.bytes, raw.port)?;
    let classified = classify(decoded, raw.port);
    let report = validate(classified, raw.port, bounds).into_result()?;

    router.on_uplink(&raw.device_id, report).await
}
