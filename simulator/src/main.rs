mod device;

use clap::Parser;
use device::Device;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use tracing::{error, info, warn};

/// Publishes synthetic sensor uplinks to an MQTT broker.
#[derive(Debug, Parser)]
#[command(name = "simulator", version)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    #[arg(long, env = "APP_ID", default_value = "sensors")]
    app_id: String,

    /// Uplinks per second across all devices
    #[arg(long, env = "RATE", default_value_t = 100)]
    rate: u64,

    #[arg(long, env = "DEVICES", default_value_t = 10)]
    devices: usize,

    #[arg(long, env = "READING_MIN", default_value_t = 0)]
    reading_min: u16,

    #[arg(long, env = "READING_MAX", default_value_t = 5000)]
    reading_max: u16,

    /// Share of uplinks reporting a device error
    #[arg(long, env = "ERROR_RATE", default_value_t = 0.01)]
    error_rate: f64,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    anyhow::ensure!(args.rate > 0, "RATE must be greater than zero");
    anyhow::ensure!(args.devices > 0, "DEVICES must be greater than zero");
    anyhow::ensure!(
        args.reading_min <= args.reading_max,
        "READING_MIN must not exceed READING_MAX"
    );
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.error_rate),
        "ERROR_RATE must be between 0 and 1"
    );

    info!("Starting uplink simulator");
    info!(
        "Broker: {}:{}, Rate: {} msg/s, Devices: {}",
        args.broker, args.port, args.rate, args.devices
    );

    let mut rng = rand::thread_rng();
    let mut fleet: Vec<Device> = (0..args.devices)
        .map(|i| Device::new(&mut rng, format!("dev-{}", i), args.reading_min, args.reading_max))
        .collect();
    info!(
        "Simulated device ids: {}",
        fleet.iter().map(|d| d.dev_id.as_str()).collect::<Vec<_>>().join(",")
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    // Spawn eventloop handler
    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    info!("Connected to MQTT broker, starting to publish uplinks");

    let burst_size = args.rate.clamp(1, 200) as usize;
    let burst_interval = Duration::from_millis((burst_size as u64 * 1000) / args.rate);
    info!("Publishing in bursts of {} uplinks every {:?}", burst_size, burst_interval);

    let mut counter = 0u64;
    loop {
        let burst_start = std::time::Instant::now();

        for _ in 0..burst_size {
            let device = &mut fleet[(counter % args.devices as u64) as usize];
            let uplink = device.uplink(&mut rng, &args.app_id, args.error_rate);

            let topic = format!("{}/devices/{}/up", uplink.app_id, uplink.dev_id);
            let payload = match serde_json::to_string(&uplink) {
                Ok(p) => p,
                Err(e) => {
                    error!("Failed to serialize uplink: {}", e);
                    continue;
                }
            };

            match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                Ok(_) => counter += 1,
                Err(e) => warn!("Failed to publish: {}", e),
            }
        }

        if counter > 0 && counter % 10000 < burst_size as u64 {
            info!("Published {} uplinks", counter);
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!(
                "Burst took {:?}, target was {:?} - system may be overloaded",
                elapsed, burst_interval
            );
        }
    }
}
