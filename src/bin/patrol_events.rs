//! Follow the RabbitMQ mirror of the change feed from a terminal.
//!
//! Usage: `patrol_events [pattern] [config file]`, e.g. `patrol_events 'alert.#'`.

use anyhow::Result;
use log::{error, info};
use patrol_pipeline::config::load_config;
use patrol_pipeline::messaging::broker::create_message_broker;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let pattern = args.next().unwrap_or_else(|| "#".to_string());
    let config_path = args
        .next()
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("PATROL_CONFIG").map(PathBuf::from));
    let config = load_config(config_path.as_deref())?;

    info!("Connecting to RabbitMQ at {}", config.message_broker.uri);
    let broker = match create_message_broker(config.message_broker.clone()).await {
        Ok(broker) => broker,
        Err(e) => {
            error!("Failed to connect to RabbitMQ: {}", e);
            error!("Make sure RabbitMQ is running at {}", config.message_broker.uri);
            return Err(e);
        }
    };

    let (mut events, consumer) = broker.consume_pattern(&pattern).await?;
    info!(
        "Following {} on exchange {}",
        pattern, config.message_broker.exchange
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => println!(
                    "{} {} {} {}",
                    event.updated_at.to_rfc3339(),
                    event.event_type,
                    event.record_id,
                    serde_json::to_string(&event.payload).unwrap_or_default()
                ),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    consumer.abort();
    Ok(())
}
