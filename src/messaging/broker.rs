use crate::config::MessageBrokerConfig;
use crate::error::Error;
use crate::messaging::distributor::{Delivery, RealtimeDistributor, TableFilter};
use crate::messaging::event::ChangeEvent;
use anyhow::Result;
use deadpool_lapin::{Config, Manager, Pool};
use futures_util::stream::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, ConnectionProperties, ExchangeKind,
};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// RabbitMQ mirror of the change stream.
///
/// Every committed change is published to a durable topic exchange with routing key
/// `<event_type>.<record_id>`, so services outside this process can follow the pipeline.
pub struct MessageBroker {
    /// Connection pool
    pool: Pool,
    /// Configuration
    config: MessageBrokerConfig,
    /// Default channel
    channel: Arc<Mutex<Option<Channel>>>,
}

impl MessageBroker {
    /// Create a new message broker
    pub async fn new(config: MessageBrokerConfig) -> Result<Self> {
        let pool_config = Config {
            url: Some(config.uri.clone()),
            pool: Some(deadpool_lapin::PoolConfig {
                max_size: config.pool_size as usize,
                queue_mode: deadpool::managed::QueueMode::Fifo,
                timeouts: deadpool::managed::Timeouts {
                    wait: Some(Duration::from_millis(config.timeout_ms)),
                    create: Some(Duration::from_millis(config.timeout_ms)),
                    recycle: Some(Duration::from_millis(config.timeout_ms)),
                },
            }),
            connection_properties: ConnectionProperties::default(),
        };
        let pool = pool_config
            .create_pool(Some(deadpool_lapin::Runtime::Tokio1))
            .map_err(|e| Error::Config(format!("Invalid RabbitMQ pool config: {}", e)))?;

        let broker = Self {
            pool,
            config,
            channel: Arc::new(Mutex::new(None)),
        };

        broker.init().await?;

        Ok(broker)
    }

    /// Declare the change exchange
    async fn init(&self) -> Result<()> {
        let channel = self.get_channel().await?;

        channel
            .exchange_declare(
                &self.config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Service(format!("Failed to declare exchange: {}", e)))?;

        info!("Message broker ready on exchange {}", self.config.exchange);
        Ok(())
    }

    /// Get a pooled connection, retrying per the configuration
    async fn get_connection(&self) -> Result<deadpool::managed::Object<Manager>> {
        let max_attempts = self.config.retry_attempts.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.pool.get().await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    if attempts >= max_attempts {
                        return Err(Error::Service(format!(
                            "Failed to get RabbitMQ connection after {} attempts: {}",
                            attempts,
                            err
                        ))
                        .into());
                    }

                    warn!(
                        "Failed to get RabbitMQ connection (attempt {}/{}): {}",
                        attempts,
                        max_attempts,
                        err
                    );

                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
            }
        }
    }

    /// Get the default channel or create a new one
    async fn get_channel(&self) -> Result<Channel> {
        let mut channel_guard = self.channel.lock().await;

        if let Some(channel) = &*channel_guard {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let conn = self.get_connection().await?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| Error::Service(format!("Failed to create RabbitMQ channel: {}", e)))?;

        *channel_guard = Some(channel.clone());

        Ok(channel)
    }

    /// Publish one change event
    pub async fn publish(&self, event: &ChangeEvent) -> Result<()> {
        let message = serde_json::to_vec(event)
            .map_err(|e| Error::Serialization(format!("Failed to encode event: {}", e)))?;
        let routing_key = event.routing_key();
        let channel = self.get_channel().await?;

        channel
            .basic_publish(
                &self.config.exchange,
                &routing_key,
                BasicPublishOptions::default(),
                &message,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await
            .map_err(|e| Error::Service(format!("Failed to publish message: {}", e)))?;

        debug!("Published event: {} with routing key: {}", event.id, routing_key);

        Ok(())
    }

    /// Consume events matching a topic pattern such as `alert.*.*` into a channel.
    ///
    /// The queue is exclusive and disappears with the consumer.
    pub async fn consume_pattern(
        &self,
        pattern: &str,
    ) -> Result<(mpsc::Receiver<ChangeEvent>, JoinHandle<()>)> {
        let channel = self.get_channel().await?;
        let queue_name = format!("patrol.{}.{}", pattern.replace('.', "_"), Uuid::new_v4());

        channel
            .queue_declare(
                &queue_name,
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Service(format!("Failed to declare queue: {}", e)))?;

        channel
            .queue_bind(
                &queue_name,
                &self.config.exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Service(format!("Failed to bind queue: {}", e)))?;

        let mut consumer = channel
            .basic_consume(
                &queue_name,
                &format!("consumer-{}", Uuid::new_v4()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Service(format!("Failed to create consumer: {}", e)))?;

        debug!("Consuming {} through queue {}", pattern, queue_name);

        let (tx, rx) = mpsc::channel(64);
        let handle = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        error!("Error receiving message: {}", e);
                        continue;
                    }
                };

                match serde_json::from_slice::<ChangeEvent>(&delivery.data) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("Failed to decode event: {}", e),
                }

                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    error!("Failed to acknowledge message: {}", e);
                }
            }
        });

        Ok((rx, handle))
    }
}

/// Create a message broker service
pub async fn create_message_broker(config: MessageBrokerConfig) -> Result<Arc<MessageBroker>> {
    let broker = MessageBroker::new(config).await?;

    Ok(Arc::new(broker))
}

/// Forward every distributed change to the broker until the distributor shuts down.
///
/// Broker failures are logged and never block the pipeline.
pub fn spawn_event_mirror(
    broker: Arc<MessageBroker>,
    distributor: &RealtimeDistributor,
) -> JoinHandle<()> {
    let mut subscription = distributor.subscribe(TableFilter::all());

    tokio::spawn(async move {
        info!("Mirroring change events to RabbitMQ");
        while let Some(delivery) = subscription.recv().await {
            match delivery {
                Delivery::Change(event) => {
                    if let Err(e) = broker.publish(&event).await {
                        error!("Failed to mirror {}: {}", event.routing_key(), e);
                    }
                }
                Delivery::ResyncRequired { missed } => {
                    warn!("Broker mirror fell behind; {} events were not mirrored", missed);
                }
            }
        }
        info!("Change stream closed; broker mirror stopped");
    })
}
