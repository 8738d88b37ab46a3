//! RabbitMQ transport via lapin.
//!
//! Channels run in confirm mode: a publish resolves only after the broker
//! acknowledges it. A mandatory message the broker returns as unroutable is
//! reported as [`TransportError::Unroutable`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, BasicRejectOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use shared_types::{ExchangeKind, ExchangeSpec, QueueBinding};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::transport::{
    Acker, BrokerChannel, BrokerConnection, CloseReason, CloseSignal, Delivery, DeliveryStream,
    Dialer, Envelope,
};

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT: u8 = 2;

fn protocol(err: lapin::Error) -> TransportError {
    TransportError::Protocol(err.to_string())
}

/// Record the first close reason; later ones are ignored.
fn signal_close(tx: &watch::Sender<Option<CloseReason>>, reason: CloseReason) {
    tx.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(reason);
            true
        } else {
            false
        }
    });
}

/// Dials `amqp://` DSNs.
#[derive(Debug, Clone, Default)]
pub struct AmqpDialer;

impl AmqpDialer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dialer for AmqpDialer {
    async fn dial(&self, dsn: &str) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let connection = Connection::connect(dsn, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::Dial(e.to_string()))?;

        let (close_tx, _) = watch::channel(None);
        let close_tx = Arc::new(close_tx);
        {
            let close_tx = Arc::clone(&close_tx);
            connection.on_error(move |err| {
                signal_close(&close_tx, CloseReason::Error(err.to_string()));
            });
        }

        Ok(Arc::new(AmqpConnection {
            connection,
            close_tx,
        }))
    }
}

pub struct AmqpConnection {
    connection: Connection,
    close_tx: Arc<watch::Sender<Option<CloseReason>>>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_closed(&self) -> bool {
        self.close_tx.borrow().is_some() || !self.connection.status().connected()
    }

    fn close_signal(&self) -> CloseSignal {
        self.close_tx.subscribe()
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| TransportError::ConnectionClosed(e.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(protocol)?;

        let (close_tx, _) = watch::channel(None);
        let close_tx = Arc::new(close_tx);
        {
            let close_tx = Arc::clone(&close_tx);
            channel.on_error(move |err| {
                signal_close(&close_tx, CloseReason::Error(err.to_string()));
            });
        }

        Ok(Arc::new(AmqpChannel { channel, close_tx }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        signal_close(&self.close_tx, CloseReason::Graceful);
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(protocol)
    }
}

pub struct AmqpChannel {
    channel: Channel,
    close_tx: Arc<watch::Sender<Option<CloseReason>>>,
}

fn lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

fn to_envelope(delivery: &lapin::message::Delivery) -> Envelope {
    let properties = &delivery.properties;
    Envelope {
        content_type: properties
            .content_type()
            .as_ref()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        timestamp: (*properties.timestamp())
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0))
            .unwrap_or_else(Utc::now),
        priority: *properties.priority(),
        routing_key: delivery.routing_key.as_str().to_string(),
        body: delivery.data.clone(),
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.0.ack(BasicAckOptions::default()).await.map_err(protocol)
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(protocol)
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_closed(&self) -> bool {
        self.close_tx.borrow().is_some() || !self.channel.status().connected()
    }

    fn close_signal(&self) -> CloseSignal {
        self.close_tx.subscribe()
    }

    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), TransportError> {
        self.channel
            .exchange_declare(
                exchange.name,
                lapin_kind(exchange.kind),
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(protocol)
    }

    async fn declare_queue(&self, binding: &QueueBinding) -> Result<(), TransportError> {
        self.channel
            .queue_declare(
                &binding.queue,
                QueueDeclareOptions {
                    durable: binding.durable,
                    exclusive: binding.exclusive,
                    auto_delete: binding.exclusive,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(protocol)
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                &binding.queue,
                binding.exchange.name,
                &binding.pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(protocol)
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), TransportError> {
        self.channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(protocol)
    }

    async fn publish(
        &self,
        exchange: &str,
        envelope: Envelope,
        mandatory: bool,
    ) -> Result<(), TransportError> {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(envelope.content_type))
            .with_timestamp(envelope.timestamp.timestamp().max(0) as u64)
            .with_delivery_mode(PERSISTENT);
        if let Some(id) = envelope.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(id));
        }
        if let Some(priority) = envelope.priority {
            properties = properties.with_priority(priority);
        }

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                &envelope.routing_key,
                BasicPublishOptions {
                    mandatory,
                    ..BasicPublishOptions::default()
                },
                &envelope.body,
                properties,
            )
            .await
            .map_err(protocol)?;

        match confirm.await.map_err(protocol)? {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Ack(Some(_)) => Err(TransportError::Unroutable {
                exchange: exchange.to_string(),
                routing_key: envelope.routing_key,
            }),
            Confirmation::Nack(_) => Err(TransportError::Nacked(exchange.to_string())),
        }
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(protocol)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, TransportError> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(protocol)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(item) = consumer.next().await {
                match item {
                    Ok(delivery) => {
                        let envelope = to_envelope(&delivery);
                        let forwarded = Delivery::new(
                            envelope,
                            delivery.delivery_tag,
                            delivery.redelivered,
                            Box::new(AmqpAcker(delivery.acker)),
                        );
                        if tx.send(forwarded).is_err() {
                            debug!(queue = %queue, "Delivery stream dropped by consumer");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "Consumer stream failed");
                        break;
                    }
                }
            }
        });

        Ok(DeliveryStream::new(rx))
    }

    async fn close(&self) -> Result<(), TransportError> {
        signal_close(&self.close_tx, CloseReason::Graceful);
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(protocol)
    }
}
