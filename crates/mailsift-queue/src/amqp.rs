//! AMQP 0-9-1 broker built on `lapin`.
//!
//! The work queue is declared durable. When the acknowledgement policy is
//! [`AckPolicy::DeadLetter`], a fanout exchange and a `<queue>.dead` queue
//! bound to it are declared as well, and the work queue is declared with
//! `x-dead-letter-exchange` pointing at that exchange. Queue arguments are
//! fixed at first declaration, so switching policy on an existing queue
//! requires deleting it first; the broker answers `PRECONDITION_FAILED`
//! otherwise.
//!
//! Publishing puts the channel in confirm mode, so [`Broker::publish`]
//! returns only once the broker has taken responsibility for the message.

use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use mailsift_types::{AckPolicy, QueueSettings};
use tracing::{debug, info, warn};

use crate::broker::{Acknowledger, Broker, Delivery, JobStream};
use crate::error::QueueError;

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Persistent delivery mode.
const PERSISTENT: u8 = 2;

/// Broker reached over AMQP.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpBroker;

impl AmqpBroker {
    /// Create a broker; connections are made per [`Broker::open`] call.
    pub fn new() -> Self {
        Self
    }

    async fn connect(settings: &QueueSettings) -> Result<(Connection, Channel), QueueError> {
        let conn = Connection::connect(&settings.url, ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Connect(e.to_string()))?;

        match conn.create_channel().await {
            Ok(channel) => Ok((conn, channel)),
            Err(e) => {
                let _ = conn.close(REPLY_SUCCESS, "channel open failed").await;
                Err(QueueError::Connect(e.to_string()))
            }
        }
    }
}

/// Declare the work queue, plus the dead-letter path when enabled.
async fn declare_topology(channel: &Channel, settings: &QueueSettings) -> Result<(), QueueError> {
    let mut args = FieldTable::default();

    if settings.ack_policy == AckPolicy::DeadLetter {
        let exchange = settings.dead_letter_exchange.as_str();
        let dead_queue = settings.dead_letter_queue();

        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(setup_error)?;
        channel
            .queue_declare(&dead_queue, durable(), FieldTable::default())
            .await
            .map_err(setup_error)?;
        channel
            .queue_bind(
                &dead_queue,
                exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(setup_error)?;

        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.into()),
        );
        debug!(%exchange, queue = %dead_queue, "declared dead-letter path");
    }

    channel
        .queue_declare(&settings.queue, durable(), args)
        .await
        .map_err(setup_error)?;
    Ok(())
}

fn durable() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

fn setup_error(e: lapin::Error) -> QueueError {
    QueueError::Setup(e.to_string())
}

#[async_trait::async_trait]
impl Broker for AmqpBroker {
    async fn open(&self, settings: &QueueSettings) -> Result<Box<dyn JobStream>, QueueError> {
        let (conn, channel) = Self::connect(settings).await?;

        let consumer = async {
            declare_topology(&channel, settings).await?;
            channel
                .basic_qos(settings.effective_prefetch(), BasicQosOptions::default())
                .await
                .map_err(setup_error)?;
            channel
                .basic_consume(
                    &settings.queue,
                    &settings.consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(setup_error)
        }
        .await;

        match consumer {
            Ok(consumer) => {
                info!(
                    queue = %settings.queue,
                    prefetch = settings.effective_prefetch(),
                    "consuming from work queue"
                );
                Ok(Box::new(AmqpJobStream {
                    conn,
                    channel,
                    consumer,
                }))
            }
            Err(e) => {
                let _ = conn.close(REPLY_SUCCESS, "queue setup failed").await;
                Err(e)
            }
        }
    }

    /// Publish one persistent message and wait for the broker's confirm.
    async fn publish(&self, settings: &QueueSettings, body: Vec<u8>) -> Result<(), QueueError> {
        let (conn, channel) = Self::connect(settings).await?;

        let result = async {
            declare_topology(&channel, settings).await?;
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(setup_error)?;
            let confirm = channel
                .basic_publish(
                    "",
                    &settings.queue,
                    BasicPublishOptions::default(),
                    &body,
                    BasicProperties::default().with_delivery_mode(PERSISTENT),
                )
                .await
                .map_err(|e| QueueError::Publish(e.to_string()))?;
            let confirmation = confirm
                .await
                .map_err(|e| QueueError::Publish(e.to_string()))?;
            if confirmation.is_nack() {
                return Err(QueueError::Publish("broker refused the job".to_string()));
            }
            debug!(queue = %settings.queue, "publish confirmed");
            Ok::<(), QueueError>(())
        }
        .await;

        let _ = channel.close(REPLY_SUCCESS, "published").await;
        let _ = conn.close(REPLY_SUCCESS, "published").await;
        result
    }
}

/// Consumer on an AMQP channel. Owns the connection.
struct AmqpJobStream {
    conn: Connection,
    channel: Channel,
    consumer: Consumer,
}

#[async_trait::async_trait]
impl JobStream for AmqpJobStream {
    async fn next(&mut self) -> Option<Result<Delivery, QueueError>> {
        match self.consumer.next().await? {
            Ok(d) => Some(Ok(Delivery::new(
                d.delivery_tag,
                d.data,
                d.redelivered,
                Box::new(AmqpAcker {
                    tag: d.delivery_tag,
                    acker: d.acker,
                }),
            ))),
            Err(e) => Some(Err(QueueError::Closed(e.to_string()))),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.channel.close(REPLY_SUCCESS, "worker stopping").await {
            warn!(error = %e, "failed to close channel");
        }
        if let Err(e) = self.conn.close(REPLY_SUCCESS, "worker stopping").await {
            warn!(error = %e, "failed to close broker connection");
        }
        debug!("broker connection closed");
    }
}

struct AmqpAcker {
    tag: u64,
    acker: Acker,
}

#[async_trait::async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| QueueError::Settle {
                tag: self.tag,
                reason: e.to_string(),
            })
    }

    async fn reject(&self, requeue: bool) -> Result<(), QueueError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| QueueError::Settle {
                tag: self.tag,
                reason: e.to_string(),
            })
    }
}
