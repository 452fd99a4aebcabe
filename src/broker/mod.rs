//! Message broker adapter
//!
//! One logical connection, three channel roles so that slow uploads never
//! stall downloads and handler-produced follow-up publishes are not
//! back-pressured by consumer flow control. The [`MessageQueue`] trait is
//! the seam between the rest of the crate and AMQP: the production
//! implementation is [`AmqpBroker`] behind the reconnecting [`Broker`]
//! facade, and [`MemoryBroker`] serves tests.

mod amqp;
mod memory;

pub use amqp::{AmqpBroker, Broker};
pub use memory::MemoryBroker;

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures_lite::Stream;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("queue {0} does not exist")]
    QueueMissing(String),

    #[error("publish to {queue} failed: {reason}")]
    Publish { queue: String, reason: String },

    #[error("consume on {queue} failed: {reason}")]
    Consume { queue: String, reason: String },

    #[error("acknowledge failed: {0}")]
    Ack(String),

    #[error("queue operation on {queue} failed: {reason}")]
    Queue { queue: String, reason: String },
}

/// Which logical channel an operation uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Download,
    Upload,
    /// Worker-initiated publishes; never used for consuming
    Publish,
}

#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub durable: bool,
    /// Rejected messages are routed to this queue via the default exchange
    pub dead_letter_routing_key: Option<String>,
}

impl QueueOptions {
    pub fn durable_with_dlq(dlq: impl Into<String>) -> Self {
        Self {
            durable: true,
            dead_letter_routing_key: Some(dlq.into()),
        }
    }

    pub fn durable() -> Self {
        Self {
            durable: true,
            dead_letter_routing_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Text(String),
    Int(i64),
}

/// Message headers, transport-agnostic
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageHeaders(BTreeMap<String, HeaderValue>);

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_text(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), HeaderValue::Text(value.into()));
    }

    pub fn set_int(&mut self, key: impl Into<String>, value: i64) {
        self.0.insert(key.into(), HeaderValue::Int(value));
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(HeaderValue::Text(value)) => Some(value),
            _ => None,
        }
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        match self.0.get(key) {
            Some(HeaderValue::Int(value)) => Some(*value),
            // retry counters survive being stringified by intermediaries
            Some(HeaderValue::Text(value)) => value.parse().ok(),
            None => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HeaderValue)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Ready/consumer counts from broker introspection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub ready: u64,
    pub consumers: u64,
}

#[async_trait]
pub(crate) trait Acknowledge: Send {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;
    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError>;
}

/// One in-flight message handed to a consumer or fetched from a queue
pub struct Delivery {
    pub body: Vec<u8>,
    pub headers: MessageHeaders,
    pub redelivered: bool,
    pub queue: String,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub(crate) fn new(
        body: Vec<u8>,
        headers: MessageHeaders,
        redelivered: bool,
        queue: String,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            body,
            headers,
            redelivered,
            queue,
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("bytes", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// The adapter contract used by the planner, the worker runtime, the
/// queue manager and the failed-queue API.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn declare_queue(&self, name: &str, opts: QueueOptions) -> Result<(), BrokerError>;

    /// Delete a queue; returns the number of messages purged with it.
    async fn delete_queue(&self, name: &str) -> Result<u64, BrokerError>;

    /// Drop all ready messages; returns how many were dropped.
    async fn purge_queue(&self, name: &str) -> Result<u64, BrokerError>;

    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        headers: MessageHeaders,
    ) -> Result<(), BrokerError>;

    /// Bind a long-lived consumer with the role's prefetch applied.
    async fn consume(&self, queue: &str, role: ChannelRole) -> Result<DeliveryStream, BrokerError>;

    /// Pull a single message without waiting; used for DLQ inspection.
    async fn fetch(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    /// Passive introspection; `None` when the queue does not exist.
    async fn queue_depth(&self, queue: &str) -> Result<Option<QueueDepth>, BrokerError>;

    fn connected(&self) -> bool;
}
