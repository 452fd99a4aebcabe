//! In-process queue implementation of the adapter
//!
//! Mirrors the AMQP semantics the crate relies on: durable declares are
//! idempotent, `nack(requeue=false)` routes to the queue named by the
//! dead-letter arguments, redeliveries set the redelivered flag. Used by
//! integration tests and local development without a broker.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    Acknowledge, BrokerError, ChannelRole, Delivery, DeliveryStream, MessageHeaders, MessageQueue,
    QueueDepth, QueueOptions,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    headers: MessageHeaders,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    opts: QueueOptions,
    ready: VecDeque<StoredMessage>,
    unacked: u64,
    consumers: u64,
}

type Queues = Arc<Mutex<HashMap<String, QueueState>>>;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    queues: Queues,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ready-message count, for test assertions.
    pub async fn ready_len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(queue)
            .map(|state| state.ready.len())
            .unwrap_or(0)
    }

    /// Peek the headers of the message at `index` without consuming it.
    pub async fn peek_headers(&self, queue: &str, index: usize) -> Option<MessageHeaders> {
        self.queues
            .lock()
            .await
            .get(queue)
            .and_then(|state| state.ready.get(index))
            .map(|message| message.headers.clone())
    }

    async fn pop(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut queues = self.queues.lock().await;
        let state = match queues.get_mut(queue) {
            Some(state) => state,
            None => return Err(BrokerError::QueueMissing(queue.to_string())),
        };
        let message = match state.ready.pop_front() {
            Some(message) => message,
            None => return Ok(None),
        };
        state.unacked += 1;

        let acker = MemoryAcker {
            queues: self.queues.clone(),
            queue: queue.to_string(),
            message: message.clone(),
        };
        Ok(Some(Delivery::new(
            message.body,
            message.headers,
            message.redelivered,
            queue.to_string(),
            Box::new(acker),
        )))
    }
}

#[async_trait]
impl MessageQueue for MemoryBroker {
    async fn declare_queue(&self, name: &str, opts: QueueOptions) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(name.to_string()).or_default();
        state.opts = opts;
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<u64, BrokerError> {
        let mut queues = self.queues.lock().await;
        Ok(queues
            .remove(name)
            .map(|state| state.ready.len() as u64)
            .unwrap_or(0))
    }

    async fn purge_queue(&self, name: &str) -> Result<u64, BrokerError> {
        let mut queues = self.queues.lock().await;
        match queues.get_mut(name) {
            Some(state) => {
                let purged = state.ready.len() as u64;
                state.ready.clear();
                Ok(purged)
            }
            None => Ok(0),
        }
    }

    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        headers: MessageHeaders,
    ) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueMissing(queue.to_string()))?;
        state.ready.push_back(StoredMessage {
            body,
            headers,
            redelivered: false,
        });
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _role: ChannelRole,
    ) -> Result<DeliveryStream, BrokerError> {
        {
            let mut queues = self.queues.lock().await;
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::QueueMissing(queue.to_string()))?;
            state.consumers += 1;
        }

        let broker = self.clone();
        let queue_name = queue.to_string();
        let stream =
            futures_lite::stream::unfold((broker, queue_name), |(broker, queue)| async move {
                loop {
                    match broker.pop(&queue).await {
                        Ok(Some(delivery)) => return Some((Ok(delivery), (broker, queue))),
                        Ok(None) => tokio::time::sleep(Duration::from_millis(5)).await,
                        Err(err) => return Some((Err(err), (broker, queue))),
                    }
                }
            });
        Ok(Box::pin(stream))
    }

    async fn fetch(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        self.pop(queue).await
    }

    async fn queue_depth(&self, queue: &str) -> Result<Option<QueueDepth>, BrokerError> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map(|state| QueueDepth {
            ready: state.ready.len() as u64,
            consumers: state.consumers,
        }))
    }

    fn connected(&self) -> bool {
        true
    }
}

struct MemoryAcker {
    queues: Queues,
    queue: String,
    message: StoredMessage,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        let MemoryAcker { queues, queue, .. } = *self;
        let mut queues = queues.lock().await;
        if let Some(state) = queues.get_mut(&queue) {
            state.unacked = state.unacked.saturating_sub(1);
        }
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        let MemoryAcker {
            queues,
            queue,
            mut message,
        } = *self;
        let mut queues = queues.lock().await;

        let dead_letter_target = match queues.get_mut(&queue) {
            Some(state) => {
                state.unacked = state.unacked.saturating_sub(1);
                if requeue {
                    message.redelivered = true;
                    state.ready.push_front(message);
                    return Ok(());
                }
                state.opts.dead_letter_routing_key.clone()
            }
            None => None,
        };

        if let Some(target) = dead_letter_target {
            let state = queues.entry(target).or_default();
            state.ready.push_back(message);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::StreamExt;

    #[tokio::test]
    async fn publish_requires_declared_queue() {
        let broker = MemoryBroker::new();
        let result = broker
            .publish("missing", b"{}".to_vec(), MessageHeaders::new())
            .await;
        assert!(matches!(result, Err(BrokerError::QueueMissing(_))));
    }

    #[tokio::test]
    async fn nack_without_requeue_routes_to_dlq() {
        let broker = MemoryBroker::new();
        broker
            .declare_queue("work", QueueOptions::durable_with_dlq("failed"))
            .await
            .unwrap();
        broker
            .declare_queue("failed", QueueOptions::durable())
            .await
            .unwrap();
        broker
            .publish("work", b"payload".to_vec(), MessageHeaders::new())
            .await
            .unwrap();

        let delivery = broker.fetch("work").await.unwrap().unwrap();
        delivery.nack(false).await.unwrap();

        assert_eq!(broker.ready_len("work").await, 0);
        assert_eq!(broker.ready_len("failed").await, 1);
    }

    #[tokio::test]
    async fn nack_with_requeue_marks_redelivered() {
        let broker = MemoryBroker::new();
        broker
            .declare_queue("work", QueueOptions::durable())
            .await
            .unwrap();
        broker
            .publish("work", b"payload".to_vec(), MessageHeaders::new())
            .await
            .unwrap();

        let first = broker.fetch("work").await.unwrap().unwrap();
        assert!(!first.redelivered);
        first.nack(true).await.unwrap();

        let second = broker.fetch("work").await.unwrap().unwrap();
        assert!(second.redelivered);
        second.ack().await.unwrap();
        assert_eq!(broker.ready_len("work").await, 0);
    }

    #[tokio::test]
    async fn consume_drains_published_messages() {
        let broker = MemoryBroker::new();
        broker
            .declare_queue("work", QueueOptions::durable())
            .await
            .unwrap();
        for n in 0..3u8 {
            broker
                .publish("work", vec![n], MessageHeaders::new())
                .await
                .unwrap();
        }

        let mut stream = broker.consume("work", ChannelRole::Download).await.unwrap();
        for expected in 0..3u8 {
            let delivery = stream.next().await.unwrap().unwrap();
            assert_eq!(delivery.body, vec![expected]);
            delivery.ack().await.unwrap();
        }

        let depth = broker.queue_depth("work").await.unwrap().unwrap();
        assert_eq!(depth.ready, 0);
        assert_eq!(depth.consumers, 1);
    }
}
