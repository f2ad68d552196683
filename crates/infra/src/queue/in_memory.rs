//! In-memory queue. Nacked messages go back to the front of the line.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use uuid::Uuid;

use super::{Delivery, MessageQueue, QueueError};

const DEFAULT_RECEIVE_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct Inner {
    ready: VecDeque<Delivery>,
    in_flight: HashMap<String, Delivery>,
    acked: usize,
    nacked: usize,
}

#[derive(Debug)]
pub struct InMemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    receive_wait: Duration,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            receive_wait: DEFAULT_RECEIVE_WAIT,
        }
    }

    pub fn acked(&self) -> usize {
        self.inner.lock().unwrap().acked
    }

    pub fn nacked(&self) -> usize {
        self.inner.lock().unwrap().nacked
    }

    /// Messages waiting to be delivered.
    pub fn ready(&self) -> usize {
        self.inner.lock().unwrap().ready.len()
    }

    /// Messages delivered but not yet acked or nacked.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap().in_flight.len()
    }

    fn take(&self, max: usize) -> Vec<Delivery> {
        let mut inner = self.inner.lock().unwrap();
        let n = max.min(inner.ready.len());
        let batch: Vec<Delivery> = inner.ready.drain(..n).collect();
        for d in &batch {
            inner.in_flight.insert(d.id.clone(), d.clone());
        }
        batch
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let batch = self.take(max);
        if !batch.is_empty() {
            return Ok(batch);
        }
        let _ = tokio::time::timeout(self.receive_wait, self.notify.notified()).await;
        Ok(self.take(max))
    }

    async fn ack(&self, id: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .in_flight
            .remove(id)
            .ok_or_else(|| QueueError::UnknownDelivery(id.to_string()))?;
        inner.acked += 1;
        Ok(())
    }

    async fn nack(&self, id: &str) -> Result<(), QueueError> {
        {
            let mut inner = self.inner.lock().unwrap();
            let mut delivery = inner
                .in_flight
                .remove(id)
                .ok_or_else(|| QueueError::UnknownDelivery(id.to_string()))?;
            delivery.attempts += 1;
            inner.ready.push_front(delivery);
            inner.nacked += 1;
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn publish(&self, body: Vec<u8>) -> Result<String, QueueError> {
        let id = Uuid::now_v7().to_string();
        self.inner.lock().unwrap().ready.push_back(Delivery {
            id: id.clone(),
            body,
            attempts: 1,
        });
        self.notify.notify_one();
        Ok(id)
    }
}
