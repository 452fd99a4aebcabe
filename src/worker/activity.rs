//! In-flight and completion accounting per queue
//!
//! AMQP passive declares expose ready and consumer counts but not
//! unacked messages, so the worker keeps its own ledger for the status
//! API.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueActivity {
    pub in_flight: u64,
    pub completed: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Default)]
pub struct ActivityTable {
    queues: Mutex<HashMap<String, QueueActivity>>,
}

impl ActivityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self, queue: &str) {
        self.update(queue, |activity| activity.in_flight += 1);
    }

    pub fn finished(&self, queue: &str) {
        self.update(queue, |activity| {
            activity.in_flight = activity.in_flight.saturating_sub(1);
            activity.completed += 1;
        });
    }

    pub fn requeued(&self, queue: &str) {
        self.update(queue, |activity| {
            activity.in_flight = activity.in_flight.saturating_sub(1);
        });
    }

    pub fn dead_lettered(&self, queue: &str) {
        self.update(queue, |activity| {
            activity.in_flight = activity.in_flight.saturating_sub(1);
            activity.dead_lettered += 1;
        });
    }

    pub fn snapshot(&self, queue: &str) -> QueueActivity {
        self.lock()
            .get(queue)
            .copied()
            .unwrap_or_default()
    }

    fn update(&self, queue: &str, apply: impl FnOnce(&mut QueueActivity)) {
        let mut queues = self.lock();
        apply(queues.entry(queue.to_string()).or_default());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, QueueActivity>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_accounting() {
        let table = ActivityTable::new();
        table.started("q");
        table.started("q");
        assert_eq!(table.snapshot("q").in_flight, 2);

        table.finished("q");
        table.dead_lettered("q");
        let activity = table.snapshot("q");
        assert_eq!(activity.in_flight, 0);
        assert_eq!(activity.completed, 1);
        assert_eq!(activity.dead_lettered, 1);

        assert_eq!(table.snapshot("other"), QueueActivity::default());
    }
}
