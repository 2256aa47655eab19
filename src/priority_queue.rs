use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    pub const NUM_LEVELS: usize = 4;

    /// highest priority first, i.e. in dequeue order
    pub const DESCENDING: [Priority; Self::NUM_LEVELS] = [Priority::Critical, Priority::High, Priority::Normal, Priority::Low];

    fn index(self) -> usize {
        u8::from(self) as usize
    }
}

#[derive(Clone, Debug)]
pub struct PriorityMessage<T> {
    pub data: Bytes,
    pub priority: Priority,
    pub timestamp: Instant,
    /// whoever is supposed to send the message, e.g. a peer address
    pub target: T,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueueStats {
    /// indexed by `Priority as usize`
    pub per_priority: [usize; Priority::NUM_LEVELS],
    pub total: usize,
    /// age of the oldest message still in the queue, across all priorities
    pub oldest_age: Option<Duration>,
}

/// An in-process queue with strict priority between levels and FIFO order within a level.
pub struct PriorityQueue<T> {
    levels: Mutex<[VecDeque<PriorityMessage<T>>; Priority::NUM_LEVELS]>,
    not_empty: Notify,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    pub fn new() -> PriorityQueue<T> {
        PriorityQueue {
            levels: Mutex::new(Default::default()),
            not_empty: Notify::new(),
        }
    }

    pub fn enqueue(&self, data: impl Into<Bytes>, target: T, priority: Priority) {
        let message = PriorityMessage {
            data: data.into(),
            priority,
            timestamp: Instant::now(),
            target,
        };
        trace!("enqueueing message of length {} with priority {:?}", message.data.len(), priority);

        self.levels.lock().unwrap()[priority.index()].push_back(message);
        self.not_empty.notify_one();
    }

    /// Removes the oldest message with the highest priority, or returns `None` if the queue is
    ///  empty
    pub fn dequeue(&self) -> Option<PriorityMessage<T>> {
        let mut levels = self.levels.lock().unwrap();
        Priority::DESCENDING.iter()
            .find_map(|p| levels[p.index()].pop_front())
    }

    /// Like `dequeue`, but waits for a message if the queue is empty.
    ///
    /// NB: This is cancel safe - dropping the future does not lose a message
    pub async fn dequeue_blocking(&self) -> PriorityMessage<T> {
        loop {
            // register interest before checking to avoid missing a wakeup in between
            let notified = self.not_empty.notified();
            if let Some(message) = self.dequeue() {
                return message;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.levels.lock().unwrap()
            .iter()
            .map(|l| l.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_by_priority(&self, priority: Priority) -> usize {
        self.levels.lock().unwrap()[priority.index()].len()
    }

    pub fn get_stats(&self) -> QueueStats {
        let levels = self.levels.lock().unwrap();

        let mut per_priority = [0; Priority::NUM_LEVELS];
        for (i, level) in levels.iter().enumerate() {
            per_priority[i] = level.len();
        }

        let oldest_age = levels.iter()
            .filter_map(|l| l.front())
            .map(|m| m.timestamp)
            .min()
            .map(|ts| ts.elapsed());

        QueueStats {
            per_priority,
            total: per_priority.iter().sum(),
            oldest_age,
        }
    }
}
