//! Admission queue
//!
//! Four FIFO lanes drained strictly critical > high > medium > low.
//! Unbounded unless a capacity is configured, in which case `enqueue`
//! rejects with [`BalancerError::QueueFull`] once the total depth is reached.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{BalancerError, Result};
use crate::types::{BalancerRequest, RequestPriority};

#[derive(Debug, Default)]
struct Lanes {
    lanes: [VecDeque<BalancerRequest>; 4],
}

impl Lanes {
    fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }
}

/// Per-lane depth
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize {
        self.critical + self.high + self.medium + self.low
    }
}

#[derive(Debug, Clone, Default)]
pub struct AdmissionQueue {
    inner: Arc<Mutex<Lanes>>,
    capacity: Option<usize>,
}

impl AdmissionQueue {
    /// Unbounded queue
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Lanes::default())),
            capacity,
        }
    }

    pub async fn enqueue(&self, request: BalancerRequest) -> Result<()> {
        let mut lanes = self.inner.lock().await;

        if let Some(capacity) = self.capacity {
            if lanes.len() >= capacity {
                warn!(
                    request_id = %request.id,
                    capacity,
                    "Admission queue full, rejecting request"
                );
                return Err(BalancerError::QueueFull { capacity });
            }
        }

        debug!(
            request_id = %request.id,
            priority = request.priority.as_str(),
            "Request queued"
        );
        lanes.lanes[request.priority.lane()].push_back(request);
        Ok(())
    }

    /// Pop the head of the highest-priority non-empty lane
    pub async fn dequeue_next(&self) -> Option<BalancerRequest> {
        let mut lanes = self.inner.lock().await;
        for priority in RequestPriority::DRAIN_ORDER {
            if let Some(request) = lanes.lanes[priority.lane()].pop_front() {
                return Some(request);
            }
        }
        None
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn depth(&self) -> QueueDepth {
        let lanes = self.inner.lock().await;
        QueueDepth {
            critical: lanes.lanes[RequestPriority::Critical.lane()].len(),
            high: lanes.lanes[RequestPriority::High.lane()].len(),
            medium: lanes.lanes[RequestPriority::Medium.lane()].len(),
            low: lanes.lanes[RequestPriority::Low.lane()].len(),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}
