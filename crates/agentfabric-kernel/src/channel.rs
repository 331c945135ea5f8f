//! Channels: bounded, directed message queues bound to one connection.
//!
//! Each connection owns one [`Channel`] made of two [`Queue`]s, one per
//! direction, so a slow receiver on one side never reorders the other side's
//! traffic. Enqueue and dequeue are single steps under the queue's mutex;
//! waiting happens on [`Notify`] handles outside it, which keeps every wait
//! cancel-safe: a dropped or cancelled call has either fully enqueued
//! (dequeued) or not touched the queue at all.

use agentfabric_types::agent::AgentId;
use agentfabric_types::error::{FabricError, FabricResult};
use agentfabric_types::message::Envelope;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Fabric-wide message sequence counter.
#[derive(Debug, Clone, Default)]
pub struct Sequencer(Arc<AtomicU64>);

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence number. Starts at 1.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// How a receive should behave when nothing is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    /// Return `Ok(None)` immediately.
    NonBlocking,
    /// Wait up to `timeout`, then fail with `Timeout`.
    Blocking { timeout: Duration },
}

/// Cancellation sources a blocking call listens to: the fabric's shutdown
/// token and an optional caller-supplied token.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CancelScope<'a> {
    pub shutdown: &'a CancellationToken,
    pub caller: Option<&'a CancellationToken>,
}

impl CancelScope<'_> {
    pub async fn cancelled(&self) {
        match self.caller {
            Some(caller) => tokio::select! {
                _ = self.shutdown.cancelled() => {}
                _ = caller.cancelled() => {}
            },
            None => self.shutdown.cancelled().await,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled() || self.caller.is_some_and(|c| c.is_cancelled())
    }
}

#[derive(Debug)]
struct QueueInner {
    buf: VecDeque<Envelope>,
    closed: bool,
}

enum PushRejected {
    Full(String),
    Closed,
}

/// One direction of a channel: `from -> to`, at most `capacity` envelopes.
#[derive(Debug)]
pub struct Queue {
    from: AgentId,
    to: AgentId,
    capacity: usize,
    inner: Mutex<QueueInner>,
    /// Woken whenever an envelope is taken or the queue closes.
    space: Notify,
    /// The receiving agent's mailbox bell, shared by all its inbound queues.
    arrival: Arc<Notify>,
}

impl Queue {
    pub(crate) fn new(from: AgentId, to: AgentId, capacity: usize, arrival: Arc<Notify>) -> Self {
        Self {
            from,
            to,
            capacity: capacity.max(1),
            inner: Mutex::new(QueueInner {
                buf: VecDeque::with_capacity(capacity.clamp(1, 64)),
                closed: false,
            }),
            space: Notify::new(),
            arrival,
        }
    }

    /// Sending side of this queue.
    pub fn from(&self) -> &AgentId {
        &self.from
    }

    /// Receiving side of this queue.
    pub fn to(&self) -> &AgentId {
        &self.to
    }

    /// Maximum number of queued envelopes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Envelopes currently queued.
    pub fn len(&self) -> usize {
        self.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue was closed by a disconnect or shutdown.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The sequence number is drawn under the queue lock, so seq order within
    /// a queue always matches enqueue order.
    fn try_push(&self, payload: String, sequencer: &Sequencer) -> Result<u64, PushRejected> {
        let seq = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(PushRejected::Closed);
            }
            if inner.buf.len() >= self.capacity {
                return Err(PushRejected::Full(payload));
            }
            let seq = sequencer.next();
            inner.buf.push_back(Envelope::new(
                seq,
                self.from.clone(),
                self.to.clone(),
                payload,
            ));
            seq
        };
        self.arrival.notify_waiters();
        Ok(seq)
    }

    /// Enqueue `payload`, waiting for space up to `timeout`. Returns the
    /// sequence number stamped on the envelope.
    ///
    /// Fails with `NoChannel` if the queue is (or becomes) closed, `Timeout`
    /// when no space frees up in time, and `Cancelled` when the scope is
    /// cancelled. On any failure nothing was enqueued.
    pub(crate) async fn push(
        &self,
        payload: String,
        sequencer: &Sequencer,
        timeout: Duration,
        scope: CancelScope<'_>,
    ) -> FabricResult<u64> {
        let deadline = Instant::now() + timeout;
        let mut pending = payload;
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            if scope.is_cancelled() {
                return Err(FabricError::Cancelled { operation: "send" });
            }
            match self.try_push(pending, sequencer) {
                Ok(seq) => return Ok(seq),
                Err(PushRejected::Closed) => {
                    return Err(FabricError::no_channel(
                        self.from.as_str(),
                        self.to.as_str(),
                    ))
                }
                Err(PushRejected::Full(back)) => pending = back,
            }

            tokio::select! {
                _ = &mut space => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(FabricError::Timeout {
                        operation: "send",
                        waited_ms: timeout.as_millis() as u64,
                    });
                }
                _ = scope.cancelled() => {
                    return Err(FabricError::Cancelled { operation: "send" });
                }
            }
        }
    }

    /// Sequence number of the oldest queued envelope.
    pub(crate) fn head_seq(&self) -> Option<u64> {
        self.lock().buf.front().map(|e| e.seq)
    }

    /// Dequeue the oldest envelope.
    pub(crate) fn pop(&self) -> Option<Envelope> {
        let envelope = self.lock().buf.pop_front();
        if envelope.is_some() {
            self.space.notify_waiters();
        }
        envelope
    }

    /// Close the queue and drop everything still in it.
    ///
    /// Returns the number of discarded envelopes. Waiting senders wake up and
    /// fail with `NoChannel`.
    pub(crate) fn close(&self) -> usize {
        let discarded = {
            let mut inner = self.lock();
            inner.closed = true;
            let n = inner.buf.len();
            inner.buf.clear();
            n
        };
        self.space.notify_waiters();
        discarded
    }
}

/// Canonical, order-independent key of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey(AgentId, AgentId);

impl ChannelKey {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self(AgentId::from(a), AgentId::from(b))
        } else {
            Self(AgentId::from(b), AgentId::from(a))
        }
    }

    /// The lexicographically smaller id.
    pub fn low(&self) -> &AgentId {
        &self.0
    }

    pub fn high(&self) -> &AgentId {
        &self.1
    }
}

/// Endpoint of a channel as seen from one agent.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: AgentId,
    /// The agent's mailbox bell.
    pub bell: Arc<Notify>,
}

/// The bidirectional channel of one connection.
#[derive(Debug)]
pub struct Channel {
    key: ChannelKey,
    /// `low -> high`.
    upward: Arc<Queue>,
    /// `high -> low`.
    downward: Arc<Queue>,
    opened_at: DateTime<Utc>,
}

impl Channel {
    /// Open a channel between two endpoints.
    pub fn open(a: Endpoint, b: Endpoint, capacity: usize) -> Self {
        let key = ChannelKey::new(a.id.as_str(), b.id.as_str());
        let (low, high) = if a.id <= b.id { (a, b) } else { (b, a) };
        Self {
            key,
            upward: Arc::new(Queue::new(
                low.id.clone(),
                high.id.clone(),
                capacity,
                high.bell,
            )),
            downward: Arc::new(Queue::new(high.id, low.id, capacity, low.bell)),
            opened_at: Utc::now(),
        }
    }

    /// Key of the connection this channel serves.
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// When the connection was made.
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// The queue carrying `from -> to`, if this channel connects them.
    pub fn queue(&self, from: &str, to: &str) -> Option<Arc<Queue>> {
        if self.upward.from().as_str() == from && self.upward.to().as_str() == to {
            Some(self.upward.clone())
        } else if self.downward.from().as_str() == from && self.downward.to().as_str() == to {
            Some(self.downward.clone())
        } else {
            None
        }
    }

    /// Messages queued in both directions.
    pub fn pending(&self) -> usize {
        self.upward.len() + self.downward.len()
    }

    /// Close both directions, returning how many messages were discarded.
    pub fn close(&self) -> usize {
        self.upward.close() + self.downward.close()
    }
}
