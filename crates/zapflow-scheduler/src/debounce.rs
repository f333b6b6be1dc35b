//! Inbound debounce — coalesces a burst of messages from one sender into a
//! single flush once the sender has been quiet for the configured delay.
//!
//! Trailing debounce with full re-arm: every new event cancels the pending
//! timer and starts a fresh one, so a sender who keeps typing keeps
//! postponing the flush. Each sender has at most one live timer, and flushes
//! for one sender run one at a time, in the order their buckets closed.
//!
//! ```text
//! handle(e1) ──► bucket{[e1]} + timer#1
//! handle(e2) ──► abort timer#1, bucket{[e1,e2]} + timer#2
//! timer#2 fires ──► remove bucket ──► on_flush(sender, name, [e1,e2])
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use zapflow_core::config::DebounceConfig;

/// An event that can be grouped by sender.
pub trait SenderEvent: Send + 'static {
    fn sender_id(&self) -> &str;
    fn sender_name(&self) -> &str;
}

/// A plain inbound chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(sender_id: &str, sender_name: &str, text: &str) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            text: text.to_string(),
            received_at: Utc::now(),
        }
    }
}

impl SenderEvent for InboundMessage {
    fn sender_id(&self) -> &str {
        &self.sender_id
    }

    fn sender_name(&self) -> &str {
        &self.sender_name
    }
}

/// Flush callback: `(sender_id, sender_name, events)`.
pub type FlushFn<E> = Arc<dyn Fn(String, String, Vec<E>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Per-call debounce settings supplied by the ingestion side.
pub struct DebounceOptions<E> {
    pub delay: Duration,
    pub on_flush: FlushFn<E>,
}

impl<E> Clone for DebounceOptions<E> {
    fn clone(&self) -> Self {
        Self {
            delay: self.delay,
            on_flush: Arc::clone(&self.on_flush),
        }
    }
}

impl<E: SenderEvent> DebounceOptions<E> {
    pub fn new<F, Fut>(delay: Duration, on_flush: F) -> Self
    where
        F: Fn(String, String, Vec<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            delay,
            on_flush: Arc::new(move |id, name, events| Box::pin(on_flush(id, name, events))),
        }
    }

    /// Options using the configured quiet period.
    pub fn from_config<F, Fut>(config: &DebounceConfig, on_flush: F) -> Self
    where
        F: Fn(String, String, Vec<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::new(config.delay(), on_flush)
    }
}

/// Buffered events for one sender plus its single pending timer.
struct Bucket<E> {
    sender_name: String,
    messages: Vec<E>,
    timer: JoinHandle<()>,
    /// Identifies which timer is the live one for this bucket.
    generation: u64,
    on_flush: FlushFn<E>,
}

struct Buckets<E> {
    by_sender: HashMap<String, Bucket<E>>,
    /// Completion signal of the latest flush started per sender.
    flushing: HashMap<String, (u64, oneshot::Receiver<()>)>,
    next_generation: u64,
}

impl<E> Buckets<E> {
    /// Queue a flush behind any flush already running for `sender_id`.
    /// Must be called in the same critical section that removed the bucket.
    fn begin_flush(&mut self, sender_id: &str, generation: u64) -> FlushTicket {
        let (done, rx) = oneshot::channel();
        let previous = self
            .flushing
            .insert(sender_id.to_string(), (generation, rx))
            .map(|(_, prev)| prev);
        FlushTicket {
            generation,
            previous,
            done,
        }
    }

    fn end_flush(&mut self, sender_id: &str, generation: u64) {
        if self.flushing.get(sender_id).is_some_and(|(g, _)| *g == generation) {
            self.flushing.remove(sender_id);
        }
    }
}

/// A place in a sender's flush queue.
struct FlushTicket {
    generation: u64,
    previous: Option<oneshot::Receiver<()>>,
    done: oneshot::Sender<()>,
}

/// Keyed debounce store. Cheap to clone; clones share the same buckets.
pub struct DebounceAggregator<E> {
    inner: Arc<Mutex<Buckets<E>>>,
}

impl<E> Clone for DebounceAggregator<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: SenderEvent> Default for DebounceAggregator<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: SenderEvent> DebounceAggregator<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Buckets {
                by_sender: HashMap::new(),
                flushing: HashMap::new(),
                next_generation: 0,
            })),
        }
    }

    /// Buffer `event` and (re)arm the sender's timer.
    pub async fn handle(&self, event: E, options: &DebounceOptions<E>) {
        let sender_id = event.sender_id().to_string();
        let mut inner = self.inner.lock().await;
        inner.next_generation += 1;
        let generation = inner.next_generation;
        let timer = self.arm(sender_id.clone(), generation, options.delay);

        match inner.by_sender.get_mut(&sender_id) {
            Some(bucket) => {
                bucket.timer.abort();
                bucket.messages.push(event);
                bucket.timer = timer;
                bucket.generation = generation;
                bucket.on_flush = Arc::clone(&options.on_flush);
                tracing::debug!(
                    sender = %sender_id,
                    buffered = bucket.messages.len(),
                    "debounce window reset"
                );
            }
            None => {
                let sender_name = event.sender_name().to_string();
                inner.by_sender.insert(
                    sender_id.clone(),
                    Bucket {
                        sender_name,
                        messages: vec![event],
                        timer,
                        generation,
                        on_flush: Arc::clone(&options.on_flush),
                    },
                );
                tracing::debug!(sender = %sender_id, "debounce window opened");
            }
        }
    }

    /// Number of events buffered for a sender.
    pub async fn pending(&self, sender_id: &str) -> usize {
        self.inner
            .lock()
            .await
            .by_sender
            .get(sender_id)
            .map_or(0, |b| b.messages.len())
    }

    /// Senders with an open bucket.
    pub async fn pending_senders(&self) -> Vec<String> {
        let mut senders: Vec<String> = self.inner.lock().await.by_sender.keys().cloned().collect();
        senders.sort();
        senders
    }

    /// Cancel every timer and flush every bucket now. Returns the number of
    /// buckets flushed.
    pub async fn flush_all(&self) -> usize {
        let drained: Vec<(String, Bucket<E>, FlushTicket)> = {
            let mut inner = self.inner.lock().await;
            let buckets: Vec<(String, Bucket<E>)> = inner.by_sender.drain().collect();
            buckets
                .into_iter()
                .map(|(sender_id, bucket)| {
                    bucket.timer.abort();
                    inner.next_generation += 1;
                    let generation = inner.next_generation;
                    let ticket = inner.begin_flush(&sender_id, generation);
                    (sender_id, bucket, ticket)
                })
                .collect()
        };
        let count = drained.len();
        for (sender_id, bucket, ticket) in drained {
            run_flush(&self.inner, sender_id, bucket, ticket).await;
        }
        count
    }

    fn arm(&self, sender_id: String, generation: u64, delay: Duration) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            // Remove before flushing so events arriving during the callback
            // open a fresh bucket.
            let claimed = {
                let mut guard = inner.lock().await;
                match guard.by_sender.get(&sender_id) {
                    Some(b) if b.generation == generation => guard
                        .by_sender
                        .remove(&sender_id)
                        .map(|bucket| (bucket, guard.begin_flush(&sender_id, generation))),
                    _ => None,
                }
            };

            if let Some((bucket, ticket)) = claimed {
                run_flush(&inner, sender_id, bucket, ticket).await;
            }
        })
    }
}

/// Wait for the sender's previous flush, run this one, then release the next.
async fn run_flush<E: SenderEvent>(
    inner: &Arc<Mutex<Buckets<E>>>,
    sender_id: String,
    bucket: Bucket<E>,
    ticket: FlushTicket,
) {
    if let Some(previous) = ticket.previous {
        // Err means the previous flush task ended without signalling; it is done either way.
        let _ = previous.await;
    }

    tracing::debug!(
        sender = %sender_id,
        count = bucket.messages.len(),
        "debounce flush"
    );
    (bucket.on_flush)(sender_id.clone(), bucket.sender_name, bucket.messages).await;

    let _ = ticket.done.send(());
    inner.lock().await.end_flush(&sender_id, ticket.generation);
}
