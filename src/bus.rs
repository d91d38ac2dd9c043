//! The coordinator: publish/trim policy, receive loop, subscriber fan-out,
//! metrics, lifecycle (spec §4.4).

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::codec::{LogBookCodec, LogEntry};
use crate::config::BusConfig;
use crate::error::BusError;
use crate::region::{NamedSharedRegion, SharedRegion};

/// One publisher's time budget for holding the write lock during a single
/// `read_modify_write` transform (spec §4.4.2 "write slot").
const WRITE_SLOT_BUDGET: Duration = Duration::from_millis(100);
/// Backoff between passes when the queue could not fully drain in one slot.
const PUBLISH_BACKOFF: Duration = Duration::from_millis(50);

type MessageHandler = dyn Fn(&[u8]) + Send + Sync;

struct Shared {
    instance_id: u128,
    region: Arc<dyn SharedRegion>,
    owns_region: bool,
    min_message_age: Duration,
    wait_timeout: Duration,
    cursor: AtomicI64,
    published_count: AtomicU64,
    received_count: AtomicU64,
    next_subscriber_id: AtomicU64,
    subscribers: DashMap<u64, mpsc::UnboundedSender<Bytes>>,
    receive_gate: Semaphore,
    message_received_handler: StdMutex<Option<Box<MessageHandler>>>,
    disposed: AtomicBool,
    cancel: CancellationToken,
}

/// Broker-less, shared-log, broadcast message bus (spec §4.4).
///
/// Cheap to clone: every clone shares the same underlying region, cursor,
/// subscriber set, and background tasks.
#[derive(Clone)]
pub struct MessageBus {
    shared: Arc<Shared>,
    watcher_task: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl MessageBus {
    /// Constructs a bus over a fresh, owned [`NamedSharedRegion`] derived
    /// from `config.name`.
    pub async fn new(config: BusConfig) -> Result<Self, BusError> {
        config.validate()?;
        let region = NamedSharedRegion::new(
            &config.name,
            config.max_file_size,
            config.max_reader_count,
            config.wait_timeout,
        )?;
        Self::with_region(region, config.min_message_age, config.wait_timeout, true).await
    }

    /// Constructs a bus over a caller-supplied [`SharedRegion`]. `owns_region`
    /// controls whether this bus disposes the region on teardown (spec §3
    /// "Ownership/lifecycle").
    pub async fn with_region(
        region: Arc<dyn SharedRegion>,
        min_message_age: Duration,
        wait_timeout: Duration,
        owns_region: bool,
    ) -> Result<Self, BusError> {
        let instance_id = uuid::Uuid::new_v4().as_u128();

        // Decode under a read lock and seed the cursor from the current
        // last_id so pre-existing history is never replayed (spec §4.4.1).
        let initial_bytes = region.read().await?;
        let book = LogBookCodec::decode_or_default(&initial_bytes);

        let shared = Arc::new(Shared {
            instance_id,
            region,
            owns_region,
            min_message_age,
            wait_timeout,
            cursor: AtomicI64::new(book.last_id),
            published_count: AtomicU64::new(0),
            received_count: AtomicU64::new(0),
            next_subscriber_id: AtomicU64::new(0),
            subscribers: DashMap::new(),
            receive_gate: Semaphore::new(1),
            message_received_handler: StdMutex::new(None),
            disposed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        let watcher_task = spawn_receiver_worker(Arc::clone(&shared));

        Ok(Self {
            shared,
            watcher_task: Arc::new(StdMutex::new(Some(watcher_task))),
        })
    }

    pub fn instance_id(&self) -> u128 {
        self.shared.instance_id
    }

    /// Publishes one message. Rejects an empty payload outright (unlike
    /// `publish_batch`, which silently skips empties during append).
    pub fn publish(
        &self,
        message: impl Into<Bytes>,
        cancel: Option<CancellationToken>,
    ) -> JoinHandle<Result<(), BusError>> {
        let message = message.into();
        if message.is_empty() {
            let disposed = self.shared.disposed.load(Ordering::Acquire);
            return tokio::spawn(async move {
                if disposed {
                    Err(BusError::Disposed)
                } else {
                    Err(BusError::EmptyMessage)
                }
            });
        }
        self.publish_batch(vec![message], cancel)
    }

    /// Publishes a batch of messages, preserving order within the call.
    /// Empty messages are silently skipped.
    pub fn publish_batch(
        &self,
        messages: Vec<Bytes>,
        cancel: Option<CancellationToken>,
    ) -> JoinHandle<Result<(), BusError>> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { publish_batch_inner(shared, messages, cancel).await })
    }

    /// Drives a single receive pass, used by tests and anyone who wants
    /// synchronous delivery instead of waiting on the background worker.
    /// Blocks on the receive gate up to `wait_timeout`.
    pub async fn receive(&self) -> Result<u64, BusError> {
        if self.shared.disposed.load(Ordering::Acquire) {
            return Err(BusError::Disposed);
        }
        let permit = timeout(
            self.shared.wait_timeout,
            self.shared.receive_gate.acquire(),
        )
        .await
        .map_err(|_| BusError::Timeout("receive gate".to_string()))?
        .map_err(|_| BusError::Disposed)?;
        let delivered = receive_pass(&self.shared).await?;
        drop(permit);
        Ok(delivered)
    }

    /// Registers a subscription; the returned stream yields message bytes
    /// in publish order, forever, until disposed or `cancel` fires.
    pub fn subscribe(&self, cancel: Option<CancellationToken>) -> Result<Subscription, BusError> {
        if self.shared.disposed.load(Ordering::Acquire) {
            return Err(BusError::Disposed);
        }
        let id = self.shared.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscribers.insert(id, tx);
        Ok(Subscription {
            id,
            subscribers: {
                // Keep only what's needed to remove this subscription on drop.
                SubscriberTable(Arc::clone(&self.shared))
            },
            inner: UnboundedReceiverStream::new(rx),
            cancel,
        })
    }

    /// Replaces the synchronous handler invoked once per received entry.
    pub fn on_message_received(&self, handler: impl Fn(&[u8]) + Send + Sync + 'static) {
        *self.shared.message_received_handler.lock().unwrap() = Some(Box::new(handler));
    }

    pub fn messages_published(&self) -> u64 {
        self.shared.published_count.load(Ordering::Acquire)
    }

    pub fn messages_received(&self) -> u64 {
        self.shared.received_count.load(Ordering::Acquire)
    }

    pub fn reset_metrics(&self) -> Result<(), BusError> {
        if self.shared.disposed.load(Ordering::Acquire) {
            return Err(BusError::Disposed);
        }
        self.shared.published_count.store(0, Ordering::Release);
        self.shared.received_count.store(0, Ordering::Release);
        Ok(())
    }

    /// Tears the bus down per spec §4.4.6: unsubscribe, cancel background
    /// work, mark disposed, complete every subscriber channel, await the
    /// receiver worker, and (if owned) dispose the region under the
    /// receive gate.
    pub async fn dispose(&self) -> Result<(), BusError> {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.cancel.cancel();
        self.shared.subscribers.clear();

        if let Some(handle) = self.watcher_task.lock().unwrap().take() {
            let _ = handle.await;
        }

        if self.shared.owns_region {
            let permit = timeout(
                self.shared.wait_timeout,
                self.shared.receive_gate.acquire(),
            )
            .await
            .map_err(|_| BusError::Timeout("region disposal".to_string()))?
            .map_err(|_| BusError::Disposed)?;
            self.shared.region.dispose().await?;
            drop(permit);
        }
        Ok(())
    }
}

/// Holds the `Arc<Shared>` just long enough to remove a subscription on
/// `Subscription::drop`, without exposing `Shared` itself.
struct SubscriberTable(Arc<Shared>);

/// A live subscription's message stream (spec §4.4.4).
///
/// Infinite until the bus is disposed or `cancel` fires; removes itself
/// from the bus's subscriber table when dropped.
pub struct Subscription {
    id: u64,
    subscribers: SubscriberTable,
    inner: UnboundedReceiverStream<Bytes>,
    cancel: Option<CancellationToken>,
}

impl Stream for Subscription {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        if let Some(token) = &self.cancel {
            if token.is_cancelled() {
                return Poll::Ready(None);
            }
        }
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers.0.subscribers.remove(&self.id);
    }
}

async fn publish_batch_inner(
    shared: Arc<Shared>,
    messages: Vec<Bytes>,
    cancel: Option<CancellationToken>,
) -> Result<(), BusError> {
    if shared.disposed.load(Ordering::Acquire) {
        return Err(BusError::Disposed);
    }

    let entry_overhead = LogBookCodec::entry_overhead();
    let max_file_size = shared.region.max_file_size() as usize;
    for message in &messages {
        if LogBookCodec::BOOK_HEADER_LEN + entry_overhead + message.len() > max_file_size {
            return Err(BusError::PayloadTooLarge {
                len: message.len(),
                max: max_file_size as u32,
            });
        }
    }

    let mut queue: VecDeque<Bytes> = messages.into_iter().collect();
    while !queue.is_empty() {
        if let Some(token) = &cancel {
            if token.is_cancelled() {
                return Err(BusError::Canceled);
            }
        }

        struct PassState {
            queue: VecDeque<Bytes>,
            published: u64,
        }
        let pass_state = Arc::new(StdMutex::new(PassState {
            queue: std::mem::take(&mut queue),
            published: 0,
        }));

        let min_message_age_nanos = shared.min_message_age.as_nanos() as i64;
        let instance_id = shared.instance_id;
        let batch_clock_reading = monotonic_now_nanos();
        let state_for_closure = Arc::clone(&pass_state);

        let transform: crate::region::Transform = Box::new(move |current_bytes| {
            let mut book = LogBookCodec::decode_or_default(&current_bytes);

            let cutoff = batch_clock_reading - min_message_age_nanos;
            let trim_from = book
                .entries
                .iter()
                .position(|e| e.timestamp >= cutoff)
                .unwrap_or(book.entries.len());
            book.entries.drain(..trim_from);

            let mut current_size = LogBookCodec::encoded_len(&book);

            let slot_start = std::time::Instant::now();
            let mut state = state_for_closure.lock().unwrap();
            while !state.queue.is_empty() && slot_start.elapsed() < WRITE_SLOT_BUDGET {
                let payload_len = state.queue.front().unwrap().len();
                if payload_len == 0 {
                    state.queue.pop_front();
                    continue;
                }
                if current_size + entry_overhead + payload_len > max_file_size {
                    break;
                }
                let message = state.queue.pop_front().unwrap();
                book.last_id += 1;
                current_size += entry_overhead + message.len();
                book.entries.push(LogEntry {
                    id: book.last_id,
                    instance: instance_id,
                    timestamp: batch_clock_reading,
                    message,
                });
                state.published += 1;
            }
            drop(state);

            Ok(LogBookCodec::encode(&book))
        });

        shared.region.read_modify_write(transform).await?;

        let (published_this_pass, remaining) = {
            let mut state = pass_state.lock().unwrap();
            (state.published, std::mem::take(&mut state.queue))
        };
        shared
            .published_count
            .fetch_add(published_this_pass, Ordering::AcqRel);
        queue = remaining;

        if !queue.is_empty() {
            tokio::time::sleep(PUBLISH_BACKOFF).await;
        }
    }

    Ok(())
}

/// Spawns the background worker that drives a receive pass every time
/// `FileUpdated` fires. Uses `try_acquire` on the receive gate rather than
/// blocking: if a pass is already in flight, that pass will observe the
/// latest state when it takes the read lock, so a concurrent wakeup need
/// not queue another pass (spec §4.4.3).
fn spawn_receiver_worker(shared: Arc<Shared>) -> JoinHandle<()> {
    let mut updates = shared.region.watch_file_updated();
    let cancel = shared.cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                res = updates.recv() => {
                    match res {
                        Ok(()) => {
                            if let Ok(_permit) = shared.receive_gate.try_acquire() {
                                if let Err(err) = receive_pass(&shared).await {
                                    tracing::warn!(%err, "background receive pass failed");
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    })
}

/// One receive pass: read-lock, decode, advance the cursor, fan out
/// strictly-newer non-self entries to every subscriber (spec §4.4.3).
///
/// Caller must already hold the receive gate.
async fn receive_pass(shared: &Arc<Shared>) -> Result<u64, BusError> {
    if shared.disposed.load(Ordering::Acquire) {
        return Ok(0);
    }
    let bytes = shared.region.read().await?;
    let book = LogBookCodec::decode_or_default(&bytes);

    let read_from = shared.cursor.load(Ordering::Acquire);
    shared.cursor.store(book.last_id, Ordering::Release);

    let mut delivered = 0u64;
    for entry in book.entries.iter().filter(|e| e.id > read_from) {
        if entry.instance == shared.instance_id {
            continue;
        }
        if entry.message.is_empty() {
            continue;
        }
        for sub in shared.subscribers.iter() {
            let _ = sub.value().send(entry.message.clone());
        }
        invoke_message_handler(shared, entry);
        delivered += 1;
    }

    shared.received_count.fetch_add(delivered, Ordering::AcqRel);
    Ok(delivered)
}

fn invoke_message_handler(shared: &Arc<Shared>, entry: &LogEntry) {
    let handler = shared.message_received_handler.lock().unwrap();
    if let Some(handler) = handler.as_ref() {
        let message = &entry.message;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(message)));
        if result.is_err() {
            tracing::error!("message_received handler panicked; continuing");
        }
    }
}

fn monotonic_now_nanos() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}
