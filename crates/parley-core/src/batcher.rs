//! Keyed coalescing scheduler.
//!
//! Items pushed for the same key within `batch_delay` of the first one are
//! handed to the [`BatchHandler`] as a single batch. Each key has at most one
//! handler invocation running at a time; callers can force an early flush
//! with [`CoalescingScheduler::consume`].
//!
//! Per key there are two locks:
//! - `state` (std mutex): batch contents, armed timer token, in-flight flag.
//!   Never held across an await.
//! - `flight` (tokio mutex): held for the whole drain + handler call, which
//!   is what makes handling single-flight and FIFO per key.
//!
//! A timer is only "cancelled" by clearing its token. The sleeping task wakes
//! up, takes the flight lock, sees the token no longer matches, and exits
//! without draining. Tasks are never aborted, so a handler that is already
//! running cannot be torn down by a racing `consume`.

use anyhow::Result;
use lru::LruCache;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{Instrument, debug, error, info_span, warn};

use crate::traits::BatchHandler;

pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_KEYS: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct BatcherConfig {
    /// How long after the first push of a batch the automatic flush fires.
    pub batch_delay: Duration,
    /// Soft cap on tracked keys. Idle keys beyond it are evicted, least
    /// recently touched first; busy keys are kept even past the cap.
    pub max_keys: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_delay: DEFAULT_BATCH_DELAY,
            max_keys: DEFAULT_MAX_KEYS,
        }
    }
}

pub struct CoalescingScheduler<K, T, H> {
    inner: Arc<Inner<K, T, H>>,
}

impl<K, T, H> Clone for CoalescingScheduler<K, T, H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, T, H> fmt::Debug for CoalescingScheduler<K, T, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescingScheduler")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

struct Inner<K, T, H> {
    handler: H,
    config: BatcherConfig,
    entries: Mutex<LruCache<K, Arc<Entry<T>>>>,
}

struct Entry<T> {
    state: Mutex<EntryState<T>>,
    flight: tokio::sync::Mutex<()>,
}

struct EntryState<T> {
    batch: Vec<T>,
    /// Token of the armed timer, if any.
    timer: Option<u64>,
    next_token: u64,
    in_flight: bool,
    /// `consume` calls queued on the flight lock.
    waiting: usize,
}

impl<T> EntryState<T> {
    fn arm(&mut self) -> u64 {
        self.next_token += 1;
        self.timer = Some(self.next_token);
        self.next_token
    }

    fn needs_timer(&self) -> bool {
        !self.batch.is_empty() && self.timer.is_none() && !self.in_flight && self.waiting == 0
    }

    fn is_idle(&self) -> bool {
        self.batch.is_empty() && self.timer.is_none() && !self.in_flight && self.waiting == 0
    }
}

impl<T> Entry<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(EntryState {
                batch: Vec::new(),
                timer: None,
                next_token: 0,
                in_flight: false,
                waiting: 0,
            }),
            flight: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EntryState<T>> {
        self.state.lock().expect("batch entry mutex poisoned")
    }
}

impl<K, T, H> CoalescingScheduler<K, T, H>
where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
    T: Send + 'static,
    H: BatchHandler<K, T> + 'static,
{
    pub fn new(handler: H, config: BatcherConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                handler,
                config,
                entries: Mutex::new(LruCache::unbounded()),
            }),
        }
    }

    pub fn handler(&self) -> &H {
        &self.inner.handler
    }

    /// Queue `item` for `key`, arming the automatic flush if nothing is
    /// armed or running for the key. Never blocks.
    ///
    /// Must be called from within a Tokio runtime for the timer to arm.
    pub fn push(&self, key: K, item: T) {
        let entry = self.inner.entry(&key);
        let token = {
            let mut state = entry.lock();
            state.batch.push(item);
            debug!(key = %key, pending = state.batch.len(), "batch item queued");
            if !state.needs_timer() {
                return;
            }
            state.arm()
        };
        self.inner.arm_timer(key, entry, token);
    }

    /// Handle the key's current batch now.
    ///
    /// Cancels an armed timer. If a handler is already running for the key,
    /// waits for it and then handles whatever was queued meanwhile. Returns
    /// `Ok(None)` without calling the handler when there is nothing pending
    /// by the time this call gets its turn.
    pub async fn consume(&self, key: &K) -> Result<Option<H::Output>> {
        let entry = self.inner.entry(key);
        {
            let mut state = entry.lock();
            if state.timer.take().is_some() {
                debug!(key = %key, "pending flush cancelled by consume");
            }
            state.waiting += 1;
        }
        let mut waiter = Waiter {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
            entry: Arc::clone(&entry),
            released: false,
        };

        let _flight = entry.flight.lock().await;
        let batch = {
            let mut state = entry.lock();
            waiter.release(&mut state);
            // An invocation that finished while we waited may have re-armed.
            state.timer = None;
            if state.batch.is_empty() {
                debug!(key = %key, "consume found empty batch, handler not invoked");
                return Ok(None);
            }
            state.in_flight = true;
            std::mem::take(&mut state.batch)
        };

        let _guard = FlightGuard {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
            entry: Arc::clone(&entry),
        };
        debug!(key = %key, batch_len = batch.len(), "batch consumed");
        self.inner.handler.handle(key, batch).await.map(Some)
    }

    pub fn pending_count(&self, key: &K) -> usize {
        self.inner
            .peek(key)
            .map_or(0, |entry| entry.lock().batch.len())
    }

    pub fn has_pending(&self, key: &K) -> bool {
        self.pending_count(key) > 0
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.inner
            .peek(key)
            .is_some_and(|entry| entry.lock().in_flight)
    }

    /// Number of keys currently tracked.
    pub fn key_count(&self) -> usize {
        self.inner.lock_entries().len()
    }

    /// Keys with queued items or a handler running. Consuming each of these
    /// drains everything the scheduler still owes.
    pub fn busy_keys(&self) -> Vec<K> {
        self.inner
            .lock_entries()
            .iter()
            .filter(|(_, entry)| {
                let state = entry.lock();
                !state.batch.is_empty() || state.in_flight
            })
            .map(|(key, _)| key.clone())
            .collect()
    }
}

impl<K, T, H> Inner<K, T, H>
where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
    T: Send + 'static,
    H: BatchHandler<K, T> + 'static,
{
    fn lock_entries(&self) -> MutexGuard<'_, LruCache<K, Arc<Entry<T>>>> {
        self.entries.lock().expect("batcher key map mutex poisoned")
    }

    fn entry(&self, key: &K) -> Arc<Entry<T>> {
        let mut entries = self.lock_entries();
        if let Some(entry) = entries.get(key) {
            return Arc::clone(entry);
        }

        let entry = Arc::new(Entry::new());
        entries.put(key.clone(), Arc::clone(&entry));
        self.evict_idle(&mut entries);
        entry
    }

    fn peek(&self, key: &K) -> Option<Arc<Entry<T>>> {
        self.lock_entries().peek(key).map(Arc::clone)
    }

    /// Drop least-recently-touched idle keys until under the cap. An entry
    /// referenced anywhere else (timer task, consume call) is never idle.
    fn evict_idle(&self, entries: &mut LruCache<K, Arc<Entry<T>>>) {
        while entries.len() > self.config.max_keys {
            let victim = entries
                .iter()
                .rev()
                .find(|(_, entry)| Arc::strong_count(entry) == 1 && entry.lock().is_idle())
                .map(|(key, _)| key.clone());
            let Some(victim) = victim else {
                debug!(
                    keys = entries.len(),
                    max_keys = self.config.max_keys,
                    "all batch keys busy, cap temporarily exceeded"
                );
                break;
            };
            entries.pop(&victim);
            debug!(key = %victim, "idle batch key evicted");
        }
    }

    fn arm_timer(self: &Arc<Self>, key: K, entry: Arc<Entry<T>>, token: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %key, "no tokio runtime, automatic flush not armed");
            entry.lock().timer = None;
            return;
        };
        let inner = Arc::clone(self);
        let span = info_span!("batch_timer", key = %key);
        runtime.spawn(inner.run_timer(key, entry, token).instrument(span));
    }

    async fn run_timer(self: Arc<Self>, key: K, entry: Arc<Entry<T>>, token: u64) {
        tokio::time::sleep(self.config.batch_delay).await;

        let _flight = entry.flight.lock().await;
        let batch = {
            let mut state = entry.lock();
            if state.timer != Some(token) {
                debug!("flush superseded, skipping");
                return;
            }
            state.timer = None;
            if state.batch.is_empty() {
                return;
            }
            state.in_flight = true;
            std::mem::take(&mut state.batch)
        };

        let _guard = FlightGuard {
            inner: Arc::clone(&self),
            key: key.clone(),
            entry: Arc::clone(&entry),
        };
        let batch_len = batch.len();
        debug!(batch_len, "automatic flush");
        if let Err(error) = self.handler.handle(&key, batch).await {
            // Nobody awaits the timer path; the batch is gone either way.
            error!(key = %key, batch_len, error = %format!("{error:#}"), "batch handler failed");
        }
    }

    /// Arm a timer for items that arrived while the key was busy.
    fn settle(self: &Arc<Self>, key: &K, entry: &Arc<Entry<T>>) {
        let token = {
            let mut state = entry.lock();
            if !state.needs_timer() {
                return;
            }
            state.arm()
        };
        debug!(key = %key, "re-arming flush for items queued during handler");
        self.arm_timer(key.clone(), Arc::clone(entry), token);
    }
}

/// Clears the in-flight flag when a handler call ends, however it ends.
struct FlightGuard<K, T, H>
where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
    T: Send + 'static,
    H: BatchHandler<K, T> + 'static,
{
    inner: Arc<Inner<K, T, H>>,
    key: K,
    entry: Arc<Entry<T>>,
}

impl<K, T, H> Drop for FlightGuard<K, T, H>
where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
    T: Send + 'static,
    H: BatchHandler<K, T> + 'static,
{
    fn drop(&mut self) {
        self.entry.lock().in_flight = false;
        self.inner.settle(&self.key, &self.entry);
    }
}

/// Tracks a `consume` queued on the flight lock, so a dropped caller
/// doesn't leave the key thinking someone will drain it.
struct Waiter<K, T, H>
where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
    T: Send + 'static,
    H: BatchHandler<K, T> + 'static,
{
    inner: Arc<Inner<K, T, H>>,
    key: K,
    entry: Arc<Entry<T>>,
    released: bool,
}

impl<K, T, H> Waiter<K, T, H>
where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
    T: Send + 'static,
    H: BatchHandler<K, T> + 'static,
{
    fn release(&mut self, state: &mut EntryState<T>) {
        state.waiting -= 1;
        self.released = true;
    }
}

impl<K, T, H> Drop for Waiter<K, T, H>
where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
    T: Send + 'static,
    H: BatchHandler<K, T> + 'static,
{
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.entry.lock().waiting -= 1;
        self.inner.settle(&self.key, &self.entry);
    }
}
