use anyhow::Result;
use futures::future::join_all;
use lru::LruCache;
use parley_core::{ConversationKey, Turn};
use std::collections::VecDeque;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Recent turns per conversation, oldest first, capped at `limit` each.
///
/// At most `max_conversations` buffers are kept; the least recently used one
/// is dropped to make room and reloads from the store the next time it is
/// needed. A conversation is loaded from the store only while its buffer is
/// missing or empty. Once seeded, it changes only through
/// [`append`](Self::append).
pub(crate) struct ConversationCache {
    limit: usize,
    buffers: Mutex<LruCache<ConversationKey, VecDeque<Turn>>>,
}

impl std::fmt::Debug for ConversationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationCache")
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl ConversationCache {
    pub(crate) fn new(limit: usize, max_conversations: usize) -> Self {
        let capacity = NonZeroUsize::new(max_conversations).unwrap_or(NonZeroUsize::MIN);
        Self {
            limit,
            buffers: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<ConversationKey, VecDeque<Turn>>> {
        self.buffers
            .lock()
            .expect("conversation cache mutex poisoned")
    }

    /// Add a turn to a cached conversation. A conversation without a buffer
    /// is left alone: its next load reads the turn back from the store.
    pub(crate) fn append(&self, key: &ConversationKey, turn: Turn) {
        let mut buffers = self.lock();
        let Some(buf) = buffers.get_mut(key) else {
            debug!(conversation = %key, "conversation not cached; turn left to the store");
            return;
        };
        if buf.len() >= self.limit {
            buf.pop_front();
        }
        if self.limit > 0 {
            buf.push_back(turn);
        }
    }

    /// Cached turns for `key`, running `loader` first if there are none.
    ///
    /// The lock is not held while `loader` runs. If something else filled
    /// the buffer meanwhile, that content wins and the loaded turns are
    /// dropped.
    pub(crate) async fn get_or_load<F, Fut>(
        &self,
        key: &ConversationKey,
        loader: F,
    ) -> Result<Vec<Turn>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Turn>>>,
    {
        if let Some(turns) = self.snapshot(key) {
            return Ok(turns);
        }

        let loaded = loader().await?;
        debug!(conversation = %key, turns = loaded.len(), "conversation history loaded");
        Ok(self.seed(key, loaded))
    }

    /// Load many conversations concurrently. Failures are logged and the
    /// conversation is left cold. Returns how many were seeded.
    pub(crate) async fn warm<F, Fut>(&self, keys: Vec<ConversationKey>, loader: F) -> usize
    where
        F: Fn(ConversationKey) -> Fut,
        Fut: Future<Output = Result<Vec<Turn>>>,
    {
        let total = keys.len();
        let results = join_all(keys.into_iter().map(|key| {
            let load = loader(key.clone());
            async move { (key, load.await) }
        }))
        .await;

        let mut warmed = 0;
        for (key, result) in results {
            match result {
                Ok(turns) if turns.is_empty() => {}
                Ok(turns) => {
                    let count = turns.len();
                    self.seed(&key, turns);
                    warmed += 1;
                    info!(conversation = %key, turns = count, "conversation history warmed");
                }
                Err(error) => {
                    warn!(conversation = %key, error = %format!("{error:#}"), "failed to warm conversation");
                }
            }
        }
        info!(conversations = total, warmed, "history warm-up complete");
        warmed
    }

    pub(crate) fn len(&self, key: &ConversationKey) -> usize {
        self.lock().peek(key).map_or(0, VecDeque::len)
    }

    fn snapshot(&self, key: &ConversationKey) -> Option<Vec<Turn>> {
        let mut buffers = self.lock();
        let buf = buffers.get(key)?;
        if buf.is_empty() {
            return None;
        }
        Some(buf.iter().cloned().collect())
    }

    fn seed(&self, key: &ConversationKey, turns: Vec<Turn>) -> Vec<Turn> {
        let skip = turns.len().saturating_sub(self.limit);
        let fresh = turns.into_iter().skip(skip);

        let mut buffers = self.lock();
        if let Some(buf) = buffers.get_mut(key) {
            if buf.is_empty() {
                buf.extend(fresh);
            }
            return buf.iter().cloned().collect();
        }

        let buf: VecDeque<Turn> = fresh.collect();
        let seeded = buf.iter().cloned().collect();
        if let Some((evicted, _)) = buffers.push(key.clone(), buf) {
            debug!(conversation = %evicted, "least recently used conversation dropped");
        }
        seeded
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{ContentPart, MessageRecord, RunId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(id: &str) -> ConversationKey {
        ConversationKey::group(id)
    }

    fn turn(text: &str) -> Turn {
        Turn::new(
            MessageRecord::request(key("g1"), Some("alice".to_owned()), vec![ContentPart::text(
                text,
            )])
            .with_run_id(RunId::new(text)),
        )
    }

    fn texts(turns: &[Turn]) -> Vec<String> {
        turns.iter().map(|t| t.records()[0].text()).collect()
    }

    async fn seeded(cache: &ConversationCache, id: &str, turns: Vec<Turn>) -> Vec<Turn> {
        cache
            .get_or_load(&key(id), move || async move { Ok(turns) })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn append_evicts_oldest_past_limit() {
        let cache = ConversationCache::new(2, 4);
        seeded(&cache, "g1", Vec::new()).await;
        cache.append(&key("g1"), turn("a"));
        cache.append(&key("g1"), turn("b"));
        cache.append(&key("g1"), turn("c"));
        assert_eq!(cache.len(&key("g1")), 2);
        assert_eq!(cache.len(&key("other")), 0);
    }

    #[tokio::test]
    async fn zero_limit_keeps_nothing() {
        let cache = ConversationCache::new(0, 4);
        seeded(&cache, "g1", vec![turn("a")]).await;
        cache.append(&key("g1"), turn("b"));
        assert_eq!(cache.len(&key("g1")), 0);
    }

    #[test]
    fn append_to_uncached_conversation_is_skipped() {
        let cache = ConversationCache::new(4, 4);
        cache.append(&key("g1"), turn("a"));
        assert_eq!(cache.len(&key("g1")), 0);
    }

    #[tokio::test]
    async fn least_recently_used_conversation_is_dropped_and_reloaded() {
        let cache = ConversationCache::new(4, 2);
        seeded(&cache, "g1", vec![turn("one")]).await;
        seeded(&cache, "g2", vec![turn("two")]).await;
        // Touch g1 so g2 is the oldest.
        seeded(&cache, "g1", Vec::new()).await;
        seeded(&cache, "g3", vec![turn("three")]).await;

        assert_eq!(cache.len(&key("g1")), 1);
        assert_eq!(cache.len(&key("g2")), 0);
        assert_eq!(cache.len(&key("g3")), 1);

        cache.append(&key("g2"), turn("lost"));
        assert_eq!(cache.len(&key("g2")), 0);

        let reloaded = seeded(&cache, "g2", vec![turn("two"), turn("from store")]).await;
        assert_eq!(texts(&reloaded), vec!["two", "from store"]);
        assert_eq!(cache.len(&key("g3")), 1);
        assert_eq!(cache.len(&key("g1")), 0);
    }

    #[tokio::test]
    async fn loader_runs_only_while_empty() {
        let cache = ConversationCache::new(4, 4);
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_or_load(&key("g1"), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![turn("stored")])
            })
            .await
            .unwrap();
        assert_eq!(texts(&first), vec!["stored"]);

        cache.append(&key("g1"), turn("fresh"));
        let second = cache
            .get_or_load(&key("g1"), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![turn("reloaded")])
            })
            .await
            .unwrap();

        assert_eq!(texts(&second), vec!["stored", "fresh"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn seeding_keeps_newest_turns_within_limit() {
        let cache = ConversationCache::new(2, 4);
        let turns = cache
            .get_or_load(&key("g1"), || async {
                Ok(vec![turn("a"), turn("b"), turn("c")])
            })
            .await
            .unwrap();
        assert_eq!(texts(&turns), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn concurrent_seed_wins_over_loaded_turns() {
        let cache = ConversationCache::new(4, 4);
        let turns = cache
            .get_or_load(&key("g1"), || async {
                // Lands while the load is "in flight".
                seeded(&cache, "g1", vec![turn("live")]).await;
                Ok(vec![turn("stale")])
            })
            .await
            .unwrap();
        assert_eq!(texts(&turns), vec!["live"]);
    }

    #[tokio::test]
    async fn load_error_leaves_cache_cold() {
        let cache = ConversationCache::new(4, 4);
        let err = cache
            .get_or_load(&key("g1"), || async {
                Err::<Vec<Turn>, _>(anyhow::anyhow!("db down"))
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("db down"));
        assert_eq!(cache.len(&key("g1")), 0);
    }

    #[tokio::test]
    async fn warm_skips_failures_and_empty_histories() {
        let cache = ConversationCache::new(4, 4);
        let keys = vec![key("ok"), key("empty"), key("broken")];

        let warmed = cache
            .warm(keys, |k| async move {
                match k.id() {
                    "ok" => Ok(vec![turn("hello")]),
                    "empty" => Ok(Vec::new()),
                    _ => anyhow::bail!("boom"),
                }
            })
            .await;

        assert_eq!(warmed, 1);
        assert_eq!(cache.len(&key("ok")), 1);
        assert_eq!(cache.len(&key("broken")), 0);
    }
}
