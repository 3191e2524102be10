//! In-memory index store.
//!
//! Mirrors the redis implementation's semantics with plain data
//! structures behind one mutex, so every multi-step operation is a
//! single critical section. Used by the test suites and by single-process
//! deployments that do not need cross-process coordination.

use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use carrier_core::{RequestId, StoredRequest};

use crate::{
    circuit::CircuitSnapshot,
    error::Result,
    limiter::TokenDecision,
};

use super::{now_ms, pending_score, IndexStore, QueueCounts, QueueSignal, PROMOTED_PRIORITY};

const SIGNAL_CAPACITY: usize = 256;

/// Score-ordered set with stable FIFO ordering for equal scores.
#[derive(Debug, Default)]
struct ScoredSet {
    by_score: BTreeMap<(i64, u64), String>,
    positions: HashMap<String, (i64, u64)>,
}

impl ScoredSet {
    fn insert(&mut self, member: String, score: i64, seq: u64) {
        if let Some(old) = self.positions.remove(&member) {
            self.by_score.remove(&old);
        }
        self.by_score.insert((score, seq), member.clone());
        self.positions.insert(member, (score, seq));
    }

    fn remove(&mut self, member: &str) -> bool {
        if let Some(key) = self.positions.remove(member) {
            self.by_score.remove(&key);
            true
        } else {
            false
        }
    }

    fn pop_first(&mut self) -> Option<String> {
        let (key, member) = {
            let (key, member) = self.by_score.iter().next()?;
            (*key, member.clone())
        };
        self.by_score.remove(&key);
        self.positions.remove(&member);
        Some(member)
    }

    /// Removes and returns every member with score <= `max_score`.
    fn take_up_to(&mut self, max_score: i64) -> Vec<String> {
        let mut taken = Vec::new();
        loop {
            let (key, member) = match self.by_score.iter().next() {
                Some((&key, member)) if key.0 <= max_score => (key, member.clone()),
                _ => break,
            };
            self.by_score.remove(&key);
            self.positions.remove(&member);
            taken.push(member);
        }
        taken
    }

    fn rank(&self, member: &str) -> Option<u64> {
        let target = self.positions.get(member)?;
        Some(self.by_score.range(..target).count() as u64)
    }

    fn len(&self) -> u64 {
        self.by_score.len() as u64
    }

    fn contains(&self, member: &str) -> bool {
        self.positions.contains_key(member)
    }
}

#[derive(Debug, Default)]
struct Bucket {
    tokens: f64,
    last_update_ms: i64,
}

#[derive(Debug)]
struct Lock {
    token: String,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    pending: ScoredSet,
    scheduled: ScoredSet,
    processing: ScoredSet,
    dead: ScoredSet,
    snapshots: HashMap<String, String>,
    buckets: HashMap<String, Bucket>,
    circuits: HashMap<String, CircuitSnapshot>,
    locks: HashMap<String, Lock>,
    seq: u64,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// In-memory [`IndexStore`] implementation.
pub struct MemoryIndexStore {
    state: Mutex<State>,
    signals: broadcast::Sender<QueueSignal>,
}

impl Default for MemoryIndexStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIndexStore {
    /// Creates an empty in-memory index.
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self { state: Mutex::new(State::default()), signals }
    }

    fn publish(&self, signal: QueueSignal) {
        // No receivers is fine; workers may not have subscribed yet.
        let _ = self.signals.send(signal);
    }

    /// Whether an id currently sits in the processing set. Test helper.
    pub async fn is_processing(&self, request_id: &RequestId) -> bool {
        self.state.lock().await.processing.contains(request_id.as_str())
    }

    /// Whether an id currently sits in any queue set. Test helper.
    pub async fn is_tracked(&self, request_id: &RequestId) -> bool {
        let state = self.state.lock().await;
        let id = request_id.as_str();
        state.pending.contains(id)
            || state.scheduled.contains(id)
            || state.processing.contains(id)
            || state.dead.contains(id)
    }
}

#[async_trait::async_trait]
impl IndexStore for MemoryIndexStore {
    async fn enqueue(&self, request: &StoredRequest) -> Result<u64> {
        let snapshot = request.to_snapshot()?;
        let id = request.id.as_str().to_string();
        let score = pending_score(request.priority, now_ms(Utc::now()));

        let position = {
            let mut state = self.state.lock().await;
            let seq = state.next_seq();
            // A revived dead-letter entry leaves the dead set here, so an
            // id is never a member of two queue sets at once.
            state.dead.remove(&id);
            state.snapshots.insert(id.clone(), snapshot);
            state.pending.insert(id.clone(), score, seq);
            state.pending.rank(&id).unwrap_or(0)
        };

        self.publish(QueueSignal::NewRequest(id));
        Ok(position)
    }

    async fn enqueue_batch(&self, requests: &[StoredRequest]) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let now = now_ms(Utc::now());
            for request in requests {
                let snapshot = request.to_snapshot()?;
                let id = request.id.as_str().to_string();
                let score = pending_score(request.priority, now);
                let seq = state.next_seq();
                state.dead.remove(&id);
                state.snapshots.insert(id.clone(), snapshot);
                state.pending.insert(id, score, seq);
            }
        }

        self.publish(QueueSignal::NewRequest(format!("batch:{}", requests.len())));
        Ok(())
    }

    async fn enqueue_scheduled(&self, request: &StoredRequest, at: DateTime<Utc>) -> Result<()> {
        let snapshot = request.to_snapshot()?;
        let id = request.id.as_str().to_string();

        let mut state = self.state.lock().await;
        let seq = state.next_seq();
        state.snapshots.insert(id.clone(), snapshot);
        state.scheduled.insert(id, now_ms(at), seq);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<StoredRequest>> {
        let mut state = self.state.lock().await;

        let Some(id) = state.pending.pop_first() else {
            return Ok(None);
        };

        let seq = state.next_seq();
        state.processing.insert(id.clone(), now_ms(Utc::now()), seq);

        match state.snapshots.get(&id).cloned() {
            Some(snapshot) => Ok(Some(StoredRequest::from_snapshot(&snapshot)?)),
            None => {
                // Snapshot lost; drop the claim so the id is not orphaned.
                state.processing.remove(&id);
                Ok(None)
            },
        }
    }

    async fn schedule_retry(&self, request_id: &RequestId, at: DateTime<Utc>) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let id = request_id.as_str().to_string();
            state.processing.remove(&id);
            let seq = state.next_seq();
            state.scheduled.insert(id, now_ms(at), seq);
        }

        self.publish(QueueSignal::Retry { request_id: request_id.clone(), retry_at: at });
        Ok(())
    }

    async fn promote_scheduled(&self) -> Result<Vec<RequestId>> {
        let now = now_ms(Utc::now());
        let promoted: Vec<String> = {
            let mut state = self.state.lock().await;
            let due = state.scheduled.take_up_to(now);
            for id in &due {
                let seq = state.next_seq();
                state.pending.insert(id.clone(), pending_score(PROMOTED_PRIORITY, now), seq);
            }
            due
        };

        if !promoted.is_empty() {
            self.publish(QueueSignal::NewRequest(format!("promoted:{}", promoted.len())));
        }

        Ok(promoted.into_iter().map(RequestId::from).collect())
    }

    async fn mark_complete(&self, request_id: &RequestId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.processing.remove(request_id.as_str());
        state.snapshots.remove(request_id.as_str());
        Ok(())
    }

    async fn move_to_dead(&self, request_id: &RequestId) -> Result<()> {
        let mut state = self.state.lock().await;
        let id = request_id.as_str().to_string();
        state.processing.remove(&id);
        let seq = state.next_seq();
        state.dead.insert(id, now_ms(Utc::now()), seq);
        Ok(())
    }

    async fn cancel(&self, request_id: &RequestId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let id = request_id.as_str();
        let removed = state.pending.remove(id) | state.scheduled.remove(id);
        if removed {
            state.snapshots.remove(id);
        }
        Ok(removed)
    }

    async fn reclaim_processing(&self, older_than: Duration) -> Result<Vec<RequestId>> {
        let now = now_ms(Utc::now());
        let cutoff = now - i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);

        let reclaimed: Vec<String> = {
            let mut state = self.state.lock().await;
            let stale = state.processing.take_up_to(cutoff);
            for id in &stale {
                let seq = state.next_seq();
                state.pending.insert(id.clone(), pending_score(PROMOTED_PRIORITY, now), seq);
            }
            stale
        };

        if !reclaimed.is_empty() {
            self.publish(QueueSignal::NewRequest(format!("promoted:{}", reclaimed.len())));
        }

        Ok(reclaimed.into_iter().map(RequestId::from).collect())
    }

    async fn take_token(
        &self,
        scope: &str,
        rate_per_sec: f64,
        burst: f64,
    ) -> Result<TokenDecision> {
        let now = now_ms(Utc::now());
        let mut state = self.state.lock().await;
        let bucket = state
            .buckets
            .entry(scope.to_string())
            .or_insert_with(|| Bucket { tokens: burst, last_update_ms: now });

        #[allow(clippy::cast_precision_loss)]
        let elapsed = (now - bucket.last_update_ms).max(0) as f64;
        let tokens = burst.min(bucket.tokens + elapsed * rate_per_sec / 1000.0);

        if tokens >= 1.0 {
            bucket.tokens = tokens - 1.0;
            bucket.last_update_ms = now;
            Ok(TokenDecision::allowed())
        } else {
            // Denied: the bucket is left untouched so the refill is not
            // double counted on the next call.
            let wait_ms = ((1.0 - tokens) / rate_per_sec * 1000.0).ceil();
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            Ok(TokenDecision::denied(Duration::from_millis(wait_ms as u64)))
        }
    }

    async fn circuit_get(&self, host: &str) -> Result<Option<CircuitSnapshot>> {
        Ok(self.state.lock().await.circuits.get(host).cloned())
    }

    async fn circuit_put(&self, host: &str, snapshot: &CircuitSnapshot) -> Result<()> {
        self.state.lock().await.circuits.insert(host.to_string(), snapshot.clone());
        Ok(())
    }

    async fn acquire_lock(&self, resource: &str, ttl: Duration) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if let Some(existing) = state.locks.get(resource) {
            if existing.expires_at > now {
                return Ok(None);
            }
        }

        let token = Uuid::new_v4().to_string();
        state
            .locks
            .insert(resource.to_string(), Lock { token: token.clone(), expires_at: now + ttl });
        Ok(Some(token))
    }

    async fn release_lock(&self, resource: &str, token: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.locks.get(resource).is_some_and(|lock| lock.token == token) {
            state.locks.remove(resource);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let state = self.state.lock().await;
        Ok(QueueCounts {
            pending: state.pending.len(),
            scheduled: state.scheduled.len(),
            processing: state.processing.len(),
            dead: state.dead.len(),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueSignal> {
        self.signals.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use carrier_core::NewRequest;

    use super::*;

    fn request_with_priority(id: &str, priority: i32) -> StoredRequest {
        let input = NewRequest {
            id: Some(id.to_string()),
            priority: Some(priority),
            ..NewRequest::to_url("https://example.com/hook")
        };
        StoredRequest::from_new(input, Utc::now())
    }

    #[tokio::test]
    async fn dequeue_respects_priority_order() {
        let index = MemoryIndexStore::new();

        index.enqueue(&request_with_priority("low", 10)).await.unwrap();
        index.enqueue(&request_with_priority("mid", 50)).await.unwrap();
        index.enqueue(&request_with_priority("high", 90)).await.unwrap();

        let order: Vec<String> = [
            index.dequeue().await.unwrap().unwrap(),
            index.dequeue().await.unwrap().unwrap(),
            index.dequeue().await.unwrap().unwrap(),
        ]
        .into_iter()
        .map(|r| r.id.0)
        .collect();

        assert_eq!(order, vec!["high", "mid", "low"]);
        assert!(index.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn equal_priorities_dequeue_fifo() {
        let index = MemoryIndexStore::new();

        for name in ["first", "second", "third"] {
            index.enqueue(&request_with_priority(name, 50)).await.unwrap();
        }

        assert_eq!(index.dequeue().await.unwrap().unwrap().id.0, "first");
        assert_eq!(index.dequeue().await.unwrap().unwrap().id.0, "second");
        assert_eq!(index.dequeue().await.unwrap().unwrap().id.0, "third");
    }

    #[tokio::test]
    async fn dequeue_moves_id_to_processing() {
        let index = MemoryIndexStore::new();
        index.enqueue(&request_with_priority("req", 50)).await.unwrap();

        let request = index.dequeue().await.unwrap().unwrap();
        assert!(index.is_processing(&request.id).await);

        let counts = index.counts().await.unwrap();
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.processing, 1);
    }

    #[tokio::test]
    async fn promote_moves_due_scheduled_requests() {
        let index = MemoryIndexStore::new();
        let due = request_with_priority("due", 50);
        let future = request_with_priority("future", 50);

        index.enqueue_scheduled(&due, Utc::now() - chrono::Duration::seconds(1)).await.unwrap();
        index
            .enqueue_scheduled(&future, Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();

        let promoted = index.promote_scheduled().await.unwrap();
        assert_eq!(promoted, vec![RequestId::from("due")]);

        // Re-running is a no-op.
        assert!(index.promote_scheduled().await.unwrap().is_empty());

        let counts = index.counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.scheduled, 1);
    }

    #[tokio::test]
    async fn cancel_removes_pending_and_scheduled_only() {
        let index = MemoryIndexStore::new();
        index.enqueue(&request_with_priority("queued", 50)).await.unwrap();

        assert!(index.cancel(&RequestId::from("queued")).await.unwrap());
        assert!(!index.cancel(&RequestId::from("queued")).await.unwrap());

        index.enqueue(&request_with_priority("running", 50)).await.unwrap();
        let running = index.dequeue().await.unwrap().unwrap();
        assert!(!index.cancel(&running.id).await.unwrap(), "processing ids are not cancelled");
    }

    #[tokio::test]
    async fn schedule_retry_moves_processing_to_scheduled() {
        let index = MemoryIndexStore::new();
        index.enqueue(&request_with_priority("req", 50)).await.unwrap();
        let request = index.dequeue().await.unwrap().unwrap();

        index
            .schedule_retry(&request.id, Utc::now() + chrono::Duration::seconds(5))
            .await
            .unwrap();

        let counts = index.counts().await.unwrap();
        assert_eq!(counts.processing, 0);
        assert_eq!(counts.scheduled, 1);
    }

    #[tokio::test]
    async fn move_to_dead_tracks_dead_set() {
        let index = MemoryIndexStore::new();
        index.enqueue(&request_with_priority("req", 50)).await.unwrap();
        let request = index.dequeue().await.unwrap().unwrap();

        index.move_to_dead(&request.id).await.unwrap();

        let counts = index.counts().await.unwrap();
        assert_eq!(counts.processing, 0);
        assert_eq!(counts.dead, 1);
    }

    #[tokio::test]
    async fn reclaim_returns_stale_processing_entries() {
        let index = MemoryIndexStore::new();
        index.enqueue(&request_with_priority("orphan", 50)).await.unwrap();
        let request = index.dequeue().await.unwrap().unwrap();

        // Zero threshold treats every processing entry as stale.
        let reclaimed = index.reclaim_processing(Duration::ZERO).await.unwrap();
        assert_eq!(reclaimed, vec![request.id.clone()]);

        let counts = index.counts().await.unwrap();
        assert_eq!(counts.processing, 0);
        assert_eq!(counts.pending, 1);
    }

    #[tokio::test]
    async fn lock_round_trip() {
        let index = MemoryIndexStore::new();

        let token = index
            .acquire_lock("cleanup", Duration::from_secs(5))
            .await
            .unwrap()
            .expect("lock should be free");
        assert!(index.acquire_lock("cleanup", Duration::from_secs(5)).await.unwrap().is_none());

        assert!(!index.release_lock("cleanup", "wrong-token").await.unwrap());
        assert!(index.release_lock("cleanup", &token).await.unwrap());
        assert!(index.acquire_lock("cleanup", Duration::from_secs(5)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn enqueue_signals_subscribers() {
        let index = MemoryIndexStore::new();
        let mut signals = index.subscribe();

        index.enqueue(&request_with_priority("req", 50)).await.unwrap();

        match signals.recv().await.unwrap() {
            QueueSignal::NewRequest(message) => assert_eq!(message, "req"),
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[tokio::test]
    async fn token_bucket_denies_after_burst() {
        let index = MemoryIndexStore::new();

        for _ in 0..5 {
            let decision = index.take_token("global", 10.0, 5.0).await.unwrap();
            assert!(decision.allowed);
        }

        let denied = index.take_token("global", 10.0, 5.0).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after >= Duration::from_millis(50));
    }
}
