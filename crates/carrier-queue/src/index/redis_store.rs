//! Redis-backed index store for cross-process coordination.
//!
//! Every multi-step queue operation runs as a server-side Lua script so
//! concurrent workers observe serialized set transitions. Pub/sub
//! messages are bridged into a tokio broadcast channel by a background
//! listener task that reconnects on connection loss.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use carrier_core::{RequestId, StoredRequest};

use crate::{
    circuit::{CircuitSnapshot, CircuitState},
    error::{QueueError, Result},
    limiter::TokenDecision,
};

use super::{
    ms_to_datetime, now_ms, pending_score, IndexStore, QueueCounts, QueueSignal,
    PROMOTED_PRIORITY,
};

const SIGNAL_CAPACITY: usize = 256;
const RATELIMIT_TTL_SECS: i64 = 60;
const CIRCUIT_TTL_SECS: i64 = 300;
const LISTENER_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Server-side scripts for atomic multi-step operations.
mod scripts {
    use redis::Script;

    /// Stores the snapshot, adds the id to pending (removing any stale
    /// dead-letter membership), and returns its rank.
    pub fn enqueue() -> Script {
        Script::new(
            r#"
            redis.call('ZREM', KEYS[2], ARGV[1])
            redis.call('SET', ARGV[3] .. ARGV[1], ARGV[4])
            redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
            return redis.call('ZRANK', KEYS[1], ARGV[1])
            "#,
        )
    }

    /// Pops the lowest-score pending id into processing and returns
    /// `{id, snapshot}`.
    pub fn dequeue() -> Script {
        Script::new(
            r#"
            local popped = redis.call('ZPOPMIN', KEYS[1])
            if #popped == 0 then
                return nil
            end
            local id = popped[1]
            redis.call('ZADD', KEYS[2], ARGV[1], id)
            local snapshot = redis.call('GET', ARGV[2] .. id)
            if not snapshot then
                redis.call('ZREM', KEYS[2], id)
                return nil
            end
            return {id, snapshot}
            "#,
        )
    }

    /// Moves one member from KEYS[1] to KEYS[2] with a new score.
    pub fn move_member() -> Script {
        Script::new(
            r#"
            redis.call('ZREM', KEYS[1], ARGV[1])
            redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
            return 1
            "#,
        )
    }

    /// Moves every member of KEYS[1] with score <= ARGV[1] into KEYS[2]
    /// starting at base score ARGV[2]; returns the moved members.
    pub fn drain_due() -> Script {
        Script::new(
            r#"
            local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
            for i, id in ipairs(due) do
                redis.call('ZREM', KEYS[1], id)
                redis.call('ZADD', KEYS[2], tonumber(ARGV[2]) + i, id)
            end
            return due
            "#,
        )
    }

    /// Removes the id from pending and scheduled; drops the snapshot if
    /// anything was removed. Returns the removal count.
    pub fn cancel() -> Script {
        Script::new(
            r#"
            local removed = redis.call('ZREM', KEYS[1], ARGV[1])
                + redis.call('ZREM', KEYS[2], ARGV[1])
            if removed > 0 then
                redis.call('DEL', ARGV[2] .. ARGV[1])
            end
            return removed
            "#,
        )
    }

    /// Token-bucket refill and consume. Returns `{1, 0}` when a token
    /// was taken, `{0, wait_ms}` otherwise.
    pub fn take_token() -> Script {
        Script::new(
            r#"
            local key = KEYS[1]
            local now_ms = tonumber(ARGV[1])
            local rate = tonumber(ARGV[2])
            local burst = tonumber(ARGV[3])
            local ttl = tonumber(ARGV[4])

            local bucket = redis.call('HMGET', key, 'tokens', 'last_update')
            local tokens = tonumber(bucket[1]) or burst
            local last_update = tonumber(bucket[2]) or now_ms

            local elapsed = math.max(0, now_ms - last_update)
            tokens = math.min(burst, tokens + elapsed * rate / 1000)

            if tokens >= 1 then
                tokens = tokens - 1
                redis.call('HSET', key, 'tokens', tokens, 'last_update', now_ms)
                redis.call('EXPIRE', key, ttl)
                return {1, 0}
            end

            local wait_ms = math.ceil((1 - tokens) / rate * 1000)
            return {0, wait_ms}
            "#,
        )
    }

    /// Compare-and-delete lock release.
    pub fn release_lock() -> Script {
        Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
            "#,
        )
    }
}

/// Redis-backed [`IndexStore`] implementation.
pub struct RedisIndexStore {
    conn: ConnectionManager,
    prefix: String,
    signals: broadcast::Sender<QueueSignal>,
    listener: tokio::task::JoinHandle<()>,
}

impl RedisIndexStore {
    /// Connects to redis and starts the pub/sub listener.
    ///
    /// # Errors
    ///
    /// Returns an index error when the connection cannot be established.
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::index(format!("invalid redis url: {e}")))?;

        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::index(format!("redis connection failed: {e}")))?;

        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        let listener =
            tokio::spawn(run_listener(client, prefix.clone(), signals.clone()));

        Ok(Self { conn, prefix, signals, listener })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.prefix)
    }

    fn snapshot_prefix(&self) -> String {
        self.key("request:")
    }

    async fn publish_new_request(&self, message: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(self.key("channel:new-request"), message).await?;
        Ok(())
    }
}

impl Drop for RedisIndexStore {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait::async_trait]
impl IndexStore for RedisIndexStore {
    async fn enqueue(&self, request: &StoredRequest) -> Result<u64> {
        let snapshot = request.to_snapshot()?;
        let score = pending_score(request.priority, now_ms(Utc::now()));

        let mut conn = self.conn.clone();
        let rank: i64 = scripts::enqueue()
            .key(self.key("queue:pending"))
            .key(self.key("queue:dead"))
            .arg(request.id.as_str())
            .arg(score)
            .arg(self.snapshot_prefix())
            .arg(snapshot)
            .invoke_async(&mut conn)
            .await?;

        self.publish_new_request(request.id.as_str()).await?;

        Ok(u64::try_from(rank).unwrap_or(0))
    }

    async fn enqueue_batch(&self, requests: &[StoredRequest]) -> Result<()> {
        let mut conn = self.conn.clone();
        let now = now_ms(Utc::now());

        for request in requests {
            let snapshot = request.to_snapshot()?;
            let score = pending_score(request.priority, now);
            let _: i64 = scripts::enqueue()
                .key(self.key("queue:pending"))
                .key(self.key("queue:dead"))
                .arg(request.id.as_str())
                .arg(score)
                .arg(self.snapshot_prefix())
                .arg(snapshot)
                .invoke_async(&mut conn)
                .await?;
        }

        self.publish_new_request(&format!("batch:{}", requests.len())).await?;

        Ok(())
    }

    async fn enqueue_scheduled(&self, request: &StoredRequest, at: DateTime<Utc>) -> Result<()> {
        let snapshot = request.to_snapshot()?;

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .set(format!("{}{}", self.snapshot_prefix(), request.id), snapshot)
            .zadd(self.key("queue:scheduled"), request.id.as_str(), now_ms(at))
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<StoredRequest>> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = scripts::dequeue()
            .key(self.key("queue:pending"))
            .key(self.key("queue:processing"))
            .arg(now_ms(Utc::now()))
            .arg(self.snapshot_prefix())
            .invoke_async(&mut conn)
            .await?;

        match popped {
            Some((id, snapshot)) => {
                debug!(request_id = %id, "claimed request from pending queue");
                Ok(Some(StoredRequest::from_snapshot(&snapshot)?))
            },
            None => Ok(None),
        }
    }

    async fn schedule_retry(&self, request_id: &RequestId, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = scripts::move_member()
            .key(self.key("queue:processing"))
            .key(self.key("queue:scheduled"))
            .arg(request_id.as_str())
            .arg(now_ms(at))
            .invoke_async(&mut conn)
            .await?;

        let payload = serde_json::json!({
            "requestId": request_id.as_str(),
            "retryAt": at.to_rfc3339(),
        });
        let _: i64 = conn.publish(self.key("channel:retry"), payload.to_string()).await?;

        Ok(())
    }

    async fn promote_scheduled(&self) -> Result<Vec<RequestId>> {
        let now = now_ms(Utc::now());
        let base_score = pending_score(PROMOTED_PRIORITY, now);

        let mut conn = self.conn.clone();
        let promoted: Vec<String> = scripts::drain_due()
            .key(self.key("queue:scheduled"))
            .key(self.key("queue:pending"))
            .arg(now)
            .arg(base_score)
            .invoke_async(&mut conn)
            .await?;

        if !promoted.is_empty() {
            self.publish_new_request(&format!("promoted:{}", promoted.len())).await?;
        }

        Ok(promoted.into_iter().map(RequestId::from).collect())
    }

    async fn mark_complete(&self, request_id: &RequestId) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .zrem(self.key("queue:processing"), request_id.as_str())
            .del(format!("{}{request_id}", self.snapshot_prefix()))
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn move_to_dead(&self, request_id: &RequestId) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = scripts::move_member()
            .key(self.key("queue:processing"))
            .key(self.key("queue:dead"))
            .arg(request_id.as_str())
            .arg(now_ms(Utc::now()))
            .invoke_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn cancel(&self, request_id: &RequestId) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = scripts::cancel()
            .key(self.key("queue:pending"))
            .key(self.key("queue:scheduled"))
            .arg(request_id.as_str())
            .arg(self.snapshot_prefix())
            .invoke_async(&mut conn)
            .await?;

        Ok(removed > 0)
    }

    async fn reclaim_processing(&self, older_than: Duration) -> Result<Vec<RequestId>> {
        let now = now_ms(Utc::now());
        let cutoff = now - i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
        let base_score = pending_score(PROMOTED_PRIORITY, now);

        let mut conn = self.conn.clone();
        let reclaimed: Vec<String> = scripts::drain_due()
            .key(self.key("queue:processing"))
            .key(self.key("queue:pending"))
            .arg(cutoff)
            .arg(base_score)
            .invoke_async(&mut conn)
            .await?;

        if !reclaimed.is_empty() {
            warn!(count = reclaimed.len(), "reclaimed orphaned processing entries");
            self.publish_new_request(&format!("promoted:{}", reclaimed.len())).await?;
        }

        Ok(reclaimed.into_iter().map(RequestId::from).collect())
    }

    async fn take_token(
        &self,
        scope: &str,
        rate_per_sec: f64,
        burst: f64,
    ) -> Result<TokenDecision> {
        let mut conn = self.conn.clone();
        let (allowed, wait_ms): (i64, i64) = scripts::take_token()
            .key(self.key(&format!("ratelimit:{scope}")))
            .arg(now_ms(Utc::now()))
            .arg(rate_per_sec)
            .arg(burst)
            .arg(RATELIMIT_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;

        if allowed == 1 {
            Ok(TokenDecision::allowed())
        } else {
            Ok(TokenDecision::denied(Duration::from_millis(u64::try_from(wait_ms).unwrap_or(0))))
        }
    }

    async fn circuit_get(&self, host: &str) -> Result<Option<CircuitSnapshot>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            conn.hgetall(self.key(&format!("cb:{host}"))).await?;

        if fields.is_empty() {
            return Ok(None);
        }

        let state = fields
            .get("state")
            .map(String::as_str)
            .unwrap_or("closed")
            .parse::<CircuitState>()
            .map_err(QueueError::index)?;
        let failures = fields.get("failures").and_then(|v| v.parse().ok()).unwrap_or(0);
        let successes = fields.get("successes").and_then(|v| v.parse().ok()).unwrap_or(0);
        let state_changed_at = fields
            .get("state_changed_at")
            .and_then(|v| v.parse::<i64>().ok())
            .map_or_else(Utc::now, ms_to_datetime);

        Ok(Some(CircuitSnapshot { state, failures, successes, state_changed_at }))
    }

    async fn circuit_put(&self, host: &str, snapshot: &CircuitSnapshot) -> Result<()> {
        let key = self.key(&format!("cb:{host}"));

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .hset(&key, "state", snapshot.state.to_string())
            .hset(&key, "failures", snapshot.failures)
            .hset(&key, "successes", snapshot.successes)
            .hset(&key, "state_changed_at", now_ms(snapshot.state_changed_at))
            .expire(&key, CIRCUIT_TTL_SECS)
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn acquire_lock(&self, resource: &str, ttl: Duration) -> Result<Option<String>> {
        let token = Uuid::new_v4().to_string();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);

        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.key(&format!("lock:{resource}")))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        Ok(acquired.map(|_| token))
    }

    async fn release_lock(&self, resource: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let released: i64 = scripts::release_lock()
            .key(self.key(&format!("lock:{resource}")))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;

        Ok(released > 0)
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let mut conn = self.conn.clone();
        let (pending, scheduled, processing, dead): (u64, u64, u64, u64) = redis::pipe()
            .zcard(self.key("queue:pending"))
            .zcard(self.key("queue:scheduled"))
            .zcard(self.key("queue:processing"))
            .zcard(self.key("queue:dead"))
            .query_async(&mut conn)
            .await?;

        Ok(QueueCounts { pending, scheduled, processing, dead })
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueSignal> {
        self.signals.subscribe()
    }
}

/// Bridges redis pub/sub messages into the broadcast channel, retrying
/// the subscription whenever the connection drops.
async fn run_listener(
    client: redis::Client,
    prefix: String,
    signals: broadcast::Sender<QueueSignal>,
) {
    let new_request_channel = format!("{prefix}channel:new-request");
    let retry_channel = format!("{prefix}channel:retry");

    loop {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(error) => {
                warn!(error = %error, "index pub/sub connection failed, retrying");
                tokio::time::sleep(LISTENER_RECONNECT_DELAY).await;
                continue;
            },
        };

        if let Err(error) =
            pubsub.subscribe(&[new_request_channel.as_str(), retry_channel.as_str()]).await
        {
            warn!(error = %error, "index pub/sub subscribe failed, retrying");
            tokio::time::sleep(LISTENER_RECONNECT_DELAY).await;
            continue;
        }

        let mut messages = pubsub.on_message();
        while let Some(message) = messages.next().await {
            let channel = message.get_channel_name().to_string();
            let payload: String = message.get_payload().unwrap_or_default();

            let signal = if channel == new_request_channel {
                QueueSignal::NewRequest(payload)
            } else {
                match parse_retry_payload(&payload) {
                    Some(signal) => signal,
                    None => continue,
                }
            };

            // Send failure means no subscribed workers; nothing to do.
            let _ = signals.send(signal);
        }

        warn!("index pub/sub stream ended, reconnecting");
        tokio::time::sleep(LISTENER_RECONNECT_DELAY).await;
    }
}

fn parse_retry_payload(payload: &str) -> Option<QueueSignal> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    let request_id = value.get("requestId")?.as_str()?.to_string();
    let retry_at = value
        .get("retryAt")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map_or_else(Utc::now, |dt| dt.with_timezone(&Utc));

    Some(QueueSignal::Retry { request_id: RequestId(request_id), retry_at })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_payload_round_trip() {
        let payload = r#"{"requestId":"req-7","retryAt":"2026-08-02T10:00:00Z"}"#;
        match parse_retry_payload(payload) {
            Some(QueueSignal::Retry { request_id, retry_at }) => {
                assert_eq!(request_id.as_str(), "req-7");
                assert_eq!(retry_at.to_rfc3339(), "2026-08-02T10:00:00+00:00");
            },
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn malformed_retry_payload_is_ignored() {
        assert!(parse_retry_payload("not json").is_none());
        assert!(parse_retry_payload("{}").is_none());
    }

    #[test]
    fn pending_score_orders_priority_before_time() {
        let high = pending_score(90, 2_000);
        let low = pending_score(10, 1_000);
        assert!(high < low, "higher priority must sort first even when enqueued later");

        let first = pending_score(50, 1_000);
        let second = pending_score(50, 2_000);
        assert!(first < second, "equal priorities sort by admission time");
    }
}
