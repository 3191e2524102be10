//! Dispatch worker: claims, executes, classifies, and transitions.
//!
//! A worker wakes on index notifications and a periodic promotion tick,
//! drains the priority queue, and launches each claimed request as an
//! independent task tracked in its in-flight set. Execution is gated by
//! the backpressure controller; outcomes drive the durable and index
//! state machines plus event dispatch.
//!
//! Store failures mid-attempt requeue the request with a short backoff
//! instead of dead-lettering it: the fault is the engine's, not the
//! request's.

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use tokio::sync::{broadcast::error::RecvError, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use carrier_core::{
    events::{RequestCompleted, RequestDead, RequestFailed, RequestRetrying},
    AttemptOutcome, Clock, QueueEvent, RequestId, ResponseSummary, StoredRequest, SubscriberSet,
};

use crate::{
    backpressure::BackpressureController,
    client::{extract_retry_after, DispatchClient, DispatchResponse},
    config::QueueConfig,
    error::Result,
    index::{IndexStore, QueueSignal},
    retry::{delay_for, should_retry},
    storage::QueueStorage,
};

/// How often the in-flight set is polled during shutdown.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Maximum time to wait for in-flight requests when stopping.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Extracts the `host[:port]` component used for per-host gating.
pub(crate) fn host_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Individual dispatch worker.
#[derive(Clone)]
pub struct Worker {
    id: usize,
    index: Arc<dyn IndexStore>,
    storage: Arc<dyn QueueStorage>,
    client: Arc<DispatchClient>,
    backpressure: Arc<BackpressureController>,
    subscribers: Arc<SubscriberSet>,
    config: QueueConfig,
    in_flight: Arc<Mutex<HashSet<RequestId>>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl Worker {
    /// Creates a new dispatch worker.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        index: Arc<dyn IndexStore>,
        storage: Arc<dyn QueueStorage>,
        client: Arc<DispatchClient>,
        backpressure: Arc<BackpressureController>,
        subscribers: Arc<SubscriberSet>,
        config: QueueConfig,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            id,
            index,
            storage,
            client,
            backpressure,
            subscribers,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            cancellation_token,
            clock,
        }
    }

    /// Main worker loop: wakes on queue signals and the promotion tick,
    /// drains until cancelled, then waits for in-flight requests.
    ///
    /// # Errors
    ///
    /// Returns error only if setup fails; per-request errors are logged
    /// and drive requeue/dead-letter transitions instead.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "dispatch worker starting");

        let mut signals = self.index.subscribe();
        let mut ticker = tokio::time::interval(self.config.promotion_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        self.drain().await;

        loop {
            tokio::select! {
                () = self.cancellation_token.cancelled() => {
                    info!(worker_id = self.id, "dispatch worker received shutdown signal");
                    break;
                }
                signal = signals.recv() => match signal {
                    Ok(QueueSignal::NewRequest(_)) => self.drain().await,
                    Ok(QueueSignal::Retry { .. }) => self.promote_due().await,
                    Err(RecvError::Lagged(skipped)) => {
                        // Missed notifications collapse into one drain.
                        debug!(worker_id = self.id, skipped, "signal channel lagged");
                        self.drain().await;
                    },
                    Err(RecvError::Closed) => {
                        warn!(worker_id = self.id, "signal channel closed, stopping worker");
                        break;
                    },
                },
                _ = ticker.tick() => self.promote_due().await,
            }
        }

        self.await_in_flight().await;
        info!(worker_id = self.id, "dispatch worker stopped");
        Ok(())
    }

    /// Promotes due scheduled requests and drains if anything moved.
    async fn promote_due(&self) {
        match self.index.promote_scheduled().await {
            Ok(promoted) if !promoted.is_empty() => {
                debug!(worker_id = self.id, count = promoted.len(), "promoted scheduled requests");
                self.drain().await;
            },
            Ok(_) => {},
            Err(e) => warn!(worker_id = self.id, error = %e, "scheduled promotion failed"),
        }
    }

    /// Drains the priority queue until empty, stopped, or the in-flight
    /// set is at capacity.
    async fn drain(&self) {
        loop {
            if self.cancellation_token.is_cancelled() {
                return;
            }

            match self.process_next().await {
                Ok(true) => {},
                Ok(false) => return,
                Err(e) => {
                    error!(worker_id = self.id, error = %e, "dequeue failed");
                    return;
                },
            }
        }
    }

    /// Claims one request and launches its processing task. Returns
    /// false when nothing was claimed.
    async fn process_next(&self) -> Result<bool> {
        {
            let in_flight = self.in_flight.lock().await;
            if in_flight.len() >= self.config.max_concurrency {
                return Ok(false);
            }
        }

        let Some(request) = self.index.dequeue().await? else {
            return Ok(false);
        };

        let request_id = request.id.clone();
        self.in_flight.lock().await.insert(request_id.clone());

        let worker = self.clone();
        tokio::spawn(async move {
            worker.process_request(request).await;
            worker.in_flight.lock().await.remove(&request_id);
        });

        Ok(true)
    }

    /// Full processing pipeline for one claimed request.
    async fn process_request(&self, request: StoredRequest) {
        let request_id = request.id.clone();
        let host = match host_of(&request.url) {
            Some(host) => host,
            None => {
                // Admission validation makes this unreachable; dead-letter
                // defensively instead of spinning on an unparseable URL.
                error!(request_id = %request_id, url = %request.url, "unparseable request URL");
                self.give_up(&request, 0, None, "invalid URL".to_string()).await;
                return;
            },
        };

        // The durable row is authoritative for the attempt counter; the
        // index snapshot may predate earlier attempts.
        let durable_attempts = match self.storage.get_request(request_id.clone()).await {
            Ok(Some(row)) => row.attempts,
            Ok(None) => request.attempts,
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "attempt count lookup failed");
                self.requeue_after_fault(&request_id).await;
                return;
            },
        };
        let current_attempt = durable_attempts + 1;

        match self.backpressure.wait_for_slot(&host, self.config.slot_wait).await {
            Ok(true) => {},
            Ok(false) => {
                debug!(request_id = %request_id, host, "no dispatch capacity, requeueing");
                let retry_at = Utc::now()
                    + chrono::Duration::from_std(self.config.busy_requeue_delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(5));
                if let Err(e) = self.index.schedule_retry(&request_id, retry_at).await {
                    error!(request_id = %request_id, error = %e, "busy requeue failed");
                }
                return;
            },
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "admission check failed");
                self.requeue_after_fault(&request_id).await;
                return;
            },
        }

        self.backpressure.acquire(&host).await;
        let outcome = self.execute_attempt(&request, &host, current_attempt).await;
        self.backpressure.release(&host).await;

        if let Err(e) = outcome {
            if e.is_engine_fault() {
                warn!(request_id = %request_id, error = %e, "store failure mid-attempt");
                self.requeue_after_fault(&request_id).await;
            } else {
                error!(request_id = %request_id, error = %e, "attempt processing failed");
            }
        }
    }

    /// Executes one attempt: durable claim, HTTP call, attempt log, and
    /// the outcome transition.
    async fn execute_attempt(
        &self,
        request: &StoredRequest,
        host: &str,
        current_attempt: i32,
    ) -> Result<()> {
        let request_id = request.id.clone();

        self.storage.mark_processing(request_id.clone(), current_attempt, Utc::now()).await?;

        let started = Instant::now();
        match self.client.execute(request, u32::try_from(current_attempt).unwrap_or(1)).await {
            Ok(response) => {
                self.log_attempt(
                    &request_id,
                    current_attempt,
                    AttemptOutcome {
                        status_code: Some(response.status_code),
                        duration_ms: duration_ms(response.duration),
                        error: None,
                        response_headers: Some(response.headers.clone()),
                    },
                )
                .await;

                if response.is_success {
                    self.handle_success(request, host, current_attempt, &response).await?;
                } else {
                    let error_text = format!("HTTP {}", response.status_code);
                    self.handle_failure(
                        request,
                        host,
                        current_attempt,
                        Some(response.status_code),
                        error_text,
                        Some(&response.headers),
                    )
                    .await?;
                    self.record_circuit_response(host, response.status_code).await;
                }
            },
            Err(transport_error) => {
                let error_text = transport_error.to_string();
                self.log_attempt(
                    &request_id,
                    current_attempt,
                    AttemptOutcome {
                        status_code: None,
                        duration_ms: duration_ms(started.elapsed()),
                        error: Some(error_text.clone()),
                        response_headers: None,
                    },
                )
                .await;

                self.handle_failure(request, host, current_attempt, None, error_text, None)
                    .await?;

                if let Err(e) = self.backpressure.record_failure(host).await {
                    warn!(host, error = %e, "circuit failure record failed");
                }
            },
        }

        Ok(())
    }

    /// Success path: durable completion (gated against cancel races),
    /// index release, event dispatch, circuit success.
    async fn handle_success(
        &self,
        request: &StoredRequest,
        host: &str,
        current_attempt: i32,
        response: &DispatchResponse,
    ) -> Result<()> {
        let request_id = request.id.clone();
        let summary = ResponseSummary {
            status_code: response.status_code,
            headers: response.headers.clone(),
            body: (!response.body.is_empty()).then(|| response.body.clone()),
            duration_ms: duration_ms(response.duration),
        };

        let transitioned = self.storage.mark_completed(request_id.clone(), summary).await?;
        self.index.mark_complete(&request_id).await?;

        if transitioned {
            info!(
                worker_id = self.id,
                request_id = %request_id,
                status = response.status_code,
                duration_ms = response.duration.as_millis(),
                "request completed"
            );

            self.subscribers
                .dispatch(QueueEvent::Completed(RequestCompleted {
                    request_id: request_id.clone(),
                    status_code: response.status_code,
                    attempt_number: u32::try_from(current_attempt).unwrap_or(1),
                    duration_ms: duration_ms(response.duration),
                    completed_at: Utc::now(),
                }))
                .await;
        } else {
            // Cancelled while in flight; the terminal row wins.
            debug!(request_id = %request_id, "late success ignored, request no longer processing");
        }

        if let Err(e) = self.backpressure.record_success(host).await {
            warn!(host, error = %e, "circuit success record failed");
        }

        Ok(())
    }

    /// Failure path: consult the retry policy, then either schedule the
    /// retry or move the request to the dead-letter set.
    async fn handle_failure(
        &self,
        request: &StoredRequest,
        _host: &str,
        current_attempt: i32,
        status_code: Option<u16>,
        error_text: String,
        response_headers: Option<&std::collections::HashMap<String, String>>,
    ) -> Result<()> {
        let request_id = request.id.clone();
        let attempt = u32::try_from(current_attempt).unwrap_or(1);

        let retry_cfg =
            self.config.retry.with_max_retries(u32::try_from(request.max_retries).unwrap_or(0));
        // The budget covers retries beyond the initial attempt: a request
        // with max_retries = N may run N + 1 attempts in total.
        let retries_used = attempt.saturating_sub(1);
        let will_retry = should_retry(status_code, Some(&error_text), retries_used, &retry_cfg);

        if will_retry {
            let mut delay = delay_for(attempt, &retry_cfg)?;

            // A server-provided Retry-After pushes the retry later, never
            // earlier.
            if let Some(headers) = response_headers {
                if let Some(retry_after) = extract_retry_after(headers) {
                    delay = delay.max(retry_after);
                }
            }

            let next_retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(5));

            self.storage
                .mark_retrying(request_id.clone(), next_retry_at, error_text.clone())
                .await?;
            self.index.schedule_retry(&request_id, next_retry_at).await?;

            warn!(
                worker_id = self.id,
                request_id = %request_id,
                attempt,
                next_retry_at = %next_retry_at,
                error = %error_text,
                "attempt failed, retry scheduled"
            );

            self.subscribers
                .dispatch(QueueEvent::Retrying(RequestRetrying {
                    request_id: request_id.clone(),
                    attempt_number: attempt,
                    next_retry_at,
                    error: error_text.clone(),
                }))
                .await;
            self.subscribers
                .dispatch(QueueEvent::Failed(RequestFailed {
                    request_id,
                    status_code,
                    attempt_number: attempt,
                    error: error_text,
                    will_retry: true,
                    failed_at: Utc::now(),
                }))
                .await;
        } else {
            self.give_up(request, attempt, status_code, error_text).await;
        }

        Ok(())
    }

    /// Terminal failure: durable dead transition, dead set, events.
    async fn give_up(
        &self,
        request: &StoredRequest,
        attempt: u32,
        status_code: Option<u16>,
        error_text: String,
    ) {
        let request_id = request.id.clone();

        if let Err(e) = self.storage.mark_dead(request_id.clone(), error_text.clone()).await {
            warn!(request_id = %request_id, error = %e, "dead transition failed");
            self.requeue_after_fault(&request_id).await;
            return;
        }
        if let Err(e) = self.index.move_to_dead(&request_id).await {
            error!(request_id = %request_id, error = %e, "dead set insert failed");
        }

        error!(
            worker_id = self.id,
            request_id = %request_id,
            attempt,
            error = %error_text,
            "request moved to dead letter set"
        );

        self.subscribers
            .dispatch(QueueEvent::Dead(RequestDead {
                request_id: request_id.clone(),
                attempts: attempt,
                error: error_text.clone(),
                died_at: Utc::now(),
            }))
            .await;
        self.subscribers
            .dispatch(QueueEvent::Failed(RequestFailed {
                request_id,
                status_code,
                attempt_number: attempt,
                error: error_text,
                will_retry: false,
                failed_at: Utc::now(),
            }))
            .await;
    }

    /// Circuit outcome for an HTTP response: 5xx and 429 count as
    /// failures (a stream of them must open the breaker), other statuses
    /// prove the host is alive.
    async fn record_circuit_response(&self, host: &str, status_code: u16) {
        let result = if status_code >= 500 || status_code == 429 {
            self.backpressure.record_failure(host).await
        } else {
            self.backpressure.record_success(host).await
        };

        if let Err(e) = result {
            warn!(host, error = %e, "circuit record failed");
        }
    }

    /// Best-effort attempt logging; a failed audit write never fails the
    /// attempt itself.
    async fn log_attempt(&self, request_id: &RequestId, attempt_number: i32, outcome: AttemptOutcome) {
        if let Err(e) =
            self.storage.log_attempt(request_id.clone(), attempt_number, outcome).await
        {
            warn!(request_id = %request_id, error = %e, "failed to log attempt");
        }
    }

    /// Requeues a request after an engine-side failure with a short
    /// backoff. No attempt is consumed.
    async fn requeue_after_fault(&self, request_id: &RequestId) {
        let retry_at = Utc::now()
            + chrono::Duration::from_std(self.config.fault_requeue_delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(2));

        if let Err(e) = self.index.schedule_retry(request_id, retry_at).await {
            error!(request_id = %request_id, error = %e, "fault requeue failed");
        }
    }

    /// Waits for the in-flight set to empty, bounded by the drain
    /// timeout.
    async fn await_in_flight(&self) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;

        loop {
            let remaining = self.in_flight.lock().await.len();
            if remaining == 0 {
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    worker_id = self.id,
                    remaining, "shutdown drain timed out with requests in flight"
                );
                return;
            }
            self.clock.sleep(DRAIN_POLL).await;
        }
    }
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction_includes_port() {
        assert_eq!(host_of("https://api.example.com/v1/x"), Some("api.example.com".to_string()));
        assert_eq!(
            host_of("http://localhost:8080/hook"),
            Some("localhost:8080".to_string())
        );
        assert_eq!(host_of("not a url"), None);
        assert_eq!(host_of("mailto:nobody@example.com"), None);
    }
}
