//! Bounded call controller.
//!
//! At most `concurrency` completion calls run at once. Waiting requests are
//! ordered by priority (higher first) and then arrival. A retryable failure
//! parks the request in the cooling set for the policy delay before it
//! re-enters the waiting list; a fatal failure resolves the caller's ticket.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use feedforge_shared::ControllerConfig;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use crate::completion::{CompletionClient, CompletionRequest, CompletionResponse};
use crate::error::{CallError, CompletionError};
use crate::retry::RetryPolicy;

/// A successful call.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub response: CompletionResponse,
    /// Failed attempts before the successful one.
    pub retry_count: u32,
    /// From submission to response, including queueing and backoff.
    pub latency: Duration,
}

/// Snapshot for health reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControllerStats {
    pub in_flight: usize,
    pub queue_depth: usize,
    pub cooling: usize,
    pub completed: u64,
    pub failed: u64,
    pub success_rate: f64,
}

type Reply = oneshot::Sender<Result<CallOutcome, CallError>>;

struct Pending {
    id: u64,
    request: CompletionRequest,
    priority: i32,
    seq: u64,
    attempts: u32,
    submitted_at: Instant,
    reply: Reply,
}

/// Waiting-list key: higher priority first, then lower arrival sequence.
type WaitKey = (Reverse<i32>, u64);

#[derive(Default)]
struct State {
    waiting: BTreeMap<WaitKey, Pending>,
    cooling: HashMap<u64, Pending>,
    in_flight: usize,
    completed: u64,
    failed: u64,
    closed: bool,
}

struct Inner<C: ?Sized> {
    client: Arc<C>,
    policy: RetryPolicy,
    config: ControllerConfig,
    state: Mutex<State>,
    next_id: AtomicU64,
}

/// Handle to one submitted request.
#[derive(Debug)]
pub struct CallTicket {
    pub id: u64,
    receiver: oneshot::Receiver<Result<CallOutcome, CallError>>,
}

impl CallTicket {
    /// Wait for the final outcome.
    pub async fn wait(self) -> Result<CallOutcome, CallError> {
        self.receiver.await.unwrap_or(Err(CallError::Shutdown))
    }
}

/// Gatekeeper in front of a [`CompletionClient`]. Cheap to clone.
pub struct CallController<C: CompletionClient + ?Sized> {
    inner: Arc<Inner<C>>,
}

impl<C: CompletionClient + ?Sized> Clone for CallController<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: CompletionClient + ?Sized + 'static> CallController<C> {
    pub fn new(client: Arc<C>, policy: RetryPolicy, config: ControllerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                policy,
                config,
                state: Mutex::new(State::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Submit and wait for the outcome.
    #[instrument(skip_all, fields(priority = priority, tier = ?request.tier))]
    pub async fn submit(
        &self,
        request: CompletionRequest,
        priority: i32,
    ) -> Result<CallOutcome, CallError> {
        self.enqueue(request, priority).wait().await
    }

    /// Queue a request and return a ticket whose id can be cancelled.
    pub fn enqueue(&self, request: CompletionRequest, priority: i32) -> CallTicket {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, receiver) = oneshot::channel();

        {
            let mut state = self.inner.lock();
            if state.closed {
                let _ = reply.send(Err(CallError::Shutdown));
                return CallTicket { id, receiver };
            }
            let pending = Pending {
                id,
                request,
                priority,
                seq: id,
                attempts: 0,
                submitted_at: Instant::now(),
                reply,
            };
            state.waiting.insert((Reverse(priority), id), pending);
        }

        debug!(call_id = id, priority, "call queued");
        Inner::pump(&self.inner);
        CallTicket { id, receiver }
    }

    /// Cancel a request that is waiting or cooling. In-flight calls are not
    /// interruptible; returns `false` for them and for unknown ids.
    pub fn cancel(&self, id: u64) -> bool {
        let mut state = self.inner.lock();
        let key = state
            .waiting
            .iter()
            .find(|(_, pending)| pending.id == id)
            .map(|(key, _)| *key);

        let pending = match key {
            Some(key) => state.waiting.remove(&key),
            None => state.cooling.remove(&id),
        };
        match pending {
            Some(pending) => {
                let _ = pending.reply.send(Err(CallError::Cancelled));
                debug!(call_id = id, "call cancelled");
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> ControllerStats {
        let state = self.inner.lock();
        let settled = state.completed + state.failed;
        ControllerStats {
            in_flight: state.in_flight,
            queue_depth: state.waiting.len(),
            cooling: state.cooling.len(),
            completed: state.completed,
            failed: state.failed,
            success_rate: if settled == 0 {
                1.0
            } else {
                state.completed as f64 / settled as f64
            },
        }
    }

    /// Reject new work and resolve every waiting or cooling request with
    /// [`CallError::Shutdown`]. In-flight calls run to completion.
    pub fn shutdown(&self) {
        let drained: Vec<Pending> = {
            let mut state = self.inner.lock();
            state.closed = true;
            let waiting = std::mem::take(&mut state.waiting);
            let cooling = std::mem::take(&mut state.cooling);
            waiting.into_values().chain(cooling.into_values()).collect()
        };
        for pending in drained {
            let _ = pending.reply.send(Err(CallError::Shutdown));
        }
    }
}

impl<C: CompletionClient + ?Sized + 'static> Inner<C> {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dispatch waiting requests while capacity remains.
    fn pump(inner: &Arc<Self>) {
        let mut ready = Vec::new();
        {
            let mut state = inner.lock();
            while state.in_flight < inner.config.concurrency {
                let Some((_, pending)) = state.waiting.pop_first() else {
                    break;
                };
                state.in_flight += 1;
                ready.push(pending);
            }
        }
        // Spawned outside the lock: a dropped task releases its slot.
        for pending in ready {
            let slot = Slot {
                inner: inner.clone(),
                settled: false,
            };
            tokio::spawn(async move { Inner::run(slot, pending).await });
        }
    }

    async fn run(mut slot: Slot<C>, pending: Pending) {
        let inner = slot.inner.clone();
        let timeout = inner.config.call_timeout;
        let result = match tokio::time::timeout(timeout, inner.client.complete(&pending.request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(CompletionError::timeout(timeout)),
        };
        Inner::finish(&inner, pending, result);
        slot.settled = true;
    }

    fn finish(
        inner: &Arc<Self>,
        mut pending: Pending,
        result: Result<CompletionResponse, CompletionError>,
    ) {
        let mut state = inner.lock();
        let error = match result {
            Ok(response) => {
                state.completed += 1;
                let outcome = CallOutcome {
                    response,
                    retry_count: pending.attempts,
                    latency: pending.submitted_at.elapsed(),
                };
                debug!(call_id = pending.id, retries = pending.attempts, "call succeeded");
                let _ = pending.reply.send(Ok(outcome));
                return;
            }
            Err(error) => error,
        };

        let decision = inner.policy.should_retry(&error, pending.attempts);
        if decision.retry && !state.closed {
            pending.attempts += 1;
            debug!(
                call_id = pending.id,
                attempts = pending.attempts,
                delay_ms = decision.delay.as_millis() as u64,
                error = %error,
                "call cooling before retry"
            );
            let id = pending.id;
            state.cooling.insert(id, pending);
            let timer_inner = inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep(decision.delay).await;
                Inner::rewake(&timer_inner, id);
            });
            return;
        }

        state.failed += 1;
        let attempts = pending.attempts + 1;
        warn!(call_id = pending.id, attempts, error = %error, "call failed");
        let _ = pending.reply.send(Err(CallError::Failed { error, attempts }));
    }

    /// Move a cooled request back to the waiting list, unless it was
    /// cancelled in the meantime.
    fn rewake(inner: &Arc<Self>, id: u64) {
        {
            let mut state = inner.lock();
            let Some(pending) = state.cooling.remove(&id) else {
                return;
            };
            state
                .waiting
                .insert((Reverse(pending.priority), pending.seq), pending);
        }
        Inner::pump(inner);
    }
}

/// In-flight slot held by a running call. Dropping it frees the slot and
/// dispatches the next waiter, even when the client panicked.
struct Slot<C: CompletionClient + ?Sized + 'static> {
    inner: Arc<Inner<C>>,
    settled: bool,
}

impl<C: CompletionClient + ?Sized + 'static> Drop for Slot<C> {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            if !self.settled {
                state.failed += 1;
                warn!("completion call aborted without a result");
            }
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            Inner::pump(&self.inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::error::ErrorClass;
    use crate::tier::ModelTier;

    fn request(prompt: &str) -> CompletionRequest {
        CompletionRequest {
            prompt: prompt.into(),
            system: None,
            tier: ModelTier::Fast,
        }
    }

    fn response(text: &str) -> CompletionResponse {
        CompletionResponse {
            text: text.into(),
            model: "fake".into(),
            input_tokens: 1,
            output_tokens: 1,
        }
    }

    fn config(concurrency: usize) -> ControllerConfig {
        ControllerConfig {
            concurrency,
            call_timeout: Duration::from_secs(10),
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(10),
            max_attempts,
        }
    }

    /// Blocks every call until a permit is released; records concurrency and start order.
    struct GatedClient {
        gate: Semaphore,
        active: AtomicUsize,
        peak: AtomicUsize,
        started: Mutex<Vec<String>>,
    }

    impl GatedClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                started: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionClient for GatedClient {
        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> Result<CompletionResponse, CompletionError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.started
                .lock()
                .expect("started lock")
                .push(request.prompt.clone());
            let permit = self.gate.acquire().await.expect("gate open");
            permit.forget();
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(response(&request.prompt))
        }
    }

    /// Fails the first `failures` calls with `class`, then succeeds.
    struct FlakyClient {
        class: ErrorClass,
        failures: u32,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionClient for FlakyClient {
        async fn complete(
            &self,
            _request: &CompletionRequest,
        ) -> Result<CompletionResponse, CompletionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as u32;
            if call < self.failures {
                Err(CompletionError::new(self.class, format!("failure {call}")))
            } else {
                Ok(response("done"))
            }
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn never_exceeds_concurrency_budget() {
        let client = GatedClient::new();
        let controller = CallController::new(client.clone(), fast_policy(3), config(2));

        let tickets: Vec<_> = (0..6)
            .map(|i| controller.enqueue(request(&format!("r{i}")), 0))
            .collect();
        settle().await;

        assert_eq!(client.active.load(Ordering::SeqCst), 2);
        let stats = controller.stats();
        assert_eq!(stats.in_flight, 2);
        assert_eq!(stats.queue_depth, 4);

        client.gate.add_permits(6);
        for ticket in tickets {
            ticket.wait().await.expect("call succeeds");
        }
        assert_eq!(client.peak.load(Ordering::SeqCst), 2);
        assert_eq!(controller.stats().completed, 6);
    }

    #[tokio::test]
    async fn higher_priority_dispatches_first_fifo_within_level() {
        let client = GatedClient::new();
        let controller = CallController::new(client.clone(), fast_policy(3), config(1));

        let blocker = controller.enqueue(request("blocker"), 0);
        settle().await;
        let low = controller.enqueue(request("low"), 1);
        let high_a = controller.enqueue(request("high-a"), 5);
        let high_b = controller.enqueue(request("high-b"), 5);

        client.gate.add_permits(4);
        for ticket in [blocker, low, high_a, high_b] {
            ticket.wait().await.expect("call succeeds");
        }

        let order = client.started.lock().expect("started lock").clone();
        assert_eq!(order, vec!["blocker", "high-a", "high-b", "low"]);
    }

    #[tokio::test]
    async fn cancel_removes_waiting_request_only() {
        let client = GatedClient::new();
        let controller = CallController::new(client.clone(), fast_policy(3), config(1));

        let running = controller.enqueue(request("running"), 0);
        settle().await;
        let waiting = controller.enqueue(request("waiting"), 0);

        assert!(!controller.cancel(running.id), "in-flight call is not cancellable");
        assert!(controller.cancel(waiting.id));
        assert!(!controller.cancel(waiting.id));
        assert!(!controller.cancel(9_999));
        assert_eq!(waiting.wait().await.unwrap_err(), CallError::Cancelled);

        client.gate.add_permits(1);
        assert!(running.wait().await.is_ok());
        assert_eq!(client.started.lock().expect("started lock").len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_then_success_reports_one_retry() {
        let client = Arc::new(FlakyClient {
            class: ErrorClass::RateLimited,
            failures: 1,
            calls: AtomicUsize::new(0),
        });
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(40),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
            max_attempts: 4,
        };
        let controller = CallController::new(client.clone(), policy, config(2));

        let outcome = controller
            .submit(request("summarize"), 0)
            .await
            .expect("eventually succeeds");
        assert_eq!(outcome.retry_count, 1);
        assert!(outcome.latency >= Duration::from_millis(40));
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fatal_failure_is_not_retried() {
        let client = Arc::new(FlakyClient {
            class: ErrorClass::Authentication,
            failures: 10,
            calls: AtomicUsize::new(0),
        });
        let controller = CallController::new(client.clone(), fast_policy(5), config(1));

        let err = controller.submit(request("x"), 0).await.unwrap_err();
        match err {
            CallError::Failed { error, attempts } => {
                assert_eq!(error.class, ErrorClass::Authentication);
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(controller.stats().failed, 1);
    }

    #[tokio::test]
    async fn retries_stop_at_max_attempts() {
        let client = Arc::new(FlakyClient {
            class: ErrorClass::Upstream5xx,
            failures: 10,
            calls: AtomicUsize::new(0),
        });
        let controller = CallController::new(client.clone(), fast_policy(3), config(1));

        let err = controller.submit(request("x"), 0).await.unwrap_err();
        assert!(matches!(err, CallError::Failed { attempts: 3, .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
        assert!((controller.stats().success_rate - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn timeout_counts_as_retryable_failure() {
        struct Stalled;

        #[async_trait]
        impl CompletionClient for Stalled {
            async fn complete(
                &self,
                _request: &CompletionRequest,
            ) -> Result<CompletionResponse, CompletionError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(response("late"))
            }
        }

        let controller = CallController::new(
            Arc::new(Stalled),
            fast_policy(2),
            ControllerConfig {
                concurrency: 1,
                call_timeout: Duration::from_millis(20),
            },
        );
        let err = controller.submit(request("x"), 0).await.unwrap_err();
        assert_eq!(err.class(), Some(ErrorClass::Timeout));
        assert!(matches!(err, CallError::Failed { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn panicking_client_frees_its_slot() {
        struct Erratic {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl CompletionClient for Erratic {
            async fn complete(
                &self,
                _request: &CompletionRequest,
            ) -> Result<CompletionResponse, CompletionError> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("client bug");
                }
                Ok(response("recovered"))
            }
        }

        let controller = CallController::new(
            Arc::new(Erratic {
                calls: AtomicUsize::new(0),
            }),
            fast_policy(3),
            config(1),
        );
        let lost = controller.enqueue(request("boom"), 0);
        assert!(lost.wait().await.is_err());
        settle().await;

        let stats = controller.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.failed, 1);

        let outcome = controller.submit(request("again"), 0).await.expect("slot reused");
        assert_eq!(outcome.response.text, "recovered");
    }

    #[tokio::test]
    async fn shutdown_resolves_waiters() {
        let client = GatedClient::new();
        let controller = CallController::new(client.clone(), fast_policy(3), config(1));

        let running = controller.enqueue(request("running"), 0);
        settle().await;
        let waiting = controller.enqueue(request("waiting"), 0);

        controller.shutdown();
        assert_eq!(waiting.wait().await.unwrap_err(), CallError::Shutdown);
        let late = controller.enqueue(request("late"), 0);
        assert_eq!(late.wait().await.unwrap_err(), CallError::Shutdown);

        client.gate.add_permits(1);
        assert!(running.wait().await.is_ok());
    }
}
