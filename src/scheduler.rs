//! Scrape scheduler: one phase-independent timing loop per target, and the
//! pool that reconciles the running set against the configured target set.

use crate::scrape::{Fetcher, ScrapeOutcome, ScrapeResult};
use crate::sink::{ResultSink, ScrapeUpdate};
use crate::target::{TargetDescriptor, TargetId};

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};

/// Contract violations in `reconcile` input. These indicate a caller bug and
/// are surfaced loudly rather than repaired.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("duplicate target identity in desired set: {0}")]
    DuplicateTarget(TargetId),
}

/// Run state of one per-target scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    InFlight,
    Cancelling,
}

#[derive(Debug)]
struct StateInner {
    run_state: RunState,
    next_fire: Option<Instant>,
    last_scrape_ok: Option<bool>,
}

/// State shared between a scheduler loop, its spawned fetch tasks, and pool
/// status queries. The scheduler keeps no scrape history beyond the most
/// recent outcome's status.
#[derive(Debug)]
struct SchedulerState {
    inner: RwLock<StateInner>,
    consecutive_failures: AtomicU32,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            inner: RwLock::new(StateInner {
                run_state: RunState::Idle,
                next_fire: None,
                last_scrape_ok: None,
            }),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    async fn run_state(&self) -> RunState {
        self.inner.read().await.run_state
    }

    async fn set_run_state(&self, run_state: RunState) {
        self.inner.write().await.run_state = run_state;
    }

    /// Mark a fetch as started. Returns false when the scheduler is
    /// cancelling, in which case no fetch must begin.
    async fn try_begin_fetch(&self) -> bool {
        let mut inner = self.inner.write().await;
        if inner.run_state == RunState::Cancelling {
            return false;
        }
        inner.run_state = RunState::InFlight;
        true
    }

    async fn set_next_fire(&self, next_fire: Instant) {
        self.inner.write().await.next_fire = Some(next_fire);
    }

    /// Record a completed fetch. Returns false when the scheduler is
    /// cancelling, in which case the caller must discard the result.
    async fn try_complete(&self, ok: bool) -> bool {
        let mut inner = self.inner.write().await;
        if inner.run_state == RunState::Cancelling {
            return false;
        }
        inner.run_state = RunState::Idle;
        inner.last_scrape_ok = Some(ok);
        true
    }
}

/// Pool-internal bookkeeping for one running scheduler.
struct SchedulerHandle {
    target: Arc<TargetDescriptor>,
    stop_tx: broadcast::Sender<()>,
    state: Arc<SchedulerState>,
}

/// Per-target health snapshot for external health/alerting use.
#[derive(Debug, Clone)]
pub struct TargetStatus {
    pub target: Arc<TargetDescriptor>,
    pub run_state: RunState,
    pub next_fire: Option<Instant>,
    pub consecutive_failures: u32,
    pub last_scrape_ok: Option<bool>,
}

/// Manages the set of per-target schedulers.
pub struct SchedulerPool {
    fetcher: Arc<dyn Fetcher>,
    sink: ResultSink,
    schedulers: Arc<RwLock<HashMap<TargetId, SchedulerHandle>>>,
    spread_start: bool,
}

impl SchedulerPool {
    pub fn new(fetcher: Arc<dyn Fetcher>, sink: ResultSink) -> Self {
        Self {
            fetcher,
            sink,
            schedulers: Arc::new(RwLock::new(HashMap::new())),
            spread_start: true,
        }
    }

    /// Fire newly added schedulers immediately instead of spreading their
    /// first fires across one interval.
    pub fn without_start_jitter(mut self) -> Self {
        self.spread_start = false;
        self
    }

    /// Reconcile the running scheduler set against `desired`.
    ///
    /// Targets present in both sets are left untouched: restarting them would
    /// reset their phase. Removed targets get the stop signal and terminate
    /// per the cancellation rules; added targets start a fresh cadence.
    pub async fn reconcile(&self, desired: Vec<TargetDescriptor>) -> Result<(), ReconcileError> {
        let mut desired_map: HashMap<TargetId, TargetDescriptor> = HashMap::new();
        for target in desired {
            let id = target.id();
            if desired_map.insert(id.clone(), target).is_some() {
                return Err(ReconcileError::DuplicateTarget(id));
            }
        }

        let mut schedulers = self.schedulers.write().await;

        let removed: Vec<TargetId> = schedulers
            .keys()
            .filter(|id| !desired_map.contains_key(*id))
            .cloned()
            .collect();
        for id in removed {
            if let Some(handle) = schedulers.remove(&id) {
                tracing::info!("Scheduler pool: removing target {}", id);
                // Cancelling must be visible before the stop signal: a fetch
                // can complete before the loop task observes the stop, and
                // its result must already be marked for discard.
                handle.state.set_run_state(RunState::Cancelling).await;
                let _ = handle.stop_tx.send(());
            }
        }

        for (id, target) in desired_map {
            if schedulers.contains_key(&id) {
                continue;
            }
            tracing::info!("Scheduler pool: adding target {}", id);
            let handle = self.spawn_scheduler(Arc::new(target));
            schedulers.insert(id, handle);
        }

        Ok(())
    }

    fn spawn_scheduler(&self, target: Arc<TargetDescriptor>) -> SchedulerHandle {
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let state = Arc::new(SchedulerState::new());

        // Jitter the first fire within one interval so adding many targets
        // at once does not produce a thundering herd.
        let initial_delay = if self.spread_start {
            let interval_ms = target.scrape_interval.as_millis().max(1) as u64;
            Duration::from_millis(rand::random::<u64>() % interval_ms)
        } else {
            Duration::ZERO
        };

        tokio::spawn(run_scrape_loop(
            target.clone(),
            self.fetcher.clone(),
            self.sink.clone(),
            state.clone(),
            stop_rx,
            initial_delay,
        ));

        SchedulerHandle {
            target,
            stop_tx,
            state,
        }
    }

    /// Snapshot the health of every running scheduler.
    pub async fn status(&self) -> Vec<TargetStatus> {
        let schedulers = self.schedulers.read().await;
        let mut statuses = Vec::with_capacity(schedulers.len());
        for handle in schedulers.values() {
            let inner = handle.state.inner.read().await;
            statuses.push(TargetStatus {
                target: handle.target.clone(),
                run_state: inner.run_state,
                next_fire: inner.next_fire,
                consecutive_failures: handle.state.consecutive_failures.load(Ordering::Relaxed),
                last_scrape_ok: inner.last_scrape_ok,
            });
        }
        statuses
    }

    pub async fn target_count(&self) -> usize {
        self.schedulers.read().await.len()
    }

    /// Stop every scheduler. In-flight fetches drain per the removal rules.
    pub async fn shutdown(&self) {
        let mut schedulers = self.schedulers.write().await;
        let count = schedulers.len();
        for (_, handle) in schedulers.drain() {
            handle.state.set_run_state(RunState::Cancelling).await;
            let _ = handle.stop_tx.send(());
        }
        tracing::info!("Scheduler pool: stopped {} schedulers", count);
    }
}

/// Timing loop for a single target.
///
/// The cadence is phase-locked to the schedule: the ticker fires every
/// `scrape_interval` from the first fire, independent of fetch duration. A
/// tick arriving while the previous fetch is still in flight is skipped once
/// and reported, never double-fired.
async fn run_scrape_loop(
    target: Arc<TargetDescriptor>,
    fetcher: Arc<dyn Fetcher>,
    sink: ResultSink,
    state: Arc<SchedulerState>,
    mut stop_rx: broadcast::Receiver<()>,
    initial_delay: Duration,
) {
    let first_fire = Instant::now() + initial_delay;
    let mut ticker = tokio::time::interval_at(first_fire, target.scrape_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // One permit: fetches for a single target are strictly sequential.
    let in_flight = Arc::new(Semaphore::new(1));

    state.set_next_fire(first_fire).await;

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            fired = ticker.tick() => {
                // A tick can race the stop signal: once the pool marked this
                // scheduler cancelling, it must not fire or report again.
                if state.run_state().await == RunState::Cancelling {
                    break;
                }

                state.set_next_fire(fired + target.scrape_interval).await;

                let permit = match in_flight.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!(
                            "Skipping tick for {}: previous fetch still in flight",
                            target.id()
                        );
                        sink.record(ScrapeUpdate::SkippedTick {
                            target: target.clone(),
                            at: Utc::now(),
                        });
                        continue;
                    }
                };

                if !state.try_begin_fetch().await {
                    break;
                }

                let target = target.clone();
                let fetcher = fetcher.clone();
                let sink = sink.clone();
                let state = state.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until the fetch settles

                    let timestamp = Utc::now();
                    let started = Instant::now();
                    let outcome = match fetcher.fetch(&target).await {
                        Ok(success) => ScrapeOutcome::Success {
                            status: success.status,
                            payload: success.payload,
                        },
                        Err(e) => {
                            tracing::warn!("Scrape failed for {}: {}", target.id(), e);
                            ScrapeOutcome::Failure(e)
                        }
                    };
                    let duration = started.elapsed();

                    // Cooperative cancellation: once the scheduler is
                    // cancelling, the result is discarded, not forwarded.
                    if !state.try_complete(outcome.is_success()).await {
                        return;
                    }

                    if outcome.is_success() {
                        state.consecutive_failures.store(0, Ordering::Relaxed);
                    } else {
                        state.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                    }

                    sink.record(ScrapeUpdate::Result(ScrapeResult {
                        target,
                        timestamp,
                        duration,
                        outcome,
                    }));
                });
            }
        }
    }

    // Removal: no new fetch starts past this point. Wait for any in-flight
    // fetch to finish or hit its deadline; its result is discarded above.
    state.set_run_state(RunState::Cancelling).await;
    let _ = in_flight.acquire().await;
    tracing::info!("Scheduler for {} terminated", target.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrape::{FetchError, FetchSuccess};
    use crate::target::Scheme;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    struct MockFetcher {
        delay: Duration,
        /// Fail this many leading fetches, then succeed.
        fail_first: usize,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        completed: AtomicUsize,
    }

    impl MockFetcher {
        fn new(delay: Duration, fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                delay,
                fail_first,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Fetcher for MockFetcher {
        async fn fetch(&self, _target: &TargetDescriptor) -> Result<FetchSuccess, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(FetchError::Connection("mock target down".to_string()))
            } else {
                Ok(FetchSuccess {
                    status: 200,
                    payload: "up 1\n".to_string(),
                })
            }
        }
    }

    fn descriptor(name: &str, interval: Duration, timeout: Duration) -> TargetDescriptor {
        TargetDescriptor {
            job_name: name.to_string(),
            address: "localhost:9100".to_string(),
            scheme: Scheme::Http,
            metrics_path: "/metrics".to_string(),
            scrape_interval: interval,
            scrape_timeout: timeout,
            tls_skip_verify: false,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ScrapeUpdate>) -> (usize, usize) {
        let (mut results, mut skips) = (0, 0);
        while let Ok(update) = rx.try_recv() {
            match update {
                ScrapeUpdate::Result(_) => results += 1,
                ScrapeUpdate::SkippedTick { .. } => skips += 1,
            }
        }
        (results, skips)
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrun_skips_tick_once_and_stays_sequential() {
        let fetcher = MockFetcher::new(Duration::from_secs(7), 0);
        let (sink, mut rx) = ResultSink::channel(64);
        let pool = SchedulerPool::new(fetcher.clone(), sink).without_start_jitter();

        let target = descriptor("app", Duration::from_secs(5), Duration::from_secs(3));
        pool.reconcile(vec![target]).await.expect("reconcile");

        // Fires at t0 (fetch runs to t7), tick at t5 is skipped once, next
        // fire at t10.
        tokio::time::sleep(Duration::from_secs(12)).await;

        let (results, skips) = drain(&mut rx);
        assert_eq!(results, 1);
        assert_eq!(skips, 1);
        assert_eq!(fetcher.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_identical_set_does_not_reset_phase() {
        let fetcher = MockFetcher::new(Duration::ZERO, 0);
        let (sink, _rx) = ResultSink::channel(64);
        let pool = SchedulerPool::new(fetcher, sink).without_start_jitter();

        let target = descriptor("app", Duration::from_secs(60), Duration::from_secs(10));
        pool.reconcile(vec![target.clone()]).await.expect("reconcile");
        tokio::time::sleep(Duration::from_secs(1)).await;

        let before = pool.status().await;
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].run_state, RunState::Idle);
        let next_fire = before[0].next_fire.expect("scheduler has fired once");

        pool.reconcile(vec![target]).await.expect("reconcile again");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let after = pool.status().await;
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].next_fire, Some(next_fire));
        assert_eq!(pool.target_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_in_flight_discards_result() {
        let fetcher = MockFetcher::new(Duration::from_secs(5), 0);
        let (sink, mut rx) = ResultSink::channel(64);
        let pool = SchedulerPool::new(fetcher.clone(), sink).without_start_jitter();

        let target = descriptor("app", Duration::from_secs(30), Duration::from_secs(10));
        pool.reconcile(vec![target]).await.expect("reconcile");

        // Fetch starts at t0; remove the target at t1 while it is in flight.
        tokio::time::sleep(Duration::from_secs(1)).await;
        pool.reconcile(Vec::new()).await.expect("remove all");
        assert_eq!(pool.target_count().await, 0);

        // Let the fetch finish (t5). It must complete and release its
        // resources, but its result must never reach the sink.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fetcher.completed.load(Ordering::SeqCst), 1);
        let (results, skips) = drain(&mut rx);
        assert_eq!(results, 0);
        assert_eq!(skips, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_at_fetch_completion_instant_discards_result() {
        let fetcher = MockFetcher::new(Duration::from_secs(5), 0);
        let (sink, mut rx) = ResultSink::channel(64);
        let pool = SchedulerPool::new(fetcher.clone(), sink).without_start_jitter();

        let target = descriptor("app", Duration::from_secs(30), Duration::from_secs(10));
        pool.reconcile(vec![target]).await.expect("reconcile");

        // Remove the target at the exact instant its fetch completes. The
        // loop task has not observed the stop signal yet, so the discard
        // decision must already be in place when reconcile returns.
        tokio::time::sleep(Duration::from_secs(5)).await;
        pool.reconcile(Vec::new()).await.expect("remove all");
        assert_eq!(pool.target_count().await, 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fetcher.completed.load(Ordering::SeqCst), 1);
        let (results, skips) = drain(&mut rx);
        assert_eq!(results, 0);
        assert_eq!(skips, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_never_stop_the_cadence() {
        let fetcher = MockFetcher::new(Duration::ZERO, usize::MAX);
        let (sink, mut rx) = ResultSink::channel(64);
        let pool = SchedulerPool::new(fetcher, sink).without_start_jitter();

        let target = descriptor("app", Duration::from_secs(5), Duration::from_secs(3));
        pool.reconcile(vec![target]).await.expect("reconcile");

        // Fires at t0, t5, t10; every fetch fails.
        tokio::time::sleep(Duration::from_secs(11)).await;

        let (results, skips) = drain(&mut rx);
        assert_eq!(results, 3);
        assert_eq!(skips, 0);

        let status = pool.status().await;
        assert_eq!(status[0].consecutive_failures, 3);
        assert_eq!(status[0].last_scrape_ok, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        // Fails at t0 and t5, recovers at t10.
        let fetcher = MockFetcher::new(Duration::ZERO, 2);
        let (sink, _rx) = ResultSink::channel(64);
        let pool = SchedulerPool::new(fetcher, sink).without_start_jitter();

        let target = descriptor("app", Duration::from_secs(5), Duration::from_secs(3));
        pool.reconcile(vec![target]).await.expect("reconcile");

        tokio::time::sleep(Duration::from_secs(6)).await;
        let status = pool.status().await;
        assert_eq!(status[0].consecutive_failures, 2);
        assert_eq!(status[0].last_scrape_ok, Some(false));

        tokio::time::sleep(Duration::from_secs(5)).await;
        let status = pool.status().await;
        assert_eq!(status[0].consecutive_failures, 0);
        assert_eq!(status[0].last_scrape_ok, Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_adds_and_removes_without_disturbing_others() {
        let fetcher = MockFetcher::new(Duration::ZERO, 0);
        let (sink, _rx) = ResultSink::channel(64);
        let pool = SchedulerPool::new(fetcher, sink).without_start_jitter();

        let a = descriptor("job-a", Duration::from_secs(60), Duration::from_secs(10));
        let b = descriptor("job-b", Duration::from_secs(60), Duration::from_secs(10));
        pool.reconcile(vec![a.clone(), b.clone()]).await.expect("reconcile");
        tokio::time::sleep(Duration::from_secs(1)).await;

        let a_next = pool
            .status()
            .await
            .into_iter()
            .find(|s| s.target.job_name == "job-a")
            .and_then(|s| s.next_fire)
            .expect("job-a fired");

        // Swap b for c; a must keep its phase.
        let c = descriptor("job-c", Duration::from_secs(60), Duration::from_secs(10));
        pool.reconcile(vec![a, c]).await.expect("reconcile");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let statuses = pool.status().await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.target.job_name != "job-b"));
        let a_after = statuses
            .iter()
            .find(|s| s.target.job_name == "job-a")
            .and_then(|s| s.next_fire)
            .expect("job-a still scheduled");
        assert_eq!(a_after, a_next);
    }

    #[tokio::test]
    async fn test_reconcile_rejects_duplicate_identity() {
        let fetcher = MockFetcher::new(Duration::ZERO, 0);
        let (sink, _rx) = ResultSink::channel(64);
        let pool = SchedulerPool::new(fetcher, sink);

        let target = descriptor("app", Duration::from_secs(5), Duration::from_secs(3));
        let err = pool
            .reconcile(vec![target.clone(), target])
            .await
            .expect_err("duplicates are a contract violation");
        assert!(matches!(err, ReconcileError::DuplicateTarget(_)));
        assert_eq!(pool.target_count().await, 0);
    }
}
