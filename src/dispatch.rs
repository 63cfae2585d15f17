//! Non-blocking color dispatch: one worker lane, one-deep latest-wins
//! mailbox, dedup, rate limiting and exponential backoff.

use crate::color::ColorSpec;
use crate::stepper;
use crate::via::{self, ViaDevice, ViaError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default minimum spacing between dispatches.
pub const DEFAULT_RATE_LIMIT: Duration = Duration::from_millis(200);

/// Escalating delays after consecutive failures, capped at the last entry.
const BACKOFF: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

fn backoff_delay(consecutive_errors: u32) -> Duration {
    let index = (consecutive_errors.saturating_sub(1) as usize).min(BACKOFF.len() - 1);
    BACKOFF[index]
}

/// Device parameters consumed by each dispatch, replaceable at runtime.
#[derive(Debug, Clone)]
pub struct DeviceParams {
    pub vid: String,
    pub pid: String,
    pub step: u8,
    pub delay: Duration,
    pub save: bool,
}

/// Executes one color application. The production implementation shells out
/// to `qmk_hid`; tests substitute a recorder.
pub trait ColorApplier: Send + Sync + 'static {
    fn apply(
        &self,
        spec: &ColorSpec,
        params: &DeviceParams,
    ) -> impl Future<Output = Result<(), ViaError>> + Send;
}

/// Applies a spec through the external tool: named colors with one direct
/// call, hex/hsv via stepwise convergence.
#[derive(Debug, Clone, Copy)]
pub struct ViaApplier;

impl ColorApplier for ViaApplier {
    async fn apply(&self, spec: &ColorSpec, params: &DeviceParams) -> Result<(), ViaError> {
        match spec {
            ColorSpec::Named(name) => via::set_named_color(*name, params.save).await,
            ColorSpec::Hex { .. } | ColorSpec::Hsv(_) => {
                let mut device = ViaDevice::new(&params.vid, &params.pid);
                stepper::converge(
                    &mut device,
                    spec.target_hue(),
                    params.step,
                    params.delay,
                    params.save,
                )
                .await
                .map(|_| ())
            }
        }
    }
}

struct DispatchState {
    params: DeviceParams,
    /// Last successfully applied color; cleared on failure so the next
    /// identical request bypasses dedup and retries.
    last_color: Option<ColorSpec>,
    last_sent_at: Option<Instant>,
    consecutive_errors: u32,
    backoff_until: Option<Instant>,
    /// One-deep mailbox; a newer request replaces an older one outright.
    pending: Option<ColorSpec>,
}

struct Inner<A> {
    applier: A,
    state: Mutex<DispatchState>,
    notify: Notify,
    cancel: CancellationToken,
    rate_limit: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Single-lane asynchronous color dispatcher.
///
/// `send_color` never blocks on device work: it either hands the request to
/// the worker lane or records it as pending for a later poll. At most one
/// external invocation is in flight at any time.
pub struct DispatchEngine<A: ColorApplier> {
    inner: Arc<Inner<A>>,
}

impl<A: ColorApplier> Clone for DispatchEngine<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: ColorApplier> DispatchEngine<A> {
    pub fn new(applier: A, params: DeviceParams, rate_limit: Duration) -> Self {
        let inner = Arc::new(Inner {
            applier,
            state: Mutex::new(DispatchState {
                params,
                last_color: None,
                last_sent_at: None,
                consecutive_errors: 0,
                backoff_until: None,
                pending: None,
            }),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            rate_limit,
            worker: Mutex::new(None),
        });

        let handle = tokio::spawn(worker_loop(Arc::clone(&inner)));
        let engine = Self { inner };
        // Stash the handle so shutdown can join it. The worker cannot have
        // exited yet; it parks on notify/cancel first.
        if let Ok(mut slot) = engine.inner.worker.try_lock() {
            *slot = Some(handle);
        }
        engine
    }

    /// Submits a color for asynchronous application.
    ///
    /// Returns `true` when the request was accepted for the worker lane,
    /// `false` when it was deduplicated, rate-limited, suppressed by
    /// backoff, or refused because the engine is shutting down. A
    /// rate-limited or backed-off request is parked as pending and is
    /// honored when the lane frees, unless a newer request supersedes it.
    pub async fn send_color(&self, spec: ColorSpec) -> bool {
        if self.inner.cancel.is_cancelled() {
            return false;
        }

        let mut state = self.inner.state.lock().await;

        if state.last_color.as_ref() == Some(&spec) {
            debug!(color = %spec, "color unchanged, skipping");
            return false;
        }

        let now = Instant::now();

        if let Some(until) = state.backoff_until {
            if now < until {
                debug!(color = %spec, remaining = ?(until - now), "within backoff window, parking");
                state.pending = Some(spec);
                return false;
            }
        }

        if let Some(last) = state.last_sent_at {
            if now.duration_since(last) < self.inner.rate_limit {
                debug!(color = %spec, "rate limited, parking");
                state.pending = Some(spec);
                return false;
            }
        }

        state.pending = Some(spec);
        state.last_sent_at = Some(now);
        drop(state);

        self.inner.notify.notify_one();
        true
    }

    /// Replaces the device parameters wholesale. Takes effect at the next
    /// job pickup.
    pub async fn update_params(&self, params: DeviceParams) {
        self.inner.state.lock().await.params = params;
    }

    /// Stops accepting work and waits up to `grace` for the in-flight call
    /// to finish; aborts the worker past that (spawned subprocesses are
    /// reaped via `kill_on_drop`).
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.cancel.cancel();
        self.inner.notify.notify_one();

        let handle = self.inner.worker.lock().await.take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(_) => info!("dispatch worker stopped"),
                Err(_) => {
                    warn!("dispatch worker did not stop within {grace:?}, aborting");
                    handle.abort();
                }
            }
        }
    }
}

async fn worker_loop<A: ColorApplier>(inner: Arc<Inner<A>>) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = inner.notify.notified() => {}
        }

        // Drain the mailbox; a request parked while a job runs is picked up
        // here, and only the newest survives.
        loop {
            let job = {
                let mut state = inner.state.lock().await;
                match state.pending.take() {
                    // A parked request the lane already satisfied; drop it.
                    Some(spec) if state.last_color.as_ref() == Some(&spec) => None,
                    other => other.map(|spec| (spec, state.params.clone())),
                }
            };
            let Some((spec, params)) = job else { break };

            info!(color = %spec, "dispatching color");
            let result = inner.applier.apply(&spec, &params).await;

            let mut state = inner.state.lock().await;
            state.last_sent_at = Some(Instant::now());
            match result {
                Ok(()) => {
                    state.last_color = Some(spec);
                    state.consecutive_errors = 0;
                    state.backoff_until = None;
                }
                Err(e) => {
                    state.last_color = None;
                    state.consecutive_errors += 1;
                    let delay = backoff_delay(state.consecutive_errors);
                    state.backoff_until = Some(Instant::now() + delay);
                    warn!(
                        color = %spec,
                        error = %e,
                        consecutive_errors = state.consecutive_errors,
                        backoff = ?delay,
                        "dispatch failed"
                    );
                }
            }

            if inner.cancel.is_cancelled() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::NamedColor;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Semaphore;

    fn params() -> DeviceParams {
        DeviceParams {
            vid: "3434".into(),
            pid: "0011".into(),
            step: 8,
            delay: Duration::ZERO,
            save: false,
        }
    }

    fn named(color: NamedColor) -> ColorSpec {
        ColorSpec::Named(color)
    }

    /// Records applied specs; optionally blocks each apply on a gate and
    /// fails the first `fail_first` calls.
    #[derive(Clone)]
    struct Recorder {
        applied: Arc<std::sync::Mutex<Vec<ColorSpec>>>,
        started: Arc<Semaphore>,
        release: Option<Arc<Semaphore>>,
        fail_first: Arc<AtomicU32>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                applied: Arc::new(std::sync::Mutex::new(Vec::new())),
                started: Arc::new(Semaphore::new(0)),
                release: None,
                fail_first: Arc::new(AtomicU32::new(0)),
            }
        }

        fn gated() -> (Self, Arc<Semaphore>) {
            let release = Arc::new(Semaphore::new(0));
            let mut recorder = Self::new();
            recorder.release = Some(Arc::clone(&release));
            (recorder, release)
        }

        fn failing(times: u32) -> Self {
            let recorder = Self::new();
            recorder.fail_first.store(times, Ordering::SeqCst);
            recorder
        }

        fn applied(&self) -> Vec<ColorSpec> {
            self.applied.lock().unwrap().clone()
        }
    }

    impl ColorApplier for Recorder {
        async fn apply(&self, spec: &ColorSpec, _params: &DeviceParams) -> Result<(), ViaError> {
            self.started.add_permits(1);
            if let Some(release) = &self.release {
                release.acquire().await.unwrap().forget();
            }
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(ViaError::Device("simulated failure".into()));
            }
            self.applied.lock().unwrap().push(spec.clone());
            Ok(())
        }
    }

    /// Waits for the worker to go idle with an empty mailbox.
    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn applies_an_accepted_color() {
        let recorder = Recorder::new();
        let engine = DispatchEngine::new(recorder.clone(), params(), DEFAULT_RATE_LIMIT);

        assert!(engine.send_color(named(NamedColor::Red)).await);
        settle().await;
        assert_eq!(recorder.applied(), vec![named(NamedColor::Red)]);
        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn deduplicates_identical_requests() {
        let recorder = Recorder::new();
        let engine = DispatchEngine::new(recorder.clone(), params(), DEFAULT_RATE_LIMIT);

        assert!(engine.send_color(named(NamedColor::Red)).await);
        settle().await;

        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(!engine.send_color(named(NamedColor::Red)).await);
        settle().await;

        assert_eq!(recorder.applied().len(), 1);
        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_request_is_parked_then_applied() {
        let (recorder, release) = Recorder::gated();
        let engine = DispatchEngine::new(recorder.clone(), params(), DEFAULT_RATE_LIMIT);

        assert!(engine.send_color(named(NamedColor::Red)).await);
        recorder.started.acquire().await.unwrap().forget();

        // Within the rate window: rejected, but parked as pending.
        assert!(!engine.send_color(named(NamedColor::Blue)).await);

        release.add_permits(2);
        settle().await;

        // Blue was applied by the freed worker without resubmission.
        assert_eq!(
            recorder.applied(),
            vec![named(NamedColor::Red), named(NamedColor::Blue)]
        );
        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn newest_pending_supersedes_older() {
        let (recorder, release) = Recorder::gated();
        let engine = DispatchEngine::new(recorder.clone(), params(), DEFAULT_RATE_LIMIT);

        assert!(engine.send_color(named(NamedColor::Red)).await);
        recorder.started.acquire().await.unwrap().forget();

        // Two rapid requests while red is in flight; only the newest may
        // survive the mailbox.
        assert!(!engine.send_color(named(NamedColor::Blue)).await);
        assert!(!engine.send_color(named(NamedColor::Green)).await);

        release.add_permits(2);
        settle().await;

        let applied = recorder.applied();
        assert_eq!(applied, vec![named(NamedColor::Red), named(NamedColor::Green)]);
        assert!(!applied.contains(&named(NamedColor::Blue)));
        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_request_superseded_before_pickup() {
        let (recorder, release) = Recorder::gated();
        let engine = DispatchEngine::new(recorder.clone(), params(), DEFAULT_RATE_LIMIT);

        assert!(engine.send_color(named(NamedColor::Red)).await);
        recorder.started.acquire().await.unwrap().forget();

        // Past the rate window both are accepted; the second replaces the
        // first in the mailbox before the worker frees.
        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(engine.send_color(named(NamedColor::Blue)).await);
        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(engine.send_color(named(NamedColor::Green)).await);

        release.add_permits(2);
        settle().await;

        assert_eq!(
            recorder.applied(),
            vec![named(NamedColor::Red), named(NamedColor::Green)]
        );
        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_red_blue_red_collapses_to_one_red() {
        let (recorder, release) = Recorder::gated();
        let engine = DispatchEngine::new(recorder.clone(), params(), DEFAULT_RATE_LIMIT);

        assert!(engine.send_color(named(NamedColor::Red)).await);
        recorder.started.acquire().await.unwrap().forget();
        assert!(!engine.send_color(named(NamedColor::Blue)).await);
        assert!(!engine.send_color(named(NamedColor::Red)).await);

        release.add_permits(3);
        settle().await;

        // The worker applies red once; the parked red is dropped at pickup
        // because it matches last_color, and blue was superseded.
        assert_eq!(recorder.applied(), vec![named(NamedColor::Red)]);
        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn failure_arms_backoff_and_clears_last_color() {
        let recorder = Recorder::failing(1);
        let engine = DispatchEngine::new(recorder.clone(), params(), DEFAULT_RATE_LIMIT);

        assert!(engine.send_color(named(NamedColor::Red)).await);
        settle().await;
        assert!(recorder.applied().is_empty());

        // Within the 1s backoff window: rejected even past the rate limit.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!engine.send_color(named(NamedColor::Red)).await);

        // Past the window the identical spec is accepted again (last_color
        // was cleared by the failure) and now succeeds.
        tokio::time::advance(Duration::from_millis(700)).await;
        assert!(engine.send_color(named(NamedColor::Red)).await);
        settle().await;
        assert_eq!(recorder.applied(), vec![named(NamedColor::Red)]);

        // Success reset the backoff: a new color is accepted after just the
        // rate window.
        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(engine.send_color(named(NamedColor::Blue)).await);
        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_escalates_with_consecutive_failures() {
        let recorder = Recorder::failing(2);
        let engine = DispatchEngine::new(recorder.clone(), params(), DEFAULT_RATE_LIMIT);

        assert!(engine.send_color(named(NamedColor::Red)).await);
        settle().await;

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(engine.send_color(named(NamedColor::Red)).await);
        settle().await;

        // Two consecutive failures: the window is now 2s.
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(!engine.send_color(named(NamedColor::Red)).await);

        tokio::time::advance(Duration::from_millis(700)).await;
        assert!(engine.send_color(named(NamedColor::Red)).await);
        settle().await;
        assert_eq!(recorder.applied(), vec![named(NamedColor::Red)]);
        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[test]
    fn backoff_table_clamps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(5));
        assert_eq!(backoff_delay(4), Duration::from_secs(10));
        assert_eq!(backoff_delay(50), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_refuses_new_work() {
        let recorder = Recorder::new();
        let engine = DispatchEngine::new(recorder.clone(), params(), DEFAULT_RATE_LIMIT);

        engine.shutdown(Duration::from_secs(1)).await;
        assert!(!engine.send_color(named(NamedColor::Red)).await);
        settle().await;
        assert!(recorder.applied().is_empty());
    }
}
