//! Single-flight refresh coordination with debounce and bounded retries
//!
//! The coordinator owns all mutable refresh state. Callers that ask for a
//! refresh while one is outstanding are joined onto the in-flight attempt
//! through a shared watch channel, so the token source is invoked exactly
//! once per flight and every caller observes the identical outcome. A token
//! returned by the source is validated before anyone sees it; a source that
//! hands back garbage produces a failure, never a success.

use crate::backoff::BackoffConfig;
use crate::jitter::{JitterSource, NullJitter};
use crate::sources::TokenSource;
use crate::validate::{self, ValidationResult};
use crate::AccessToken;
use aliri_clock::{Clock, DurationSecs, System};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Configuration for the refresh coordinator
#[derive(Clone, Debug)]
pub struct RefreshConfig {
    max_retries: u32,
    debounce: Duration,
    proactive_lead: DurationSecs,
    backoff: BackoffConfig,
}

impl Default for RefreshConfig {
    /// Default refresh configuration
    ///
    /// Allows three retries, debounces attempts closer together than one
    /// second, and arms proactive checks five minutes ahead of expiry.
    fn default() -> Self {
        Self {
            max_retries: 3,
            debounce: Duration::from_secs(1),
            proactive_lead: DurationSecs(300),
            backoff: BackoffConfig::default(),
        }
    }
}

impl RefreshConfig {
    /// Sets the maximum number of consecutive failed attempts before the
    /// caller is told to stop retrying
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the minimum spacing between refresh attempts
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Sets how far ahead of expiry the proactive check fires
    pub fn with_proactive_lead(mut self, lead: DurationSecs) -> Self {
        self.proactive_lead = lead;
        self
    }

    /// Sets the backoff shape for failed attempts
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

/// The outcome of a refresh request
#[derive(Clone, Debug)]
pub enum RefreshOutcome {
    /// A fresh, validated token
    Success(AccessToken),
    /// The attempt failed
    Failed {
        /// What went wrong
        message: String,
        /// Whether the retry budget permits another attempt
        should_retry: bool,
        /// The backoff delay the caller should wait before retrying, when
        /// retrying is permitted
        retry_after: Option<Duration>,
    },
    /// The request was dropped because an attempt just finished
    Debounced,
    /// A refresh is already running; the caller chose not to wait for it
    AlreadyInProgress,
}

impl RefreshOutcome {
    /// Whether this outcome carries a fresh token
    pub fn is_success(&self) -> bool {
        matches!(self, RefreshOutcome::Success(_))
    }
}

type OutcomeReceiver = watch::Receiver<Option<RefreshOutcome>>;

#[derive(Debug, Default)]
struct RefreshState {
    in_flight: Option<OutcomeReceiver>,
    retry_count: u32,
    last_attempt: Option<Instant>,
    scheduled_check: Option<JoinHandle<()>>,
    // Incremented by reset(); a flight started under an older epoch
    // completes but records nothing.
    epoch: u64,
}

#[derive(Debug)]
struct Inner<S, C, J> {
    source: tokio::sync::Mutex<S>,
    state: Mutex<RefreshState>,
    jitter: Mutex<J>,
    config: RefreshConfig,
    clock: C,
}

/// Coordinates token refreshes against a [`TokenSource`]
///
/// Cheap to clone; clones share the same state.
#[derive(Debug)]
pub struct RefreshCoordinator<S, C = System, J = NullJitter> {
    inner: Arc<Inner<S, C, J>>,
}

impl<S, C, J> Clone for RefreshCoordinator<S, C, J> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

enum Begin {
    Started(OutcomeReceiver),
    Joined(OutcomeReceiver),
    Debounced,
}

impl<S: TokenSource + 'static> RefreshCoordinator<S, System, NullJitter> {
    /// Constructs a coordinator with the system clock and no jitter
    pub fn new(source: S, config: RefreshConfig) -> Self {
        Self::with_clock_and_jitter(source, config, System, NullJitter)
    }
}

impl<S, C, J> RefreshCoordinator<S, C, J>
where
    S: TokenSource + 'static,
    C: Clock + Send + Sync + 'static,
    J: JitterSource + Send + 'static,
{
    /// Constructs a coordinator with a custom clock and jitter source
    pub fn with_clock_and_jitter(source: S, config: RefreshConfig, clock: C, jitter: J) -> Self {
        Self {
            inner: Arc::new(Inner {
                source: tokio::sync::Mutex::new(source),
                state: Mutex::new(RefreshState::default()),
                jitter: Mutex::new(jitter),
                config,
                clock,
            }),
        }
    }

    /// Requests a refresh and waits for its outcome
    ///
    /// Joins an in-flight attempt when one exists; otherwise either starts a
    /// new attempt or reports [`RefreshOutcome::Debounced`] when the
    /// previous attempt was too recent.
    pub async fn refresh(&self) -> RefreshOutcome {
        match self.begin() {
            Begin::Started(rx) | Begin::Joined(rx) => await_outcome(rx).await,
            Begin::Debounced => RefreshOutcome::Debounced,
        }
    }

    /// Starts a refresh without waiting for its outcome
    ///
    /// Used by timer-driven callers. Returns [`RefreshOutcome::AlreadyInProgress`]
    /// when an attempt is running (or was just started), or
    /// [`RefreshOutcome::Debounced`] when the request was dropped.
    pub fn refresh_nowait(&self) -> RefreshOutcome {
        match self.begin() {
            Begin::Started(_) | Begin::Joined(_) => RefreshOutcome::AlreadyInProgress,
            Begin::Debounced => RefreshOutcome::Debounced,
        }
    }

    fn begin(&self) -> Begin {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(rx) = &state.in_flight {
            tracing::trace!("joining in-flight refresh");
            return Begin::Joined(rx.clone());
        }
        if let Some(last) = state.last_attempt {
            if last.elapsed() < self.inner.config.debounce {
                tracing::debug!("refresh request debounced");
                return Begin::Debounced;
            }
        }
        state.last_attempt = Some(Instant::now());
        let (tx, rx) = watch::channel(None);
        state.in_flight = Some(rx.clone());
        let epoch = state.epoch;
        drop(state);

        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.execute(epoch).await;
            let _ = tx.send(Some(outcome));
        });
        Begin::Started(rx)
    }

    /// Performs the remote call, validates the result, and records the
    /// retry bookkeeping. Runs inside the spawned flight task.
    async fn execute(&self, epoch: u64) -> RefreshOutcome {
        tracing::debug!("requesting new token from source");
        let result = {
            let mut source = self.inner.source.lock().await;
            source.request_token().await
        };

        // The invalid-token guard: a token is validated strictly after the
        // source resolves and strictly before anyone can observe it.
        let checked = match result {
            Ok(token) => match validate::decode_with_clock(token.as_str(), &self.inner.clock) {
                ValidationResult::Valid(_) => Ok(token),
                ValidationResult::Invalid { kind, message, .. } => Err(format!(
                    "source returned an unusable token ({}): {}",
                    kind, message
                )),
            },
            Err(err) => Err(err.to_string()),
        };

        let mut state = self.inner.state.lock().unwrap();
        if state.epoch != epoch {
            tracing::debug!("refresh flight outlived a reset; discarding bookkeeping");
            return match checked {
                Ok(token) => RefreshOutcome::Success(token),
                Err(message) => RefreshOutcome::Failed {
                    message,
                    should_retry: false,
                    retry_after: None,
                },
            };
        }
        state.in_flight = None;

        match checked {
            Ok(token) => {
                state.retry_count = 0;
                tracing::info!("token refresh succeeded");
                RefreshOutcome::Success(token)
            }
            Err(message) => {
                state.retry_count += 1;
                if state.retry_count <= self.inner.config.max_retries {
                    let attempt = state.retry_count;
                    let delay = {
                        let mut jitter = self.inner.jitter.lock().unwrap();
                        self.inner.config.backoff.jittered_delay(attempt, &mut *jitter)
                    };
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %message,
                        "token refresh failed; caller may retry"
                    );
                    RefreshOutcome::Failed {
                        message,
                        should_retry: true,
                        retry_after: Some(delay),
                    }
                } else {
                    state.retry_count = 0;
                    tracing::error!(%message, "token refresh failed; retry budget exhausted");
                    RefreshOutcome::Failed {
                        message,
                        should_retry: false,
                        retry_after: None,
                    }
                }
            }
        }
    }

    /// Arms a one-shot check ahead of the token's expiry
    ///
    /// Any previously scheduled check is cancelled. The check fires
    /// `proactive_lead` before the token expires (it is skipped entirely
    /// when that moment has already passed) and re-validates the token; a
    /// token found unusable at that point triggers a background refresh.
    pub fn schedule_proactive_check(&self, token: &AccessToken) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(handle) = state.scheduled_check.take() {
            handle.abort();
        }

        let claims = match validate::decode_with_clock(token.as_str(), &self.inner.clock) {
            ValidationResult::Valid(claims) => claims,
            ValidationResult::Invalid { kind, .. } => {
                tracing::debug!(%kind, "not scheduling proactive check for an unusable token");
                return;
            }
        };
        let expiry = match claims.expiration_time() {
            Some(expiry) => expiry,
            None => {
                tracing::debug!("token has no expiry; skipping proactive check");
                return;
            }
        };

        let now = self.inner.clock.now();
        let lead = self.inner.config.proactive_lead;
        if expiry.0 <= now.0 + lead.0 {
            tracing::debug!(
                expiry = expiry.0,
                "proactive check window already past; skipping"
            );
            return;
        }
        let fire_at = expiry - lead;
        let delay: Duration = (fire_at - now).into();

        let this = self.clone();
        let token = token.clone();
        tracing::debug!(
            fire_at = fire_at.0,
            delay_secs = delay.as_secs(),
            "proactive expiry check scheduled"
        );
        state.scheduled_check = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match validate::decode_with_clock(token.as_str(), &this.inner.clock) {
                ValidationResult::Valid(_) => {
                    tracing::trace!("token still usable at proactive check");
                }
                ValidationResult::Invalid { kind, .. } => {
                    tracing::info!(%kind, "proactive check found token unusable; refreshing");
                    let _ = this.refresh_nowait();
                }
            }
        }));
    }

    /// Cancels timers and discards all refresh state
    ///
    /// Safe to call while a refresh is outstanding: the flight completes
    /// and resolves for its original awaiters, but its bookkeeping is
    /// discarded.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(handle) = state.scheduled_check.take() {
            handle.abort();
        }
        state.in_flight = None;
        state.retry_count = 0;
        state.last_attempt = None;
        state.epoch = state.epoch.wrapping_add(1);
        tracing::debug!("refresh coordinator reset");
    }

    /// The number of consecutive failed attempts so far
    pub fn retry_count(&self) -> u32 {
        self.inner.state.lock().unwrap().retry_count
    }

    /// Whether a refresh is currently in flight
    pub fn is_refreshing(&self) -> bool {
        self.inner.state.lock().unwrap().in_flight.is_some()
    }
}

async fn await_outcome(mut rx: OutcomeReceiver) -> RefreshOutcome {
    loop {
        let current = rx.borrow().clone();
        if let Some(outcome) = current {
            return outcome;
        }
        if rx.changed().await.is_err() {
            // The flight task was torn down without reporting.
            return RefreshOutcome::Failed {
                message: "refresh task quit without reporting an outcome".to_owned(),
                should_retry: true,
                retry_after: None,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aliri_base64::Base64Url;
    use aliri_clock::UnixTime;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use thiserror::Error;
    use tokio::sync::Notify;

    #[derive(Debug, Error)]
    #[error("{0}")]
    struct SourceError(String);

    fn token_expiring_at(exp: u64) -> AccessToken {
        let payload = Base64Url::from_raw(format!(r#"{{"exp":{}}}"#, exp).into_bytes());
        AccessToken::from(format!("hdr.{}.sig", payload))
    }

    fn eternal_token() -> AccessToken {
        let payload = Base64Url::from_raw(&br#"{"sub":"user-1"}"#[..]);
        AccessToken::from(format!("hdr.{}.sig", payload))
    }

    /// Returns scripted responses; waits on a gate first when one is set.
    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<AccessToken, String>>>,
        calls: Arc<AtomicU32>,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<AccessToken, String>>) -> (Self, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            (
                Self {
                    responses: Mutex::new(responses.into()),
                    calls: Arc::clone(&calls),
                    gate: None,
                },
                calls,
            )
        }

        fn gated(
            responses: Vec<Result<AccessToken, String>>,
        ) -> (Self, Arc<AtomicU32>, Arc<Notify>) {
            let (mut source, calls) = Self::new(responses);
            let gate = Arc::new(Notify::new());
            source.gate = Some(Arc::clone(&gate));
            (source, calls, gate)
        }
    }

    #[async_trait]
    impl TokenSource for ScriptedSource {
        type Error = SourceError;

        async fn request_token(&mut self) -> Result<AccessToken, Self::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err("script exhausted".to_owned()))
                .map_err(SourceError)
        }
    }

    fn coordinator(source: ScriptedSource, config: RefreshConfig) -> RefreshCoordinator<ScriptedSource> {
        RefreshCoordinator::new(source, config)
    }

    #[tokio::test(start_paused = true)]
    async fn successful_refresh_returns_the_new_token() {
        let (source, calls) = ScriptedSource::new(vec![Ok(eternal_token())]);
        let coord = coordinator(source, RefreshConfig::default());
        let outcome = coord.refresh().await;
        assert!(outcome.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coord.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_flight() {
        let (source, calls, gate) = ScriptedSource::gated(vec![Ok(eternal_token())]);
        let coord = coordinator(source, RefreshConfig::default());

        let mut handles = Vec::new();
        for _ in 0..5 {
            let coord = coord.clone();
            handles.push(tokio::spawn(async move { coord.refresh().await }));
        }
        // Let every caller reach the join point, then open the gate.
        tokio::task::yield_now().await;
        assert!(coord.is_refreshing());
        gate.notify_one();

        for handle in handles {
            let outcome = handle.await.unwrap();
            assert!(outcome.is_success(), "got {:?}", outcome);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_call_inside_debounce_window_is_dropped() {
        let (source, calls) =
            ScriptedSource::new(vec![Ok(eternal_token()), Ok(eternal_token())]);
        let coord = coordinator(source, RefreshConfig::default());

        assert!(coord.refresh().await.is_success());
        let outcome = coord.refresh().await;
        assert!(matches!(outcome, RefreshOutcome::Debounced));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Outside the window the next call goes through.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(coord.refresh().await.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_back_off_then_exhaust_the_budget() {
        let (source, _) = ScriptedSource::new(vec![
            Err("boom".to_owned()),
            Err("boom".to_owned()),
            Err("boom".to_owned()),
        ]);
        let config = RefreshConfig::default()
            .with_max_retries(2)
            .with_debounce(Duration::ZERO)
            .with_backoff(BackoffConfig::new(
                Duration::from_millis(100),
                Duration::from_secs(10),
            ));
        let coord = coordinator(source, config);

        match coord.refresh().await {
            RefreshOutcome::Failed {
                should_retry,
                retry_after,
                ..
            } => {
                assert!(should_retry);
                assert_eq!(retry_after, Some(Duration::from_millis(100)));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(coord.retry_count(), 1);

        match coord.refresh().await {
            RefreshOutcome::Failed {
                should_retry,
                retry_after,
                ..
            } => {
                assert!(should_retry);
                assert_eq!(retry_after, Some(Duration::from_millis(200)));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(coord.retry_count(), 2);

        // Budget exceeded: no more retries, and the count starts fresh.
        match coord.refresh().await {
            RefreshOutcome::Failed {
                should_retry,
                retry_after,
                ..
            } => {
                assert!(!should_retry);
                assert_eq!(retry_after, None);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(coord.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_token_from_source_is_a_failure() {
        let (source, _) = ScriptedSource::new(vec![Ok(AccessToken::from("hdr.!!!!.sig"))]);
        let coord = coordinator(source, RefreshConfig::default());
        match coord.refresh().await {
            RefreshOutcome::Failed {
                message,
                should_retry,
                ..
            } => {
                assert!(should_retry);
                assert!(message.contains("unusable token"), "message: {}", message);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_from_source_is_a_failure() {
        let (source, _) = ScriptedSource::new(vec![Ok(token_expiring_at(0))]);
        let coord = coordinator(source, RefreshConfig::default());
        assert!(!coord.refresh().await.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_retry_count() {
        let (source, _) = ScriptedSource::new(vec![Err("boom".to_owned()), Ok(eternal_token())]);
        let config = RefreshConfig::default().with_debounce(Duration::ZERO);
        let coord = coordinator(source, config);
        assert!(!coord.refresh().await.is_success());
        assert_eq!(coord.retry_count(), 1);
        assert!(coord.refresh().await.is_success());
        assert_eq!(coord.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_discards_in_flight_bookkeeping() {
        let (source, _, gate) = ScriptedSource::gated(vec![Err("boom".to_owned())]);
        let coord = coordinator(source, RefreshConfig::default());

        let waiter = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.refresh().await })
        };
        tokio::task::yield_now().await;
        assert!(coord.is_refreshing());

        coord.reset();
        assert!(!coord.is_refreshing());
        gate.notify_one();

        // The original caller still sees the flight resolve, but the
        // coordinator recorded nothing from it.
        let outcome = waiter.await.unwrap();
        assert!(matches!(outcome, RefreshOutcome::Failed { .. }));
        assert_eq!(coord.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn nowait_reports_in_progress() {
        let (source, calls, gate) = ScriptedSource::gated(vec![Ok(eternal_token())]);
        let coord = coordinator(source, RefreshConfig::default());

        assert!(matches!(
            coord.refresh_nowait(),
            RefreshOutcome::AlreadyInProgress
        ));
        tokio::task::yield_now().await;
        assert!(matches!(
            coord.refresh_nowait(),
            RefreshOutcome::AlreadyInProgress
        ));
        gate.notify_one();
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// A clock whose time the test can move while the coordinator holds it
    #[derive(Clone, Debug)]
    struct SharedClock(Arc<std::sync::atomic::AtomicU64>);

    impl SharedClock {
        fn at(time: u64) -> Self {
            Self(Arc::new(std::sync::atomic::AtomicU64::new(time)))
        }

        fn set(&self, time: u64) {
            self.0.store(time, Ordering::SeqCst);
        }
    }

    impl Clock for SharedClock {
        fn now(&self) -> UnixTime {
            UnixTime(self.0.load(Ordering::SeqCst))
        }
    }

    fn clocked_coordinator(
        source: ScriptedSource,
        config: RefreshConfig,
        clock: SharedClock,
    ) -> RefreshCoordinator<ScriptedSource, SharedClock> {
        RefreshCoordinator::with_clock_and_jitter(source, config, clock, NullJitter)
    }

    #[tokio::test(start_paused = true)]
    async fn proactive_check_refreshes_an_expiring_token() {
        let (source, calls) = ScriptedSource::new(vec![Ok(eternal_token())]);
        let config = RefreshConfig::default().with_proactive_lead(DurationSecs(0));
        let clock = SharedClock::at(1_000);
        let coord = clocked_coordinator(source, config, clock.clone());

        coord.schedule_proactive_check(&token_expiring_at(1_060));

        // By the time the check fires, the expiry has come and gone, so the
        // check kicks off a background refresh.
        clock.set(2_000);
        tokio::time::sleep(Duration::from_secs(61)).await;
        // Give the background flight a chance to run to completion.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn proactive_check_is_skipped_when_the_window_has_passed() {
        let (source, calls) = ScriptedSource::new(vec![Ok(eternal_token())]);
        let clock = SharedClock::at(1_000);
        let coord = clocked_coordinator(source, RefreshConfig::default(), clock);

        // Expires in 60 s with a 300 s lead: the fire time is in the past.
        coord.schedule_proactive_check(&token_expiring_at(1_060));
        tokio::time::sleep(Duration::from_secs(400)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_cancels_the_previous_check() {
        let (source, calls) = ScriptedSource::new(vec![Ok(eternal_token())]);
        let config = RefreshConfig::default().with_proactive_lead(DurationSecs(0));
        let clock = SharedClock::at(1_000);
        let coord = clocked_coordinator(source, config, clock.clone());

        coord.schedule_proactive_check(&token_expiring_at(1_002));
        // The replacement expires far in the future; the first check must
        // not fire even once its original deadline passes.
        coord.schedule_proactive_check(&token_expiring_at(101_000));
        clock.set(5_000);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
