//! The recovery state machine for authentication error episodes
//!
//! A caller that hits an authentication failure reports it here. The error
//! is classified, recorded in the pattern monitor, and wrapped in a
//! [`RecoverySession`] for the lifetime of the episode. Safe kinds are
//! retried automatically with backoff; everything else waits for an
//! explicit manual action. Collaborators are statically known: credential
//! storage is an injected [`CredentialStore`], and surrounding session code
//! listens on a typed signal channel rather than a string-named event bus.
//!
//! This is the only component that clears the credential store, and the
//! only one that declares an episode terminally failed.

use crate::classify::{self, AuthErrorKind, RecoveryAction};
use crate::jitter::{JitterSource, NullJitter};
use crate::monitor::{AuthEvent, LogSink, MonitorConfig, PatternMonitor, Severity, TracingSink};
use crate::refresh::{RefreshCoordinator, RefreshOutcome};
use crate::sources::{clear_credentials, keys, CredentialStore, TokenSource};
use aliri_clock::{Clock, System};
use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Configuration for the recovery state machine
#[derive(Clone, Debug)]
pub struct RecoveryConfig {
    max_attempts: u32,
    cooldown: Duration,
    enable_auto_recovery: bool,
    network_wait: Duration,
    backoff: crate::backoff::BackoffConfig,
}

impl Default for RecoveryConfig {
    /// Default recovery configuration
    ///
    /// Allows three attempts per episode, requires thirty seconds of
    /// cooldown before unattended recovery begins, and waits two seconds
    /// for transient network conditions to clear.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            cooldown: Duration::from_secs(30),
            enable_auto_recovery: true,
            network_wait: Duration::from_secs(2),
            backoff: crate::backoff::BackoffConfig::default(),
        }
    }
}

impl RecoveryConfig {
    /// Sets the maximum number of recovery attempts per episode
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the cooldown required before unattended recovery begins
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Enables or disables unattended recovery
    pub fn with_auto_recovery(mut self, enabled: bool) -> Self {
        self.enable_auto_recovery = enabled;
        self
    }

    /// Sets the fixed wait used for transient network failures
    pub fn with_network_wait(mut self, wait: Duration) -> Self {
        self.network_wait = wait;
        self
    }

    /// Sets the backoff shape between attempts
    pub fn with_backoff(mut self, backoff: crate::backoff::BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Where an error episode currently stands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryState {
    /// No episode is active
    Normal,
    /// An error was just reported and classified
    Caught,
    /// Unattended recovery attempts are running
    AutoRecovering,
    /// Recovery is possible but needs an explicit request
    AwaitingManualAction,
    /// The attempt budget is spent; only manual actions remain
    Exhausted,
}

/// The record of one error episode
#[derive(Clone, Debug)]
pub struct RecoverySession {
    /// A unique identifier for the episode
    pub error_id: String,
    /// The classified kind of the originating failure
    pub kind: AuthErrorKind,
    /// Recovery attempts made so far
    pub attempts: u32,
    /// The attempt budget for this episode
    pub max_attempts: u32,
    /// Whether an attempt is executing right now
    pub is_recovering: bool,
    /// When the most recent attempt ran
    pub last_attempt_at: Option<aliri_clock::UnixTime>,
}

/// The two signals surrounding session code can subscribe to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalKind {
    /// Credentials were purged; collaborators should drop their own
    /// session-derived state
    ClearRequested,
    /// The session is over; the host should route to re-authentication
    ReinitRequested,
}

/// A typed notification emitted toward surrounding session code
#[derive(Clone, Debug)]
pub struct SessionSignal {
    /// Which signal this is
    pub signal: SignalKind,
    /// The episode that produced it
    pub error_id: String,
    /// The classified kind of the originating failure
    pub kind: AuthErrorKind,
    /// Why the signal was emitted
    pub reason: String,
}

#[derive(Debug)]
struct Machine {
    state: RecoveryState,
    session: Option<RecoverySession>,
    driver: Option<JoinHandle<()>>,
    last_attempt: Option<Instant>,
}

struct Inner<S, C, J> {
    coordinator: RefreshCoordinator<S, C, J>,
    store: Arc<dyn CredentialStore>,
    signals: mpsc::UnboundedSender<SessionSignal>,
    monitor: Mutex<PatternMonitor<C>>,
    sink: Arc<dyn LogSink>,
    config: RecoveryConfig,
    clock: C,
    machine: Mutex<Machine>,
    state_tx: watch::Sender<RecoveryState>,
    // Held so state broadcasts always have at least one receiver.
    state_rx: watch::Receiver<RecoveryState>,
    error_seq: AtomicU64,
}

/// Drives recovery of authentication error episodes
///
/// Cheap to clone; clones share the same state.
pub struct RecoveryManager<S, C = System, J = NullJitter> {
    inner: Arc<Inner<S, C, J>>,
}

impl<S, C, J> Clone for RecoveryManager<S, C, J> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: TokenSource + 'static> RecoveryManager<S, System, NullJitter> {
    /// Constructs a manager with default monitoring and `tracing` logging
    pub fn new(
        coordinator: RefreshCoordinator<S, System, NullJitter>,
        store: Arc<dyn CredentialStore>,
        signals: mpsc::UnboundedSender<SessionSignal>,
        config: RecoveryConfig,
    ) -> Self {
        Self::with_parts(
            coordinator,
            store,
            signals,
            PatternMonitor::new(MonitorConfig::default()),
            Arc::new(TracingSink),
            config,
            System,
        )
    }
}

impl<S, C, J> RecoveryManager<S, C, J>
where
    S: TokenSource + 'static,
    C: Clock + Clone + Send + Sync + 'static,
    J: JitterSource + Send + 'static,
{
    /// Constructs a manager from explicitly provided collaborators
    pub fn with_parts(
        coordinator: RefreshCoordinator<S, C, J>,
        store: Arc<dyn CredentialStore>,
        signals: mpsc::UnboundedSender<SessionSignal>,
        monitor: PatternMonitor<C>,
        sink: Arc<dyn LogSink>,
        config: RecoveryConfig,
        clock: C,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(RecoveryState::Normal);
        Self {
            inner: Arc::new(Inner {
                coordinator,
                store,
                signals,
                monitor: Mutex::new(monitor),
                sink,
                config,
                clock,
                machine: Mutex::new(Machine {
                    state: RecoveryState::Normal,
                    session: None,
                    driver: None,
                    last_attempt: None,
                }),
                state_tx,
                state_rx,
                error_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Reports an authentication failure by message
    ///
    /// Classifies the failure, records it in the pattern monitor, logs a
    /// structured event, and opens a fresh episode when none is active.
    /// Returns the state the machine is now in. A report arriving while an
    /// episode is already active is recorded and logged but does not
    /// replace the running session.
    pub fn report_error(&self, message: &str) -> RecoveryState {
        self.report_classified(classify::classify(message), message)
    }

    /// Reports an authentication failure, classifying across its source
    /// chain
    pub fn report_error_source(&self, error: &(dyn Error + 'static)) -> RecoveryState {
        self.report_classified(classify::classify_error(error), &error.to_string())
    }

    fn report_classified(&self, kind: AuthErrorKind, message: &str) -> RecoveryState {
        let error_id = self.next_error_id();
        self.log_event(kind, &error_id, message, Some(0));

        let mut machine = self.inner.machine.lock().unwrap();
        if machine.state != RecoveryState::Normal {
            tracing::debug!(
                %kind,
                state = ?machine.state,
                "error reported while an episode is active; keeping current session"
            );
            return machine.state;
        }

        machine.session = Some(RecoverySession {
            error_id: error_id.clone(),
            kind,
            attempts: 0,
            max_attempts: self.inner.config.max_attempts,
            is_recovering: false,
            last_attempt_at: None,
        });
        self.set_state(&mut machine, RecoveryState::Caught);

        let cooldown_ok = machine
            .last_attempt
            .map_or(true, |t| t.elapsed() >= self.inner.config.cooldown);

        if self.inner.config.enable_auto_recovery && kind.is_auto_recoverable() && cooldown_ok {
            if let Some(session) = machine.session.as_mut() {
                session.is_recovering = true;
            }
            self.set_state(&mut machine, RecoveryState::AutoRecovering);
            let this = self.clone();
            machine.driver = Some(tokio::spawn(this.drive()));
            tracing::info!(%kind, error_id = %error_id, "starting unattended recovery");
        } else {
            self.set_state(&mut machine, RecoveryState::AwaitingManualAction);
            tracing::info!(
                %kind,
                error_id = %error_id,
                auto = self.inner.config.enable_auto_recovery,
                cooldown_ok,
                "recovery requires a manual action"
            );
        }
        machine.state
    }

    /// The unattended retry loop; runs as a spawned task per episode
    //
    // Boxed rather than an `async fn`: the opaque futures of `drive` and
    // `run_attempt` would otherwise contain each other, making the `Send`
    // auto-trait obligation cyclic and unprovable.
    fn drive(self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
        loop {
            let attempt = {
                let machine = self.inner.machine.lock().unwrap();
                if machine.state != RecoveryState::AutoRecovering {
                    return;
                }
                match &machine.session {
                    Some(session) => session.attempts,
                    None => return,
                }
            };
            let delay = self.inner.config.backoff.delay_for_attempt(attempt + 1);
            tokio::time::sleep(delay).await;
            match self.run_attempt().await {
                RecoveryState::AutoRecovering => continue,
                _ => return,
            }
        }
        })
    }

    /// Executes one recovery attempt and applies the resulting transition
    async fn run_attempt(&self) -> RecoveryState {
        let (kind, error_id) = {
            let mut machine = self.inner.machine.lock().unwrap();
            match machine.session.as_mut() {
                Some(session) => {
                    session.is_recovering = true;
                    (session.kind, session.error_id.clone())
                }
                None => return machine.state,
            }
        };

        let action = kind.default_action();
        tracing::debug!(%kind, error_id = %error_id, ?action, "executing recovery attempt");
        let result = self.execute_action(kind, &error_id, action).await;

        let mut machine = self.inner.machine.lock().unwrap();
        machine.last_attempt = Some(Instant::now());
        let session = match machine.session.as_mut() {
            Some(session) => session,
            // The episode was resolved out from under the attempt
            // (a manual clear raced it); nothing left to record.
            None => return machine.state,
        };
        session.is_recovering = false;
        session.last_attempt_at = Some(self.inner.clock.now());

        match result {
            Ok(()) => {
                self.inner.monitor.lock().unwrap().record_success(kind);
                self.log_recovery(kind, &error_id, "recovery attempt succeeded");
                machine.session = None;
                self.set_state(&mut machine, RecoveryState::Normal);
            }
            Err(message) => {
                session.attempts += 1;
                let attempts = session.attempts;
                self.log_event(kind, &error_id, &message, Some(attempts));
                if attempts >= self.inner.config.max_attempts {
                    tracing::error!(
                        %kind,
                        error_id = %error_id,
                        attempts,
                        "recovery attempts exhausted"
                    );
                    self.set_state(&mut machine, RecoveryState::Exhausted);
                } else if self.inner.config.enable_auto_recovery && kind.is_auto_recoverable() {
                    self.set_state(&mut machine, RecoveryState::AutoRecovering);
                    // A manual retry has no drive loop behind it; without
                    // one the next attempt would never be scheduled.
                    if machine.driver.as_ref().map_or(true, |d| d.is_finished()) {
                        let this = self.clone();
                        machine.driver = Some(tokio::spawn(this.drive()));
                    }
                } else {
                    self.set_state(&mut machine, RecoveryState::AwaitingManualAction);
                }
            }
        }
        machine.state
    }

    async fn execute_action(
        &self,
        kind: AuthErrorKind,
        error_id: &str,
        action: RecoveryAction,
    ) -> Result<(), String> {
        match action {
            RecoveryAction::Refresh => match self.inner.coordinator.refresh().await {
                RefreshOutcome::Success(token) => {
                    // The token already passed validation inside the
                    // coordinator; persisting it here keeps the store the
                    // machine's exclusive concern.
                    self.inner.store.set(keys::ACCESS_TOKEN, token.as_str());
                    self.inner.coordinator.schedule_proactive_check(&token);
                    Ok(())
                }
                RefreshOutcome::Failed { message, .. } => Err(message),
                RefreshOutcome::Debounced => Err("refresh attempt was debounced".to_owned()),
                RefreshOutcome::AlreadyInProgress => {
                    Err("a refresh is already in progress".to_owned())
                }
            },
            RecoveryAction::ClearSession => {
                clear_credentials(self.inner.store.as_ref());
                self.send_signal(
                    SignalKind::ClearRequested,
                    kind,
                    error_id,
                    "credentials cleared during recovery",
                );
                Ok(())
            }
            RecoveryAction::Logout => {
                clear_credentials(self.inner.store.as_ref());
                self.send_signal(
                    SignalKind::ClearRequested,
                    kind,
                    error_id,
                    "credentials cleared before logout",
                );
                self.send_signal(
                    SignalKind::ReinitRequested,
                    kind,
                    error_id,
                    "session terminated after failed refresh",
                );
                Ok(())
            }
            RecoveryAction::None => {
                // Nothing corrective to do for a transient blip; wait it
                // out and declare the attempt complete.
                tokio::time::sleep(self.inner.config.network_wait).await;
                Ok(())
            }
        }
    }

    /// Runs one recovery attempt on demand
    ///
    /// Valid whenever an episode is active, including from
    /// [`RecoveryState::Exhausted`]; the cooldown that gates unattended
    /// recovery does not apply to an explicit request.
    pub async fn retry(&self) -> RecoveryState {
        {
            let machine = self.inner.machine.lock().unwrap();
            match machine.state {
                RecoveryState::Caught
                | RecoveryState::AwaitingManualAction
                | RecoveryState::Exhausted => {}
                state => return state,
            }
        }
        self.run_attempt().await
    }

    /// Purges all persisted credentials and resolves the episode
    pub fn clear_session(&self) {
        let (kind, error_id) = self.episode_context();
        let mut machine = self.inner.machine.lock().unwrap();
        if let Some(driver) = machine.driver.take() {
            driver.abort();
        }
        clear_credentials(self.inner.store.as_ref());
        self.send_signal(
            SignalKind::ClearRequested,
            kind,
            &error_id,
            "session cleared on request",
        );
        machine.session = None;
        self.set_state(&mut machine, RecoveryState::Normal);
    }

    /// Routes toward re-authentication
    ///
    /// Credentials are always cleared first so no stale credential survives
    /// the transition.
    pub fn reauthenticate(&self) {
        let (kind, error_id) = self.episode_context();
        let mut machine = self.inner.machine.lock().unwrap();
        if let Some(driver) = machine.driver.take() {
            driver.abort();
        }
        clear_credentials(self.inner.store.as_ref());
        self.send_signal(
            SignalKind::ClearRequested,
            kind,
            &error_id,
            "credentials cleared before re-authentication",
        );
        self.send_signal(
            SignalKind::ReinitRequested,
            kind,
            &error_id,
            "re-authentication requested",
        );
        machine.session = None;
        self.set_state(&mut machine, RecoveryState::Normal);
    }

    /// Cancels scheduled work ahead of teardown
    ///
    /// Aborts the machine's own retry driver and resets the coordinator,
    /// cancelling its timers as well.
    pub fn shutdown(&self) {
        let mut machine = self.inner.machine.lock().unwrap();
        if let Some(driver) = machine.driver.take() {
            driver.abort();
        }
        drop(machine);
        self.inner.coordinator.reset();
        tracing::debug!("recovery manager shut down");
    }

    /// The machine's current state
    pub fn state(&self) -> RecoveryState {
        self.inner.machine.lock().unwrap().state
    }

    /// A snapshot of the active episode, if any
    pub fn session(&self) -> Option<RecoverySession> {
        self.inner.machine.lock().unwrap().session.clone()
    }

    /// A receiver that observes every state transition
    pub fn watch_state(&self) -> watch::Receiver<RecoveryState> {
        self.inner.state_rx.clone()
    }

    /// The status line the boundary should present for the active episode
    pub fn status_message(&self) -> Option<&'static str> {
        self.inner
            .machine
            .lock()
            .unwrap()
            .session
            .as_ref()
            .map(|s| s.kind.user_message())
    }

    /// Whether failures of the given kind are currently escalating
    pub fn is_escalating(&self, kind: AuthErrorKind) -> bool {
        self.inner.monitor.lock().unwrap().is_escalating(kind)
    }

    /// The current failure pattern for the given kind
    pub fn pattern(&self, kind: AuthErrorKind) -> Option<crate::monitor::ErrorPattern> {
        self.inner.monitor.lock().unwrap().pattern(kind)
    }

    /// The refresh coordinator this manager drives
    pub fn coordinator(&self) -> &RefreshCoordinator<S, C, J> {
        &self.inner.coordinator
    }

    fn set_state(&self, machine: &mut Machine, state: RecoveryState) {
        if machine.state != state {
            tracing::trace!(from = ?machine.state, to = ?state, "recovery state transition");
        }
        machine.state = state;
        let _ = self.inner.state_tx.send(state);
    }

    fn episode_context(&self) -> (AuthErrorKind, String) {
        let machine = self.inner.machine.lock().unwrap();
        match &machine.session {
            Some(session) => (session.kind, session.error_id.clone()),
            None => (AuthErrorKind::ValidationError, self.next_error_id()),
        }
    }

    fn next_error_id(&self) -> String {
        let seq = self.inner.error_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("auth-{}-{}", self.inner.clock.now().0, seq)
    }

    fn send_signal(&self, signal: SignalKind, kind: AuthErrorKind, error_id: &str, reason: &str) {
        let sent = self.inner.signals.send(SessionSignal {
            signal,
            error_id: error_id.to_owned(),
            kind,
            reason: reason.to_owned(),
        });
        if sent.is_err() {
            tracing::debug!(?signal, "no listener for session signals");
        }
    }

    fn log_event(&self, kind: AuthErrorKind, error_id: &str, message: &str, attempts: Option<u32>) {
        let (severity, pattern) = {
            let mut monitor = self.inner.monitor.lock().unwrap();
            let pattern = if attempts == Some(0) {
                // A fresh report counts as an occurrence; attempt failures
                // within the episode do not re-count it.
                Some(monitor.record(kind))
            } else {
                monitor.pattern(kind)
            };
            (monitor.severity_for(kind, Severity::Error), pattern)
        };
        self.inner.sink.log(&AuthEvent {
            severity,
            kind,
            error_id: error_id.to_owned(),
            message: message.to_owned(),
            attempts,
            pattern,
        });
    }

    fn log_recovery(&self, kind: AuthErrorKind, error_id: &str, message: &str) {
        self.inner.sink.log(&AuthEvent {
            severity: Severity::Info,
            kind,
            error_id: error_id.to_owned(),
            message: message.to_owned(),
            attempts: None,
            pattern: None,
        });
    }
}

impl<S, C, J> std::fmt::Debug for RecoveryManager<S, C, J>
where
    C: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("clock", &self.inner.clock)
            .field("machine", &self.inner.machine)
            .finish()
    }
}
