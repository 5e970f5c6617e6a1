//! Sliding-window failure pattern tracking and structured log events
//!
//! Every classified failure is recorded here. The monitor keeps a
//! per-kind sliding window of occurrence times, computes an events-per-minute
//! frequency over the retained occurrences, and flags kinds whose frequency
//! exceeds the escalation threshold. Repeated consecutive failures of one
//! kind raise the severity of subsequent log events for that kind without
//! changing what the recovery machinery does about them.

use crate::classify::AuthErrorKind;
use aliri_clock::{Clock, DurationSecs, System, UnixTime};
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Sensitivity configuration for the pattern monitor
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    window: DurationSecs,
    escalation_threshold_per_minute: f64,
    severity_threshold: u32,
}

impl Default for MonitorConfig {
    /// Default monitoring configuration
    ///
    /// Uses a ten-minute window, an escalation threshold of five events per
    /// minute, and raises severity after five consecutive failures of the
    /// same kind.
    fn default() -> Self {
        Self {
            window: DurationSecs(600),
            escalation_threshold_per_minute: 5.0,
            severity_threshold: 5,
        }
    }
}

impl MonitorConfig {
    /// Constructs a new monitoring configuration
    pub fn new(
        window: DurationSecs,
        escalation_threshold_per_minute: f64,
        severity_threshold: u32,
    ) -> Self {
        Self {
            window,
            escalation_threshold_per_minute,
            severity_threshold,
        }
    }
}

/// A snapshot of the failure pattern for one error kind
#[derive(Clone, Copy, Debug)]
pub struct ErrorPattern {
    /// Occurrences currently retained within the window
    pub count: usize,
    /// The oldest retained occurrence
    pub first_occurrence: UnixTime,
    /// The newest retained occurrence
    pub last_occurrence: UnixTime,
    /// Events per minute over the retained occurrences
    pub frequency_per_minute: f64,
    /// Whether the frequency exceeds the escalation threshold
    pub is_escalating: bool,
}

#[derive(Debug, Default)]
struct KindEntry {
    occurrences: VecDeque<UnixTime>,
    consecutive_failures: u32,
}

/// Tracks failure occurrence patterns per error kind
#[derive(Debug)]
pub struct PatternMonitor<C = System> {
    config: MonitorConfig,
    clock: C,
    entries: HashMap<AuthErrorKind, KindEntry>,
}

impl PatternMonitor<System> {
    /// Constructs a monitor using the system clock
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_clock(config, System)
    }
}

impl<C: Clock> PatternMonitor<C> {
    /// Constructs a monitor using the provided clock
    pub fn with_clock(config: MonitorConfig, clock: C) -> Self {
        Self {
            config,
            clock,
            entries: HashMap::new(),
        }
    }

    /// Records an occurrence of the given kind and returns the updated
    /// pattern snapshot
    pub fn record(&mut self, kind: AuthErrorKind) -> ErrorPattern {
        let now = self.clock.now();
        let window = self.config.window;
        let entry = self.entries.entry(kind).or_default();
        trim_window(&mut entry.occurrences, now, window);
        entry.occurrences.push_back(now);
        entry.consecutive_failures += 1;
        let pattern = snapshot(entry, &self.config);
        if pattern.is_escalating {
            tracing::warn!(
                kind = %kind,
                count = pattern.count,
                frequency_per_minute = pattern.frequency_per_minute,
                "error frequency exceeds escalation threshold"
            );
        }
        pattern
    }

    /// Reports that recovery for the given kind succeeded
    ///
    /// Resets the kind's consecutive-failure counter; retained occurrences
    /// are unaffected.
    pub fn record_success(&mut self, kind: AuthErrorKind) {
        if let Some(entry) = self.entries.get_mut(&kind) {
            entry.consecutive_failures = 0;
        }
    }

    /// The current pattern for a kind, if any occurrences remain in the
    /// window
    ///
    /// Eviction is lazy: entries whose occurrences have all aged out of the
    /// window are dropped here, on access.
    pub fn pattern(&mut self, kind: AuthErrorKind) -> Option<ErrorPattern> {
        let now = self.clock.now();
        let window = self.config.window;
        let entry = self.entries.get_mut(&kind)?;
        trim_window(&mut entry.occurrences, now, window);
        if entry.occurrences.is_empty() {
            self.entries.remove(&kind);
            return None;
        }
        Some(snapshot(self.entries.get(&kind)?, &self.config))
    }

    /// Whether the given kind is currently escalating
    pub fn is_escalating(&mut self, kind: AuthErrorKind) -> bool {
        self.pattern(kind).map_or(false, |p| p.is_escalating)
    }

    /// Consecutive failures recorded for a kind since its last success
    pub fn consecutive_failures(&self, kind: AuthErrorKind) -> u32 {
        self.entries
            .get(&kind)
            .map_or(0, |e| e.consecutive_failures)
    }

    /// The severity at which an event of this kind should be logged
    ///
    /// `base` is raised one step (error becomes critical) once the kind's
    /// consecutive failures pass the configured threshold.
    pub fn severity_for(&self, kind: AuthErrorKind, base: Severity) -> Severity {
        if self.consecutive_failures(kind) > self.config.severity_threshold {
            base.escalate()
        } else {
            base
        }
    }
}

fn trim_window(occurrences: &mut VecDeque<UnixTime>, now: UnixTime, window: DurationSecs) {
    let cutoff = if now.0 > window.0 {
        UnixTime(now.0 - window.0)
    } else {
        UnixTime(0)
    };
    while let Some(oldest) = occurrences.front() {
        if *oldest < cutoff {
            occurrences.pop_front();
        } else {
            break;
        }
    }
}

fn snapshot(entry: &KindEntry, config: &MonitorConfig) -> ErrorPattern {
    let count = entry.occurrences.len();
    let first = *entry.occurrences.front().unwrap_or(&UnixTime(0));
    let last = *entry.occurrences.back().unwrap_or(&UnixTime(0));
    // A burst shorter than a minute still rates against a one-minute floor,
    // otherwise two events a second apart would always escalate.
    let elapsed_minutes = ((last.0.saturating_sub(first.0)) as f64 / 60.0).max(1.0);
    let frequency = count as f64 / elapsed_minutes;
    ErrorPattern {
        count,
        first_occurrence: first,
        last_occurrence: last,
        frequency_per_minute: frequency,
        is_escalating: frequency > config.escalation_threshold_per_minute,
    }
}

/// Severity of a structured log event
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Diagnostic detail
    Debug,
    /// Routine lifecycle information
    Info,
    /// Something recoverable went wrong
    Warning,
    /// A failure requiring recovery
    Error,
    /// A failure pattern warranting attention
    Critical,
}

impl Severity {
    fn escalate(self) -> Severity {
        match self {
            Severity::Debug => Severity::Info,
            Severity::Info => Severity::Warning,
            Severity::Warning => Severity::Error,
            Severity::Error | Severity::Critical => Severity::Critical,
        }
    }

    /// A stable lowercase name for use in log fields
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discrete, structured authentication log event
#[derive(Clone, Debug)]
pub struct AuthEvent {
    /// The severity computed for this event
    pub severity: Severity,
    /// The classified kind of the underlying failure
    pub kind: AuthErrorKind,
    /// The identifier of the error episode this event belongs to
    pub error_id: String,
    /// A human-readable description
    pub message: String,
    /// Recovery attempts made so far, when known
    pub attempts: Option<u32>,
    /// The kind's pattern at the time of the event, when known
    pub pattern: Option<ErrorPattern>,
}

/// A sink for structured authentication log events
///
/// Backends are interchangeable; sinks are injected wherever they are
/// needed rather than discovered through global state.
pub trait LogSink: Send + Sync {
    /// Records one event
    fn log(&self, event: &AuthEvent);
}

/// The default sink, forwarding events to `tracing`
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, event: &AuthEvent) {
        let attempts = event.attempts.unwrap_or(0);
        let escalating = event.pattern.map_or(false, |p| p.is_escalating);
        match event.severity {
            Severity::Debug => tracing::debug!(
                kind = %event.kind,
                error_id = %event.error_id,
                attempts,
                escalating,
                "{}",
                event.message
            ),
            Severity::Info => tracing::info!(
                kind = %event.kind,
                error_id = %event.error_id,
                attempts,
                escalating,
                "{}",
                event.message
            ),
            Severity::Warning => tracing::warn!(
                kind = %event.kind,
                error_id = %event.error_id,
                attempts,
                escalating,
                "{}",
                event.message
            ),
            Severity::Error => tracing::error!(
                kind = %event.kind,
                error_id = %event.error_id,
                attempts,
                escalating,
                "{}",
                event.message
            ),
            Severity::Critical => tracing::error!(
                kind = %event.kind,
                error_id = %event.error_id,
                attempts,
                escalating,
                escalated = true,
                "{}",
                event.message
            ),
        }
    }
}

/// A sink that retains events in memory
///
/// Useful for tests and for hosts that ship events to telemetry in batches.
#[derive(Debug, Default)]
pub struct VecSink {
    events: std::sync::Mutex<Vec<AuthEvent>>,
}

impl VecSink {
    /// Constructs a new, empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the events recorded so far
    pub fn events(&self) -> Vec<AuthEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl LogSink for VecSink {
    fn log(&self, event: &AuthEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
