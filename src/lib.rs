//! Client-side lifecycle management and failure recovery for bearer tokens
//!
//! A long-lived client session authenticates with a signed, expiring bearer
//! token. This crate owns the hard part of keeping that credential healthy:
//! validating tokens, coordinating refreshes so that concurrent callers
//! never trigger duplicate work, scheduling proactive renewal ahead of
//! expiry, and classifying failures precisely enough to drive a safe,
//! bounded recovery strategy when things go wrong.
//!
//! The crate never verifies token signatures; that is the server's job. It
//! only decodes the unsigned claims segment to reason about expiry and
//! shape.
//!
//! # Layout
//!
//! The pieces compose from the leaves up:
//!
//! * [`validate`] decodes a token's claims and reports structural or expiry
//!   problems as values, never as errors.
//! * [`classify`] maps arbitrary failures into a closed taxonomy of
//!   [`AuthErrorKind`][classify::AuthErrorKind]s, each with a fixed default
//!   recovery action.
//! * [`refresh`] owns single-flight and debounce semantics around the
//!   host-supplied token operation, with bounded, jittered backoff.
//! * [`recovery`] reacts to classified failures: it retries safe kinds
//!   automatically, clears credentials when the session is beyond saving,
//!   and notifies surrounding code through typed signals.
//! * [`monitor`] keeps a sliding-window frequency model per error kind so
//!   the host can tell an isolated hiccup from an escalating pattern.
//!
//! # Getting started
//!
//! Wire a [`TokenSource`][sources::TokenSource] (however your application
//! obtains tokens) into a [`RefreshCoordinator`][refresh::RefreshCoordinator],
//! then hand that plus a credential store and a signal channel to a
//! [`RecoveryManager`][recovery::RecoveryManager]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokenkeeper::{
//!     recovery::{RecoveryConfig, RecoveryManager},
//!     refresh::{RefreshConfig, RefreshCoordinator},
//!     sources::MemoryCredentialStore,
//! };
//!
//! # use tokenkeeper::{AccessToken, sources::TokenSource};
//! # use async_trait::async_trait;
//! # struct MySource;
//! # #[async_trait]
//! # impl TokenSource for MySource {
//! #     type Error = std::io::Error;
//! #     async fn request_token(&mut self) -> Result<AccessToken, Self::Error> {
//! #         unimplemented!()
//! #     }
//! # }
//! # async fn example() {
//! let coordinator = RefreshCoordinator::new(MySource, RefreshConfig::default());
//! let store = Arc::new(MemoryCredentialStore::new());
//! let (signal_tx, mut signal_rx) = tokio::sync::mpsc::unbounded_channel();
//!
//! let manager = RecoveryManager::new(
//!     coordinator,
//!     store,
//!     signal_tx,
//!     RecoveryConfig::default(),
//! );
//!
//! // An API wrapper that hits an auth failure reports it and lets the
//! // machine decide what is safe to do about it.
//! manager.report_error("Token has expired");
//!
//! // Surrounding session code reacts to typed signals instead of a
//! // string-named event bus.
//! while let Some(signal) = signal_rx.recv().await {
//!     println!("session signal: {:?}", signal);
//! }
//! # }
//! ```
//!
//! Instances are explicitly constructed and owned; nothing in this crate is
//! a process-wide singleton, so multiple independent sessions (and tests)
//! can coexist.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod backoff;
mod braids;
pub mod classify;
pub mod jitter;
pub mod monitor;
pub mod recovery;
pub mod refresh;
pub mod sources;
pub mod validate;

pub use braids::*;
pub use classify::{classify, classify_error, AuthErrorKind, RecoveryAction};
pub use recovery::{RecoveryManager, RecoveryState, SessionSignal, SignalKind};
pub use refresh::{RefreshCoordinator, RefreshOutcome};
pub use validate::{Claims, ValidationResult};
