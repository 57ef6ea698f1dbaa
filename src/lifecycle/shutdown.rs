//! Shutdown coordination.
//!
//! A [`ShutdownManager`] collects named cleanup handlers and runs them all,
//! concurrently and exactly once, when shutdown is triggered either by a
//! call to [`ShutdownManager::shutdown`] or by one of its OS signals.
//!
//! # Design Decisions
//! - One deadline for the whole sequence; every handler sees the same one
//! - Handlers that overrun are reported as timed out, not aborted
//! - Every failure is kept; the caller gets them all in one [`ShutdownError`]
//! - The sequence runs in its own task so a caller dropping its future
//!   cannot leave the manager half shut down

use std::error::Error as StdError;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{Instrument, Span};

use crate::lifecycle::signals::{ShutdownSignal, SignalListener};
use crate::observability::metrics;
use crate::BoxError;

/// Default deadline for the sequence when the trigger carries none.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline shared by every handler of one shutdown sequence.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownContext {
    deadline: Instant,
}

impl ShutdownContext {
    pub fn new(deadline: Instant) -> Self {
        Self { deadline }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline, zero once it passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Resolves when the deadline passes.
    pub async fn expired(&self) {
        tokio::time::sleep_until(self.deadline).await
    }
}

/// A cleanup action run during shutdown.
///
/// Implemented for every `Fn(ShutdownContext) -> impl Future<Output =
/// Result<(), BoxError>>`. Handlers should watch the context's deadline and
/// return promptly once it passes.
pub trait ShutdownHandler: Send + Sync + 'static {
    fn shutdown(&self, ctx: ShutdownContext) -> BoxFuture<'static, Result<(), BoxError>>;
}

impl<F, Fut> ShutdownHandler for F
where
    F: Fn(ShutdownContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    fn shutdown(&self, ctx: ShutdownContext) -> BoxFuture<'static, Result<(), BoxError>> {
        Box::pin(self(ctx))
    }
}

/// Why a single handler did not complete cleanly.
#[derive(Debug, Clone, Error)]
pub enum FailureKind {
    #[error("{0}")]
    Failed(Arc<dyn StdError + Send + Sync>),

    #[error("panicked")]
    Panicked,

    #[error("did not finish before the deadline")]
    TimedOut,
}

/// One handler's failure within a shutdown sequence.
#[derive(Debug, Clone, Error)]
#[error("{name}: {kind}")]
pub struct HandlerFailure {
    pub name: String,
    pub kind: FailureKind,
}

/// Every handler failure of one shutdown sequence.
#[derive(Debug, Clone)]
pub struct ShutdownError {
    failures: Vec<HandlerFailure>,
}

impl ShutdownError {
    pub fn failures(&self) -> &[HandlerFailure] {
        &self.failures
    }

    /// Failure reported for the handler registered as `name`, if any.
    pub fn failure(&self, name: &str) -> Option<&HandlerFailure> {
        self.failures.iter().find(|f| f.name == name)
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} shutdown handler(s) failed", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{failure}")?;
        }
        Ok(())
    }
}

impl StdError for ShutdownError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.failures.first().map(|f| f as &(dyn StdError + 'static))
    }
}

/// Error returned by [`ShutdownManager::register`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("shutdown already started, handler {0:?} rejected")]
    ShutdownStarted(String),
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotStarted = 0,
    ShuttingDown = 1,
    Done = 2,
}

impl From<u8> for Phase {
    fn from(val: u8) -> Self {
        match val {
            0 => Phase::NotStarted,
            1 => Phase::ShuttingDown,
            _ => Phase::Done,
        }
    }
}

type Outcome = Result<(), ShutdownError>;

struct Inner {
    phase: AtomicU8,
    handlers: Mutex<Vec<(String, Arc<dyn ShutdownHandler>)>>,
    timeout: Mutex<Duration>,
    finished: watch::Sender<Option<Outcome>>,
    span: Span,
}

/// Runs registered cleanup handlers once, concurrently, under a deadline.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ShutdownManager {
    inner: Arc<Inner>,
}

impl ShutdownManager {
    /// Create a manager that is only triggered explicitly.
    pub fn new() -> Self {
        let (finished, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                phase: AtomicU8::new(Phase::NotStarted as u8),
                handlers: Mutex::new(Vec::new()),
                timeout: Mutex::new(DEFAULT_TIMEOUT),
                finished,
                span: Span::none(),
            }),
        }
    }

    /// Create a manager that also triggers itself on the first of `signals`.
    ///
    /// Must be called from within a Tokio runtime unless `signals` is empty.
    pub fn with_signals(signals: &[ShutdownSignal], span: Span) -> std::io::Result<Self> {
        let manager = Self::new().with_span(span);
        let mut listener = SignalListener::install(signals)?;
        if signals.is_empty() {
            return Ok(manager);
        }

        let weak = Arc::downgrade(&manager.inner);
        let span = manager.inner.span.clone();
        tokio::spawn(
            async move {
                let signal = listener.recv().await;
                let Some(inner) = weak.upgrade() else { return };
                tracing::info!(signal = %signal, "Shutdown signal received");
                let manager = ShutdownManager { inner };
                if let Err(e) = manager.shutdown(None).await {
                    tracing::error!(error = %e, "Shutdown finished with errors");
                }
            }
            .instrument(span),
        );
        Ok(manager)
    }

    /// Emit this manager's events inside `span`.
    ///
    /// Only meaningful before the manager is shared.
    pub fn with_span(mut self, span: Span) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.span = span;
        }
        self
    }

    /// Set the deadline applied when a trigger carries none.
    pub fn set_timeout(&self, timeout: Duration) {
        *self
            .inner
            .timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = timeout;
    }

    pub fn timeout(&self) -> Duration {
        *self
            .inner
            .timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> Phase {
        Phase::from(self.inner.phase.load(Ordering::Acquire))
    }

    /// Add a cleanup handler. Rejected once the sequence has started.
    pub fn register<H>(&self, name: impl Into<String>, handler: H) -> Result<(), RegisterError>
    where
        H: ShutdownHandler,
    {
        let name = name.into();
        let mut handlers = self
            .inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.phase() != Phase::NotStarted {
            return Err(RegisterError::ShutdownStarted(name));
        }
        handlers.push((name, Arc::new(handler)));
        Ok(())
    }

    /// Trigger shutdown and wait for it to finish.
    ///
    /// The first call runs the sequence with `deadline`, or with now plus
    /// the configured timeout when `deadline` is `None`. Every other call,
    /// concurrent or later, waits for that run and returns its outcome.
    pub async fn shutdown(&self, deadline: Option<Instant>) -> Result<(), ShutdownError> {
        let won = self
            .inner
            .phase
            .compare_exchange(
                Phase::NotStarted as u8,
                Phase::ShuttingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if won {
            let inner = Arc::clone(&self.inner);
            let deadline = deadline.unwrap_or_else(|| Instant::now() + self.timeout());
            let span = inner.span.clone();
            tokio::spawn(
                async move {
                    let outcome = run_handlers(&inner, deadline).await;
                    inner.phase.store(Phase::Done as u8, Ordering::Release);
                    inner.finished.send_replace(Some(outcome));
                }
                .instrument(span),
            );
        }

        self.outcome().await
    }

    /// Wait until a shutdown sequence has completed.
    pub async fn await_termination(&self) {
        let _ = self.outcome().await;
    }

    async fn outcome(&self) -> Outcome {
        let mut rx = self.inner.finished.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Ok(())),
            // The sender lives in `inner`, which `self` keeps alive.
            Err(_) => Ok(()),
        };
        outcome
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_handlers(inner: &Inner, deadline: Instant) -> Outcome {
    let handlers = inner
        .handlers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

    tracing::info!(handlers = handlers.len(), "Shutdown started");
    let ctx = ShutdownContext::new(deadline);

    let running: Vec<(String, JoinHandle<Result<(), BoxError>>)> = handlers
        .into_iter()
        .map(|(name, handler)| {
            let task = handler.shutdown(ctx).in_current_span();
            (name, tokio::spawn(task))
        })
        .collect();

    let mut failures = Vec::new();
    for (name, mut task) in running {
        let kind = match timeout_at(deadline, &mut task).await {
            Ok(Ok(Ok(()))) => {
                metrics::record_shutdown_handler("ok");
                continue;
            }
            Ok(Ok(Err(e))) => {
                metrics::record_shutdown_handler("failed");
                FailureKind::Failed(Arc::from(e))
            }
            Ok(Err(_join_error)) => {
                metrics::record_shutdown_handler("panicked");
                FailureKind::Panicked
            }
            Err(_elapsed) => {
                metrics::record_shutdown_handler("timed_out");
                FailureKind::TimedOut
            }
        };
        tracing::warn!(handler = %name, error = %kind, "Shutdown handler failed");
        failures.push(HandlerFailure { name, kind });
    }

    if failures.is_empty() {
        tracing::info!("Shutdown complete");
        Ok(())
    } else {
        Err(ShutdownError { failures })
    }
}
