//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers for the configured set (possibly empty)
//! - Resolve with whichever configured signal arrives first
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Handlers are installed eagerly so a failure shows up at construction
//! - An empty set never resolves

use std::future::poll_fn;
use std::io;
use std::task::Poll;

use serde::{Deserialize, Serialize};

/// A termination signal that can start the shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownSignal {
    /// SIGINT / Ctrl+C.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// SIGHUP.
    Hangup,
    /// SIGQUIT.
    Quit,
}

impl ShutdownSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::Hangup => "SIGHUP",
            ShutdownSignal::Quit => "SIGQUIT",
        }
    }
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Installed handlers for a set of [`ShutdownSignal`]s.
pub struct SignalListener {
    streams: Vec<(ShutdownSignal, platform::Stream)>,
}

impl SignalListener {
    /// Install handlers for `signals`. Duplicates are ignored.
    ///
    /// Must be called from within a Tokio runtime unless `signals` is empty.
    pub fn install(signals: &[ShutdownSignal]) -> io::Result<Self> {
        let mut streams: Vec<(ShutdownSignal, platform::Stream)> = Vec::with_capacity(signals.len());
        for &signal in signals {
            if streams.iter().any(|(installed, _)| *installed == signal) {
                continue;
            }
            if let Some(stream) = platform::install(signal)? {
                streams.push((signal, stream));
            }
        }
        Ok(Self { streams })
    }

    /// Signals this listener actually watches.
    pub fn signals(&self) -> Vec<ShutdownSignal> {
        self.streams.iter().map(|(signal, _)| *signal).collect()
    }

    /// Wait for the first configured signal.
    pub async fn recv(&mut self) -> ShutdownSignal {
        poll_fn(|cx| {
            for (signal, stream) in self.streams.iter_mut() {
                if stream.poll_recv(cx).is_ready() {
                    return Poll::Ready(*signal);
                }
            }
            Poll::Pending
        })
        .await
    }
}

#[cfg(unix)]
mod platform {
    use super::ShutdownSignal;
    use tokio::signal::unix::{signal, Signal, SignalKind};

    pub type Stream = Signal;

    pub fn install(sig: ShutdownSignal) -> std::io::Result<Option<Stream>> {
        let kind = match sig {
            ShutdownSignal::Interrupt => SignalKind::interrupt(),
            ShutdownSignal::Terminate => SignalKind::terminate(),
            ShutdownSignal::Hangup => SignalKind::hangup(),
            ShutdownSignal::Quit => SignalKind::quit(),
        };
        signal(kind).map(Some)
    }
}

#[cfg(windows)]
mod platform {
    use super::ShutdownSignal;
    use tokio::signal::windows::{ctrl_c, CtrlC};

    pub type Stream = CtrlC;

    pub fn install(sig: ShutdownSignal) -> std::io::Result<Option<Stream>> {
        match sig {
            ShutdownSignal::Interrupt => ctrl_c().map(Some),
            other => {
                tracing::warn!(signal = %other, "Signal not supported on this platform, ignoring");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn empty_set_needs_no_runtime() {
        let listener = SignalListener::install(&[]).unwrap();
        assert!(listener.signals().is_empty());
    }

    #[tokio::test]
    async fn empty_set_never_fires() {
        let mut listener = SignalListener::install(&[]).unwrap();
        let fired = tokio::time::timeout(Duration::from_millis(50), listener.recv()).await;
        assert!(fired.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn installs_several_signals_once_each() {
        let listener = SignalListener::install(&[
            ShutdownSignal::Interrupt,
            ShutdownSignal::Terminate,
            ShutdownSignal::Interrupt,
        ])
        .unwrap();
        assert_eq!(
            listener.signals(),
            vec![ShutdownSignal::Interrupt, ShutdownSignal::Terminate]
        );
    }

    #[test]
    fn deserializes_snake_case_names() {
        let signals: Vec<ShutdownSignal> = serde_json::from_str(r#"["interrupt","hangup"]"#).unwrap();
        assert_eq!(signals, vec![ShutdownSignal::Interrupt, ShutdownSignal::Hangup]);
    }
}
