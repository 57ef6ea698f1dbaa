//! Server error taxonomy.

use std::error::Error as StdError;
use std::io;

use thiserror::Error;

use crate::lifecycle::RegisterError;
use crate::net::NetError;
use crate::transport::DocumentError;
use crate::BoxError;

/// Error type for [`Server`](crate::server::Server) operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A listener could not be bound; nothing was served.
    #[error("Failed to create listeners: {0}")]
    Bind(#[from] NetError),

    /// A descriptor's gateway routes, the document routes or the
    /// reflection service could not be registered; nothing was served.
    #[error("Failed to register services: {0}")]
    Registration(#[source] BoxError),

    /// The merged API-description document could not be built.
    #[error("Failed to build API document: {0}")]
    Document(#[from] DocumentError),

    /// A serve loop failed for a reason other than shutdown.
    #[error("{loop_name} serve loop failed: {source}")]
    Serve {
        loop_name: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("Server already started")]
    AlreadyStarted,

    /// Serve loops were still running at the stop deadline.
    #[error("Serve loops did not stop before the deadline")]
    StopTimeout,

    #[error("Failed to install signal handlers: {0}")]
    Signal(#[source] io::Error),

    #[error(transparent)]
    Register(#[from] RegisterError),
}

impl ServerError {
    pub(crate) fn serve<E>(loop_name: &'static str, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        ServerError::Serve {
            loop_name,
            source: source.into(),
        }
    }

    /// Whether this error only reports a listener closed by shutdown.
    pub fn is_expected_close(&self) -> bool {
        is_expected_close(self)
    }
}

/// Whether `err`, or anything in its source chain, is a listener or
/// connection closed as part of a requested shutdown.
pub fn is_expected_close(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(NetError::MuxClosed) = e.downcast_ref::<NetError>() {
            return true;
        }
        if let Some(io) = e.downcast_ref::<io::Error>() {
            if io.kind() == io::ErrorKind::NotConnected {
                return true;
            }
            // io::Error hides its payload from `source()`.
            if let Some(inner) = io.get_ref() {
                if is_expected_close(inner) {
                    return true;
                }
            }
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mux_closed_is_expected_anywhere_in_chain() {
        assert!(is_expected_close(&NetError::MuxClosed));

        let wrapped = ServerError::serve("mux", NetError::MuxClosed);
        assert!(wrapped.is_expected_close());

        let io = io::Error::new(io::ErrorKind::Other, NetError::MuxClosed);
        assert!(ServerError::serve("grpc", io).is_expected_close());
    }

    #[test]
    fn closed_socket_is_expected() {
        let err = NetError::Accept(io::Error::from(io::ErrorKind::NotConnected));
        assert!(is_expected_close(&err));
    }

    #[test]
    fn other_failures_are_not_expected() {
        let err = ServerError::serve("grpc", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!err.is_expected_close());
        assert!(!ServerError::AlreadyStarted.is_expected_close());
        assert_eq!(
            err.to_string(),
            "grpc serve loop failed: permission denied"
        );
    }
}
