//! Error kinds for the detection pipeline (see spec §7)

use thiserror::Error;

/// Fatal and transient error kinds the pipeline can surface.
///
/// Queue-full and malformed-packet conditions are *not* represented here —
/// per spec they are handled locally (backpressure / silent drop) and never
/// propagate as an error.
#[derive(Debug, Error)]
pub enum DcaError {
    /// Missing/unparseable model or scaler, malformed company key, unresolvable
    /// server hostname, or a BPF filter that can't be bound. Exit code 1.
    #[error("startup failed: {0}")]
    Startup(String),

    /// The server replied "FAIL" or closed mid-handshake. Exit code 1.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Transient send/recv failure while shipping alerts.
    #[error("network error: {0}")]
    Network(String),

    /// Transient capture-layer failure (not a dropped packet — those are
    /// silent — but e.g. the capture device itself going away).
    #[error("capture error: {0}")]
    Capture(String),
}
