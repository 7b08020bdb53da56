//! Event probes: the framer's way of telling an embedder about
//! lifecycle and synchronization events without depending on any
//! particular telemetry backend.

use log::{error, info, warn};

use crate::error::FramerError;

/// Lifecycle and synchronization events raised by [`crate::framer::Framer`].
///
/// Every method has a default no-op body so an embedder only overrides
/// what it cares about.
pub trait Probe {
    /// The framer has been constructed and is ready to receive input.
    fn ready(&mut self) {}

    /// The framer is about to be torn down.
    fn dead(&mut self) {}

    /// The first sequence header after a sync loss (or at startup) was
    /// found; frames will start being emitted.
    fn sync_acquired(&mut self) {}

    /// Parsing hit a discontinuity or a malformed header and had to
    /// resynchronize; no frames will be emitted until the next sequence
    /// header or picture start is found, per the input-acquisition rules.
    fn sync_lost(&mut self) {}

    /// A non-recoverable error occurred (allocation failure, broken
    /// internal invariant); the current `push` call was abandoned.
    fn fatal(&mut self, err: &FramerError) {}

    /// A recoverable condition worth surfacing (malformed header field,
    /// unexpected start code at a frame boundary).
    fn warn(&mut self, message: &str) {}
}

/// The default [`Probe`] implementation: routes every event through the
/// `log` crate at the level an embedder would expect.
#[derive(Debug, Default)]
pub struct LoggingProbe;

impl Probe for LoggingProbe {
    fn ready(&mut self) {
        info!("mpgv framer ready");
    }

    fn dead(&mut self) {
        info!("mpgv framer torn down");
    }

    fn sync_acquired(&mut self) {
        info!("mpgv framer: sync acquired");
    }

    fn sync_lost(&mut self) {
        warn!("mpgv framer: sync lost");
    }

    fn fatal(&mut self, err: &FramerError) {
        error!("mpgv framer: fatal error: {}", err);
    }

    fn warn(&mut self, message: &str) {
        warn!("mpgv framer: {}", message);
    }
}
