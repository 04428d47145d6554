//! The sink capability contract: the writable target built by the caller's
//! factory, consumed (never implemented) by this crate.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::StreamError;
use crate::types::ResponseHead;

/// Which of the three required capabilities a sink supports.
///
/// The exchange refuses a sink whose capabilities are incomplete and
/// attaches no listener to it; the caller gets `InvalidReturnValue` naming
/// the first missing capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkCapabilities {
    /// Accepts body chunks via `write`.
    pub write: bool,
    /// Accepts an end-of-stream signal via `end`.
    pub end: bool,
    /// Delivers `Drain`/`Finish`/`Error` events to a subscribed listener.
    pub events: bool,
}

impl SinkCapabilities {
    pub const ALL: Self = Self {
        write: true,
        end: true,
        events: true,
    };

    /// First missing capability, if any.
    pub fn missing(&self) -> Option<&'static str> {
        if !self.write {
            Some("write")
        } else if !self.end {
            Some("end")
        } else if !self.events {
            Some("events")
        } else {
            None
        }
    }
}

impl Default for SinkCapabilities {
    fn default() -> Self {
        Self::ALL
    }
}

/// Lifecycle events a sink reports through its subscribed listener.
#[derive(Debug)]
pub enum SinkEvent {
    /// The sink can accept more writes after backpressure.
    Drain,
    /// The sink finished flushing after end-of-stream.
    Finish,
    /// The sink failed.
    Error(StreamError),
}

/// The exchange's event intake, handed to the sink via [`BodySink::subscribe`].
///
/// Cloneable; holds only a weak reference to the exchange, so a sink that
/// outlives its exchange cannot keep it alive, and events delivered after
/// the exchange is gone are ignored.
#[derive(Clone)]
pub struct SinkListener {
    inner: Arc<dyn Fn(SinkEvent) + Send + Sync>,
}

impl SinkListener {
    pub(crate) fn new(f: impl Fn(SinkEvent) + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    pub fn notify(&self, event: SinkEvent) {
        (self.inner)(event)
    }
}

impl fmt::Debug for SinkListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SinkListener")
    }
}

/// A writable destination for response body bytes.
///
/// The exchange owns the sink exclusively while it is attached: no other
/// component may write to or release it. On any abnormal path the exchange
/// calls [`abort`](BodySink::abort) exactly once before dropping it.
///
/// Lifecycle events must be delivered from the sink's own execution
/// context, never synchronously from inside `write`, `end`, `subscribe`,
/// or `abort`.
pub trait BodySink: Send {
    /// Which of the required capabilities this sink supports.
    fn capabilities(&self) -> SinkCapabilities {
        SinkCapabilities::ALL
    }

    /// Accept a body chunk.
    ///
    /// `false` applies backpressure: the engine pauses delivery until the
    /// sink reports [`SinkEvent::Drain`].
    fn write(&mut self, chunk: Bytes) -> bool;

    /// End-of-stream signal. Completion is reported through
    /// [`SinkEvent::Finish`] once the sink actually finishes flushing.
    fn end(&mut self);

    /// Register the exchange's lifecycle listener.
    fn subscribe(&mut self, listener: SinkListener);

    /// Release held resources after an abnormal end (or, with no reason,
    /// after a successful finish of a sink that is no longer readable).
    fn abort(&mut self, reason: Option<&StreamError>) {
        let _ = reason;
    }

    /// A sink that is still independently readable is not released on
    /// successful finish.
    fn is_readable(&self) -> bool {
        false
    }
}

/// Caller-supplied factory mapping response metadata to a sink.
///
/// `Ok(None)` declines the body; an error is treated exactly like a
/// transport error.
pub type SinkFactory =
    Box<dyn FnOnce(ResponseHead) -> anyhow::Result<Option<Box<dyn BodySink>>> + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_missing_names_first_gap() {
        assert_eq!(SinkCapabilities::ALL.missing(), None);

        let no_end = SinkCapabilities {
            end: false,
            ..SinkCapabilities::ALL
        };
        assert_eq!(no_end.missing(), Some("end"));

        let none = SinkCapabilities {
            write: false,
            end: false,
            events: false,
        };
        assert_eq!(none.missing(), Some("write"));
    }
}
