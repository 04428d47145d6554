//! Exchange metadata, submission options, and the handles that cross the
//! engine boundary.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use http::{HeaderMap, Method, StatusCode};

use crate::error::{Result, StreamError};

/// Caller-supplied context value, threaded through to the sink factory
/// unchanged.
pub type OpaqueValue = Box<dyn Any + Send>;

/// Terminal notification for one exchange.
///
/// Invoked exactly once. The `Ok` payload is always `()`: the exchange
/// produces no value of its own, only the side effect of driving the
/// sink.
pub type Completion = Box<dyn FnOnce(Result<()>) + Send>;

/// Response metadata handed to the sink factory once a final (non-1xx)
/// status line has arrived.
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Context value supplied at submission, consumed by the factory.
    pub opaque: Option<OpaqueValue>,
}

impl fmt::Debug for ResponseHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHead")
            .field("status", &self.status)
            .field("headers", &self.headers.len())
            .field("opaque", &self.opaque.is_some())
            .finish()
    }
}

/// Request options accepted at submission.
///
/// Construction and configuration of the request itself is the caller's
/// concern; only the shape needed to validate and trace the exchange is
/// kept here.
pub struct StreamOptions {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    /// Context value delivered to the factory along with the response
    /// metadata.
    pub opaque: Option<OpaqueValue>,
}

impl StreamOptions {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            opaque: None,
        }
    }

    pub fn with_opaque(mut self, value: impl Any + Send) -> Self {
        self.opaque = Some(Box::new(value));
        self
    }

    /// Check the request shape before it is handed to the dispatcher.
    pub fn validate(&self) -> Result<()> {
        if self.path.is_empty() {
            return Err(StreamError::InvalidArgument(
                "path must not be empty".into(),
            ));
        }
        if !self.path.starts_with('/') && self.path != "*" {
            return Err(StreamError::InvalidArgument(format!(
                "path must be absolute, got {:?}",
                self.path
            )));
        }
        Ok(())
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::new(Method::GET, "/")
    }
}

impl fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOptions")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("headers", &self.headers.len())
            .field("opaque", &self.opaque.is_some())
            .finish()
    }
}

/// Backpressure-release handle the engine passes into `on_headers`.
///
/// Invoking it tells the engine it may resume delivering body chunks after
/// a paused write. It is fired on every sink drain and, unconditionally,
/// when the exchange finalizes, so the engine is never left waiting on a
/// sink that will not drain again.
#[derive(Clone)]
pub struct ResumeHandle {
    inner: Arc<dyn Fn() + Send + Sync>,
}

impl ResumeHandle {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    /// Handle for engines that never pause delivery.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn resume(&self) {
        (self.inner)()
    }
}

impl fmt::Debug for ResumeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResumeHandle")
    }
}
