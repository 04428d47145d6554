//! Response-to-sink streaming for HTTP-like client engines.
//!
//! An external engine (the connection and wire-protocol layer) drives a
//! per-exchange [`BodyRelay`] through four hooks as a response arrives.
//! The relay invokes a caller-supplied factory to build a writable
//! [`BodySink`] from the response metadata, pumps body chunks into it
//! while forwarding backpressure in both directions, and reports a single
//! terminal outcome through the callback (or future) supplied at
//! submission, no matter how the exchange ends.
//!
//! This crate does not touch sockets and holds no connection state; it
//! only reacts to hook calls already delivered to it. Connection
//! management and retry policy belong to the engine behind the
//! [`Dispatcher`] and [`ResponseHandler`] boundary.

#![forbid(unsafe_code)]

pub mod dispatch;
pub mod error;
pub mod relay;
pub mod sink;
pub mod types;

pub use dispatch::{stream, stream_async, Dispatcher, ResponseHandler};
pub use error::{Result, StreamError};
pub use relay::{BodyRelay, RelayState};
pub use sink::{BodySink, SinkCapabilities, SinkEvent, SinkFactory, SinkListener};
pub use types::{Completion, OpaqueValue, ResponseHead, ResumeHandle, StreamOptions};
