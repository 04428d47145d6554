//! Engine-facing contracts and the submission entry points.

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Result, StreamError};
use crate::relay::BodyRelay;
use crate::sink::{BodySink, SinkFactory};
use crate::types::{Completion, ResponseHead, ResumeHandle, StreamOptions};

/// Contract the connection/parsing layer drives as the exchange
/// progresses.
///
/// Hooks arrive in order: `on_headers`, zero or more `on_body`, then
/// completion or error; implementations tolerate completion or error
/// without any prior body chunk. After a terminal hook no further call
/// has observable effect.
pub trait ResponseHandler: Send {
    /// Final or informational status line with its headers. `resume`
    /// releases engine-side backpressure; the handler fires it on every
    /// sink drain and unconditionally on finalization.
    fn on_headers(&mut self, status: StatusCode, headers: HeaderMap, resume: ResumeHandle);

    /// Body bytes `[offset, offset + len)` within `chunk`. Returns
    /// `false` when the engine should pause delivery until `resume`
    /// fires.
    fn on_body(&mut self, chunk: &Bytes, offset: usize, len: usize) -> bool;

    /// All body chunks delivered. Trailers are informational.
    fn on_complete(&mut self, trailers: HeaderMap);

    /// Transport failure; terminal.
    fn on_error(&mut self, err: StreamError);
}

/// The external request queue an exchange is submitted to.
pub trait Dispatcher: Send + Sync {
    /// The dispatcher was torn down and accepts no further exchanges.
    fn is_destroyed(&self) -> bool;

    /// The dispatcher is draining and accepts no further exchanges.
    fn is_closed(&self) -> bool;

    /// Accept a constructed exchange. The dispatcher later drives it
    /// through its [`ResponseHandler`] hooks.
    fn enqueue(&self, exchange: BodyRelay);
}

/// Submit a streamed exchange; the outcome is reported through `callback`
/// exactly once.
///
/// A validation failure (including a rejected `CONNECT` method and a
/// destroyed or closed dispatcher) is delivered asynchronously through
/// the same callback channel and never reaches `enqueue`. Must be called
/// within a tokio runtime context.
pub fn stream<D, F, C>(dispatcher: &D, opts: StreamOptions, factory: F, callback: C)
where
    D: Dispatcher + ?Sized,
    F: FnOnce(ResponseHead) -> anyhow::Result<Option<Box<dyn BodySink>>> + Send + 'static,
    C: FnOnce(Result<()>) + Send + 'static,
{
    submit(
        dispatcher,
        opts,
        Box::new(factory),
        Box::new(callback),
        Handle::current(),
    );
}

/// Future-based convention over the same submission path: a oneshot
/// channel stands in for the callback.
pub async fn stream_async<D, F>(dispatcher: &D, opts: StreamOptions, factory: F) -> Result<()>
where
    D: Dispatcher + ?Sized,
    F: FnOnce(ResponseHead) -> anyhow::Result<Option<Box<dyn BodySink>>> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    stream(dispatcher, opts, factory, move |result| {
        let _ = tx.send(result);
    });
    match rx.await {
        Ok(result) => result,
        Err(_) => Err(StreamError::Internal("completion channel closed")),
    }
}

fn submit<D: Dispatcher + ?Sized>(
    dispatcher: &D,
    opts: StreamOptions,
    factory: SinkFactory,
    callback: Completion,
    runtime: Handle,
) {
    match check(dispatcher, &opts) {
        Ok(()) => dispatcher.enqueue(BodyRelay::new(opts, factory, callback, runtime)),
        Err(err) => {
            debug!(error = %err, "submission rejected");
            runtime.spawn(async move { callback(Err(err)) });
        }
    }
}

fn check<D: Dispatcher + ?Sized>(dispatcher: &D, opts: &StreamOptions) -> Result<()> {
    opts.validate()?;
    if opts.method == Method::CONNECT {
        return Err(StreamError::NotSupported(opts.method.clone()));
    }
    if dispatcher.is_destroyed() {
        return Err(StreamError::DispatcherDestroyed);
    }
    if dispatcher.is_closed() {
        return Err(StreamError::DispatcherClosed);
    }
    Ok(())
}
