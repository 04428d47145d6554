//! Per-exchange state machine: drives the caller's sink factory from
//! response metadata, pumps body chunks into the sink with backpressure,
//! and reports exactly one terminal outcome.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn, Span};

use crate::dispatch::ResponseHandler;
use crate::error::StreamError;
use crate::sink::{BodySink, SinkEvent, SinkFactory, SinkListener};
use crate::types::{Completion, OpaqueValue, ResponseHead, ResumeHandle, StreamOptions};

/// Exchange lifecycle.
///
/// `Pending → Active → {CompletedEmpty, CompletedBody, Errored}`, with
/// direct `Pending → terminal` transitions when the factory fails or the
/// caller declines a body. Once terminal, every hook is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Submitted; awaiting a final (non-1xx) status line.
    Pending,
    /// The factory yielded a sink; body chunks are being forwarded.
    Active,
    /// The caller declined the body; no sink was attached.
    CompletedEmpty,
    /// The sink finished flushing the body.
    CompletedBody,
    /// The exchange failed.
    Errored,
}

impl RelayState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RelayState::CompletedEmpty | RelayState::CompletedBody | RelayState::Errored
        )
    }
}

/// Mutable record backing one exchange.
///
/// The `factory`, `callback`, and `sink` slots are taken at most once
/// each; a cleared slot is never read again. The mutex is never held
/// while the factory, the callback, or the resume handle runs.
struct ExchangeCore {
    state: RelayState,
    factory: Option<SinkFactory>,
    callback: Option<Completion>,
    sink: Option<Box<dyn BodySink>>,
    resume: Option<ResumeHandle>,
    opaque: Option<OpaqueValue>,
    runtime: Handle,
    span: Span,
}

impl Drop for ExchangeCore {
    fn drop(&mut self) {
        // Last-resort cleanup for an engine that drops the exchange
        // without ever delivering a terminal hook.
        if let Some(mut sink) = self.sink.take() {
            let span = self.span.clone();
            span.in_scope(|| sink.abort(None));
        }
        if let Some(callback) = self.callback.take() {
            warn!("exchange dropped before completion");
            callback(Err(StreamError::Internal(
                "exchange dropped before completion",
            )));
        }
    }
}

fn lock(core: &Mutex<ExchangeCore>) -> MutexGuard<'_, ExchangeCore> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The streaming adapter submitted to the dispatcher.
///
/// The dispatcher drives it through the [`ResponseHandler`] hooks as the
/// exchange progresses; the completion callback supplied at submission is
/// the only channel back to the caller.
pub struct BodyRelay {
    core: Arc<Mutex<ExchangeCore>>,
}

impl BodyRelay {
    pub(crate) fn new(
        opts: StreamOptions,
        factory: SinkFactory,
        callback: Completion,
        runtime: Handle,
    ) -> Self {
        let span = tracing::debug_span!("exchange", method = %opts.method, path = %opts.path);
        Self {
            core: Arc::new(Mutex::new(ExchangeCore {
                state: RelayState::Pending,
                factory: Some(factory),
                callback: Some(callback),
                sink: None,
                resume: None,
                opaque: opts.opaque,
                runtime,
                span,
            })),
        }
    }

    pub fn state(&self) -> RelayState {
        lock(&self.core).state
    }
}

impl std::fmt::Debug for BodyRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyRelay")
            .field("state", &self.state())
            .finish()
    }
}

impl ResponseHandler for BodyRelay {
    fn on_headers(&mut self, status: StatusCode, headers: HeaderMap, resume: ResumeHandle) {
        if status.is_informational() {
            // TODO: interim response handling; final status follows.
            trace!(%status, "ignoring informational response");
            return;
        }

        let (factory, opaque, span) = {
            let mut core = lock(&self.core);
            let Some(factory) = core.factory.take() else {
                return;
            };
            core.resume = Some(resume);
            (factory, core.opaque.take(), core.span.clone())
        };

        let produced = span.in_scope(|| {
            factory(ResponseHead {
                status,
                headers,
                opaque,
            })
        });

        let sink = match produced {
            Ok(sink) => sink,
            Err(err) => {
                fail(&self.core, err.into());
                return;
            }
        };

        let mut core = lock(&self.core);

        if core.callback.is_none() {
            // Aborted while the factory ran: release whatever it produced
            // without attaching it.
            drop(core);
            if let Some(mut sink) = sink {
                span.in_scope(|| sink.abort(None));
            }
            return;
        }

        let mut sink = match sink {
            Some(sink) => sink,
            None => {
                core.state = RelayState::CompletedEmpty;
                let resume = core.resume.clone();
                let callback = core.callback.take();
                drop(core);
                span.in_scope(|| debug!("caller declined response body"));
                settle(resume, callback, Ok(()));
                return;
            }
        };

        if let Some(name) = sink.capabilities().missing() {
            core.state = RelayState::Errored;
            let resume = core.resume.clone();
            let callback = core.callback.take();
            drop(core);
            settle(
                resume,
                callback,
                Err(StreamError::InvalidReturnValue(format!(
                    "sink does not support {name}"
                ))),
            );
            return;
        }

        let weak = Arc::downgrade(&self.core);
        sink.subscribe(SinkListener::new(move |event| on_sink_event(&weak, event)));
        core.sink = Some(sink);
        core.state = RelayState::Active;
        drop(core);
        span.in_scope(|| debug!(%status, "sink attached, streaming body"));
    }

    fn on_body(&mut self, chunk: &Bytes, offset: usize, len: usize) -> bool {
        let mut core = lock(&self.core);
        let Some(sink) = core.sink.as_mut() else {
            return true;
        };
        let end = offset.saturating_add(len).min(chunk.len());
        let start = offset.min(end);
        sink.write(chunk.slice(start..end))
    }

    fn on_complete(&mut self, trailers: HeaderMap) {
        let mut core = lock(&self.core);
        if !trailers.is_empty() {
            trace!(trailers = trailers.len(), "trailers discarded");
        }
        if let Some(sink) = core.sink.as_mut() {
            sink.end();
        }
    }

    fn on_error(&mut self, err: StreamError) {
        fail(&self.core, err);
    }
}

/// Sink-side event intake; the subscribed listener lands here.
fn on_sink_event(core: &Weak<Mutex<ExchangeCore>>, event: SinkEvent) {
    let Some(core) = core.upgrade() else {
        return;
    };
    match event {
        SinkEvent::Drain => {
            let resume = {
                let core = lock(&core);
                if core.state.is_terminal() {
                    None
                } else {
                    core.resume.clone()
                }
            };
            if let Some(resume) = resume {
                resume.resume();
            }
        }
        SinkEvent::Finish => finish(&core),
        SinkEvent::Error(err) => fail(&core, err),
    }
}

/// Successful end of the body stream: the sink has flushed everything.
fn finish(core: &Mutex<ExchangeCore>) {
    let (resume, callback, sink, span) = {
        let mut core = lock(core);
        if core.state.is_terminal() {
            return;
        }
        core.state = RelayState::CompletedBody;
        (
            core.resume.clone(),
            core.callback.take(),
            core.sink.take(),
            core.span.clone(),
        )
    };

    if let Some(resume) = &resume {
        resume.resume();
    }

    if let Some(mut sink) = sink {
        if !sink.is_readable() {
            span.in_scope(|| {
                debug!("releasing sink after finish");
                sink.abort(None);
            });
        }
    }

    if let Some(callback) = callback {
        span.in_scope(|| debug!("body complete"));
        callback(Ok(()));
    }
}

/// Error path shared by the engine hook, factory failures, and sink
/// errors. Releases the sink and fires the resume handle before the
/// callback is delivered; the callback itself is deferred to the next
/// scheduling turn so the error never reenters the caller from inside an
/// engine-driven hook.
fn fail(core: &Mutex<ExchangeCore>, err: StreamError) {
    let (resume, callback, sink, runtime, span) = {
        let mut core = lock(core);
        if core.state.is_terminal() {
            return;
        }
        core.state = RelayState::Errored;
        core.factory = None;
        (
            core.resume.clone(),
            core.callback.take(),
            core.sink.take(),
            core.runtime.clone(),
            core.span.clone(),
        )
    };

    if let Some(resume) = &resume {
        resume.resume();
    }

    if let Some(mut sink) = sink {
        span.in_scope(|| {
            debug!(error = %err, "releasing sink after failure");
            sink.abort(Some(&err));
        });
    }

    if let Some(callback) = callback {
        runtime.spawn(async move { callback(Err(err)) });
    }
}

/// Terminal delivery for paths that complete inside `on_headers`: the
/// resume handle fires first so the engine is never left paused, then the
/// callback runs.
fn settle(
    resume: Option<ResumeHandle>,
    callback: Option<Completion>,
    result: crate::error::Result<()>,
) {
    if let Some(resume) = resume {
        resume.resume();
    }
    if let Some(callback) = callback {
        callback(result);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;

    use super::*;

    #[derive(Default)]
    struct SinkProbe {
        subscribed: AtomicBool,
        aborted: AtomicBool,
    }

    struct TestSink {
        probe: Arc<SinkProbe>,
    }

    impl BodySink for TestSink {
        fn write(&mut self, _chunk: Bytes) -> bool {
            true
        }

        fn end(&mut self) {}

        fn subscribe(&mut self, _listener: SinkListener) {
            self.probe.subscribed.store(true, Ordering::SeqCst);
        }

        fn abort(&mut self, _reason: Option<&StreamError>) {
            self.probe.aborted.store(true, Ordering::SeqCst);
        }
    }

    fn relay_with(
        factory: SinkFactory,
    ) -> (BodyRelay, tokio::sync::oneshot::Receiver<crate::error::Result<()>>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let callback: Completion = Box::new(move |result| {
            let _ = tx.send(result);
        });
        let relay = BodyRelay::new(
            StreamOptions::default(),
            factory,
            callback,
            Handle::current(),
        );
        (relay, rx)
    }

    #[test]
    fn test_state_terminal_predicates() {
        assert!(!RelayState::Pending.is_terminal());
        assert!(!RelayState::Active.is_terminal());
        assert!(RelayState::CompletedEmpty.is_terminal());
        assert!(RelayState::CompletedBody.is_terminal());
        assert!(RelayState::Errored.is_terminal());
    }

    #[tokio::test]
    async fn test_informational_status_leaves_factory_armed() {
        let (mut relay, _rx) = relay_with(Box::new(|_head| Ok(None)));

        relay.on_headers(StatusCode::CONTINUE, HeaderMap::new(), ResumeHandle::noop());

        assert_eq!(relay.state(), RelayState::Pending);
        assert!(lock(&relay.core).factory.is_some());
    }

    #[tokio::test]
    async fn test_body_without_sink_is_discarded() {
        let (mut relay, _rx) = relay_with(Box::new(|_head| Ok(None)));

        let chunk = Bytes::from_static(b"dropped");
        assert!(relay.on_body(&chunk, 0, chunk.len()));
        assert_eq!(relay.state(), RelayState::Pending);
    }

    #[tokio::test]
    async fn test_body_slice_clamped_to_chunk_bounds() {
        let probe = Arc::new(SinkProbe::default());
        let sink_probe = probe.clone();
        let (mut relay, _rx) = relay_with(Box::new(move |_head| {
            Ok(Some(Box::new(TestSink { probe: sink_probe }) as Box<dyn BodySink>))
        }));

        relay.on_headers(StatusCode::OK, HeaderMap::new(), ResumeHandle::noop());
        assert_eq!(relay.state(), RelayState::Active);

        let chunk = Bytes::from_static(b"abc");
        // An out-of-range window must not panic.
        assert!(relay.on_body(&chunk, 2, 10));
        assert!(relay.on_body(&chunk, 10, 1));
    }

    /// An abort racing the factory: the error lands between the factory
    /// slot being taken and the factory returning. The produced sink must
    /// be released without being attached, and the callback must fire
    /// exactly once, with the abort error.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_error_during_factory_discards_produced_sink() {
        let probe = Arc::new(SinkProbe::default());
        let sink_probe = probe.clone();

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let factory: SinkFactory = Box::new(move |_head| {
            entered_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            Ok(Some(Box::new(TestSink { probe: sink_probe }) as Box<dyn BodySink>))
        });
        let (mut relay, rx) = relay_with(factory);
        let core = relay.core.clone();

        let engine = std::thread::spawn(move || {
            relay.on_headers(StatusCode::OK, HeaderMap::new(), ResumeHandle::noop());
            relay
        });

        entered_rx.recv().unwrap();
        fail(&core, StreamError::Internal("aborted"));
        release_tx.send(()).unwrap();
        let relay = engine.join().unwrap();

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(StreamError::Internal(_))));
        assert_eq!(relay.state(), RelayState::Errored);
        assert!(probe.aborted.load(Ordering::SeqCst));
        assert!(!probe.subscribed.load(Ordering::SeqCst));
    }
}
