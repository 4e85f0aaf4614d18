//! Per-connection pipeline stages.
//!
//! A connection's pipeline is an ordered set of named stages which is
//! reconfigured at the start of every call:
//!
//! | stage          | lifetime                                   |
//! |----------------|--------------------------------------------|
//! | `idle_guard`   | armed while pooled, removed on lease       |
//! | `debug_logger` | installed on first call when enabled       |
//! | `call_timeout` | replaced every call                        |
//! | `tls`          | installed once, removed if a call is plain |
//! | `http_codec`   | kept while clean, replaced when stuck      |
//! | `chunk_relay`  | replaced every call                        |
//! | `error_relay`  | replaced every call                        |
//!
//! The pipeline is only ever touched from the connection's own task.
//!
//! Outbound bytes are queued rather than written in place, and the
//! connection task polls the queue and the socket's read side together, so a
//! peer which answers while it is still reading the request keeps flowing in
//! both directions.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf as _, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::breaker::{CircuitBreaker, Outcome};
use crate::client::conn::timeout::{CallTimer, IdleTimer};
use crate::client::conn::tls::{self, TlsConfigs};
use crate::client::conn::transport::Transport;
use crate::client::conn::{CallState, Connection, ConnectionId, Shared};
use crate::client::pool::{AddressPool, WeakOpt};
use crate::client::streaming::StreamingCallback;
use crate::codec::{inspect, CodecHealth, HttpClientCodec, ResponseChunk};
use crate::context::{CallContext, Tracer};
use crate::error::Error;

pub(crate) const IDLE_GUARD: &str = "idle_guard";
pub(crate) const DEBUG_LOGGER: &str = "debug_logger";
pub(crate) const CALL_TIMEOUT: &str = "call_timeout";
pub(crate) const TLS: &str = "tls";
pub(crate) const HTTP_CODEC: &str = "http_codec";
pub(crate) const CHUNK_RELAY: &str = "chunk_relay";
pub(crate) const ERROR_RELAY: &str = "error_relay";

/// Log target for the debug logging stage.
pub(crate) const DEBUG_TARGET: &str = "edgewire::downstream_debug";

const READ_CHUNK: usize = 8 * 1024;

/// How the pipeline should be configured for one call.
#[derive(Debug, Clone)]
pub(crate) struct CallSetup {
    pub(crate) host: String,
    pub(crate) is_secure: bool,
    pub(crate) relaxed_tls: bool,
    pub(crate) call_timeout: Option<Duration>,
}

/// Everything the connection task needs to set up one call.
pub(crate) struct CallParams {
    pub(crate) setup: CallSetup,
    pub(crate) head: http::Request<()>,
    pub(crate) relay: CallRelay,
}

/// Encoded bytes waiting to be written.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub(crate) data: Bytes,
    pub(crate) waiter: Waiter,
}

/// Who is told once an [`Outbound`] entry has been flushed.
#[derive(Debug)]
pub(crate) enum Waiter {
    /// The request head. Flushing it completes the call's setup.
    Head,

    /// A body chunk, whose future resolves with the write's outcome.
    Chunk(oneshot::Sender<Result<(), Error>>),
}

/// Progress on the connection's socket.
#[derive(Debug)]
pub(crate) enum IoEvent {
    /// Bytes were appended to the read buffer, or the read failed. Zero means EOF.
    Read(io::Result<usize>),

    /// Part of the front outbound entry was written.
    Wrote(usize),

    /// The front outbound entry was written and flushed.
    Flushed(Outbound),

    /// Writing the front outbound entry failed.
    WriteFailed(Outbound, io::Error),
}

/// Connection-wide settings used when preparing a pipeline.
#[derive(Debug)]
pub(crate) struct PipelineSettings {
    pub(crate) debug_logging: bool,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) tls: Arc<TlsConfigs>,
}

/// The stages installed on one connection.
#[derive(Debug)]
pub(crate) struct Pipeline {
    pub(crate) transport: Option<Transport>,
    pub(crate) idle: Option<IdleTimer>,
    pub(crate) debug: bool,
    pub(crate) call_timer: Option<CallTimer>,
    pub(crate) codec: Option<HttpClientCodec>,
    pub(crate) relay: Option<CallRelay>,
    pub(crate) read_buf: BytesMut,
    pub(crate) outbound: VecDeque<Outbound>,
}

impl Pipeline {
    pub(crate) fn new(transport: Transport) -> Self {
        Self {
            transport: Some(transport),
            idle: None,
            debug: false,
            call_timer: None,
            codec: None,
            relay: None,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            outbound: VecDeque::new(),
        }
    }

    /// Names of the installed stages, in order.
    pub(crate) fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::with_capacity(7);
        if self.idle.is_some() {
            names.push(IDLE_GUARD);
        }
        if self.debug {
            names.push(DEBUG_LOGGER);
        }
        if self.call_timer.is_some() {
            names.push(CALL_TIMEOUT);
        }
        if self.transport.as_ref().is_some_and(Transport::is_tls) {
            names.push(TLS);
        }
        if self.codec.is_some() {
            names.push(HTTP_CODEC);
        }
        if self.relay.is_some() {
            names.push(CHUNK_RELAY);
            names.push(ERROR_RELAY);
        }
        names
    }

    /// Returns `true` while the installed relay's call is active.
    pub(crate) fn call_active(&self) -> bool {
        self.relay
            .as_ref()
            .is_some_and(|relay| relay.call.is_active())
    }

    /// The call timer's deadline, only while the call it guards is active.
    pub(crate) fn call_deadline(&self) -> Option<tokio::time::Instant> {
        self.call_timer
            .filter(|_| self.call_active())
            .map(|timer| timer.deadline)
    }

    /// Queue encoded bytes behind anything already waiting to be written.
    pub(crate) fn queue(&mut self, data: Bytes, waiter: Waiter) {
        self.outbound.push_back(Outbound { data, waiter });
    }

    /// Make progress on the front outbound entry, then on reading.
    ///
    /// Pending while there is no transport.
    pub(crate) fn poll_io(&mut self, cx: &mut Context<'_>) -> Poll<IoEvent> {
        let Some(transport) = self.transport.as_mut() else {
            return Poll::Pending;
        };

        if let Some(front) = self.outbound.front_mut() {
            let progress = if front.data.is_empty() {
                Pin::new(&mut *transport).poll_flush(cx).map_ok(|()| None)
            } else {
                Pin::new(&mut *transport)
                    .poll_write(cx, &front.data)
                    .map_ok(Some)
            };

            match progress {
                Poll::Ready(Ok(Some(n))) if n > 0 => {
                    front.data.advance(n);
                    return Poll::Ready(IoEvent::Wrote(n));
                }
                Poll::Pending => {}
                Poll::Ready(result) => {
                    if let Some(done) = self.outbound.pop_front() {
                        return Poll::Ready(match result {
                            Ok(None) => IoEvent::Flushed(done),
                            Ok(Some(_)) => {
                                IoEvent::WriteFailed(done, io::ErrorKind::WriteZero.into())
                            }
                            Err(error) => IoEvent::WriteFailed(done, error),
                        });
                    }
                }
            }
        }

        let mut chunk = [0u8; READ_CHUNK];
        let mut buf = ReadBuf::new(&mut chunk);
        match Pin::new(transport).poll_read(cx, &mut buf) {
            Poll::Ready(Ok(())) => {
                let filled = buf.filled();
                self.read_buf.extend_from_slice(filled);
                Poll::Ready(IoEvent::Read(Ok(filled.len())))
            }
            Poll::Ready(Err(error)) => Poll::Ready(IoEvent::Read(Err(error))),
            Poll::Pending => Poll::Pending,
        }
    }

    /// Take every queued write, oldest first.
    pub(crate) fn take_outbound(&mut self) -> impl Iterator<Item = Outbound> + '_ {
        self.outbound.drain(..)
    }

    /// Reconfigure the stages for a new call, up to (but not including) the relays.
    pub(crate) async fn prepare(
        &mut self,
        shared: &Shared,
        params: &CallSetup,
        settings: &PipelineSettings,
    ) -> Result<(), Error> {
        if let Some(idle) = self.idle.take() {
            trace!(epoch = idle.epoch, "removed {IDLE_GUARD}");
        }

        if settings.debug_logging && !self.debug {
            self.debug = true;
            debug!(target: DEBUG_TARGET, conn = %shared.id(), "installed {DEBUG_LOGGER}");
        }

        self.call_timer = params
            .call_timeout
            .filter(|timeout| !timeout.is_zero())
            .map(CallTimer::new);

        let switching = params.is_secure != self.transport.as_ref().is_some_and(Transport::is_tls);
        if switching && !self.outbound.is_empty() {
            return Err(Error::setup(
                "unable to change tls on a connection with unflushed writes",
                io::Error::from(io::ErrorKind::WouldBlock),
            ));
        }

        let transport = self
            .transport
            .take()
            .ok_or(Error::ConnectionClosed(shared.id()))?;

        match (params.is_secure, transport.is_tls()) {
            (true, false) => {
                let config = settings.tls.get(params.relaxed_tls)?;
                let stream = tls::handshake(config, &params.host, transport.into_plain())
                    .await
                    .map_err(|error| {
                        Error::setup("unable to complete tls handshake with downstream host", error)
                    })?;
                trace!(relaxed = params.relaxed_tls, "installed {TLS}");
                self.transport = Some(Transport::Tls(Box::new(stream)));
            }
            (false, true) => {
                self.transport = Some(Transport::Plain(transport.into_plain()));
                self.remove_codec(shared);
                trace!("removed {TLS}");
            }
            _ => self.transport = Some(transport),
        }

        let health = inspect(shared.probe());
        if self.codec.is_none() || health != CodecHealth::Clean {
            if health.is_stuck() {
                debug!(?health, "replacing {HTTP_CODEC} left mid-message by a previous call");
            }
            self.codec = Some(HttpClientCodec::new(shared.probe().clone()));
            self.read_buf.clear();
        }

        Ok(())
    }

    fn remove_codec(&mut self, shared: &Shared) {
        if self.codec.take().is_some() {
            shared.probe().uninstall();
            self.read_buf.clear();
        }
    }
}

/// A leased connection, and the pool it goes back to.
pub(crate) struct Lease {
    conn: Connection,
    pool: WeakOpt<AddressPool>,
}

impl Lease {
    pub(crate) fn new(conn: Connection, pool: WeakOpt<AddressPool>) -> Self {
        Self { conn, pool }
    }
}

/// The chunk relay and error relay for one call.
///
/// The relay holds the call's lease until the call deactivates, so the
/// connection goes back to its pool even when the caller has already
/// dropped its [`StreamingChannel`][crate::StreamingChannel].
pub(crate) struct CallRelay {
    call: Arc<CallState>,
    lease: Option<Lease>,
    setup: Option<oneshot::Sender<Result<(), Error>>>,
    callback: Arc<dyn StreamingCallback>,
    context: CallContext,
    performed_subspan: bool,
    breaker: Option<Arc<dyn CircuitBreaker>>,
    log_after_finish: bool,
}

impl std::fmt::Debug for CallRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRelay")
            .field("call", &self.call)
            .field("leased", &self.lease.is_some())
            .field("in_setup", &self.setup.is_some())
            .field("performed_subspan", &self.performed_subspan)
            .finish()
    }
}

impl CallRelay {
    pub(crate) fn new(
        call: Arc<CallState>,
        lease: Lease,
        callback: Arc<dyn StreamingCallback>,
        context: CallContext,
        performed_subspan: bool,
        breaker: Option<Arc<dyn CircuitBreaker>>,
        log_after_finish: bool,
    ) -> Self {
        Self {
            call,
            lease: Some(lease),
            setup: None,
            callback,
            context,
            performed_subspan,
            breaker,
            log_after_finish,
        }
    }

    pub(crate) fn call(&self) -> &Arc<CallState> {
        &self.call
    }

    /// Hold the caller's setup reply until the request head is flushed.
    ///
    /// Until then, a failure is reported through that reply rather than the callback.
    pub(crate) fn await_setup(&mut self, reply: oneshot::Sender<Result<(), Error>>) {
        self.setup = Some(reply);
    }

    /// The request head is on the wire, so the caller gets its channel.
    pub(crate) fn setup_complete(&mut self) {
        if let Some(reply) = self.setup.take() {
            if reply.send(Ok(())).is_err() {
                trace!("caller went away before setup finished");
            }
        }
    }

    /// Forward one inbound message to the callback.
    ///
    /// Messages are only forwarded while the call is active. The terminal
    /// message finishes the call and returns the connection to the pool.
    pub(crate) fn message_received(&mut self, chunk: ResponseChunk) {
        if !self.call.is_active() {
            if self.log_after_finish {
                self.context.in_scope(|| {
                    warn!(
                        message = ?chunk,
                        "received response message after the downstream call finished"
                    )
                });
            }
            return;
        }

        let is_last = chunk.is_last();
        if is_last {
            self.call.set_terminal_chunk_sent();
            self.setup_complete();
        }

        self.context.in_scope(|| {
            self.callback.message_received(chunk);
            if is_last {
                self.finish_span();
            }
        });

        if is_last {
            if let Some(breaker) = &self.breaker {
                breaker.report(Outcome::Success);
            }
            if self.call.deactivate() {
                self.release("last response chunk received");
            }
        }
    }

    /// Route a pipeline error to the callback and tear the call down.
    ///
    /// During setup the error goes to the caller's setup reply instead. Once
    /// the call is no longer active, errors are only logged.
    pub(crate) fn error_occurred(&mut self, error: Error, shared: &Shared) {
        if !self.call.deactivate() {
            self.context.in_scope(|| {
                if matches!(error, Error::DownstreamIdleChannelTimeout(_)) {
                    debug!(conn = %shared.id(), "closing idle downstream connection: {error}");
                } else {
                    warn!(
                        conn = %shared.id(),
                        "error on downstream connection after the call finished, ignoring: {error}"
                    );
                }
            });
            return;
        }

        shared.mark_broken();

        if let Some(reply) = self.setup.take() {
            self.context
                .in_scope(|| debug!(conn = %shared.id(), "downstream call failed during setup: {error}"));
            if reply.send(Err(error)).is_err() {
                trace!("caller went away before setup finished");
            }
            self.release("error while setting up downstream call");
            return;
        }

        self.context.in_scope(|| {
            self.finish_span();
            debug!(conn = %shared.id(), "downstream call failed: {error}");
            self.callback.unrecoverable_error_occurred(error, true);
        });

        if let Some(breaker) = &self.breaker {
            breaker.report(Outcome::Failure);
        }
        self.release("error in downstream call pipeline");
    }

    /// Close the connection on behalf of the caller, if `call` is still active.
    pub(crate) fn close_due_to_error(
        &mut self,
        call: &Arc<CallState>,
        cause: &str,
        shared: &Shared,
    ) -> bool {
        if !Arc::ptr_eq(&self.call, call) || !call.is_active() {
            debug!(
                conn = %shared.id(),
                "the call deactivated before the channel could be closed, ignoring unrecoverable error: {cause}"
            );
            return false;
        }

        self.context.in_scope(|| {
            tracing::error!(
                conn = %shared.id(),
                unrecoverable_error = cause,
                "closing streaming channel due to unrecoverable error"
            )
        });

        shared.mark_broken();
        if self.call.deactivate() {
            self.release("closing streaming channel due to unrecoverable error");
        }
        true
    }

    fn finish_span(&self) {
        if self.performed_subspan {
            finish_call_span();
        }
    }

    fn release(&mut self, reason: &'static str) {
        let Some(Lease { conn, pool }) = self.lease.take() else {
            trace!(reason, "connection already released");
            return;
        };

        trace!(conn = %conn.id(), reason, "releasing downstream connection");
        match pool.upgrade() {
            Some(pool) => pool.release(conn),
            None => conn.close(),
        }
    }
}

/// Complete the span started for a call: the sub-span, or the root span when
/// it is the only one on the stack.
pub(crate) fn finish_call_span() {
    match Tracer::current_span_stack_copy() {
        Some(spans) if spans.len() >= 2 => Tracer::complete_sub_span(),
        _ => Tracer::complete_request_span(),
    }
}

/// Log the request head through the debug logging stage.
pub(crate) fn log_request_head(id: ConnectionId, head: &http::Request<()>) {
    debug!(
        target: DEBUG_TARGET,
        conn = %id,
        method = %head.method(),
        uri = %head.uri(),
        headers = ?head.headers(),
        "writing downstream request head"
    );
}
