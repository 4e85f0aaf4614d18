//! The task which owns a downstream connection.
//!
//! Every socket read and write, every pipeline change, and every timer
//! happens on this task. Handles talk to it through an unbounded command
//! queue, which is processed strictly in order: chunks are queued for writing
//! in the order `stream_chunk` was called. Queued writes are driven alongside
//! reads, so a slow writer never stops the response from being relayed.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt as _;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, Instrument as _};

use super::timeout::IdleTimer;
use super::transport::Transport;
use super::{CallState, Command, Connection, Shared};
use crate::client::pipeline::{self, CallParams, IoEvent, Pipeline, PipelineSettings, Waiter, DEBUG_TARGET};
use crate::codec::{BodyChunk, ResponseChunk};
use crate::error::Error;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Close,
}

/// Spawn the task for a freshly connected socket and return its handle.
pub(crate) fn spawn(
    runtime: &Handle,
    stream: TcpStream,
    address: SocketAddr,
    settings: Arc<PipelineSettings>,
) -> Connection {
    let shared = Arc::new(Shared::new(address));
    let (tx, rx) = mpsc::unbounded_channel();

    let driver = Driver {
        shared: shared.clone(),
        commands: rx,
        pipeline: Pipeline::new(Transport::Plain(stream)),
        settings,
    };

    let span = tracing::debug_span!("downstream", conn = %shared.id(), remote.addr = %shared.address());
    runtime.spawn(driver.run().instrument(span));

    Connection::new(shared, tx)
}

struct Driver {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    pipeline: Pipeline,
    settings: Arc<PipelineSettings>,
}

impl Driver {
    async fn run(mut self) {
        trace!("connection task started");
        let mut accepting = true;

        loop {
            let idle_deadline = self.pipeline.idle.map(|idle| idle.deadline);
            let call_deadline = self.pipeline.call_deadline();
            let far_future = Instant::now() + Duration::from_secs(86400 * 365);

            let step = tokio::select! {
                command = self.commands.recv(), if accepting => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        trace!("all connection handles dropped");
                        accepting = false;
                        Step::Continue
                    }
                },
                event = std::future::poll_fn(|cx| self.pipeline.poll_io(cx)) => {
                    self.on_io(event)
                },
                _ = tokio::time::sleep_until(idle_deadline.unwrap_or(far_future)), if idle_deadline.is_some() => {
                    self.on_idle_timeout()
                },
                _ = tokio::time::sleep_until(call_deadline.unwrap_or(far_future)), if call_deadline.is_some() => {
                    self.on_call_timeout()
                },
            };

            if step == Step::Close {
                break;
            }

            if !accepting && !self.pipeline.call_active() {
                break;
            }
        }

        self.shutdown().await;
    }

    async fn on_command(&mut self, command: Command) -> Step {
        match command {
            Command::Begin { params, reply } => {
                self.begin(*params, reply).await;
                Step::Continue
            }
            Command::Stream { chunk, call, reply } => {
                match self.encode_chunk(chunk, &call) {
                    Ok(Some(data)) => self.pipeline.queue(data, Waiter::Chunk(reply)),
                    Ok(None) => {
                        let _ = reply.send(Ok(()));
                    }
                    Err(error) => {
                        let _ = reply.send(Err(error));
                    }
                }
                Step::Continue
            }
            Command::CloseDueToError { call, cause } => {
                let closed = match self.pipeline.relay.as_mut() {
                    Some(relay) => relay.close_due_to_error(&call, &cause, &self.shared),
                    None => false,
                };

                if closed {
                    Step::Close
                } else {
                    Step::Continue
                }
            }
            Command::EnterIdle { epoch } => {
                if self.shared.lifecycle().is_idle_at(epoch) {
                    if let Some(timeout) = self.settings.idle_timeout {
                        trace!(epoch, ?timeout, "armed idle guard");
                        self.pipeline.idle = Some(IdleTimer::new(epoch, timeout));
                    }
                }
                Step::Continue
            }
            Command::Close => Step::Close,
        }
    }

    /// Prepare the pipeline, install the call's relays and queue the request head.
    ///
    /// The caller's reply is answered once the head has been flushed, or with
    /// the first error seen before then.
    async fn begin(&mut self, params: CallParams, reply: oneshot::Sender<Result<(), Error>>) {
        let started = std::time::Instant::now();
        let CallParams { setup, head, mut relay } = params;
        relay.await_setup(reply);

        let queued = match self.pipeline.prepare(&self.shared, &setup, &self.settings).await {
            Ok(()) => self.encode_head(&head, relay.call()),
            Err(error) => Err(error),
        };

        let data = match queued {
            Ok(data) => data,
            Err(error) => {
                relay.error_occurred(error, &self.shared);
                return;
            }
        };

        if self.pipeline.debug {
            pipeline::log_request_head(self.shared.id(), &head);
        }
        self.pipeline.relay = Some(relay);
        self.pipeline.queue(data, Waiter::Head);

        trace!(
            elapsed_micros = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
            stages = ?self.pipeline.names(),
            "pipeline prepared and request head queued"
        );
    }

    fn encode_head(&mut self, head: &http::Request<()>, call: &CallState) -> Result<Bytes, Error> {
        let codec = self
            .pipeline
            .codec
            .as_mut()
            .ok_or(Error::ConnectionClosed(self.shared.id()))?;

        let mut buf = BytesMut::with_capacity(1024);
        let encoded = codec.encode_head(head, &mut buf)?;
        if encoded.message_complete {
            call.set_terminal_chunk_sent();
        }
        Ok(buf.freeze())
    }

    /// Check and encode one body chunk. `None` means the chunk was absorbed.
    fn encode_chunk(&mut self, chunk: BodyChunk, call: &CallState) -> Result<Option<Bytes>, Error> {
        if call.terminal_chunk_sent() && chunk.is_empty_last() {
            trace!("ignoring empty last chunk after the terminal chunk was already sent");
            return Ok(None);
        }

        if !call.is_active() {
            return Err(Error::CallInactive);
        }

        if call.is_closed_due_to_error() {
            return Err(Error::ClosedDueToUnrecoverableError);
        }

        let codec = self
            .pipeline
            .codec
            .as_mut()
            .ok_or(Error::ConnectionClosed(self.shared.id()))?;

        let is_last = chunk.is_last();
        let mut buf = BytesMut::with_capacity(chunk.data().len() + 32);
        let encoded = codec.encode_body(chunk, &mut buf)?;
        if encoded.message_complete || is_last {
            call.set_terminal_chunk_sent();
        }
        Ok(Some(buf.freeze()))
    }

    fn on_io(&mut self, event: IoEvent) -> Step {
        match event {
            IoEvent::Read(read) => self.on_read(read),
            IoEvent::Wrote(n) => {
                if self.pipeline.debug {
                    debug!(target: DEBUG_TARGET, conn = %self.shared.id(), bytes = n, "wrote to downstream");
                }
                self.touch_call_timer();
                Step::Continue
            }
            IoEvent::Flushed(done) => {
                self.touch_call_timer();
                match done.waiter {
                    Waiter::Head => {
                        if let Some(relay) = self.pipeline.relay.as_mut() {
                            relay.setup_complete();
                        }
                    }
                    Waiter::Chunk(reply) => {
                        let _ = reply.send(Ok(()));
                    }
                }
                Step::Continue
            }
            IoEvent::WriteFailed(done, error) => {
                self.shared.mark_broken();
                let error = Error::from_pipeline_io(error);
                match done.waiter {
                    Waiter::Head => self.fail_call(error),
                    Waiter::Chunk(reply) => {
                        let _ = reply.send(Err(error));
                    }
                }
                Step::Continue
            }
        }
    }

    fn touch_call_timer(&mut self) {
        if let Some(timer) = self.pipeline.call_timer.as_mut() {
            timer.touch();
        }
    }

    fn on_read(&mut self, read: io::Result<usize>) -> Step {
        match read {
            Err(error) => {
                self.fail_call(Error::from_pipeline_io(error));
                Step::Close
            }
            Ok(0) => {
                trace!("downstream closed the connection");
                let step = self.drain(true);
                if step == Step::Continue && self.pipeline.call_active() {
                    self.fail_call(Error::DownstreamChannelClosedUnexpectedly(self.shared.id()));
                }
                Step::Close
            }
            Ok(n) => {
                if self.pipeline.debug {
                    debug!(target: DEBUG_TARGET, conn = %self.shared.id(), bytes = n, "read from downstream");
                }
                self.touch_call_timer();
                self.drain(false)
            }
        }
    }

    /// Decode and relay everything buffered so far.
    fn drain(&mut self, eof: bool) -> Step {
        loop {
            let Some(codec) = self.pipeline.codec.as_mut() else {
                if !self.pipeline.read_buf.is_empty() {
                    trace!(bytes = self.pipeline.read_buf.len(), "discarding data read with no codec installed");
                    self.pipeline.read_buf.clear();
                }
                return Step::Continue;
            };

            let decoded = if eof {
                codec.decode_eof(&mut self.pipeline.read_buf)
            } else {
                codec.decode(&mut self.pipeline.read_buf)
            };

            match decoded {
                Ok(Some(chunk)) => self.dispatch(chunk),
                Ok(None) => return Step::Continue,
                Err(error) => {
                    self.fail_call(Error::Codec(error));
                    return Step::Close;
                }
            }
        }
    }

    fn dispatch(&mut self, chunk: ResponseChunk) {
        match self.pipeline.relay.as_mut() {
            Some(relay) => relay.message_received(chunk),
            None => trace!(message = ?chunk, "dropping response message with no call installed"),
        }
    }

    fn fail_call(&mut self, error: Error) {
        match self.pipeline.relay.as_mut() {
            Some(relay) => relay.error_occurred(error, &self.shared),
            None => debug!("error on downstream connection with no call installed: {error}"),
        }
    }

    /// Fail every queued chunk write. A queued head is failed through the relay.
    fn fail_pending_writes(&mut self, error: impl Fn() -> Error) {
        for pending in self.pipeline.take_outbound() {
            if let Waiter::Chunk(reply) = pending.waiter {
                let _ = reply.send(Err(error()));
            }
        }
    }

    fn on_idle_timeout(&mut self) -> Step {
        let Some(idle) = self.pipeline.idle.take() else {
            return Step::Continue;
        };

        if self.shared.lifecycle().expire(idle.epoch) {
            self.fail_call(Error::DownstreamIdleChannelTimeout(idle.timeout));
            Step::Close
        } else {
            trace!(epoch = idle.epoch, "idle guard fired after the connection was leased");
            Step::Continue
        }
    }

    fn on_call_timeout(&mut self) -> Step {
        let Some(timer) = self.pipeline.call_timer.take() else {
            return Step::Continue;
        };

        if !self.pipeline.call_active() {
            return Step::Continue;
        }

        self.fail_pending_writes(|| Error::DownstreamCallTimeout(timer.timeout));
        self.fail_call(Error::DownstreamCallTimeout(timer.timeout));
        Step::Close
    }

    async fn shutdown(mut self) {
        self.shared.set_closed();
        self.commands.close();

        if self.pipeline.call_active() {
            self.fail_call(Error::ConnectionClosed(self.shared.id()));
        }
        let id = self.shared.id();
        self.fail_pending_writes(|| Error::ConnectionClosed(id));

        if self.pipeline.codec.take().is_some() {
            self.shared.probe().uninstall();
        }

        if let Some(mut transport) = self.pipeline.transport.take() {
            if let Ok(Err(error)) = tokio::time::timeout(SHUTDOWN_GRACE, transport.shutdown()).await {
                trace!("error shutting down downstream socket: {error}");
            }
        }

        // Drop queued commands so their callers see the connection as closed.
        while self.commands.try_recv().is_ok() {}

        trace!("connection task finished");
    }
}
