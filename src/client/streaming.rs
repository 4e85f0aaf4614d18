//! The caller's side of a downstream call.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use pin_project::pin_project;
use tokio::sync::oneshot;

use crate::client::conn::{CallState, Command, Connection, ConnectionId};
use crate::codec::{BodyChunk, ResponseChunk};
use crate::context::CallContext;
use crate::error::Error;

/// Receives the response to a downstream call.
///
/// Both methods are invoked on the connection's task with the call's
/// [`CallContext`] installed, and must not block.
pub trait StreamingCallback: Send + Sync + 'static {
    /// A response head or body chunk arrived. Chunks arrive in order, and the
    /// last one satisfies [`ResponseChunk::is_last`].
    fn message_received(&self, chunk: ResponseChunk);

    /// The call failed and no more messages will arrive.
    ///
    /// `guarantees_broken_downstream_request` is `true` when the downstream
    /// request is known to be unusable, so the caller should not expect any
    /// further response data.
    fn unrecoverable_error_occurred(&self, error: Error, guarantees_broken_downstream_request: bool);

    /// The original caller went away, so nothing more should be streamed back to it.
    fn cancel_streaming_to_original_caller(&self) {}
}

/// A handle for streaming the request body of one downstream call.
///
/// Returned by [`StreamingClient::stream_downstream_call`][crate::StreamingClient::stream_downstream_call]
/// once the request head has been written.
pub struct StreamingChannel {
    connection: Connection,
    call: Arc<CallState>,
    context: CallContext,
}

impl fmt::Debug for StreamingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingChannel")
            .field("connection", &self.connection.id())
            .field("active", &self.call.is_active())
            .finish()
    }
}

impl StreamingChannel {
    pub(crate) fn new(connection: Connection, call: Arc<CallState>, context: CallContext) -> Self {
        Self {
            connection,
            call,
            context,
        }
    }

    /// The connection this call is running on.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// Send one request body chunk downstream.
    ///
    /// The chunk is queued for the connection as soon as this is called, so
    /// chunks are written in the order `stream_chunk` is called, even if the
    /// returned futures are polled in a different order. The future resolves
    /// once the chunk has been written, or with the reason it was not.
    pub fn stream_chunk(&self, chunk: impl Into<BodyChunk>) -> WriteChunk {
        let (reply, receiver) = oneshot::channel();
        let command = Command::Stream {
            chunk: chunk.into(),
            call: self.call.clone(),
            reply,
        };

        match self.connection.send(command) {
            Ok(()) => WriteChunk::pending(self.connection.id(), receiver),
            Err(error) => WriteChunk::failed(error),
        }
    }

    /// Close the downstream connection because the call cannot continue.
    ///
    /// Only the first call while the downstream call is active has any effect;
    /// later calls are ignored.
    pub fn close_due_to_unrecoverable_error(&self, cause: &(dyn std::error::Error + 'static)) {
        let previously_closed = self.call.set_closed_due_to_error();

        if !previously_closed && self.call.is_active() {
            let command = Command::CloseDueToError {
                call: self.call.clone(),
                cause: cause.to_string(),
            };
            if self.connection.send(command).is_err() {
                tracing::trace!(conn = %self.connection.id(), "connection task already gone");
            }
            return;
        }

        if self.call.first_ignored_close() {
            self.context.in_scope(|| {
                tracing::debug!(
                    previously_called = previously_closed,
                    call_is_active = self.call.is_active(),
                    "ignoring close_due_to_unrecoverable_error, it was already called or the call is no longer active"
                )
            });
        }
    }

    /// Returns `true` until the downstream call finishes.
    pub fn is_active(&self) -> bool {
        self.call.is_active()
    }
}

/// Stop a downstream call whose original caller went away.
///
/// Tells `callback` to stop streaming back to the original caller, then closes
/// the downstream channel if the call is still going.
pub fn cancel_downstream_call(
    callback: &dyn StreamingCallback,
    channel: Option<&StreamingChannel>,
    reason: &(dyn std::error::Error + 'static),
) {
    callback.cancel_streaming_to_original_caller();

    if let Some(channel) = channel.filter(|channel| channel.is_active()) {
        channel.close_due_to_unrecoverable_error(reason);
    }
}

/// Future returned by [`StreamingChannel::stream_chunk`].
#[pin_project]
#[derive(Debug)]
pub struct WriteChunk {
    #[pin]
    state: WriteChunkState,
}

#[pin_project(project = WriteChunkStateProj)]
#[derive(Debug)]
enum WriteChunkState {
    Pending {
        id: ConnectionId,
        #[pin]
        receiver: oneshot::Receiver<Result<(), Error>>,
    },
    Failed(Option<Error>),
}

impl WriteChunk {
    fn pending(id: ConnectionId, receiver: oneshot::Receiver<Result<(), Error>>) -> Self {
        Self {
            state: WriteChunkState::Pending { id, receiver },
        }
    }

    fn failed(error: Error) -> Self {
        Self {
            state: WriteChunkState::Failed(Some(error)),
        }
    }
}

impl Future for WriteChunk {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().state.project() {
            WriteChunkStateProj::Pending { id, receiver } => match ready!(receiver.poll(cx)) {
                Ok(result) => Poll::Ready(result),
                Err(_) => Poll::Ready(Err(Error::ConnectionClosed(*id))),
            },
            WriteChunkStateProj::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(Error::CallInactive)))
            }
        }
    }
}
