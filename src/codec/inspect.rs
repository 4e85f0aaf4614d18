//! Codec health inspection.
//!
//! A call that is aborted halfway through a request or response leaves the
//! connection's codec mid-message. Reusing such a codec would misframe the
//! next call, so the pool and the pipeline provisioner check it first.

use tracing::warn;

use super::{CodecProbe, DecoderState, EncoderState};

/// What [`inspect`] found on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecHealth {
    /// No codec is installed.
    Absent,

    /// Both halves of the codec are between messages.
    Clean,

    /// The response decoder is partway through a message.
    InboundStuck(DecoderState),

    /// The request encoder is partway through a message.
    OutboundStuck(EncoderState),
}

impl CodecHealth {
    /// Returns `true` if a codec is installed but is not between messages.
    pub fn is_stuck(&self) -> bool {
        matches!(
            self,
            CodecHealth::InboundStuck(_) | CodecHealth::OutboundStuck(_)
        )
    }
}

/// Inspect the codec published on `probe`.
///
/// The decoder is checked before the encoder. A stuck codec is logged at warn.
pub fn inspect(probe: &CodecProbe) -> CodecHealth {
    if !probe.is_installed() {
        return CodecHealth::Absent;
    }

    let decoder = probe.decoder_state();
    if decoder != DecoderState::SkipControlChars {
        warn!(
            state = ?decoder,
            "HTTP client codec inbound (response) handler is in an incorrect state"
        );
        return CodecHealth::InboundStuck(decoder);
    }

    let encoder = probe.encoder_state();
    if encoder != EncoderState::Init {
        warn!(
            state = ?encoder,
            "HTTP client codec outbound (request) handler is in an incorrect state"
        );
        return CodecHealth::OutboundStuck(encoder);
    }

    CodecHealth::Clean
}
