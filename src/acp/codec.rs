//! Newline-delimited line codec for agent stdio streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so a
//! misbehaving agent cannot make the proxy buffer an unbounded line. The
//! same codec frames JSON-RPC traffic on stdout and diagnostic lines on
//! stderr. `LinesCodec` drops a trailing `\r`, so CRLF output decodes cleanly.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum accepted line length for JSON-RPC frames: 8 MiB.
///
/// Agent responses can carry whole file contents, so the limit is generous.
pub const MAX_LINE_BYTES: usize = 8 * 1_048_576;

/// Maximum accepted line length for stderr diagnostics: 64 KiB.
pub const MAX_STDERR_LINE_BYTES: usize = 65_536;

/// Line codec for agent stdio.
///
/// Lines longer than the configured limit decode to
/// [`AppError::Acp`]`("line too long: …")`; the codec then discards input up
/// to the next newline and resumes. I/O errors map to [`AppError::Io`].
#[derive(Debug)]
pub struct NdjsonCodec {
    inner: LinesCodec,
    max_len: usize,
}

impl NdjsonCodec {
    /// Codec with the JSON-RPC [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Codec with a custom line limit.
    #[must_use]
    pub fn with_max_length(max_len: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_len),
            max_len,
        }
    }

    fn codec_error(&self, e: LinesCodecError) -> AppError {
        match e {
            LinesCodecError::MaxLineLengthExceeded => {
                AppError::Acp(format!("line too long: exceeded {} bytes", self.max_len))
            }
            LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
        }
    }
}

impl Default for NdjsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NdjsonCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.inner.decode(src).map_err(|e| self.codec_error(e))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.inner.decode_eof(src).map_err(|e| self.codec_error(e))
    }
}

impl Encoder<String> for NdjsonCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.inner.encode(item, dst).map_err(|e| self.codec_error(e))
    }
}
