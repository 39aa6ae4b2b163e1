//! Single writer task for an agent's stdin.
//!
//! Every outbound frame for one agent passes through one bounded
//! [`mpsc`] channel drained by [`run_writer`], so concurrent callers can
//! never interleave bytes of two frames on the wire.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Capacity of a bridge's outbound frame channel.
pub const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Drain `frames` into `sink` as NDJSON until cancelled or all senders drop.
///
/// Each frame is serialised compactly, terminated by `\n`, written with
/// `write_all` and flushed before the next frame is taken.
///
/// # Errors
///
/// Returns [`AppError::Acp`]`("write failed: …")` when the sink rejects a
/// write, typically because the agent process has exited.
pub async fn run_writer<W>(
    label: String,
    sink: W,
    mut frames: mpsc::Receiver<serde_json::Value>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut sink = sink;

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(label = %label, "agent writer: cancelled");
                break;
            }

            frame = frames.recv() => {
                let Some(value) = frame else {
                    debug!(label = %label, "agent writer: channel closed");
                    break;
                };

                let mut bytes = serde_json::to_vec(&value)?;
                bytes.push(b'\n');

                let written = async {
                    sink.write_all(&bytes).await?;
                    sink.flush().await
                }
                .await;

                if let Err(e) = written {
                    warn!(label = %label, error = %e, "agent writer: write to stdin failed");
                    return Err(AppError::Acp(format!("write failed: {e}")));
                }
            }
        }
    }

    // Closing stdin lets a well-behaved agent observe EOF.
    let _ = sink.shutdown().await;
    Ok(())
}
