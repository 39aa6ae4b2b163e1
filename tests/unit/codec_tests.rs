//! Unit tests for the NDJSON line codec used on agent stdio.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use acp_proxy::acp::codec::NdjsonCodec;
use acp_proxy::AppError;

// ── Decoding ─────────────────────────────────────────────────────────────────

/// Two complete lines in one buffer decode one at a time.
#[test]
fn batched_lines_decode_in_order() {
    let mut codec = NdjsonCodec::new();
    let mut buf = BytesMut::from("{\"id\":1}\n{\"id\":2}\n");

    let first = codec.decode(&mut buf).expect("first decode");
    let second = codec.decode(&mut buf).expect("second decode");
    let third = codec.decode(&mut buf).expect("third decode");

    assert_eq!(first.as_deref(), Some("{\"id\":1}"));
    assert_eq!(second.as_deref(), Some("{\"id\":2}"));
    assert!(third.is_none());
}

/// A line without its newline is held until the rest arrives.
#[test]
fn partial_line_is_buffered() {
    let mut codec = NdjsonCodec::new();
    let mut buf = BytesMut::from("{\"method\":\"ses");

    assert!(codec.decode(&mut buf).expect("partial decode").is_none());

    buf.extend_from_slice(b"sion/update\"}\n");
    let line = codec.decode(&mut buf).expect("completed decode");
    assert_eq!(line.as_deref(), Some("{\"method\":\"session/update\"}"));
}

/// A trailing line without newline is flushed at EOF.
#[test]
fn final_line_flushed_at_eof() {
    let mut codec = NdjsonCodec::new();
    let mut buf = BytesMut::from("{\"id\":7}");

    let line = codec.decode_eof(&mut buf).expect("eof decode");
    assert_eq!(line.as_deref(), Some("{\"id\":7}"));
}

/// Over-long lines fail with an `Acp` error and the codec recovers on the
/// next line.
#[test]
fn over_long_line_is_rejected_then_skipped() {
    let mut codec = NdjsonCodec::with_max_length(16);
    let mut buf = BytesMut::from("0123456789abcdefXYZ\n{\"ok\":1}\n");

    let err = codec.decode(&mut buf).expect_err("line exceeds limit");
    assert!(
        matches!(&err, AppError::Acp(msg) if msg.contains("line too long")),
        "unexpected error: {err}"
    );

    let mut next = None;
    for _ in 0..4 {
        match codec.decode(&mut buf) {
            Ok(Some(line)) => {
                next = Some(line);
                break;
            }
            Ok(None) | Err(_) => {}
        }
    }
    assert_eq!(next.as_deref(), Some("{\"ok\":1}"));
}

// ── Encoding ─────────────────────────────────────────────────────────────────

/// Encoding appends exactly one newline.
#[test]
fn encode_appends_newline() {
    let mut codec = NdjsonCodec::new();
    let mut dst = BytesMut::new();

    codec
        .encode("{\"jsonrpc\":\"2.0\"}".to_owned(), &mut dst)
        .expect("encode");

    assert_eq!(&dst[..], b"{\"jsonrpc\":\"2.0\"}\n");
}
