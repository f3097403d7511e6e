//! NDJSON response streaming.
//!
//! Completion frames leave the scheduler on a bounded channel and are
//! serialized one JSON object per line. Dropping the response body (client
//! disconnect) trips the sequence's quit flag so the scheduler evicts it
//! on its next pass.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header;
use axum::response::Response;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::sched::CompletionFrame;

/// Sets the sequence's quit flag when the response body is dropped.
pub struct QuitGuard(pub Arc<AtomicBool>);

impl Drop for QuitGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

struct GuardedStream<S> {
    inner: S,
    _guard: QuitGuard,
}

impl<S: Stream + Unpin> Stream for GuardedStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Build the streaming NDJSON response for a completion.
pub fn ndjson_response(rx: mpsc::Receiver<CompletionFrame>, quit: Arc<AtomicBool>) -> Response {
    let lines = ReceiverStream::new(rx).map(|frame| {
        let mut line = serde_json::to_string(&frame).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        Ok::<_, std::convert::Infallible>(line)
    });
    let body = Body::from_stream(GuardedStream {
        inner: lines,
        _guard: QuitGuard(quit),
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(body)
        .expect("static response parts")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_quit_guard_fires_on_drop() {
        let quit = Arc::new(AtomicBool::new(false));
        let (_tx, rx) = mpsc::channel::<CompletionFrame>(4);
        let resp = ndjson_response(rx, quit.clone());
        drop(resp);
        assert!(quit.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_frames_serialize_one_per_line() {
        let quit = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(4);
        tx.send(CompletionFrame {
            content: "hi".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        drop(tx);

        let resp = ndjson_response(rx, quit);
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("\"content\":\"hi\""));
    }
}
