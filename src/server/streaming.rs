//! SSE (Server-Sent Events) streaming for chunk-by-chunk responses.
//!
//! Converts a streaming request's chunk channel plus its completion handle
//! into an SSE stream: one event per chunk, then a final event carrying either
//! the token count or the error, then the `[DONE]` sentinel.

use std::convert::Infallible;

use axum::response::sse::Event;
use futures::stream::{self, Stream};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::scheduler::CompletionHandle;

/// One streamed chunk.
#[derive(Debug, Serialize)]
pub struct ChunkEvent {
    pub request_id: String,
    pub text: String,
}

/// Terminal event sent before the sentinel.
#[derive(Debug, Serialize)]
pub struct FinalEvent {
    pub request_id: String,
    pub finish_reason: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
}

pub const DONE_SENTINEL: &str = "[DONE]";

/// Convert a chunk receiver and its completion handle into an SSE stream.
pub fn chunks_to_sse_stream(
    rx: mpsc::Receiver<String>,
    handle: CompletionHandle,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let request_id = handle.request_id().to_string();
    let chunk_id = request_id.clone();

    let chunks = ReceiverStream::new(rx).map(move |text| {
        let event = ChunkEvent {
            request_id: chunk_id.clone(),
            text,
        };
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok::<_, Infallible>(Event::default().data(data))
    });

    // The chunk channel closes when the dispatcher finishes the stream; the
    // handle then carries the outcome.
    let last = stream::once(async move {
        let event = match handle.await {
            Ok(result) => FinalEvent {
                request_id,
                finish_reason: "stop",
                tokens: Some(result.tokens),
                error: None,
                kind: None,
            },
            Err(err) => FinalEvent {
                request_id,
                finish_reason: "error",
                tokens: None,
                error: Some(err.to_string()),
                kind: Some(err.kind()),
            },
        };
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok::<_, Infallible>(Event::default().data(data))
    });

    chunks
        .chain(last)
        // Append the [DONE] sentinel after all events.
        .chain(tokio_stream::once(Ok(Event::default().data(DONE_SENTINEL))))
}
