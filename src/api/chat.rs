use super::AppState;
use crate::events::StreamEvent;
use crate::turn::{self, TurnError};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Frames buffered between the turn task and the response body
const EVENT_BUFFER: usize = 32;

/// `POST /api/chat`: run one turn and stream it back as server-sent events.
///
/// Rejections found before streaming starts get their own status code and a
/// single `error` frame. Once streaming starts the status is 200 and failures
/// arrive as the terminal `error` event.
pub async fn chat_turn(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let services = Arc::clone(&state.services);
    let prepared = match turn::prepare(&services, &headers, &body).await {
        Ok(prepared) => prepared,
        Err(e) => return rejection(&e),
    };

    let (tx, rx) = mpsc::channel::<StreamEvent>(EVENT_BUFFER);
    tokio::spawn(async move {
        turn::run(&services, prepared, &tx).await;
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        if event.is_terminal() {
            tracing::debug!(event = event.name(), "chat stream finished");
        }
        Event::default().event(event.name()).json_data(&event)
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

fn rejection(error: &TurnError) -> Response {
    let frame = StreamEvent::Error {
        error: error.user_message(),
    }
    .to_frame();
    (
        error.status(),
        [(header::CONTENT_TYPE, "text/event-stream")],
        frame,
    )
        .into_response()
}
