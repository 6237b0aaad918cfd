//! Server-sent events stream for bot activity. Replaces the teacher's
//! dashboard WebSocket -- SSE is simpler for a one-way, reconnecting feed and
//! matches the spec's `GET /events/stream` contract.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use futures_util::stream::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::events::Unsubscribe;
use crate::server::auth::AuthUser;
use crate::state::AppState;

/// Calls `Unsubscribe::call` exactly once, when the stream it's attached to
/// is dropped (client disconnect, or the server giving up on the response).
struct UnsubscribeGuard(Option<Unsubscribe>);

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        if let Some(unsub) = self.0.take() {
            unsub.call();
        }
    }
}

pub struct EventStream {
    inner: ReceiverStream<String>,
    _guard: UnsubscribeGuard,
}

impl Stream for EventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_next(cx).map(|opt| opt.map(|payload| Ok(Event::default().data(payload))))
    }
}

/// GET /events/stream -- every event for the authenticated user's bots, as
/// they're emitted. The subscription lives exactly as long as the HTTP
/// connection; dropping the stream on client disconnect unsubscribes.
pub async fn stream_events(State(state): State<Arc<AppState>>, user: AuthUser) -> Sse<KeepAliveStream<EventStream>> {
    let (tx, rx) = mpsc::channel(256);

    let unsub = state.events.subscribe_user(user.user_id.clone(), move |event| {
        let payload = serde_json::to_string(event).unwrap_or_default();
        let _ = tx.try_send(payload);
    });

    let stream = EventStream { inner: ReceiverStream::new(rx), _guard: UnsubscribeGuard(Some(unsub)) };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
