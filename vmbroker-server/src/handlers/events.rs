use std::convert::Infallible;
use std::pin::Pin;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    response::Sse,
    response::sse::{Event, KeepAlive, KeepAliveStream},
};
use tokio_stream::{self as stream, Stream, StreamExt, wrappers::BroadcastStream};
use tracing::warn;
use uuid::Uuid;

use vmbroker_model::SessionEvent;

use crate::errors::AppResult;
use crate::handlers::{CallerId, sessions::owned_session};
use crate::infra::app_state::AppState;

type EventStream =
    Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

/// Live event stream for one session.
///
/// The stream opens with a snapshot of the session's current status (and
/// checklist, when non-empty), so a subscriber never has to guess what it
/// missed, then follows with events in the order transitions were applied.
/// The stream ends once a terminal status has been delivered.
pub async fn session_events(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<Uuid>,
) -> AppResult<Sse<KeepAliveStream<EventStream>>> {
    owned_session(&state, caller, id).await?;

    // Subscribe before taking the snapshot so no transition can fall between
    // the snapshot and the live stream. Deleted sessions stay readable, so
    // the re-read cannot fail for a session that just turned terminal.
    let receiver = state.bus.subscribe(id.into());
    let session = owned_session(&state, caller, id).await?;

    let mut snapshot = vec![SessionEvent::StatusUpdate {
        session_id: session.id,
        status: session.status,
        result: session.result.clone(),
    }];
    if !session.checklist.is_empty() {
        snapshot.push(SessionEvent::ChecklistUpdate {
            session_id: session.id,
            items: session.checklist.clone(),
        });
    }
    let initial =
        stream::iter(snapshot.into_iter().filter_map(to_sse).map(Ok));

    let events: EventStream = if session.status.is_terminal() {
        // Already terminal: the snapshot is the whole story. The channel
        // created by the subscribe above would never be closed by a publish.
        drop(receiver);
        state.bus.close(session.id);
        Box::pin(initial)
    } else {
        let live = BroadcastStream::new(receiver).filter_map(|item| {
            match item {
                Ok(event) => to_sse(event).map(Ok),
                Err(err) => {
                    // Lagged subscriber skipped ahead; snapshots make the
                    // gap recoverable by re-reading the session.
                    warn!(%err, "session event subscriber lagged");
                    None
                }
            }
        });
        Box::pin(initial.chain(live))
    };

    Ok(Sse::new(events).keep_alive(default_keep_alive()))
}

fn to_sse(event: SessionEvent) -> Option<Event> {
    let name = event.name();
    match serde_json::to_string(&event) {
        Ok(data) => Some(Event::default().event(name).data(data)),
        Err(err) => {
            warn!(%err, "failed to serialize session event");
            None
        }
    }
}

fn default_keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(15))
        .text("keep-alive")
}
