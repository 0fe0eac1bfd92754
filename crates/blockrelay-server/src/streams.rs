//! Server-sent-event view of a broadcast stream.
//!
//! Every event carries the entry's offset as its SSE id, so a reconnecting
//! client resumes with `Last-Event-ID` and sees no gaps or duplicates.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use blockrelay_core::broadcast::{BroadcastEntry, Offset};
use blockrelay_core::ids::QueryId;
use blockrelay_engine::EngineError;

use crate::error::ApiError;
use crate::server::AppState;

const KEEP_ALIVE: Duration = Duration::from_secs(15);
const LAST_EVENT_ID: &str = "last-event-id";

#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    #[serde(default)]
    pub offset: Option<u64>,
}

/// `GET /v1/streams/{stream_id}?offset=N`
pub async fn follow_stream(
    State(state): State<AppState>,
    Path(stream_id): Path<QueryId>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let after = resume_offset(&headers, params.offset)?;
    let exists = state
        .coordinator
        .log()
        .exists(&stream_id)
        .await
        .map_err(EngineError::from)?;
    if !exists {
        return Err(ApiError::StreamNotFound(stream_id.to_string()));
    }

    debug!(stream_id = %stream_id, after = %after, "client following stream");
    let events = state.reader.follow(stream_id, after).map(|item| Ok(to_event(item)));
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE)))
}

/// `Last-Event-ID` wins over the query parameter.
fn resume_offset(headers: &HeaderMap, param: Option<u64>) -> Result<Offset, ApiError> {
    match headers.get(LAST_EVENT_ID) {
        Some(value) => {
            let raw = value
                .to_str()
                .map_err(|_| ApiError::BadRequest("Last-Event-ID is not valid text".into()))?;
            raw.parse::<Offset>().map_err(|e| ApiError::BadRequest(e.to_string()))
        }
        None => Ok(param.map(Offset).unwrap_or(Offset::START)),
    }
}

fn to_event(item: Result<BroadcastEntry, EngineError>) -> Event {
    match item {
        Ok(entry) => Event::default().id(entry.offset.to_string()).data(entry.payload),
        Err(err) => {
            warn!(error = %err, "stream follow ended with error");
            let content = err.to_stream_error(None);
            Event::default()
                .event("error")
                .json_data(&content)
                .unwrap_or_else(|_| Event::default().event("error").data(err.to_string()))
        }
    }
}
