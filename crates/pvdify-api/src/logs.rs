//! Server-sent log stream.
//!
//! Each journal line becomes one `data:` event. A follower read error is
//! sent as an `error` event and ends the stream. When the client goes away
//! axum drops the body stream, and with it the follower process.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use tracing::debug;

use pvdify_orchestrator::LogRequest;

use crate::ApiState;
use crate::error::ApiResult;

/// GET /api/v1/apps/{name}/logs?process=web&lines=100&follow=true
pub async fn stream_logs(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(request): Query<LogRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let lines = state.orchestrator.stream_logs(&name, &request).await?;
    debug!(app = %name, follow = request.follow, "log stream opened");

    let events = lines
        .scan(false, |failed, line| {
            if *failed {
                return futures::future::ready(None);
            }
            let event = match line {
                Ok(line) => Event::default().data(line),
                Err(e) => {
                    *failed = true;
                    Event::default().event("error").data(e.to_string())
                }
            };
            futures::future::ready(Some(Ok(event)))
        });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}
