// Chunked view streaming - Newline-delimited JSON session views
use crate::domain::session::SessionView;
use axum::body::Body;
use axum::http::{Response, StatusCode, header};
use axum::response::IntoResponse;
use futures::StreamExt;
use futures::stream::Stream;
use tokio::sync::watch;

/// Create a chunked NDJSON response, one view per line
pub fn ndjson_stream<S>(stream: S) -> Result<Response<Body>, StatusCode>
where
    S: Stream<Item = SessionView> + Send + 'static,
{
    let lines = stream.map(|view| serialize_line(&view));
    let body = Body::from_stream(lines);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

fn serialize_line(view: &SessionView) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(view)?;
    line.push('\n');
    Ok(line)
}

/// Stream the current view, then every published change until the session goes away
pub fn stream_from_watch(mut rx: watch::Receiver<SessionView>) -> impl IntoResponse {
    let stream = async_stream::stream! {
        let current = rx.borrow_and_update().clone();
        yield current;
        while rx.changed().await.is_ok() {
            let view = rx.borrow_and_update().clone();
            yield view;
        }
    };

    match ndjson_stream(stream) {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}
