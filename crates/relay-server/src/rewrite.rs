use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use futures::StreamExt;

/// How much of a 400 body gets buffered before giving up on the rewrite.
const SESSION_ERROR_BUFFER_LIMIT: usize = 512;

const SESSION_ERROR_MARKERS: [&str; 2] = ["Invalid session ID", "session not found"];

/// Rewrites invalid-session 400 responses to 404 on the streamable-HTTP
/// path.
///
/// Clients are required to re-initialize on 404 for an expired or unknown
/// session, but the handler library reports those as 400. Only short POST
/// error envelopes are candidates: the body is buffered up to 512 bytes and
/// re-emitted verbatim; anything larger (or any read error) flips to
/// passthrough with the buffered prefix replayed ahead of the remaining
/// stream, which keeps SSE payloads streaming untouched.
pub async fn rewrite_session_errors(request: Request, next: Next) -> Response {
    let is_post = request.method() == Method::POST;
    let response = next.run(request).await;
    if !is_post || response.status() != StatusCode::BAD_REQUEST {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let mut stream = body.into_data_stream();
    let mut buffered: Vec<Bytes> = Vec::new();
    let mut total = 0usize;

    loop {
        match stream.next().await {
            Some(Ok(chunk)) => {
                total += chunk.len();
                buffered.push(chunk);
                if total > SESSION_ERROR_BUFFER_LIMIT {
                    let replay =
                        futures::stream::iter(buffered.into_iter().map(Ok::<_, axum::Error>));
                    return Response::from_parts(parts, Body::from_stream(replay.chain(stream)));
                }
            }
            Some(Err(error)) => {
                let replay = futures::stream::iter(buffered.into_iter().map(Ok::<_, axum::Error>))
                    .chain(futures::stream::once(async move { Err(error) }));
                return Response::from_parts(parts, Body::from_stream(replay));
            }
            None => break,
        }
    }

    let body: Bytes = buffered.concat().into();
    if is_session_error(&body) {
        parts.status = StatusCode::NOT_FOUND;
    }
    Response::from_parts(parts, Body::from(body))
}

fn is_session_error(body: &[u8]) -> bool {
    let text = String::from_utf8_lossy(body);
    SESSION_ERROR_MARKERS
        .iter()
        .any(|marker| text.contains(marker))
}
