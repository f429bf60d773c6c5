//! Axum middleware adapter.
//!
//! Wraps the detection engine as a pre-handler: build a request context
//! from the incoming parts, evaluate, then apply the decision — pass,
//! tag, delay, challenge, or short-circuit with a status reply.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::evidence::{Action, ChallengeKind};
use crate::request::{RequestContext, RequestContextBuilder};

/// Build an engine request context from axum request parts.
pub fn context_from_request(request: &Request<Body>, remote: SocketAddr) -> RequestContext {
    let path = request.uri().path().to_string();
    let query_count = request
        .uri()
        .query()
        .map(|q| q.split('&').filter(|kv| !kv.is_empty()).count())
        .unwrap_or(0);

    let mut builder: RequestContextBuilder =
        RequestContext::builder(request.method().as_str(), path)
            .query_count(query_count)
            .remote_addr(remote.ip())
            .https(
                request.uri().scheme_str() == Some("https")
                    || request
                        .headers()
                        .get("x-forwarded-proto")
                        .and_then(|v| v.to_str().ok())
                        == Some("https"),
            );

    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            builder = builder.header(name.as_str(), value);
        }
    }
    if let Some(len) = request
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        builder = builder.content_length(len);
    }
    builder.build()
}

/// The middleware itself. Mount with
/// `axum::middleware::from_fn_with_state(engine, detection_middleware)`.
pub async fn detection_middleware(
    State(engine): State<Arc<Engine>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let mut ctx = context_from_request(&request, addr);
    let (decision, evidence) = engine.evaluate(&mut ctx).await;

    debug!(
        path = %ctx.path,
        probability = evidence.bot_probability,
        action = %decision.action,
        reason = %decision.reason,
        "request evaluated"
    );

    match decision.action {
        Action::Allow => next.run(request).await,

        Action::Tag { header, value } => {
            if let (Ok(name), Ok(value)) =
                (header.parse::<HeaderName>(), value.parse::<HeaderValue>())
            {
                request.headers_mut().insert(name, value);
            }
            next.run(request).await
        }

        Action::Throttle { delay } => {
            tokio::time::sleep(delay).await;
            next.run(request).await
        }

        Action::Challenge { kind } => {
            let kind = match kind {
                ChallengeKind::Captcha => "captcha",
                ChallengeKind::Interactive => "interactive",
            };
            let body = serde_json::json!({
                "error": "challenge_required",
                "challenge": kind,
                "reason": decision.reason,
            });
            (StatusCode::FORBIDDEN, axum::Json(body)).into_response()
        }

        Action::Block { status, message } => {
            warn!(
                path = %ctx.path,
                probability = evidence.bot_probability,
                bot_type = ?evidence.primary_bot_type,
                "request blocked"
            );
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::FORBIDDEN);
            let body = serde_json::json!({
                "error": "request_blocked",
                "message": message,
                "reason": decision.reason,
            });
            (status, axum::Json(body)).into_response()
        }
    }
}
