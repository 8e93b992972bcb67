//! Forwarding of admitted requests to the platform backend.
//!
//! Every route the gateway does not serve itself lands here. With
//! `UPSTREAM_URL` set, the request is replayed against the backend with the
//! resolved client address in `X-Forwarded-For`; without it the gateway
//! answers 404.

use axum::body::{Body, to_bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, header};
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::middleware::ip::{ClientIdentity, X_FORWARDED_FOR, request_identity};
use crate::state::AppState;

/// Headers that describe one connection and must not be forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name)
}

/// Copy end-to-end headers. `Host` and `Content-Length` are recomputed by the client.
fn forwardable_headers(source: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(source.len());
    for (name, value) in source {
        if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Fallback handler: forward to the backend or answer 404.
pub async fn forward(
    State(state): State<AppState>,
    mut req: Request<Body>,
) -> AppResult<Response<Body>> {
    let (Some(client), Some(base)) = (&state.upstream, &state.config.upstream_url) else {
        return Err(AppError::NotFound(format!(
            "No route for {} {}",
            req.method(),
            req.uri().path()
        )));
    };

    let identity = request_identity(&mut req, &state.trusted_proxies);
    let path_and_query = req
        .uri()
        .path_and_query()
        .map_or_else(|| req.uri().path().to_string(), |pq| pq.as_str().to_string());
    let url = format!("{base}{path_and_query}");

    let (parts, body) = req.into_parts();
    let body = to_bytes(body, state.config.max_request_body_size)
        .await
        .map_err(|e| AppError::BadRequest(format!("Unreadable request body: {e}")))?;

    let mut headers = forwardable_headers(&parts.headers);
    set_forwarded_for(&mut headers, &identity);

    debug!(method = %parts.method, url = %url, client_ip = %identity, "Forwarding request");

    let upstream = client
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            metrics::record_upstream_request("error");
            if e.is_timeout() {
                AppError::UpstreamTimeout(format!("{url}: {e}"))
            } else {
                AppError::UpstreamFailed(format!("{url}: {e}"))
            }
        })?;

    let status = upstream.status();
    metrics::record_upstream_request(status.as_str());

    let mut response_headers = forwardable_headers(upstream.headers());
    let bytes = upstream.bytes().await.map_err(|e| {
        warn!(error = %e, url = %url, "Failed to read upstream response body");
        AppError::UpstreamFailed(format!("{url}: {e}"))
    })?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    std::mem::swap(response.headers_mut(), &mut response_headers);
    Ok(response)
}

fn set_forwarded_for(headers: &mut HeaderMap, identity: &ClientIdentity) {
    if identity.is_unknown() {
        headers.remove(X_FORWARDED_FOR);
        return;
    }
    if let Ok(value) = HeaderValue::from_str(identity.as_str()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
