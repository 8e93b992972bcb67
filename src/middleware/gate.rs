//! Behaviour shared by the gates when their backing store fails.

use axum::body::Body;
use axum::http::Response;
use axum::response::IntoResponse;
use tracing::{error, warn};

use crate::config::FailMode;
use crate::error::{AppError, StoreError};
use crate::metrics;

use super::ip::ClientIdentity;

/// Apply the configured fail mode to a store failure.
///
/// Returns `None` when the request should be admitted anyway, or the
/// response to send instead.
pub(crate) fn on_store_failure(
    gate: &'static str,
    mode: FailMode,
    err: &StoreError,
    identity: &ClientIdentity,
    path: &str,
) -> Option<Response<Body>> {
    metrics::record_store_failure(gate, mode.as_str());

    match mode {
        FailMode::Open => {
            warn!(
                gate,
                client_ip = %identity,
                path = %path,
                error = %err,
                "Gate store failed, admitting request"
            );
            None
        }
        FailMode::Closed => {
            error!(
                gate,
                client_ip = %identity,
                path = %path,
                error = %err,
                "Gate store failed, rejecting request"
            );
            Some(AppError::GateUnavailable(format!("{gate}: {err}")).into_response())
        }
    }
}
