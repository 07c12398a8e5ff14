//! Push monitor endpoint. Receives data pushed by the cloud.
//!
//! The cloud authenticates with one shared credential (not a user account)
//! configured alongside the monitor itself. Each delivery may batch many
//! logical messages; every message is routed and published independently,
//! and one bad message never blocks its siblings.
//!
//! The HTTP status is the only feedback channel the monitor protocol has:
//! success tells the cloud the push landed, 503 tells it nobody is
//! listening so it should back off and eventually deactivate the monitor,
//! 4xx marks the delivery malformed.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::AppState;
use crate::auth::parse_basic_auth;
use crate::router::route;

pub async fn monitor_receiver(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // No credential at all: forbidden. A credential that does not decode or
    // does not match the shared monitor credential: unauthorized.
    let Some(parsed) = parse_basic_auth(&headers) else {
        return StatusCode::FORBIDDEN.into_response();
    };
    let Ok((user, pass)) = parsed else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if user != state.config.monitor.auth_user || pass != state.config.monitor.auth_pass {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    info!("Received device cloud push");

    let Ok(document) = serde_json::from_slice::<Value>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(messages) = document.get("Document").and_then(|d| d.get("Msg")) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    // Msg is a list when the push batches several events, a plain object
    // otherwise.
    let messages: Vec<&Value> = match messages {
        Value::Array(items) => items.iter().collect(),
        single => vec![single],
    };

    let mut any_routed = false;
    let mut any_delivered = false;
    for message in messages {
        match route(message) {
            Ok(envelope) => {
                any_routed = true;
                let outcome = state.bus.publish(envelope).await;
                debug!(
                    receivers = outcome.receiver_count,
                    "Routed push message to bus"
                );
                any_delivered |= outcome.delivered;
            }
            Err(error) if error.is_malformed() => {
                return StatusCode::BAD_REQUEST.into_response();
            }
            Err(error) => {
                // Recoverable: this message is dropped, its siblings are
                // still processed.
                warn!(%error, "Skipping unroutable push message");
            }
        }
    }

    if any_delivered {
        info!("Push event with receivers handled");
        return StatusCode::OK.into_response();
    }
    if any_routed {
        // The cloud retries failed pushes with backoff and eventually marks
        // the monitor inactive, which is exactly what we want when nobody
        // is watching.
        info!("Received a push with no receivers, responding 503 to idle the monitor");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    StatusCode::BAD_REQUEST.into_response()
}
