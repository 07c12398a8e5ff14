//! Parses inbound webhook topic strings into publishable event envelopes.
//!
//! Reported topics arrive as `<accountPrefix>/<kind>/<subtopic...>`. The
//! account prefix is discarded, the kind segment selects a [`ResourceKind`],
//! and the device id is recovered either from the subtopic (`DataPoint`) or
//! from a fixed path in the message body (`DeviceCore`). Pure parsing; every
//! failure here is recoverable and scoped to the one message it came from.

use percent_encoding::percent_decode_str;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use thiserror::Error;

use crate::bus::{EventEnvelope, ResourceKind};

/// Device ids are four dash-joined groups of eight uppercase hex digits,
/// e.g. `00000000-00000000-00409DFF-FF123456`, embedded somewhere in the
/// subtopic alongside stream path segments.
static DEVICE_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<dev_id>(-?[0-9A-F]{8}){4})").expect("device id pattern compiles")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("message has no topic field")]
    MissingTopic,
    #[error("no handler for push topic kind {0}")]
    UnknownKind(String),
    #[error("no device id found in {0} message")]
    NoDeviceId(ResourceKind),
}

impl RouteError {
    /// Missing topics make the whole delivery malformed; the other variants
    /// only drop the single message they concern.
    pub fn is_malformed(&self) -> bool {
        matches!(self, RouteError::MissingTopic)
    }
}

/// Parse one pushed message into an [`EventEnvelope`].
pub fn route(message: &Value) -> Result<EventEnvelope, RouteError> {
    let topic = message
        .get("topic")
        .and_then(Value::as_str)
        .ok_or(RouteError::MissingTopic)?;

    let mut segments = topic.splitn(3, '/');
    let _account_prefix = segments.next();
    let tag = segments.next().unwrap_or_default();
    let subtopic = segments.next().unwrap_or_default();

    let kind = ResourceKind::from_topic_tag(tag)
        .ok_or_else(|| RouteError::UnknownKind(tag.to_string()))?;

    let device_id = match kind {
        ResourceKind::DataPoint => {
            let subtopic = percent_decode_str(subtopic).decode_utf8_lossy();
            DEVICE_ID_PATTERN
                .captures(&subtopic)
                .and_then(|caps| caps.name("dev_id"))
                .map(|m| m.as_str().to_string())
                .ok_or(RouteError::NoDeviceId(kind))?
        }
        // Device id is not in the topic, only in the message body
        ResourceKind::DeviceCore => message
            .get("DeviceCore")
            .and_then(|core| core.get("devConnectwareId"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(RouteError::NoDeviceId(kind))?,
    };

    Ok(EventEnvelope {
        kind,
        device_id,
        raw: message.clone(),
    })
}
