//! Cloud-side push monitor lifecycle: query, create, kick.
//!
//! Exactly one monitor should exist per (account, topic, transport url)
//! triple. The cloud does not enforce that, so [`ensure_monitor`] does:
//! query first, create only when nothing matched, otherwise reactivate
//! ("kick") the existing one. Kicking is an idempotent PUT, which makes the
//! whole ensure operation safe to repeat on every subscribe.

use devicecloud::{CloudClient, MonitorRequest};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::MonitorConfig;
use crate::error::{AppError, err};

/// What a monitor watches: one device's data points, or every device
/// update on the account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorScope {
    DataPoint { device_id: String },
    DeviceCore,
}

impl MonitorScope {
    /// The cloud-side topic string for this scope. DeviceCore monitors are
    /// restricted to update operations; creations and deletions are noise
    /// for a live dashboard.
    pub fn topic(&self) -> String {
        match self {
            MonitorScope::DataPoint { device_id } => format!("DataPoint/{device_id}"),
            MonitorScope::DeviceCore => "[operation=U]DeviceCore".to_string(),
        }
    }
}

/// Make sure an active monitor exists for `scope`, pointing at this
/// server's webhook endpoint. Returns the cloud's monitor document (the
/// existing one when found, the creation response otherwise).
pub async fn ensure_monitor(
    client: &CloudClient,
    scope: &MonitorScope,
    config: &MonitorConfig,
) -> Result<Value, AppError> {
    let endpoint_url = config.public_url.trim();
    if endpoint_url.is_empty() {
        return Err(err::validation("no public webhook url configured"));
    }
    // The cloud cannot reach a loopback address; a monitor pointing at one
    // would be created successfully and then fail every push.
    if endpoint_url.contains("localhost") || endpoint_url.contains("127.0.0.1") {
        error!(endpoint_url, "Rejecting attempt to create monitor to loopback");
        return Err(err::validation("webhook endpoint resolves to loopback"));
    }

    let topic = scope.topic();
    let monitors = client
        .get_monitors(&[topic.clone()], &[endpoint_url.to_string()])
        .await?;

    if result_size(&monitors) == 0 {
        info!(%topic, "Creating a new push monitor");
        let created = client
            .create_monitor(&MonitorRequest {
                topic,
                transport_url: endpoint_url.to_string(),
                auth_user: config.auth_user.clone(),
                auth_pass: config.auth_pass.clone(),
                description: Some(config.description.clone()),
                batch_size: Some(config.batch_size),
                batch_duration: Some(config.batch_duration_secs),
            })
            .await?;
        return Ok(created);
    }

    let items = monitor_items(&monitors);
    if items.len() > 1 {
        warn!(%topic, count = items.len(), "Found multiple monitors for this topic");
    }
    let monitor_id = items
        .first()
        .and_then(|monitor| monitor.get("monId"))
        .map(render_id)
        .ok_or_else(|| err::internal("monitor query result has no monId"))?;

    info!(%topic, %monitor_id, "Found an existing monitor, kicking it");
    client.kick_monitor(&monitor_id).await?;
    // Return the original info, not the kick response
    Ok(monitors)
}

/// `resultSize` arrives as a string from the cloud; tolerate a number too.
fn result_size(monitors: &Value) -> usize {
    match monitors.get("resultSize") {
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0) as usize,
        _ => 0,
    }
}

/// `items` is a list for multi-result queries but may collapse to a single
/// object.
fn monitor_items(monitors: &Value) -> Vec<&Value> {
    match monitors.get("items") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(item @ Value::Object(_)) => vec![item],
        _ => Vec::new(),
    }
}

fn render_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
