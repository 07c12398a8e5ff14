//! Device REST surface: list/provision devices, read and write settings,
//! drive outputs, send serial data, browse streams.
//!
//! Every handler is a thin translation layer: per-request cloud credentials
//! in, one or more cloud calls out, response passed back through. The
//! interesting work happens in the envelope builders, the config diff
//! engine and the I/O command encoder.
//!
//! The cloud has one quirk handlers must compensate for: device-level
//! failures (device offline, bad setting) come back as `error` elements
//! inside a 200 response. A nested-key scan turns those into 500s so
//! callers are not fooled by the happy status line.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use devicecloud::CloudClient;
use serde_json::Value;
use tracing::info;

use super::AppState;
use crate::auth::{cloud_client_for, credentials_from_headers};
use crate::error::{AppError, err};
use crate::xbee::{
    SettingValue, config_tree_from_value, config_tree_to_value, diff_against, encode_io_commands,
    stock_config,
};

fn client_for_request(state: &AppState, headers: &HeaderMap) -> Result<CloudClient, AppError> {
    let creds = credentials_from_headers(headers, &state.config.cloud)?;
    cloud_client_for(&creds, &state.config.cloud)
}

/// Return bool for existence of `key` anywhere in the document tree.
fn has_nested_key(value: &Value, key: &str) -> bool {
    match value {
        Value::Object(map) => {
            map.contains_key(key) || map.values().any(|v| has_nested_key(v, key))
        }
        Value::Array(items) => items.iter().any(|v| has_nested_key(v, key)),
        _ => false,
    }
}

/// Pass a cloud response through, demoting embedded `error` elements to a
/// 500 so the caller sees the failure.
fn cloud_response(payload: Value) -> Response {
    if has_nested_key(&payload, "error") {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(payload)).into_response();
    }
    Json(payload).into_response()
}

fn bool_param(params: &HashMap<String, String>, name: &str) -> Result<bool, AppError> {
    match params.get(name) {
        None => Ok(false),
        Some(raw) => SettingValue::Text(raw.clone())
            .as_bool()
            .ok_or_else(|| err::validation(format!("bad boolean for query param {name}"))),
    }
}

/// List devices on the authenticated account, filtered to supported types.
pub async fn list_devices(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let client = client_for_request(&state, &headers)?;
    let devices = client
        .get_device_list(&state.config.cloud.supported_device_types, None)
        .await?;
    Ok(Json(devices).into_response())
}

/// Provision a new device onto the account by MAC address.
pub async fn provision_device(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, AppError> {
    let mac = body
        .get("mac")
        .and_then(Value::as_str)
        .ok_or_else(|| err::validation("MAC address field required"))?;
    let client = client_for_request(&state, &headers)?;
    let response = client.provision_device(mac).await?;
    Ok(Json(response).into_response())
}

/// Show DeviceCore data for one device.
pub async fn device_detail(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let client = client_for_request(&state, &headers)?;
    let device = client.get_device_list(&[], Some(&device_id)).await?;
    Ok(Json(device).into_response())
}

/// Query the full device configuration, attaching the corrective diff
/// against the stock Kit configuration as `config-kit-stock-values`.
pub async fn get_device_config(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let cache = bool_param(&params, "cache")?;
    let client = client_for_request(&state, &headers)?;
    let mut settings = client.get_device_settings(&device_id, None, cache).await?;

    if has_nested_key(&settings, "error") {
        return Ok((StatusCode::INTERNAL_SERVER_ERROR, Json(settings)).into_response());
    }

    let queried = settings
        .pointer("/sci_reply/send_message/device/rci_reply/query_setting")
        .cloned()
        .unwrap_or(Value::Null);
    let observed = config_tree_from_value(&queried);
    let delta = diff_against(&observed, &stock_config());
    if let Some(doc) = settings.as_object_mut() {
        doc.insert("config-kit-stock-values".into(), config_tree_to_value(&delta));
    }
    Ok(Json(settings).into_response())
}

/// Apply a nested `{"group": {"key": value}}` settings tree to the device.
pub async fn put_device_config(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, AppError> {
    validate_settings_tree(&body)?;
    let client = client_for_request(&state, &headers)?;
    let response = client.set_device_settings(&device_id, &body).await?;
    Ok(cloud_response(response))
}

/// Query a single settings group.
pub async fn get_config_group(
    State(state): State<Arc<AppState>>,
    Path((device_id, group)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let cache = bool_param(&params, "cache")?;
    let client = client_for_request(&state, &headers)?;
    let settings = client
        .get_device_settings(&device_id, Some(&group), cache)
        .await?;
    Ok(cloud_response(settings))
}

/// Apply key/value settings to a single group.
pub async fn put_config_group(
    State(state): State<Arc<AppState>>,
    Path((device_id, group)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, AppError> {
    // The group is fixed by the path, so the request can stay flat.
    let settings = serde_json::json!({ group: body });
    validate_settings_tree(&settings)?;
    let client = client_for_request(&state, &headers)?;
    let response = client.set_device_settings(&device_id, &settings).await?;
    Ok(cloud_response(response))
}

/// Reset the module to the stock Kit configuration: query, diff, and apply
/// only the corrective patch. A device already in stock shape gets no write
/// at all.
pub async fn apply_stock_config(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let client = client_for_request(&state, &headers)?;
    let settings = client.get_device_settings(&device_id, None, false).await?;
    if has_nested_key(&settings, "error") {
        return Ok((StatusCode::INTERNAL_SERVER_ERROR, Json(settings)).into_response());
    }

    let queried = settings
        .pointer("/sci_reply/send_message/device/rci_reply/query_setting")
        .cloned()
        .ok_or_else(|| err::internal("settings query reply missing query_setting"))?;
    let observed = config_tree_from_value(&queried);
    let delta = diff_against(&observed, &stock_config());
    if delta.is_empty() {
        info!(%device_id, "Device already matches stock configuration");
        return Ok(StatusCode::OK.into_response());
    }

    let response = client
        .set_device_settings(&device_id, &config_tree_to_value(&delta))
        .await?;
    Ok(cloud_response(response))
}

/// Change output levels and related I/O settings. Takes flat name/state
/// pairs: `DIO<n>` names drive the bit-addressed output command, two
/// character AT names become persistent InputOutput settings, `SERIAL*`
/// names are concatenated into one serial write.
pub async fn set_device_io(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, AppError> {
    let request = body
        .as_object()
        .ok_or_else(|| err::validation("io request must be an object of name/state pairs"))?;
    let commands = encode_io_commands(request)?;
    let client = client_for_request(&state, &headers)?;

    let mut response = Value::Object(serde_json::Map::new());
    if let Some(masks) = &commands.masks {
        response = client
            .set_output(&device_id, &masks.enable_hex(), &masks.output_hex())
            .await?;
    }
    if !commands.settings.is_empty() {
        // These settings all belong to one known group, so the request can
        // be constructed for the caller.
        let mut group = serde_json::Map::new();
        for (name, value) in &commands.settings {
            group.insert(name.clone(), Value::String(value.clone()));
        }
        let settings = serde_json::json!({ "InputOutput": Value::Object(group) });
        response = client.set_device_settings(&device_id, &settings).await?;
    }
    if let Some(payload) = &commands.serial_payload {
        let encoded = BASE64.encode(payload.as_bytes());
        response = client.send_serial_data(&device_id, &encoded, "").await?;
    }
    Ok(cloud_response(response))
}

/// Send binary data to the module's serial port. The payload may arrive
/// pre-encoded (`is_base64`) or raw, in which case it is encoded here.
pub async fn send_serial(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, AppError> {
    let data = body
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| err::validation("data field required"))?;
    let pre_encoded = match body.get("is_base64") {
        None => false,
        Some(flag) => SettingValue::from_json(flag)
            .and_then(|v| v.as_bool())
            .ok_or_else(|| err::validation("bad boolean for is_base64"))?,
    };
    let payload = if pre_encoded {
        data.to_string()
    } else {
        BASE64.encode(data.as_bytes())
    };

    let client = client_for_request(&state, &headers)?;
    let response = client.send_serial_data(&device_id, &payload, "").await?;
    Ok(cloud_response(response))
}

/// List the data streams available for one device.
pub async fn list_datastreams(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let client = client_for_request(&state, &headers)?;
    let streams = client.get_datastream_list(Some(&device_id)).await?;
    Ok(Json(streams).into_response())
}

/// Page historical data points for one stream. `startTime` is a POSIX
/// timestamp in seconds; the default window is the last five minutes.
pub async fn list_datapoints(
    State(state): State<Arc<AppState>>,
    Path((_device_id, stream_id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let start_millis = match params.get("startTime") {
        Some(raw) => {
            let seconds: f64 = raw
                .parse()
                .map_err(|_| err::validation("bad startTime timestamp"))?;
            (seconds * 1000.0) as u64
        }
        None => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO);
            now.as_millis().saturating_sub(5 * 60 * 1000) as u64
        }
    };

    let client = client_for_request(&state, &headers)?;
    let points = client
        .get_datapoints(&stream_id, &start_millis.to_string())
        .await?;
    Ok(Json(points).into_response())
}

fn validate_settings_tree(settings: &Value) -> Result<(), AppError> {
    let groups = settings
        .as_object()
        .ok_or_else(|| err::validation("settings must be an object of groups"))?;
    for (group, entries) in groups {
        let entries = entries
            .as_object()
            .ok_or_else(|| err::validation(format!("settings group {group} must be an object")))?;
        for (key, value) in entries {
            if SettingValue::from_json(value).is_none() {
                return Err(err::validation(format!(
                    "setting {group}/{key} must be a scalar value"
                )));
            }
        }
    }
    Ok(())
}
