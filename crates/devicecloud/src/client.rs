//! HTTP client for the Device Cloud REST resources and SCI command tunnel.

use std::time::Duration;

use reqwest::header::{self, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::envelope::{self, EnvelopeError};

const DEVICECORE_RESOURCE: &str = "DeviceCore";
const DATASTREAM_RESOURCE: &str = "DataStream";
const DATAPOINT_RESOURCE: &str = "DataPoint";
const USERINFO_RESOURCE: &str = "UserInfo";
const MONITOR_RESOURCE: &str = "Monitor";
const SCI_RESOURCE: &str = "sci";

/// Failures talking to the cloud, split the way callers need to branch:
/// the remote *rejected* the request (status and body propagated verbatim)
/// versus the remote was *unreachable* (connection refused, DNS, timeout).
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("device cloud returned status {status}")]
    Status { status: u16, body: String },
    #[error("device cloud unreachable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

/// Parameters for registering an HTTP push monitor.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MonitorRequest {
    pub topic: String,
    pub transport_url: String,
    pub auth_user: String,
    pub auth_pass: String,
    pub description: Option<String>,
    pub batch_size: Option<u32>,
    pub batch_duration: Option<u32>,
}

/// One authenticated connection to a Device Cloud account.
///
/// Cheap to construct; holds no connection state beyond reqwest's internal
/// pool. All requests carry basic auth and a hard timeout; a cloud that
/// does not answer in time is reported as [`CloudError::Unavailable`],
/// identically to a refused connection.
pub struct CloudClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl CloudClient {
    /// Connect to `https://{cloud_fqdn}` with the given account credentials.
    pub fn new(
        username: &str,
        password: &str,
        cloud_fqdn: &str,
        timeout: Duration,
    ) -> Result<Self, CloudError> {
        Self::with_base_url(&format!("https://{cloud_fqdn}"), username, password, timeout)
    }

    /// Connect to an explicit base URL. Intended for tests and alternate
    /// deployments that front the cloud with a local proxy.
    pub fn with_base_url(
        base_url: &str,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, CloudError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| CloudError::Unavailable(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    fn resource_url(&self, resource: &str, path: &str) -> String {
        format!("{}/ws/{}/{}", self.base_url, resource, path)
    }

    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Value, CloudError> {
        let response = self
            .http
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;
        debug!(url, "GET against device cloud");
        read_response(response).await
    }

    async fn post_xml(&self, url: &str, body: String) -> Result<Value, CloudError> {
        let response = self
            .http
            .post(url)
            .basic_auth(&self.username, Some(&self.password))
            .body(body)
            .send()
            .await
            .map_err(transport_error)?;
        debug!(url, "POST against device cloud");
        read_response(response).await
    }

    async fn put_xml(&self, url: &str, body: String) -> Result<Value, CloudError> {
        let response = self
            .http
            .put(url)
            .basic_auth(&self.username, Some(&self.password))
            .body(body)
            .send()
            .await
            .map_err(transport_error)?;
        debug!(url, "PUT against device cloud");
        read_response(response).await
    }

    /// Verify the credentials by querying UserInfo. A bad username/password
    /// surfaces as [`CloudError::Status`] with status 401.
    pub async fn authenticate(&self) -> Result<Value, CloudError> {
        self.get(&self.resource_url(USERINFO_RESOURCE, ""), &[]).await
    }

    /// List devices on the account, optionally filtered by device type
    /// and/or pinned to a single device id.
    pub async fn get_device_list(
        &self,
        device_types: &[String],
        device_id: Option<&str>,
    ) -> Result<Value, CloudError> {
        let type_cond = device_types
            .iter()
            .map(|t| format!("dpDeviceType='{t}'"))
            .collect::<Vec<_>>()
            .join(" or ");
        let id_cond = device_id
            .map(|id| format!("devConnectwareId='{id}'"))
            .unwrap_or_default();
        let condition = join_conditions(&[type_cond, id_cond]);

        let mut query = Vec::new();
        if !condition.is_empty() {
            query.push(("condition", condition));
        }
        self.get(&self.resource_url(DEVICECORE_RESOURCE, ""), &query)
            .await
    }

    /// Provision a device onto the account by MAC address.
    pub async fn provision_device(&self, mac: &str) -> Result<Value, CloudError> {
        let body = envelope::to_xml(&json!({ "DeviceCore": { "devMac": mac } }))?;
        self.post_xml(&self.resource_url(DEVICECORE_RESOURCE, ""), body)
            .await
    }

    /// List data streams, optionally scoped to one device's stream prefix.
    pub async fn get_datastream_list(&self, device_id: Option<&str>) -> Result<Value, CloudError> {
        let path = device_id.unwrap_or_default();
        self.get(&self.resource_url(DATASTREAM_RESOURCE, path), &[])
            .await
    }

    /// Page historical data points for one stream starting at `start_time`
    /// (epoch millis or ISO 8601, per the cloud's API).
    pub async fn get_datapoints(
        &self,
        stream_id: &str,
        start_time: &str,
    ) -> Result<Value, CloudError> {
        self.get(
            &self.resource_url(DATAPOINT_RESOURCE, stream_id),
            &[("startTime", start_time.to_string())],
        )
        .await
    }

    /// RCI `query_setting` for one device, optionally scoped to a single
    /// settings group. `cache` selects the cloud's cached copy over a live
    /// device round trip.
    pub async fn get_device_settings(
        &self,
        device_id: &str,
        settings_group: Option<&str>,
        cache: bool,
    ) -> Result<Value, CloudError> {
        let body = envelope::query_setting_request(device_id, settings_group, cache)?;
        self.post_xml(&self.resource_url(SCI_RESOURCE, ""), body).await
    }

    /// RCI `set_setting` with a nested `{"group": {"key": value}}` tree.
    pub async fn set_device_settings(
        &self,
        device_id: &str,
        settings: &Value,
    ) -> Result<Value, CloudError> {
        let body = envelope::set_setting_request(device_id, settings)?;
        self.post_xml(&self.resource_url(SCI_RESOURCE, ""), body).await
    }

    /// Issue the combined OM/IO `set_state` command. Masks are hex strings
    /// (`"0x5"`); OM selects the affected pins, IO the levels.
    pub async fn set_output(
        &self,
        device_id: &str,
        enable_mask: &str,
        io_mask: &str,
    ) -> Result<Value, CloudError> {
        let body = envelope::set_output_request(device_id, enable_mask, io_mask)?;
        self.post_xml(&self.resource_url(SCI_RESOURCE, ""), body).await
    }

    /// Deliver a base64 payload to the device serial port.
    pub async fn send_serial_data(
        &self,
        device_id: &str,
        data_b64: &str,
        target_name: &str,
    ) -> Result<Value, CloudError> {
        let body = envelope::serial_data_request(device_id, target_name, data_b64)?;
        self.post_xml(&self.resource_url(SCI_RESOURCE, ""), body).await
    }

    /// List this account's monitors, filtered to the given topics and
    /// transport URLs.
    pub async fn get_monitors(&self, topics: &[String], urls: &[String]) -> Result<Value, CloudError> {
        let topic_cond = topics
            .iter()
            .map(|t| format!("monTopic='{t}'"))
            .collect::<Vec<_>>()
            .join(" or ");
        let url_cond = urls
            .iter()
            .map(|u| format!("monTransportUrl='{u}'"))
            .collect::<Vec<_>>()
            .join(" or ");
        let condition = join_conditions(&[topic_cond, url_cond]);

        let mut query = Vec::new();
        if !condition.is_empty() {
            query.push(("condition", condition));
        }
        self.get(&self.resource_url(MONITOR_RESOURCE, ""), &query).await
    }

    /// Register a new HTTP push monitor.
    pub async fn create_monitor(&self, request: &MonitorRequest) -> Result<Value, CloudError> {
        let mut monitor = json!({
            "monTopic": request.topic,
            "monTransportType": "http",
            "monTransportUrl": request.transport_url,
            "monTransportToken": format!("{}:{}", request.auth_user, request.auth_pass),
            "monFormatType": "json",
        });
        let fields = monitor.as_object_mut().expect("monitor body is an object");
        if let Some(description) = &request.description {
            fields.insert("monDescription".into(), json!(description));
        }
        if let Some(batch_size) = request.batch_size {
            fields.insert("monBatchSize".into(), json!(batch_size));
        }
        if let Some(batch_duration) = request.batch_duration {
            fields.insert("monBatchDuration".into(), json!(batch_duration));
        }
        let body = envelope::to_xml(&json!({ "Monitor": monitor }))?;
        self.post_xml(&self.resource_url(MONITOR_RESOURCE, ""), body).await
    }

    /// Reactivate a monitor. Monitors go inactive after repeated failed
    /// pushes or sit in a backoff state; an otherwise-empty PUT resets both.
    /// Safe to repeat.
    pub async fn kick_monitor(&self, monitor_id: &str) -> Result<Value, CloudError> {
        let body = envelope::to_xml(&json!({ "Monitor": { "monId": monitor_id } }))?;
        self.put_xml(&self.resource_url(MONITOR_RESOURCE, monitor_id), body)
            .await
    }
}

fn join_conditions(parts: &[String]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join(" and ")
}

fn transport_error(error: reqwest::Error) -> CloudError {
    CloudError::Unavailable(error.to_string())
}

/// Decode a cloud response by content type: XML through the envelope
/// parser, JSON as-is. Error statuses carry the body through verbatim so
/// callers can relay the cloud's own diagnostics.
async fn read_response(response: reqwest::Response) -> Result<Value, CloudError> {
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let text = response.text().await.map_err(transport_error)?;

    if !status.is_success() {
        return Err(CloudError::Status {
            status: status.as_u16(),
            body: text,
        });
    }

    if content_type.contains("application/xml") {
        return Ok(envelope::from_xml(&text)?);
    }
    if content_type.contains("application/json") {
        return serde_json::from_str(&text)
            .map_err(|e| CloudError::Unavailable(format!("invalid json from cloud: {e}")));
    }
    warn!(%content_type, "unexpected content type from device cloud");
    match serde_json::from_str(&text) {
        Ok(value) => Ok(value),
        Err(_) => Ok(Value::String(text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use std::net::SocketAddr;

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn client(addr: SocketAddr) -> CloudClient {
        CloudClient::with_base_url(
            &format!("http://{addr}"),
            "user",
            "pass",
            Duration::from_secs(2),
        )
        .expect("build client")
    }

    #[tokio::test]
    async fn device_list_parses_json_response() {
        let router = Router::new().route(
            "/ws/DeviceCore/",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "application/json")],
                    r#"{"resultSize":"1","items":[{"devConnectwareId":"dev1"}]}"#,
                )
            }),
        );
        let addr = serve(router).await;

        let devices = client(addr)
            .get_device_list(&["XBee WiFi S6B TH".into()], None)
            .await
            .expect("list devices");
        assert_eq!(devices["items"][0]["devConnectwareId"], "dev1");
    }

    #[tokio::test]
    async fn sci_response_parses_xml_into_tree() {
        let router = Router::new().route(
            "/ws/sci/",
            post(|| async {
                (
                    [(header::CONTENT_TYPE, "application/xml")],
                    r#"<sci_reply version="1.0"><send_message><device id="dev1"><rci_reply version="1.1"><query_setting><Serial><AP>0</AP></Serial></query_setting></rci_reply></device></send_message></sci_reply>"#,
                )
            }),
        );
        let addr = serve(router).await;

        let settings = client(addr)
            .get_device_settings("dev1", None, false)
            .await
            .expect("query settings");
        assert_eq!(
            settings["sci_reply"]["send_message"]["device"]["rci_reply"]["query_setting"]
                ["Serial"]["AP"],
            "0"
        );
    }

    #[tokio::test]
    async fn error_status_propagates_body_verbatim() {
        let router = Router::new().route(
            "/ws/Monitor/",
            get(|| async { (StatusCode::BAD_REQUEST, "bad condition").into_response() }),
        );
        let addr = serve(router).await;

        let err = client(addr)
            .get_monitors(&["DataPoint/dev1".into()], &[])
            .await
            .expect_err("should fail");
        match err {
            CloudError::Status { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad condition");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_host_maps_to_unavailable() {
        // Bind then drop to obtain a port that refuses connections.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(addr).authenticate().await.expect_err("should fail");
        assert!(matches!(err, CloudError::Unavailable(_)));
    }
}
