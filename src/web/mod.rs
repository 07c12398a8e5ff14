//! Web service surface: the push webhook, the live device WebSocket, and
//! the device REST API. Routes are assembled in [`build_router`] so tests
//! can serve the exact production router on an ephemeral port.

pub mod api;
pub mod session;
pub mod webhook;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use tower_http::trace::{DefaultMakeSpan, TraceLayer};

use crate::bus::EventBus;
use crate::config::AppConfig;
use crate::authority::AuthorityProvider;

/// Shared state handed to every handler. The event bus is owned here and
/// nowhere else; the webhook publishes into it and live sessions subscribe
/// out of it.
pub struct AppState {
    pub bus: Arc<EventBus>,
    pub config: Arc<AppConfig>,
    pub authority: Arc<dyn AuthorityProvider>,
}

/// Build the application router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Push monitor endpoint - receives data from the cloud
        .route("/api/monitor", put(webhook::monitor_receiver))
        // Live device data bridge
        .route("/ws/device", get(session::device_ws_handler))
        // Device REST surface
        .route(
            "/api/devices",
            get(api::list_devices).post(api::provision_device),
        )
        .route("/api/devices/{device_id}", get(api::device_detail))
        .route("/api/devices/{device_id}/io", put(api::set_device_io))
        .route(
            "/api/devices/{device_id}/config",
            get(api::get_device_config).put(api::put_device_config),
        )
        .route(
            "/api/devices/{device_id}/config/{group}",
            get(api::get_config_group).put(api::put_config_group),
        )
        .route(
            "/api/devices/{device_id}/config-stock",
            put(api::apply_stock_config),
        )
        .route("/api/devices/{device_id}/serial", post(api::send_serial))
        .route("/api/devices/{device_id}/data", get(api::list_datastreams))
        .route(
            "/api/devices/{device_id}/data/{*stream_id}",
            get(api::list_datapoints),
        )
        .layer(
            TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default()),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use crate::authority::{AuthorityProvider, DeviceAuthority};
    use crate::bus::ResourceKind;
    use crate::error::AppError;
    use crate::monitor::MonitorScope;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{Value, json};
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use tokio::time::{Duration, timeout};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::protocol::Message;
    use tower::ServiceExt;

    const DEV_OWNED: &str = "00000000-00000000-00409DFF-FF000001";
    const DEV_OTHER: &str = "00000000-00000000-00409DFF-FF000099";

    /// Authority stub: one fixed account owning `DEV_OWNED`, monitors always
    /// ensured successfully.
    struct StubAuthority;

    #[async_trait]
    impl DeviceAuthority for StubAuthority {
        async fn owned_devices(&self) -> Result<HashSet<String>, AppError> {
            Ok(HashSet::from([DEV_OWNED.to_string()]))
        }

        async fn ensure_monitor(&self, _scope: &MonitorScope) -> Result<Value, AppError> {
            Ok(json!({"resultSize": "1"}))
        }
    }

    struct StubProvider;

    #[async_trait]
    impl AuthorityProvider for StubProvider {
        async fn authorize(
            &self,
            creds: &Credentials,
        ) -> Result<std::sync::Arc<dyn DeviceAuthority>, AppError> {
            if creds.password != "pw" {
                return Err(crate::error::err::unauthorized("bad stub credentials"));
            }
            Ok(std::sync::Arc::new(StubAuthority))
        }
    }

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState {
            bus: Arc::new(EventBus::new()),
            config: Arc::new(AppConfig::default()),
            authority: Arc::new(StubProvider),
        })
    }

    async fn serve(state: Arc<AppState>) -> SocketAddr {
        let router = build_router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        addr
    }

    fn ws_request(addr: SocketAddr, auth: Option<&str>) -> tokio_tungstenite::tungstenite::handshake::client::Request {
        let mut request = format!("ws://{addr}/ws/device")
            .into_client_request()
            .unwrap();
        if let Some(user_pass) = auth {
            request.headers_mut().insert(
                header::AUTHORIZATION,
                format!("Basic {}", BASE64.encode(user_pass)).parse().unwrap(),
            );
        }
        request
    }

    async fn next_json<S>(stream: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let frame = timeout(Duration::from_secs(2), stream.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("socket error");
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).expect("frame is json");
            }
        }
    }

    fn push_request(body: Value) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri("/api/monitor")
            .header(header::CONTENT_TYPE, "application/json")
            .header(
                header::AUTHORIZATION,
                format!("Basic {}", BASE64.encode("change:me")),
            )
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn datapoint_message(device_id: &str) -> Value {
        json!({
            "topic": format!("1234/DataPoint/{device_id}/DIO/1"),
            "DataPoint": {"data": "7"},
        })
    }

    #[tokio::test]
    async fn unauthenticated_socket_is_rejected_at_upgrade() {
        let addr = serve(test_state()).await;
        let result = connect_async(ws_request(addr, None)).await;
        assert!(result.is_err(), "upgrade should have been refused");
    }

    #[tokio::test]
    async fn socket_with_bad_credentials_is_rejected() {
        let addr = serve(test_state()).await;
        let result = connect_async(ws_request(addr, Some("alice:wrong"))).await;
        assert!(result.is_err(), "upgrade should have been refused");
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn push_fans_out_to_live_session_end_to_end() {
        let state = test_state();
        let addr = serve(state.clone()).await;
        let push_router = build_router(state.clone());

        // 1. Connect and start monitoring the owned device
        let (ws_stream, _) = connect_async(ws_request(addr, Some("alice:pw")))
            .await
            .expect("connect");
        let (mut write, mut read) = ws_stream.split();
        write
            .send(Message::Text(
                json!({"cmd": "start_monitoring", "devices": [DEV_OWNED]})
                    .to_string()
                    .into(),
            ))
            .await
            .unwrap();
        let ack = next_json(&mut read).await;
        assert_eq!(ack["event"], "started_monitoring");
        assert_eq!(ack["device_id"], DEV_OWNED);

        // 2. A batch arrives for one subscribed and one unsubscribed device:
        //    success response, exactly one forwarded frame
        let response = push_router
            .clone()
            .oneshot(push_request(json!({"Document": {"Msg": [
                datapoint_message(DEV_OWNED),
                datapoint_message(DEV_OTHER),
            ]}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let frame = next_json(&mut read).await;
        assert_eq!(frame["event"], "device_data");
        assert_eq!(frame["data"]["DataPoint"]["data"], "7");

        // 3. Device status events arrive as device_status
        let response = push_router
            .clone()
            .oneshot(push_request(json!({"Document": {"Msg": {
                "topic": "1234/DeviceCore/42",
                "DeviceCore": {"devConnectwareId": DEV_OWNED, "dpConnectionStatus": "0"},
            }}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let frame = next_json(&mut read).await;
        assert_eq!(frame["event"], "device_status");

        // 4. Stop monitoring: the same push now finds no receivers
        write
            .send(Message::Text(
                json!({"cmd": "stop_monitoring", "devices": [DEV_OWNED]})
                    .to_string()
                    .into(),
            ))
            .await
            .unwrap();
        let ack = next_json(&mut read).await;
        assert_eq!(ack["event"], "stopped_monitoring");

        let response = push_router
            .oneshot(push_request(json!({"Document": {"Msg":
                datapoint_message(DEV_OWNED)
            }})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn session_teardown_cleans_bus_on_disconnect() {
        let state = test_state();
        let addr = serve(state.clone()).await;

        let (ws_stream, _) = connect_async(ws_request(addr, Some("alice:pw")))
            .await
            .expect("connect");
        let (mut write, mut read) = ws_stream.split();
        write
            .send(Message::Text(
                json!({"cmd": "start_monitoring", "devices": [DEV_OWNED]})
                    .to_string()
                    .into(),
            ))
            .await
            .unwrap();
        let ack = next_json(&mut read).await;
        assert_eq!(ack["event"], "started_monitoring");
        assert_eq!(
            state
                .bus
                .publish(crate::bus::EventEnvelope {
                    kind: ResourceKind::DataPoint,
                    device_id: DEV_OWNED.to_string(),
                    raw: json!({}),
                })
                .await
                .receiver_count,
            1
        );

        // Drop the connection without a polite stop_monitoring
        drop(write);
        drop(read);

        // Teardown is asynchronous; poll until the subscriptions are gone
        let mut cleaned = false;
        for _ in 0..50 {
            if state.bus.channel_count().await == 0 {
                cleaned = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(cleaned, "session teardown did not remove subscriptions");
    }

    #[tokio::test]
    async fn permission_denied_for_non_owned_device() {
        let state = test_state();
        let addr = serve(state).await;

        let (ws_stream, _) = connect_async(ws_request(addr, Some("alice:pw")))
            .await
            .expect("connect");
        let (mut write, mut read) = ws_stream.split();
        write
            .send(Message::Text(
                json!({"cmd": "start_monitoring", "devices": [DEV_OTHER]})
                    .to_string()
                    .into(),
            ))
            .await
            .unwrap();
        let frame = next_json(&mut read).await;
        assert_eq!(frame["event"], "error");
        assert_eq!(frame["code"], "permission_denied");
    }
}
