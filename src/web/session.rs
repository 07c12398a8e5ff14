//! Live device session bridge.
//!
//! One WebSocket connection per dashboard client. The client asks to watch
//! devices; the session checks ownership against the principal's device
//! list, makes sure a cloud monitor is feeding the webhook, and then
//! forwards matching bus events to the connection as `device_data` /
//! `device_status` frames. Subscriptions die with the session: teardown
//! runs unconditionally when the connection ends, however it ends.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::AppState;
use crate::auth::credentials_from_headers;
use crate::authority::DeviceAuthority;
use crate::bus::{EventBus, EventEnvelope, ResourceKind};
use crate::error::{AppError, ClientFacingError};
use crate::monitor::MonitorScope;

/// Commands a client may send over the session socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum SessionCommand {
    StartMonitoring {
        #[serde(default)]
        devices: Vec<String>,
    },
    StopMonitoring {
        #[serde(default)]
        devices: Vec<String>,
    },
    StartMonitoringStatus,
}

/// Frames emitted to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StartedMonitoring { device_id: String },
    StoppedMonitoring { device_id: String },
    DeviceData { data: Value },
    DeviceStatus { data: Value },
    Error(ClientFacingError),
}

impl SessionEvent {
    fn error(error: &AppError) -> Self {
        Self::Error(ClientFacingError::from(error))
    }
}

/// WebSocket upgrade handler. Connections without valid cloud credentials
/// never get upgraded; an unauthenticated socket must not be able to reach
/// any session command.
pub async fn device_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let creds = match credentials_from_headers(&headers, &state.config.cloud) {
        Ok(creds) => creds,
        Err(error) => {
            warn!(%addr, "Rejecting unauthenticated socket connection");
            return error.into_response();
        }
    };
    let authority = match state.authority.authorize(&creds).await {
        Ok(authority) => authority,
        Err(error) => {
            warn!(%addr, %error, "Rejecting socket connection, authorization failed");
            return error.into_response();
        }
    };

    info!(%addr, "New device session connection");
    ws.on_upgrade(move |socket| handle_session(socket, addr, state, authority))
}

/// Per-session state and command handling, kept separate from the socket
/// plumbing so it can be driven directly in tests.
pub struct DeviceSession {
    session_id: String,
    bus: Arc<EventBus>,
    authority: Arc<dyn DeviceAuthority>,
    bus_tx: mpsc::UnboundedSender<Arc<EventEnvelope>>,
    monitored: HashSet<String>,
    /// Cached device list for this principal; fetched on first use.
    owned: Option<HashSet<String>>,
}

impl DeviceSession {
    pub fn new(
        session_id: String,
        bus: Arc<EventBus>,
        authority: Arc<dyn DeviceAuthority>,
        bus_tx: mpsc::UnboundedSender<Arc<EventEnvelope>>,
    ) -> Self {
        Self {
            session_id,
            bus,
            authority,
            bus_tx,
            monitored: HashSet::new(),
            owned: None,
        }
    }

    pub async fn handle(&mut self, command: SessionCommand) -> Vec<SessionEvent> {
        match command {
            SessionCommand::StartMonitoring { devices } => self.start_monitoring(devices).await,
            SessionCommand::StopMonitoring { devices } => self.stop_monitoring(devices).await,
            SessionCommand::StartMonitoringStatus => self.start_monitoring_status().await,
        }
    }

    async fn start_monitoring(&mut self, devices: Vec<String>) -> Vec<SessionEvent> {
        let mut replies = Vec::new();
        for device_id in devices {
            if device_id.is_empty() || self.monitored.contains(&device_id) {
                continue;
            }
            match self.owns_device(&device_id).await {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        session = %self.session_id, %device_id,
                        "Attempted to start monitoring a device not in this account"
                    );
                    replies.push(SessionEvent::error(&crate::error::err::permission(
                        "attempted to monitor a device not in your account",
                    )));
                    continue;
                }
                Err(error) => {
                    // Unavailable ownership data means deny, never allow.
                    warn!(session = %self.session_id, %error, "Device list unavailable, denying");
                    replies.push(SessionEvent::error(&error));
                    continue;
                }
            }

            debug!(session = %self.session_id, %device_id, "Kicking/creating data point monitor");
            let scope = MonitorScope::DataPoint {
                device_id: device_id.clone(),
            };
            if let Err(error) = self.authority.ensure_monitor(&scope).await {
                error!(session = %self.session_id, %error, "Monitor setup failed");
                replies.push(SessionEvent::error(&error));
                continue;
            }

            // One bus receiver per session; data and status events for this
            // device both land on it.
            self.bus
                .subscribe(
                    ResourceKind::DataPoint,
                    &device_id,
                    &self.session_id,
                    self.bus_tx.clone(),
                )
                .await;
            self.bus
                .subscribe(
                    ResourceKind::DeviceCore,
                    &device_id,
                    &self.session_id,
                    self.bus_tx.clone(),
                )
                .await;
            self.monitored.insert(device_id.clone());
            replies.push(SessionEvent::StartedMonitoring { device_id });
        }
        replies
    }

    async fn stop_monitoring(&mut self, devices: Vec<String>) -> Vec<SessionEvent> {
        let mut replies = Vec::new();
        for device_id in devices {
            if !self.monitored.remove(&device_id) {
                continue;
            }
            debug!(session = %self.session_id, %device_id, "Removing bus subscriptions");
            self.bus
                .unsubscribe(ResourceKind::DataPoint, &device_id, &self.session_id)
                .await;
            self.bus
                .unsubscribe(ResourceKind::DeviceCore, &device_id, &self.session_id)
                .await;
            replies.push(SessionEvent::StoppedMonitoring { device_id });
        }
        replies
    }

    async fn start_monitoring_status(&mut self) -> Vec<SessionEvent> {
        match self.authority.ensure_monitor(&MonitorScope::DeviceCore).await {
            Ok(_) => Vec::new(),
            Err(error) => {
                error!(session = %self.session_id, %error, "DeviceCore monitor setup failed");
                vec![SessionEvent::error(&error)]
            }
        }
    }

    async fn owns_device(&mut self, device_id: &str) -> Result<bool, AppError> {
        if self.owned.is_none() {
            let owned = self.authority.owned_devices().await?;
            self.owned = Some(owned);
        }
        Ok(self
            .owned
            .as_ref()
            .map(|owned| owned.contains(device_id))
            .unwrap_or(false))
    }

    /// Map a bus event to the frame the client expects. Events for devices
    /// this session stopped watching (unsubscribe racing an in-flight
    /// publish) are dropped.
    pub fn forward(&self, event: &EventEnvelope) -> Option<SessionEvent> {
        if !self.monitored.contains(&event.device_id) {
            return None;
        }
        Some(match event.kind {
            ResourceKind::DataPoint => SessionEvent::DeviceData {
                data: event.raw.clone(),
            },
            ResourceKind::DeviceCore => SessionEvent::DeviceStatus {
                data: event.raw.clone(),
            },
        })
    }

    /// Remove every subscription this session holds. Runs on every exit
    /// path, including abnormal connection loss.
    pub async fn teardown(&mut self) {
        debug!(session = %self.session_id, "Disconnecting session, removing receivers");
        for device_id in std::mem::take(&mut self.monitored) {
            self.bus
                .unsubscribe(ResourceKind::DataPoint, &device_id, &self.session_id)
                .await;
            self.bus
                .unsubscribe(ResourceKind::DeviceCore, &device_id, &self.session_id)
                .await;
        }
    }

    #[cfg(test)]
    pub fn monitored(&self) -> &HashSet<String> {
        &self.monitored
    }
}

async fn handle_session(
    socket: WebSocket,
    addr: SocketAddr,
    state: Arc<AppState>,
    authority: Arc<dyn DeviceAuthority>,
) {
    let (mut sink, mut stream) = socket.split();
    let (bus_tx, mut bus_rx) = mpsc::unbounded_channel();
    let mut session = DeviceSession::new(
        format!("session-{addr}"),
        state.bus.clone(),
        authority,
        bus_tx,
    );

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<SessionCommand>(&text) {
                        Ok(command) => {
                            for event in session.handle(command).await {
                                if !send_event(&mut sink, &event).await {
                                    break;
                                }
                            }
                        }
                        Err(parse_error) => {
                            debug!(%addr, %parse_error, "Unparseable session command");
                            let error = crate::error::err::parse("failed to parse session command");
                            if !send_event(&mut sink, &SessionEvent::error(&error)).await {
                                break;
                            }
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(%addr, "Device session closed");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    warn!(%addr, %error, "Device session socket error");
                    break;
                }
            },
            event = bus_rx.recv() => match event {
                Some(envelope) => {
                    if let Some(frame) = session.forward(&envelope) {
                        if !send_event(&mut sink, &frame).await {
                            break;
                        }
                    }
                }
                // All senders dropped. Cannot happen while we hold bus_tx,
                // but end the session rather than spin.
                None => break,
            },
        }
    }

    session.teardown().await;
}

async fn send_event(sink: &mut SplitSink<WebSocket, Message>, event: &SessionEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => {
            if let Err(error) = sink.send(Message::Text(json.into())).await {
                debug!(%error, "Failed to send session event");
                return false;
            }
            true
        }
        Err(error) => {
            error!(%error, "Failed to serialize session event");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::err;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::time::{Duration, timeout};

    const DEV_OWNED: &str = "00000000-00000000-00409DFF-FF000001";
    const DEV_OTHER: &str = "00000000-00000000-00409DFF-FF000099";

    /// Stub authority: a fixed device list and a log of ensured monitors.
    struct StubAuthority {
        owned: Vec<String>,
        unavailable: bool,
        ensured: Mutex<Vec<MonitorScope>>,
    }

    impl StubAuthority {
        fn with_devices(devices: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                owned: devices.iter().map(|s| s.to_string()).collect(),
                unavailable: false,
                ensured: Mutex::new(Vec::new()),
            })
        }

        fn unavailable() -> Arc<Self> {
            Arc::new(Self {
                owned: Vec::new(),
                unavailable: true,
                ensured: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl DeviceAuthority for StubAuthority {
        async fn owned_devices(&self) -> Result<HashSet<String>, AppError> {
            if self.unavailable {
                return Err(AppError::CloudUnavailable("stub outage".into()));
            }
            Ok(self.owned.iter().cloned().collect())
        }

        async fn ensure_monitor(&self, scope: &MonitorScope) -> Result<Value, AppError> {
            self.ensured.lock().unwrap().push(scope.clone());
            Ok(json!({"resultSize": "1"}))
        }
    }

    fn session_with(
        authority: Arc<StubAuthority>,
    ) -> (
        DeviceSession,
        Arc<EventBus>,
        mpsc::UnboundedReceiver<Arc<EventEnvelope>>,
    ) {
        let bus = Arc::new(EventBus::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let session = DeviceSession::new("session-test".into(), bus.clone(), authority, tx);
        (session, bus, rx)
    }

    fn data_event(device_id: &str) -> EventEnvelope {
        EventEnvelope {
            kind: ResourceKind::DataPoint,
            device_id: device_id.to_string(),
            raw: json!({"DataPoint": {"data": "1"}}),
        }
    }

    #[tokio::test]
    async fn start_monitoring_owned_device_subscribes_and_acks() {
        let authority = StubAuthority::with_devices(&[DEV_OWNED]);
        let (mut session, bus, mut rx) = session_with(authority.clone());

        let replies = session
            .handle(SessionCommand::StartMonitoring {
                devices: vec![DEV_OWNED.into()],
            })
            .await;
        assert!(matches!(
            replies.as_slice(),
            [SessionEvent::StartedMonitoring { device_id }] if device_id == DEV_OWNED
        ));
        // Monitor ensured for exactly this device's data points
        assert_eq!(
            authority.ensured.lock().unwrap().as_slice(),
            [MonitorScope::DataPoint {
                device_id: DEV_OWNED.into()
            }]
        );

        // A published event now reaches the session's receiver
        let outcome = bus.publish(data_event(DEV_OWNED)).await;
        assert_eq!(outcome.receiver_count, 1);
        let envelope = timeout(Duration::from_millis(100), rx.recv())
            .await
            .expect("timed out")
            .expect("closed");
        let frame = session.forward(&envelope).expect("forwarded");
        assert!(matches!(frame, SessionEvent::DeviceData { .. }));
    }

    #[tokio::test]
    async fn start_monitoring_is_idempotent_per_device() {
        let authority = StubAuthority::with_devices(&[DEV_OWNED]);
        let (mut session, bus, _rx) = session_with(authority);

        let first = session
            .handle(SessionCommand::StartMonitoring {
                devices: vec![DEV_OWNED.into()],
            })
            .await;
        assert_eq!(first.len(), 1);
        let second = session
            .handle(SessionCommand::StartMonitoring {
                devices: vec![DEV_OWNED.into()],
            })
            .await;
        assert!(second.is_empty());

        let outcome = bus.publish(data_event(DEV_OWNED)).await;
        assert_eq!(outcome.receiver_count, 1);
    }

    #[tokio::test]
    async fn non_owned_device_is_denied() {
        let authority = StubAuthority::with_devices(&[DEV_OWNED]);
        let (mut session, bus, _rx) = session_with(authority.clone());

        let replies = session
            .handle(SessionCommand::StartMonitoring {
                devices: vec![DEV_OTHER.into()],
            })
            .await;
        assert!(matches!(replies.as_slice(), [SessionEvent::Error(e)] if e.code == "permission_denied"));
        assert!(session.monitored().is_empty());
        assert!(authority.ensured.lock().unwrap().is_empty());
        assert_eq!(bus.publish(data_event(DEV_OTHER)).await.receiver_count, 0);
    }

    #[tokio::test]
    async fn unavailable_device_list_means_deny() {
        let authority = StubAuthority::unavailable();
        let (mut session, _bus, _rx) = session_with(authority);

        let replies = session
            .handle(SessionCommand::StartMonitoring {
                devices: vec![DEV_OWNED.into()],
            })
            .await;
        assert!(matches!(replies.as_slice(), [SessionEvent::Error(e)] if e.code == "cloud_unavailable"));
        assert!(session.monitored().is_empty());
    }

    #[tokio::test]
    async fn stop_monitoring_removes_subscriptions() {
        let authority = StubAuthority::with_devices(&[DEV_OWNED]);
        let (mut session, bus, _rx) = session_with(authority);

        session
            .handle(SessionCommand::StartMonitoring {
                devices: vec![DEV_OWNED.into()],
            })
            .await;
        let replies = session
            .handle(SessionCommand::StopMonitoring {
                devices: vec![DEV_OWNED.into()],
            })
            .await;
        assert!(matches!(
            replies.as_slice(),
            [SessionEvent::StoppedMonitoring { device_id }] if device_id == DEV_OWNED
        ));
        assert_eq!(bus.publish(data_event(DEV_OWNED)).await.receiver_count, 0);

        // Stopping an unmonitored device is a quiet no-op
        let replies = session
            .handle(SessionCommand::StopMonitoring {
                devices: vec![DEV_OWNED.into()],
            })
            .await;
        assert!(replies.is_empty());
    }

    #[tokio::test]
    async fn status_command_ensures_devicecore_monitor() {
        let authority = StubAuthority::with_devices(&[]);
        let (mut session, _bus, _rx) = session_with(authority.clone());

        let replies = session.handle(SessionCommand::StartMonitoringStatus).await;
        assert!(replies.is_empty());
        assert_eq!(
            authority.ensured.lock().unwrap().as_slice(),
            [MonitorScope::DeviceCore]
        );
    }

    #[tokio::test]
    async fn teardown_unsubscribes_everything() {
        let authority = StubAuthority::with_devices(&[DEV_OWNED]);
        let (mut session, bus, _rx) = session_with(authority);

        session
            .handle(SessionCommand::StartMonitoring {
                devices: vec![DEV_OWNED.into()],
            })
            .await;
        assert_eq!(bus.publish(data_event(DEV_OWNED)).await.receiver_count, 1);

        session.teardown().await;
        assert_eq!(bus.publish(data_event(DEV_OWNED)).await.receiver_count, 0);
        assert_eq!(bus.channel_count().await, 0);
    }

    #[tokio::test]
    async fn forward_drops_events_for_unwatched_devices() {
        let authority = StubAuthority::with_devices(&[DEV_OWNED]);
        let (mut session, _bus, _rx) = session_with(authority);
        session
            .handle(SessionCommand::StartMonitoring {
                devices: vec![DEV_OWNED.into()],
            })
            .await;

        assert!(session.forward(&data_event(DEV_OWNED)).is_some());
        assert!(session.forward(&data_event(DEV_OTHER)).is_none());

        let status = EventEnvelope {
            kind: ResourceKind::DeviceCore,
            device_id: DEV_OWNED.to_string(),
            raw: json!({"DeviceCore": {"dpConnectionStatus": "1"}}),
        };
        assert!(matches!(
            session.forward(&status),
            Some(SessionEvent::DeviceStatus { .. })
        ));
    }

    #[test]
    fn commands_deserialize_from_wire_shape() {
        let cmd: SessionCommand = serde_json::from_str(
            r#"{"cmd": "start_monitoring", "devices": ["a", "b"]}"#,
        )
        .unwrap();
        assert!(matches!(cmd, SessionCommand::StartMonitoring { devices } if devices.len() == 2));

        let cmd: SessionCommand =
            serde_json::from_str(r#"{"cmd": "start_monitoring_status"}"#).unwrap();
        assert!(matches!(cmd, SessionCommand::StartMonitoringStatus));
    }

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let frame = SessionEvent::StartedMonitoring {
            device_id: DEV_OWNED.into(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["event"], "started_monitoring");
        assert_eq!(json["device_id"], DEV_OWNED);

        let frame = SessionEvent::error(&err::permission("nope"));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["code"], "permission_denied");
        assert!(json["message"].as_str().unwrap().contains("nope"));
    }
}
