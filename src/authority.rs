//! Device ownership checks and monitor provisioning, as seen by a live
//! session.
//!
//! The session bridge never talks to the cloud directly; it goes through
//! [`DeviceAuthority`], which answers exactly two questions: which devices
//! may this principal watch, and is there an active cloud monitor feeding
//! our webhook. Keeping this behind a trait lets tests drive sessions
//! without a cloud.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use devicecloud::CloudClient;
use serde_json::Value;
use tracing::warn;

use crate::auth::{Credentials, cloud_client_for};
use crate::config::AppConfig;
use crate::error::{AppError, err};
use crate::monitor::{MonitorScope, ensure_monitor};

#[async_trait]
pub trait DeviceAuthority: Send + Sync {
    /// The set of device ids this principal may subscribe to. An error here
    /// must be treated as "deny", never as "allow".
    async fn owned_devices(&self) -> Result<HashSet<String>, AppError>;

    /// Make sure an active cloud monitor exists for `scope`.
    async fn ensure_monitor(&self, scope: &MonitorScope) -> Result<Value, AppError>;
}

/// Turns request credentials into a [`DeviceAuthority`], verifying them
/// first. Live connections carrying no valid principal are rejected here,
/// before they can subscribe to anything.
#[async_trait]
pub trait AuthorityProvider: Send + Sync {
    async fn authorize(&self, creds: &Credentials) -> Result<Arc<dyn DeviceAuthority>, AppError>;
}

pub struct CloudAuthorityProvider {
    config: Arc<AppConfig>,
}

impl CloudAuthorityProvider {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AuthorityProvider for CloudAuthorityProvider {
    async fn authorize(&self, creds: &Credentials) -> Result<Arc<dyn DeviceAuthority>, AppError> {
        let client = cloud_client_for(creds, &self.config.cloud)?;
        // Verify the credentials up front; a bad password should read as an
        // auth failure, not as a cloud rejection on some later call.
        if let Err(error) = client.authenticate().await {
            return Err(match AppError::from(error) {
                AppError::CloudStatus { status: 401, .. } => {
                    err::unauthorized("device cloud rejected the credentials")
                }
                other => other,
            });
        }
        Ok(Arc::new(CloudDeviceAuthority {
            client,
            config: self.config.clone(),
        }))
    }
}

pub struct CloudDeviceAuthority {
    client: CloudClient,
    config: Arc<AppConfig>,
}

#[async_trait]
impl DeviceAuthority for CloudDeviceAuthority {
    async fn owned_devices(&self) -> Result<HashSet<String>, AppError> {
        let devices = self
            .client
            .get_device_list(&self.config.cloud.supported_device_types, None)
            .await?;
        let mut owned = HashSet::new();
        if let Some(items) = devices.get("items").and_then(Value::as_array) {
            for device in items {
                match device.get("devConnectwareId").and_then(Value::as_str) {
                    Some(id) => {
                        owned.insert(id.to_string());
                    }
                    None => warn!("Device list entry without devConnectwareId"),
                }
            }
        }
        Ok(owned)
    }

    async fn ensure_monitor(&self, scope: &MonitorScope) -> Result<Value, AppError> {
        ensure_monitor(&self.client, scope, &self.config.monitor).await
    }
}
