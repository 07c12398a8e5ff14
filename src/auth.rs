//! Per-request credential handling.
//!
//! There are no local accounts: clients authenticate with their own Device
//! Cloud credentials on every request, passed through to the cloud. The
//! username may carry the cloud FQDN after a `#` (`user#devicecloud.digi.com`);
//! without one the configured default server is used.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use devicecloud::CloudClient;

use crate::config::CloudConfig;
use crate::error::{AppError, err};

/// Delimiter between username and cloud FQDN in combined login strings.
pub const USERNAME_CLOUD_DELIMITER: char = '#';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub cloud_fqdn: String,
}

/// Decode a basic-auth header into its raw user/password pair. `None` when
/// the header is absent or not basic auth at all; `Some(Err)` when it is
/// present but undecodable.
pub fn parse_basic_auth(headers: &HeaderMap) -> Option<Result<(String, String), AppError>> {
    let header = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let mut parts = header.splitn(2, ' ');
    if !parts.next()?.eq_ignore_ascii_case("basic") {
        return None;
    }
    let encoded = parts.next()?.trim();

    let decoded = match BASE64.decode(encoded) {
        Ok(bytes) => bytes,
        Err(_) => return Some(Err(err::unauthorized("undecodable basic auth header"))),
    };
    let decoded = match String::from_utf8(decoded) {
        Ok(s) => s,
        Err(_) => return Some(Err(err::unauthorized("undecodable basic auth header"))),
    };
    let (user, pass) = match decoded.split_once(':') {
        Some(pair) => pair,
        None => return Some(Err(err::unauthorized("malformed basic auth header"))),
    };
    Some(Ok((user.to_string(), pass.to_string())))
}

/// Resolve full cloud credentials from a request's basic-auth header.
pub fn credentials_from_headers(
    headers: &HeaderMap,
    cloud: &CloudConfig,
) -> Result<Credentials, AppError> {
    let (user_cloud, password) = parse_basic_auth(headers)
        .ok_or_else(|| err::unauthorized("device cloud credentials required"))??;

    let (username, cloud_fqdn) = match user_cloud.split_once(USERNAME_CLOUD_DELIMITER) {
        Some((user, fqdn)) if !fqdn.is_empty() => (user.to_string(), fqdn.to_string()),
        _ => (user_cloud.clone(), cloud.default_fqdn.clone()),
    };
    if username.is_empty() || password.is_empty() {
        return Err(err::unauthorized("empty device cloud credentials"));
    }
    Ok(Credentials {
        username,
        password,
        cloud_fqdn,
    })
}

/// Build a cloud client for one request's credentials.
pub fn cloud_client_for(creds: &Credentials, cloud: &CloudConfig) -> Result<CloudClient, AppError> {
    let client = match &cloud.base_url {
        Some(base_url) => CloudClient::with_base_url(
            base_url,
            &creds.username,
            &creds.password,
            cloud.request_timeout(),
        ),
        None => CloudClient::new(
            &creds.username,
            &creds.password,
            &creds.cloud_fqdn,
            cloud.request_timeout(),
        ),
    };
    client.map_err(AppError::from)
}
