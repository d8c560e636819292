//! Pusher REST API client
//!
//! Events are triggered with a signed `POST /apps/{app_id}/events`. The
//! signature is an HMAC-SHA256 over the method, path and the sorted auth
//! query parameters, keyed with the application secret.

use async_trait::async_trait;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;

use super::Broadcaster;
use crate::config::PusherConfig;
use crate::error::BroadcastError;

type HmacSha256 = Hmac<Sha256>;

const AUTH_VERSION: &str = "1.0";

#[derive(Serialize)]
struct TriggerRequest<'a> {
    name: &'a str,
    channels: [&'a str; 1],
    data: &'a str,
}

/// Live broadcaster
#[derive(Clone)]
pub struct PusherClient {
    http: reqwest::Client,
    endpoint: String,
    app_id: String,
    key: String,
    mac: HmacSha256,
}

impl std::fmt::Debug for PusherClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PusherClient")
            .field("endpoint", &self.endpoint)
            .field("app_id", &self.app_id)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl PusherClient {
    /// Build a client, rejecting blank credentials
    pub fn new(config: &PusherConfig) -> Result<Self, BroadcastError> {
        if config.key.trim().is_empty() {
            return Err(BroadcastError::MissingCredential("key"));
        }
        if config.secret.trim().is_empty() {
            return Err(BroadcastError::MissingCredential("secret"));
        }
        if config.app_id.trim().is_empty() {
            return Err(BroadcastError::MissingCredential("app id"));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            app_id: config.app_id.clone(),
            key: config.key.clone(),
            mac: keyed(&config.secret)?,
        })
    }

    fn events_path(&self) -> String {
        format!("/apps/{}/events", self.app_id)
    }

    /// Query string for `body`, signature last
    fn signed_query(&self, path: &str, body: &str, timestamp: i64) -> String {
        let body_md5 = format!("{:x}", md5::compute(body.as_bytes()));
        let query = format!(
            "auth_key={}&auth_timestamp={}&auth_version={}&body_md5={}",
            self.key, timestamp, AUTH_VERSION, body_md5
        );
        let signature = sign(&self.mac, &format!("POST\n{}\n{}", path, query));
        format!("{}&auth_signature={}", query, signature)
    }
}

fn keyed(secret: &str) -> Result<HmacSha256, BroadcastError> {
    <HmacSha256 as KeyInit>::new_from_slice(secret.as_bytes())
        .map_err(|_| BroadcastError::InvalidSecret)
}

/// Hex encoded HMAC-SHA256 of `message` under the already keyed `mac`
fn sign(mac: &HmacSha256, message: &str) -> String {
    let mut mac = mac.clone();
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[async_trait]
impl Broadcaster for PusherClient {
    async fn publish(&self, channel: &str, event: &str, data: &str) -> Result<(), BroadcastError> {
        let body = serde_json::to_string(&TriggerRequest {
            name: event,
            channels: [channel],
            data,
        })?;

        let path = self.events_path();
        let query = self.signed_query(&path, &body, chrono::Utc::now().timestamp());
        let url = format!("{}{}?{}", self.endpoint, path, query);

        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BroadcastError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn config() -> PusherConfig {
        PusherConfig {
            key: "278d425bdf160c739803".into(),
            secret: "7ad3773142a6692b25b8".into(),
            app_id: "3".into(),
            endpoint: "https://api.pusherapp.com/".into(),
            connect_timeout_secs: 3,
            request_timeout_secs: 5,
        }
    }

    #[test]
    fn test_hmac_matches_rfc4231_vector() {
        let mac = keyed("Jefe").unwrap();
        assert_eq!(
            sign(&mac, "what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_keyed_mac_signs_repeatedly() {
        let mac = keyed("7ad3773142a6692b25b8").unwrap();
        let first = sign(&mac, "POST\n/apps/3/events\nauth_key=a");
        let second = sign(&mac, "POST\n/apps/3/events\nauth_key=a");

        assert_eq!(first.len(), 64);
        assert_eq!(first, second);
        assert_ne!(first, sign(&mac, "POST\n/apps/3/events\nauth_key=b"));
    }

    #[test]
    fn test_signed_query_matches_documented_example() {
        let client = PusherClient::new(&config()).unwrap();
        let body = r#"{"name":"foo","channels":["project-3"],"data":"{\"some\":\"data\"}"}"#;

        let query = client.signed_query("/apps/3/events", body, 1353088179);

        assert_eq!(
            query,
            "auth_key=278d425bdf160c739803&auth_timestamp=1353088179&auth_version=1.0\
             &body_md5=ec365a775a4cd0599faeb73354201b6f\
             &auth_signature=da454824c97ba181a32ccc17a72625ba02771f50b50e1e7430e47a1f3f457e6c"
        );
    }

    #[test]
    fn test_signed_query_layout() {
        let client = PusherClient::new(&config()).unwrap();
        let query = client.signed_query("/apps/3/events", "", 1353088179);

        assert!(query.starts_with(
            "auth_key=278d425bdf160c739803&auth_timestamp=1353088179&auth_version=1.0\
             &body_md5=d41d8cd98f00b204e9800998ecf8427e&auth_signature="
        ));
        let signature = query.rsplit('=').next().unwrap();
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn test_signature_depends_on_body() {
        let client = PusherClient::new(&config()).unwrap();
        let a = client.signed_query("/apps/3/events", "{\"a\":1}", 1);
        let b = client.signed_query("/apps/3/events", "{\"a\":2}", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_blank_credentials_rejected() {
        let mut cfg = config();
        cfg.secret = String::new();
        assert!(matches!(
            PusherClient::new(&cfg),
            Err(BroadcastError::MissingCredential("secret"))
        ));

        let mut cfg = config();
        cfg.app_id = " ".into();
        assert!(matches!(
            PusherClient::new(&cfg),
            Err(BroadcastError::MissingCredential("app id"))
        ));
    }

    #[test]
    fn test_endpoint_trailing_slash_trimmed() {
        let client = PusherClient::new(&config()).unwrap();
        assert_eq!(client.endpoint, "https://api.pusherapp.com");
        assert_eq!(client.events_path(), "/apps/3/events");
    }
}
