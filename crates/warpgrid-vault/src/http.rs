//! Plain-HTTP Vault client.
//!
//! Speaks just enough of Vault's HTTP API to renew tokens
//! (`POST /v1/auth/token/renew-self`) and secret leases
//! (`PUT /v1/sys/leases/renew`). Each request opens its own HTTP/1.1
//! connection and is bounded by the configured timeout. TLS is not
//! supported; put a local proxy in front of a TLS-only Vault.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode, header};
use http_body_util::{BodyExt, Full};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::backend::{RenewalBackend, RenewedLease, classify_response_error};
use crate::config::VaultConfig;
use crate::error::{VaultError, VaultResult};
use crate::request::LeaseKind;

const DEFAULT_PORT: u16 = 8200;

/// Vault client used by the renewer in production.
#[derive(Debug, Clone)]
pub struct VaultHttpClient {
    /// `host:port` to connect to.
    authority: String,
    /// Agent token, required for secret-lease renewal.
    token: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TokenRenewal {
    auth: LeaseGrant,
}

#[derive(Debug, Deserialize)]
struct LeaseGrant {
    lease_duration: u64,
    #[serde(default)]
    renewable: bool,
}

impl VaultHttpClient {
    pub fn new(address: &str, token: Option<String>, timeout: Duration) -> VaultResult<Self> {
        Ok(Self {
            authority: parse_authority(address)?,
            token,
            timeout,
        })
    }

    pub fn from_config(config: &VaultConfig) -> VaultResult<Self> {
        Self::new(&config.address, config.token.clone(), config.request_timeout()?)
    }

    /// Point the client at a different Vault and agent token.
    pub fn configure(&mut self, address: &str, token: Option<String>) -> VaultResult<()> {
        self.authority = parse_authority(address)?;
        self.token = token;
        Ok(())
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        auth_token: &str,
        body: serde_json::Value,
    ) -> VaultResult<(StatusCode, Bytes)> {
        let payload = Bytes::from(body.to_string());
        let authority = self.authority.clone();

        let result = tokio::time::timeout(self.timeout, async {
            let stream = tokio::net::TcpStream::connect(&authority)
                .await
                .map_err(|e| VaultError::Connection(format!("connect {authority}: {e}")))?;

            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| VaultError::Connection(format!("handshake {authority}: {e}")))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(error = %e, "vault connection closed with error");
                }
            });

            let req = http::Request::builder()
                .method(method)
                .uri(path)
                .header(header::HOST, &authority)
                .header(header::USER_AGENT, "warpgrid-vault/0.1")
                .header(header::CONTENT_TYPE, "application/json")
                .header("x-vault-token", auth_token)
                .body(Full::new(payload))
                .map_err(|e| VaultError::InvalidInput(e.to_string()))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| VaultError::Connection(format!("request {path}: {e}")))?;
            let status = resp.status();
            let body = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| VaultError::Connection(format!("read {path}: {e}")))?
                .to_bytes();

            Ok::<_, VaultError>((status, body))
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(VaultError::Connection(format!(
                "request {path} timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

#[async_trait]
impl RenewalBackend for VaultHttpClient {
    async fn renew(&self, kind: LeaseKind, id: &str, increment: u64) -> VaultResult<RenewedLease> {
        let grant = match kind {
            LeaseKind::Token => {
                let (status, body) = self
                    .send(
                        Method::POST,
                        "/v1/auth/token/renew-self",
                        id,
                        serde_json::json!({ "increment": format!("{increment}s") }),
                    )
                    .await?;
                decode::<TokenRenewal>(status, &body)?.auth
            }
            LeaseKind::Lease => {
                let token = self.token.as_deref().ok_or_else(|| {
                    VaultError::Config("renewing a secret lease requires an agent token".to_string())
                })?;
                let (status, body) = self
                    .send(
                        Method::PUT,
                        "/v1/sys/leases/renew",
                        token,
                        serde_json::json!({ "lease_id": id, "increment": increment }),
                    )
                    .await?;
                decode::<LeaseGrant>(status, &body)?
            }
        };

        debug!(%kind, lease_duration = grant.lease_duration, renewable = grant.renewable, "vault renewal accepted");
        Ok(RenewedLease {
            lease_duration: Duration::from_secs(grant.lease_duration),
            renewable: grant.renewable,
        })
    }
}

fn decode<T: DeserializeOwned>(status: StatusCode, body: &[u8]) -> VaultResult<T> {
    if !status.is_success() {
        let errors = serde_json::from_slice::<ErrorBody>(body)
            .map(|b| b.errors)
            .unwrap_or_default();
        return Err(classify_response_error(status.as_u16(), &errors));
    }
    serde_json::from_slice(body)
        .map_err(|e| VaultError::Connection(format!("malformed vault response: {e}")))
}

/// Reduce a configured address to `host:port`.
fn parse_authority(address: &str) -> VaultResult<String> {
    let trimmed = address.trim().trim_end_matches('/');
    if trimmed.starts_with("https://") {
        return Err(VaultError::Config(format!(
            "{address}: https is not supported by the built-in client"
        )));
    }
    let rest = trimmed.strip_prefix("http://").unwrap_or(trimmed);
    if rest.is_empty() || rest.contains('/') || rest.contains("://") {
        return Err(VaultError::Config(format!("invalid vault address {address:?}")));
    }

    // Bracketed IPv6 literals carry colons of their own.
    let has_port = match rest.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && !port.contains(']'),
        None => false,
    };
    if has_port {
        Ok(rest.to_string())
    } else {
        Ok(format!("{rest}:{DEFAULT_PORT}"))
    }
}
