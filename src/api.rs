use std::{net::Ipv6Addr, sync::Arc};

use async_trait::async_trait;

use crate::config;

#[derive(Debug, thiserror::Error)]
pub enum ResetError {
    #[error("cannot build HTTP client: {0}")]
    Client(reqwest::Error),

    #[error("reset request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("BMC answered {status}: {message}")]
    Status {
        status: reqwest::StatusCode,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// The BMC accepted the reset.
    Reset,

    /// `no_restart` is set; nothing was sent.
    DryRun,
}

/// Something that can power-cycle the router.
#[async_trait]
pub trait PowerControl: Send + Sync {
    async fn invoke_reset(&self) -> Result<ResetOutcome, ResetError>;
}

/// Client for the router's Redfish BMC.
#[derive(Clone)]
pub struct Api {
    inner: Arc<Inner>,
    client: reqwest::Client,
}

struct Inner {
    reset_url: String,
    reset_type: String,
    credentials: Option<config::Credentials>,
    dry_run: bool,
}

impl Api {
    pub fn from_config(conf: &config::Config) -> Result<Self, ResetError> {
        let ipmi = &conf.opnsense_ipmi;
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(ipmi.accept_invalid_certs)
            .timeout(std::time::Duration::from_secs(ipmi.timeout_secs))
            .no_proxy()
            .build()
            .map_err(ResetError::Client)?;

        Ok(Self {
            inner: Arc::new(Inner {
                reset_url: reset_url(ipmi),
                reset_type: ipmi.reset_type.clone(),
                credentials: ipmi.credentials(),
                dry_run: conf.no_restart,
            }),
            client,
        })
    }

    pub fn reset_url(&self) -> &str {
        &self.inner.reset_url
    }
}

#[async_trait]
impl PowerControl for Api {
    async fn invoke_reset(&self) -> Result<ResetOutcome, ResetError> {
        if self.inner.dry_run {
            tracing::warn!(
                "no_restart is set: would reset with ResetType={} via {}",
                self.inner.reset_type,
                self.inner.reset_url
            );
            return Ok(ResetOutcome::DryRun);
        }

        tracing::debug!("Sending ResetType={} to BMC", self.inner.reset_type);
        let mut req = self
            .client
            .post(&self.inner.reset_url)
            .json(&serde_json::json!({ "ResetType": self.inner.reset_type }));
        if let Some(creds) = &self.inner.credentials {
            req = req.basic_auth(&creds.user, Some(&creds.password));
        }
        let res = req.send().await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(ResetError::Status {
                status,
                message: describe_error(&body),
            });
        }

        tracing::debug!("BMC accepted reset with {}", status);
        Ok(ResetOutcome::Reset)
    }
}

fn reset_url(ipmi: &config::IpmiConfig) -> String {
    let host = match ipmi.ip.parse::<Ipv6Addr>() {
        Ok(v6) => format!("[{v6}]"),
        Err(_) => ipmi.ip.clone(),
    };
    format!(
        "{}://{}:{}/redfish/v1/Systems/{}/Actions/ComputerSystem.Reset",
        ipmi.protocol, host, ipmi.port, ipmi.system_id
    )
}

/// Pull the human-readable part out of a Redfish error payload,
/// falling back to the raw body.
fn describe_error(body: &str) -> String {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.trim().to_string();
    };
    let error = &json["error"];
    error["@Message.ExtendedInfo"][0]["Message"]
        .as_str()
        .or_else(|| error["message"].as_str())
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string())
}
