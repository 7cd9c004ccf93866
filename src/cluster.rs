use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub const SERVICE_NAME: &str = "webrtc-recorder";

const CHECK_TTL: Duration = Duration::from_secs(10);
const DEREGISTER_AFTER: Duration = Duration::from_secs(20);
const REGISTER_ATTEMPTS: u32 = 10;
const REGISTER_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct ServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Address")]
    address: &'a str,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Check")]
    check: CheckRegistration,
}

#[derive(Serialize)]
struct CheckRegistration {
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    deregister_critical_service_after: String,
}

enum PassError {
    /// The agent no longer knows the check, typically after it restarted.
    AgentLostUs,
    Other(anyhow::Error),
}

/// Keeps this instance registered with the discovery agent: a TTL health
/// check refreshed at half TTL, re-registration whenever the agent loses
/// track of us.
pub struct Cluster {
    agent: Url,
    client: Client,
    id: String,
    address: String,
    port: u16,
}

impl Cluster {
    pub fn new(agent: Url, id: String, address: String, port: u16) -> Arc<Self> {
        Arc::new(Self {
            agent,
            client: Client::new(),
            id,
            address,
            port,
        })
    }

    /// Registers the service, retrying on startup, then keeps the health
    /// check passing in the background until `cancel` fires.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.register().await {
                Ok(()) => break,
                Err(err) if attempt >= REGISTER_ATTEMPTS => {
                    return Err(err.context("service registration failed"));
                }
                Err(err) => {
                    warn!("service registration attempt {} failed: {}", attempt, err);
                    tokio::time::sleep(REGISTER_RETRY_DELAY).await;
                }
            }
        }
        info!(service = SERVICE_NAME, id = %self.id, "registered with discovery agent");
        tokio::spawn(self.heartbeat(cancel));
        Ok(())
    }

    async fn register(&self) -> Result<()> {
        let registration = ServiceRegistration {
            id: &self.id,
            name: SERVICE_NAME,
            address: &self.address,
            port: self.port,
            check: CheckRegistration {
                ttl: format!("{}s", CHECK_TTL.as_secs()),
                deregister_critical_service_after: format!("{}s", DEREGISTER_AFTER.as_secs()),
            },
        };
        let url = self.agent.join("v1/agent/service/register")?;
        let response = self
            .client
            .put(url)
            .json(&registration)
            .send()
            .await
            .context("reaching discovery agent")?;
        if !response.status().is_success() {
            return Err(anyhow!("discovery agent responded with {}", response.status()));
        }
        Ok(())
    }

    async fn heartbeat(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(CHECK_TTL / 2);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(err) = self.deregister().await {
                        debug!("deregistration failed: {}", err);
                    }
                    return;
                }
                _ = ticker.tick() => {
                    match self.pass().await {
                        Ok(()) => {}
                        Err(PassError::AgentLostUs) => {
                            // The agent dropped the check; register again.
                            warn!(id = %self.id, "health check unknown to agent, re-registering");
                            if let Err(err) = self.register().await {
                                warn!("re-registration failed: {}", err);
                            }
                        }
                        Err(PassError::Other(err)) => {
                            warn!("health check refresh failed: {}", err);
                        }
                    }
                }
            }
        }
    }

    async fn pass(&self) -> Result<(), PassError> {
        let url = self
            .agent
            .join(&format!("v1/agent/check/pass/service:{}", self.id))
            .map_err(|err| PassError::Other(err.into()))?;
        let response = self
            .client
            .put(url)
            .send()
            .await
            .map_err(|err| PassError::Other(err.into()))?;
        if response.status().is_server_error() {
            return Err(PassError::AgentLostUs);
        }
        if !response.status().is_success() {
            return Err(PassError::Other(anyhow!(
                "discovery agent responded with {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn deregister(&self) -> Result<()> {
        let url = self
            .agent
            .join(&format!("v1/agent/service/deregister/{}", self.id))?;
        self.client.put(url).send().await?.error_for_status()?;
        Ok(())
    }
}
