//! Target reachability check run before any plugin is scheduled

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Checks that the target answers at all. Any HTTP status counts as reachable;
/// only transport failures (DNS, connect, TLS, timeout) do not.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Returns the HTTP status the target answered with
    async fn probe(&self, url: &str) -> Result<u16>;
}

/// One GET through `ureq`, without following redirects
pub struct HttpProbe {
    agent: ureq::Agent,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .redirects(0)
            .build();
        Self { agent }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn probe(&self, url: &str) -> Result<u16> {
        let agent = self.agent.clone();
        let url = url.to_string();
        tokio::task::spawn_blocking(move || -> Result<u16> {
            match agent.get(&url).call() {
                Ok(resp) => Ok(resp.status()),
                Err(ureq::Error::Status(code, _)) => Ok(code),
                Err(e) => Err(e).with_context(|| format!("Failed to connect to {}", url)),
            }
        })
        .await
        .context("Reachability probe task failed")?
    }
}
