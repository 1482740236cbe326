//! Provisioning of bridging credentials with the remote broker.
//!
//! The actual provisioning protocol lives in an external helper executable;
//! the bridge only knows when to run it: once at startup when broker
//! initialization was requested, and again whenever an established cloud
//! link is lost (the server may have reset our credentials in the
//! meantime). The helper prints the broker-assigned client id on its first
//! output line; that id names the reserved connection-state topic.

use std::path::PathBuf;

use tokio::process::Command;

use crate::error::{BridgeError, BridgeResult};

pub(crate) trait Registrator {
    /// The client id the broker knows us by, once registered.
    fn client_id(&self) -> Option<&str>;

    async fn register(&mut self) -> BridgeResult<()>;
}

#[derive(Debug)]
pub(crate) struct HelperRegistrator {
    helper: PathBuf,
    portal_id: String,
    client_id: Option<String>,
}

impl HelperRegistrator {
    pub(crate) fn new(helper: PathBuf, portal_id: String) -> Self {
        Self {
            helper,
            portal_id,
            client_id: None,
        }
    }
}

impl Registrator for HelperRegistrator {
    fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    async fn register(&mut self) -> BridgeResult<()> {
        tracing::info!(helper = %self.helper.display(), "registering with the remote broker");
        let output = Command::new(&self.helper)
            .arg("register")
            .arg(&self.portal_id)
            .output()
            .await?;
        if !output.status.success() {
            return Err(BridgeError::Registration(format!(
                "helper exited with {}",
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Some(client_id) = stdout.lines().next().map(str::trim).filter(|id| !id.is_empty())
        {
            tracing::info!(client_id, "registered with the remote broker");
            self.client_id = Some(client_id.to_string());
        }
        Ok(())
    }
}
