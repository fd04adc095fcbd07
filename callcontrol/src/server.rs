use crate::event;
use anyhow::Result;
use lazy_static::lazy_static;
use serde::Deserialize;
use std::fs;
use std::sync::Arc;
use tandem_db::api::{Database, DB};
use tandem_rpc::client::{EventPublisher, RpcSwitchClient, SwitchControl};
use tandem_rpc::server::EventServer;
use tracing::{error, info};

lazy_static! {
    pub static ref CALL_SERVICE: CallService = CallService::new().unwrap();
}

#[derive(Deserialize)]
pub struct Config {
    /// Stasis application channels are handed to.
    pub application: String,
    /// Switch this control plane originates channels on.
    pub switch_id: String,
}

pub struct CallService {
    pub config: Config,
    pub db: Database,
    pub switch: Arc<dyn SwitchControl>,
    pub events: EventPublisher,
}

impl CallService {
    pub fn new() -> Result<CallService> {
        let contents = fs::read_to_string("/etc/tandem/tandem.conf")?;
        let config: Config = toml::from_str(&contents)?;
        Ok(CallService {
            config,
            db: DB.clone(),
            switch: Arc::new(RpcSwitchClient),
            events: EventPublisher::default(),
        })
    }
}

pub struct Server;

impl Server {
    /// Consume the switch event stream forever. Every entry is handled
    /// on its own task and acked only when the handler succeeded, so a
    /// crash or failure mid-handling leaves it pending for redelivery.
    pub async fn run() -> Result<()> {
        info!(application = %CALL_SERVICE.config.application, "call control starting");
        let mut receiver = EventServer::new_switch_events().await;
        while let Some((entry, switch_event)) = receiver.recv().await {
            tokio::spawn(async move {
                let result = event::handle_switch_event(switch_event).await;
                if ack_on_success(&result) {
                    entry.ack().await;
                } else if let Err(e) = result {
                    error!("switch event handling failed, left pending: {e:#}");
                }
            });
        }
        Ok(())
    }
}

/// Failed entries stay pending so the stream redelivers them.
pub(crate) fn ack_on_success(result: &Result<()>) -> bool {
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn failed_events_are_left_pending() {
        assert!(ack_on_success(&Ok(())));
        assert!(!ack_on_success(&Err(anyhow!("db unavailable"))));
    }
}
