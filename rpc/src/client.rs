use super::message::*;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tandem_db::message::DomainEventType;
use tandem_redis::REDIS;
use tandem_utils::uuid;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::warn;

const REPLY_TIMEOUT: usize = 3000;

/// Failures the switch reports back that the orchestration layer wants
/// to tell apart. Anything else stays a plain anyhow error.
#[derive(Debug, Error, PartialEq)]
pub enum SwitchError {
    #[error("channel not found on switch")]
    NotFound,
    #[error("switch request timed out")]
    Timeout,
}

/// Command surface of a media switch. The one implementation sends over
/// the switch command stream; tests swap in their own.
#[async_trait]
pub trait SwitchControl: Send + Sync {
    async fn answer(&self, switch_id: &str, channel_id: &str) -> Result<()>;
    async fn ring(&self, switch_id: &str, channel_id: &str) -> Result<()>;
    async fn hangup(
        &self,
        switch_id: &str,
        channel_id: &str,
        cause: &str,
    ) -> Result<()>;
    async fn hold(&self, switch_id: &str, channel_id: &str) -> Result<()>;
    async fn unhold(&self, switch_id: &str, channel_id: &str) -> Result<()>;
    async fn start_moh(&self, switch_id: &str, channel_id: &str) -> Result<()>;
    async fn stop_moh(&self, switch_id: &str, channel_id: &str) -> Result<()>;
    async fn mute(
        &self,
        switch_id: &str,
        channel_id: &str,
        direction: &str,
    ) -> Result<()>;
    async fn unmute(
        &self,
        switch_id: &str,
        channel_id: &str,
        direction: &str,
    ) -> Result<()>;
    async fn start_silence(&self, switch_id: &str, channel_id: &str)
        -> Result<()>;
    async fn stop_silence(&self, switch_id: &str, channel_id: &str) -> Result<()>;
    async fn send_dtmf(
        &self,
        switch_id: &str,
        channel_id: &str,
        dtmf: &str,
    ) -> Result<()>;
    async fn play(
        &self,
        switch_id: &str,
        channel_id: &str,
        media: Vec<String>,
        playback_id: &str,
    ) -> Result<()>;
    async fn stop_playback(
        &self,
        switch_id: &str,
        channel_id: &str,
        playback_id: &str,
    ) -> Result<()>;
    async fn dial(
        &self,
        switch_id: &str,
        channel_id: &str,
        caller: &str,
        timeout: u64,
    ) -> Result<()>;
    async fn redirect(
        &self,
        switch_id: &str,
        channel_id: &str,
        endpoint: &str,
    ) -> Result<()>;
    async fn continue_in_dialplan(
        &self,
        switch_id: &str,
        channel_id: &str,
        context: &str,
        extension: &str,
    ) -> Result<()>;
    async fn create_channel(
        &self,
        switch_id: &str,
        request: RpcCreateChannel,
    ) -> Result<()>;
    async fn create_snoop(
        &self,
        switch_id: &str,
        request: RpcCreateSnoop,
    ) -> Result<()>;
    async fn record(&self, switch_id: &str, request: RpcRecord) -> Result<()>;
    async fn stop_recording(&self, switch_id: &str, name: &str) -> Result<()>;
    async fn bridge_record(
        &self,
        switch_id: &str,
        request: RpcBridgeRecord,
    ) -> Result<()>;
    async fn external_media_start(
        &self,
        switch_id: &str,
        request: RpcExternalMedia,
    ) -> Result<()>;
    async fn variable_get(
        &self,
        switch_id: &str,
        channel_id: &str,
        variable: &str,
    ) -> Result<String>;
    async fn variable_set(
        &self,
        switch_id: &str,
        channel_id: &str,
        variable: &str,
        value: &str,
    ) -> Result<()>;
}

pub struct RpcSwitchClient;

impl RpcSwitchClient {
    async fn send<T: Serialize>(
        &self,
        switch_id: &str,
        method: RpcMethod,
        id: &str,
        params: &T,
    ) -> Result<()> {
        let msg = RpcMessage {
            method,
            id: id.to_string(),
            params: serde_json::to_value(params)?,
            reply_to: "".to_string(),
        };
        REDIS
            .xadd_maxlen::<String>(
                &switch_stream(switch_id),
                "message",
                &serde_json::to_string(&msg)?,
                1000000,
            )
            .await?;
        Ok(())
    }

    /// Send a command and wait for the switch's reply entry. A reply
    /// that carries the not_found error is surfaced as
    /// SwitchError::NotFound, silence as Timeout.
    async fn request<T: Serialize>(
        &self,
        switch_id: &str,
        method: RpcMethod,
        id: &str,
        params: &T,
    ) -> Result<String> {
        let reply_to = format!("tandem:reply:{}", uuid());
        let msg = RpcMessage {
            method,
            id: id.to_string(),
            params: serde_json::to_value(params)?,
            reply_to: reply_to.clone(),
        };
        REDIS
            .xadd_maxlen::<String>(
                &switch_stream(switch_id),
                "message",
                &serde_json::to_string(&msg)?,
                1000000,
            )
            .await?;

        let (_entry_id, _key, value) = REDIS
            .xread_next_entry_timeout(&reply_to, "0", REPLY_TIMEOUT)
            .await
            .map_err(|_| SwitchError::Timeout)?;
        let _ = REDIS.del(&reply_to).await;

        let reply: RpcReply = serde_json::from_str(&value)?;
        if reply.error == RPC_ERROR_NOT_FOUND {
            return Err(SwitchError::NotFound.into());
        }
        if !reply.error.is_empty() {
            return Err(anyhow::anyhow!("switch error: {}", reply.error));
        }
        Ok(reply.value)
    }
}

#[async_trait]
impl SwitchControl for RpcSwitchClient {
    async fn answer(&self, switch_id: &str, channel_id: &str) -> Result<()> {
        let params = RpcChannel {
            id: channel_id.to_string(),
        };
        self.send(switch_id, RpcMethod::Answer, channel_id, &params)
            .await
    }

    async fn ring(&self, switch_id: &str, channel_id: &str) -> Result<()> {
        let params = RpcChannel {
            id: channel_id.to_string(),
        };
        self.send(switch_id, RpcMethod::Ring, channel_id, &params)
            .await
    }

    async fn hangup(
        &self,
        switch_id: &str,
        channel_id: &str,
        cause: &str,
    ) -> Result<()> {
        let params = RpcHangup {
            id: channel_id.to_string(),
            cause: cause.to_string(),
        };
        self.request(switch_id, RpcMethod::Hangup, channel_id, &params)
            .await?;
        Ok(())
    }

    async fn hold(&self, switch_id: &str, channel_id: &str) -> Result<()> {
        let params = RpcChannel {
            id: channel_id.to_string(),
        };
        self.send(switch_id, RpcMethod::Hold, channel_id, &params)
            .await
    }

    async fn unhold(&self, switch_id: &str, channel_id: &str) -> Result<()> {
        let params = RpcChannel {
            id: channel_id.to_string(),
        };
        self.send(switch_id, RpcMethod::Unhold, channel_id, &params)
            .await
    }

    async fn start_moh(&self, switch_id: &str, channel_id: &str) -> Result<()> {
        let params = RpcChannel {
            id: channel_id.to_string(),
        };
        self.send(switch_id, RpcMethod::StartMoh, channel_id, &params)
            .await
    }

    async fn stop_moh(&self, switch_id: &str, channel_id: &str) -> Result<()> {
        let params = RpcChannel {
            id: channel_id.to_string(),
        };
        self.send(switch_id, RpcMethod::StopMoh, channel_id, &params)
            .await
    }

    async fn mute(
        &self,
        switch_id: &str,
        channel_id: &str,
        direction: &str,
    ) -> Result<()> {
        let params = RpcMute {
            id: channel_id.to_string(),
            direction: direction.to_string(),
        };
        self.send(switch_id, RpcMethod::Mute, channel_id, &params)
            .await
    }

    async fn unmute(
        &self,
        switch_id: &str,
        channel_id: &str,
        direction: &str,
    ) -> Result<()> {
        let params = RpcMute {
            id: channel_id.to_string(),
            direction: direction.to_string(),
        };
        self.send(switch_id, RpcMethod::Unmute, channel_id, &params)
            .await
    }

    async fn start_silence(
        &self,
        switch_id: &str,
        channel_id: &str,
    ) -> Result<()> {
        let params = RpcChannel {
            id: channel_id.to_string(),
        };
        self.send(switch_id, RpcMethod::StartSilence, channel_id, &params)
            .await
    }

    async fn stop_silence(&self, switch_id: &str, channel_id: &str) -> Result<()> {
        let params = RpcChannel {
            id: channel_id.to_string(),
        };
        self.send(switch_id, RpcMethod::StopSilence, channel_id, &params)
            .await
    }

    async fn send_dtmf(
        &self,
        switch_id: &str,
        channel_id: &str,
        dtmf: &str,
    ) -> Result<()> {
        let params = RpcDtmf {
            id: channel_id.to_string(),
            dtmf: dtmf.to_string(),
        };
        self.send(switch_id, RpcMethod::SendDtmf, channel_id, &params)
            .await
    }

    async fn play(
        &self,
        switch_id: &str,
        channel_id: &str,
        media: Vec<String>,
        playback_id: &str,
    ) -> Result<()> {
        let params = RpcPlay {
            id: channel_id.to_string(),
            media,
            playback_id: playback_id.to_string(),
        };
        self.send(switch_id, RpcMethod::Play, channel_id, &params)
            .await
    }

    async fn stop_playback(
        &self,
        switch_id: &str,
        channel_id: &str,
        playback_id: &str,
    ) -> Result<()> {
        let params = RpcStopPlayback {
            id: channel_id.to_string(),
            playback_id: playback_id.to_string(),
        };
        self.send(switch_id, RpcMethod::StopPlayback, channel_id, &params)
            .await
    }

    async fn dial(
        &self,
        switch_id: &str,
        channel_id: &str,
        caller: &str,
        timeout: u64,
    ) -> Result<()> {
        let params = RpcDial {
            id: channel_id.to_string(),
            caller: caller.to_string(),
            timeout,
        };
        self.send(switch_id, RpcMethod::Dial, channel_id, &params)
            .await
    }

    async fn redirect(
        &self,
        switch_id: &str,
        channel_id: &str,
        endpoint: &str,
    ) -> Result<()> {
        let params = RpcRedirect {
            id: channel_id.to_string(),
            endpoint: endpoint.to_string(),
        };
        self.send(switch_id, RpcMethod::Redirect, channel_id, &params)
            .await
    }

    async fn continue_in_dialplan(
        &self,
        switch_id: &str,
        channel_id: &str,
        context: &str,
        extension: &str,
    ) -> Result<()> {
        let params = RpcContinue {
            id: channel_id.to_string(),
            context: context.to_string(),
            extension: extension.to_string(),
        };
        self.send(switch_id, RpcMethod::ContinueInDialplan, channel_id, &params)
            .await
    }

    async fn create_channel(
        &self,
        switch_id: &str,
        request: RpcCreateChannel,
    ) -> Result<()> {
        let id = request.id.clone();
        self.send(switch_id, RpcMethod::CreateChannel, &id, &request)
            .await
    }

    async fn create_snoop(
        &self,
        switch_id: &str,
        request: RpcCreateSnoop,
    ) -> Result<()> {
        let id = request.id.clone();
        self.send(switch_id, RpcMethod::CreateSnoop, &id, &request)
            .await
    }

    async fn record(&self, switch_id: &str, request: RpcRecord) -> Result<()> {
        let id = request.id.clone();
        self.send(switch_id, RpcMethod::Record, &id, &request).await
    }

    async fn stop_recording(&self, switch_id: &str, name: &str) -> Result<()> {
        let params = RpcChannel {
            id: name.to_string(),
        };
        self.send(switch_id, RpcMethod::StopRecording, name, &params)
            .await
    }

    async fn bridge_record(
        &self,
        switch_id: &str,
        request: RpcBridgeRecord,
    ) -> Result<()> {
        let id = request.bridge_id.clone();
        self.send(switch_id, RpcMethod::BridgeRecord, &id, &request)
            .await
    }

    async fn external_media_start(
        &self,
        switch_id: &str,
        request: RpcExternalMedia,
    ) -> Result<()> {
        let id = request.channel_id.clone();
        self.send(switch_id, RpcMethod::ExternalMediaStart, &id, &request)
            .await
    }

    async fn variable_get(
        &self,
        switch_id: &str,
        channel_id: &str,
        variable: &str,
    ) -> Result<String> {
        let params = RpcVariable {
            id: channel_id.to_string(),
            variable: variable.to_string(),
            value: "".to_string(),
        };
        self.request(switch_id, RpcMethod::GetVariable, channel_id, &params)
            .await
    }

    async fn variable_set(
        &self,
        switch_id: &str,
        channel_id: &str,
        variable: &str,
        value: &str,
    ) -> Result<()> {
        let params = RpcVariable {
            id: channel_id.to_string(),
            variable: variable.to_string(),
            value: value.to_string(),
        };
        self.send(switch_id, RpcMethod::SetVariable, channel_id, &params)
            .await
    }
}

/// Publishes domain change notifications to the shared event stream.
/// The send happens on its own task; callers that care (tests, mostly)
/// can await the handle, everyone else drops it.
#[derive(Clone, Default)]
pub struct EventPublisher;

#[derive(Serialize)]
struct DomainEvent<'a, T: Serialize> {
    #[serde(rename = "type")]
    event_type: String,
    data: &'a T,
}

impl EventPublisher {
    pub fn publish<T: Serialize>(
        &self,
        event_type: DomainEventType,
        data: &T,
    ) -> JoinHandle<()> {
        let payload = serde_json::to_string(&DomainEvent {
            event_type: event_type.to_string(),
            data,
        });
        tokio::spawn(async move {
            let payload = match payload {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("domain event encode failed {e}");
                    return;
                }
            };
            if let Err(e) = REDIS
                .xadd_maxlen::<String>(
                    DOMAIN_EVENT_STREAM,
                    "message",
                    &payload,
                    1000000,
                )
                .await
            {
                warn!("domain event publish failed {e}");
            }
        })
    }
}
