use crate::recording::RecordingOptions;
use crate::server::CALL_SERVICE;
use anyhow::Result;
use std::time::Duration;
use tandem_db::message::{DomainError, DomainEventType};
use tandem_db::models::{self, MuteDirection};
use tandem_rpc::client::{SwitchControl, SwitchError};
use tandem_rpc::message::RpcRecord;
use tandem_utils::uuid;
use tokio::task::JoinHandle;
use tracing::warn;

/// Facade over a single switch channel. Every action re-reads the
/// record first and refuses to drive a channel that already ended,
/// with hangup as the one idempotent exception.
pub struct Channel {
    pub id: String,
}

impl Channel {
    pub fn new(id: &str) -> Channel {
        Channel { id: id.to_string() }
    }

    async fn load(&self) -> Result<models::Channel> {
        let channel = CALL_SERVICE.db.get_channel(&self.id).await?;
        ensure_active(&channel)?;
        Ok(channel)
    }

    pub async fn answer(&self) -> Result<()> {
        let channel = self.load().await?;
        CALL_SERVICE
            .switch
            .answer(&channel.switch_id, &channel.id)
            .await
    }

    pub async fn ring(&self) -> Result<()> {
        let channel = self.load().await?;
        CALL_SERVICE
            .switch
            .ring(&channel.switch_id, &channel.id)
            .await
    }

    pub async fn hold_on(&self) -> Result<()> {
        let channel = self.load().await?;
        CALL_SERVICE
            .switch
            .hold(&channel.switch_id, &channel.id)
            .await
    }

    pub async fn hold_off(&self) -> Result<()> {
        let channel = self.load().await?;
        CALL_SERVICE
            .switch
            .unhold(&channel.switch_id, &channel.id)
            .await
    }

    pub async fn moh_on(&self) -> Result<()> {
        let channel = self.load().await?;
        CALL_SERVICE
            .switch
            .start_moh(&channel.switch_id, &channel.id)
            .await
    }

    pub async fn moh_off(&self) -> Result<()> {
        let channel = self.load().await?;
        CALL_SERVICE
            .switch
            .stop_moh(&channel.switch_id, &channel.id)
            .await
    }

    pub async fn silence_on(&self) -> Result<()> {
        let channel = self.load().await?;
        CALL_SERVICE
            .switch
            .start_silence(&channel.switch_id, &channel.id)
            .await
    }

    pub async fn silence_off(&self) -> Result<()> {
        let channel = self.load().await?;
        CALL_SERVICE
            .switch
            .stop_silence(&channel.switch_id, &channel.id)
            .await
    }

    /// The switch is told about the direction being muted now, the
    /// record keeps the merged result of every mute so far.
    pub async fn mute_on(
        &self,
        direction: MuteDirection,
    ) -> Result<models::Channel> {
        let channel = self.load().await?;
        CALL_SERVICE
            .switch
            .mute(&channel.switch_id, &channel.id, &direction.to_string())
            .await?;
        let merged = channel.mute_direction().add(direction);
        let channel = CALL_SERVICE
            .db
            .update_channel_mute_direction(&channel.id, merged)
            .await?;
        CALL_SERVICE
            .events
            .publish(DomainEventType::ChannelUpdated, &channel);
        Ok(channel)
    }

    pub async fn mute_off(
        &self,
        direction: MuteDirection,
    ) -> Result<models::Channel> {
        let channel = self.load().await?;
        CALL_SERVICE
            .switch
            .unmute(&channel.switch_id, &channel.id, &direction.to_string())
            .await?;
        let merged = channel.mute_direction().remove(direction);
        let channel = CALL_SERVICE
            .db
            .update_channel_mute_direction(&channel.id, merged)
            .await?;
        CALL_SERVICE
            .events
            .publish(DomainEventType::ChannelUpdated, &channel);
        Ok(channel)
    }

    /// Record this leg into the named file.
    pub async fn record(
        &self,
        name: &str,
        options: RecordingOptions,
    ) -> Result<()> {
        let channel = self.load().await?;
        record_switch(&channel, CALL_SERVICE.switch.as_ref(), name, &options)
            .await
    }

    pub async fn dtmf_send(&self, dtmf: &str) -> Result<()> {
        let channel = self.load().await?;
        CALL_SERVICE
            .switch
            .send_dtmf(&channel.switch_id, &channel.id, dtmf)
            .await
    }

    /// Start playback and return the playback id, which is also
    /// persisted so a later stop knows what to cancel.
    pub async fn play(&self, media: Vec<String>) -> Result<String> {
        let channel = self.load().await?;
        let playback_id = uuid();
        CALL_SERVICE
            .db
            .update_channel_playback(&channel.id, Some(playback_id.clone()))
            .await?;
        CALL_SERVICE
            .switch
            .play(&channel.switch_id, &channel.id, media, &playback_id)
            .await?;
        Ok(playback_id)
    }

    pub async fn playback_stop(&self) -> Result<()> {
        let channel = self.load().await?;
        if playback_stop_switch(&channel, CALL_SERVICE.switch.as_ref()).await? {
            CALL_SERVICE
                .db
                .update_channel_playback(&channel.id, None)
                .await?;
        }
        Ok(())
    }

    pub async fn dial(&self, caller: &str, timeout: u64) -> Result<()> {
        let channel = self.load().await?;
        CALL_SERVICE
            .switch
            .dial(&channel.switch_id, &channel.id, caller, timeout)
            .await
    }

    pub async fn redirect(&self, endpoint: &str) -> Result<()> {
        let channel = self.load().await?;
        CALL_SERVICE
            .switch
            .redirect(&channel.switch_id, &channel.id, endpoint)
            .await
    }

    pub async fn continue_to(&self, context: &str, extension: &str) -> Result<()> {
        let channel = self.load().await?;
        CALL_SERVICE
            .switch
            .continue_in_dialplan(&channel.switch_id, &channel.id, context, extension)
            .await
    }

    /// Idempotent hangup: a channel that is unknown, already ended, or
    /// already gone on the switch counts as hung up.
    pub async fn hangup(&self, cause: &str) -> Result<()> {
        let channel = match CALL_SERVICE.db.get_channel(&self.id).await {
            Ok(channel) => channel,
            Err(e) => {
                if let Some(DomainError::NotFound(_)) = e.downcast_ref() {
                    return Ok(());
                }
                return Err(e);
            }
        };
        if channel.is_ended() {
            return Ok(());
        }
        hangup_switch(&channel, CALL_SERVICE.switch.as_ref(), cause).await
    }

    /// Hang up and retire the record now instead of waiting for the
    /// switch's destroy event, refusing a channel that already ended.
    pub async fn hangup_now(&self, cause: &str) -> Result<models::Channel> {
        let channel = self.load().await?;
        hangup_switch(&channel, CALL_SERVICE.switch.as_ref(), cause).await?;
        let channel = CALL_SERVICE.db.delete_channel(&channel.id, cause).await?;
        CALL_SERVICE
            .events
            .publish(DomainEventType::ChannelDeleted, &channel);
        Ok(channel)
    }

    /// Schedule a hangup after a grace period. Unlike hangup itself
    /// this complains when the channel turns out to have ended already.
    pub fn hangup_delayed(&self, cause: &str, delay: Duration) -> JoinHandle<()> {
        let channel = Channel::new(&self.id);
        let cause = cause.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let result = match channel.load().await {
                Ok(record) => {
                    hangup_switch(
                        &record,
                        CALL_SERVICE.switch.as_ref(),
                        &cause,
                    )
                    .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(channel = %channel.id, "delayed hangup failed {e:#}");
            }
        })
    }
}

pub(crate) fn ensure_active(channel: &models::Channel) -> Result<()> {
    if channel.is_ended() {
        return Err(DomainError::AlreadyEnded.into());
    }
    Ok(())
}

pub(crate) async fn record_switch(
    channel: &models::Channel,
    switch: &dyn SwitchControl,
    name: &str,
    options: &RecordingOptions,
) -> Result<()> {
    switch
        .record(
            &channel.switch_id,
            RpcRecord {
                id: channel.id.clone(),
                name: name.to_string(),
                format: options.format.clone(),
                max_duration: options.max_duration,
                max_silence: options.max_silence,
                beep: options.beep,
                terminate_on: options.terminate_on.clone(),
                if_exists: options.if_exists.clone(),
            },
        )
        .await
}

/// Stop playback on the switch. Returns false when there is nothing
/// playing, which is not an error.
pub(crate) async fn playback_stop_switch(
    channel: &models::Channel,
    switch: &dyn SwitchControl,
) -> Result<bool> {
    let playback_id = channel.playback_id.clone().unwrap_or_default();
    if playback_id.is_empty() {
        return Ok(false);
    }
    switch
        .stop_playback(&channel.switch_id, &channel.id, &playback_id)
        .await?;
    Ok(true)
}

pub(crate) async fn hangup_switch(
    channel: &models::Channel,
    switch: &dyn SwitchControl,
    cause: &str,
) -> Result<()> {
    match switch.hangup(&channel.switch_id, &channel.id, cause).await {
        Ok(()) => Ok(()),
        Err(e) => match e.downcast_ref::<SwitchError>() {
            Some(SwitchError::NotFound) => Ok(()),
            _ => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{channel_record, MockSwitch};
    use chrono::Utc;

    #[test]
    fn ended_channels_are_refused() {
        let mut channel = channel_record();
        assert!(ensure_active(&channel).is_ok());
        channel.tm_delete = Some(Utc::now());
        let err = ensure_active(&channel).unwrap_err();
        assert_eq!(
            err.downcast_ref::<DomainError>(),
            Some(&DomainError::AlreadyEnded)
        );
    }

    #[tokio::test]
    async fn playback_stop_without_playback_is_a_noop() {
        let switch = MockSwitch::default();
        let channel = channel_record();
        let stopped = playback_stop_switch(&channel, &switch).await.unwrap();
        assert!(!stopped);
        assert!(switch.calls().is_empty());
    }

    #[tokio::test]
    async fn playback_stop_cancels_active_playback() {
        let switch = MockSwitch::default();
        let mut channel = channel_record();
        channel.playback_id = Some("pb42".to_string());
        let stopped = playback_stop_switch(&channel, &switch).await.unwrap();
        assert!(stopped);
        assert_eq!(switch.calls(), vec!["stop_playback:pb42".to_string()]);
    }

    #[tokio::test]
    async fn hangup_tolerates_channel_gone_on_switch() {
        let switch = MockSwitch {
            hangup_not_found: true,
            ..Default::default()
        };
        let channel = channel_record();
        hangup_switch(&channel, &switch, "normal").await.unwrap();
        assert_eq!(switch.calls(), vec!["hangup:ch1".to_string()]);
    }

    #[tokio::test]
    async fn record_sends_the_named_file_and_options() {
        let switch = MockSwitch::default();
        let channel = channel_record();
        let options = RecordingOptions {
            format: "wav".to_string(),
            ..Default::default()
        };
        record_switch(&channel, &switch, "call_c1_in.wav", &options)
            .await
            .unwrap();
        assert_eq!(switch.calls(), vec!["record:call_c1_in.wav".to_string()]);
    }
}
