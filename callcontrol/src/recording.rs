use crate::channel::Channel;
use crate::server::CALL_SERVICE;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use tandem_db::message::{
    DomainError, DomainEventType, StasisDataKey, CONTEXT_RECORDING,
};
use tandem_db::models::{self, NewRecording, RecordingStatus, ReferenceType};
use tandem_rpc::message::{RpcBridgeRecord, RpcCreateSnoop, RpcRecord};
use tandem_utils::uuid;
use tracing::info;

pub struct RecordingOptions {
    pub format: String,
    pub max_duration: u64,
    pub max_silence: u64,
    pub beep: bool,
    pub terminate_on: String,
    pub if_exists: String,
}

impl Default for RecordingOptions {
    fn default() -> Self {
        RecordingOptions {
            format: "wav".to_string(),
            max_duration: 0,
            max_silence: 0,
            beep: false,
            terminate_on: "none".to_string(),
            if_exists: "fail".to_string(),
        }
    }
}

pub fn recording_name(
    reference_type: ReferenceType,
    reference_id: &str,
    start: DateTime<Utc>,
) -> String {
    format!("{}_{}_{}", reference_type, reference_id, start.timestamp())
}

/// A call recording is two files, one per audio direction.
pub fn snoop_filenames(name: &str, format: &str) -> (String, String) {
    (
        format!("{}_in.{}", name, format),
        format!("{}_out.{}", name, format),
    )
}

pub async fn start(
    reference_type: ReferenceType,
    reference_id: &str,
    options: RecordingOptions,
) -> Result<models::Recording> {
    match reference_type {
        ReferenceType::Call => start_call_recording(reference_id, options).await,
        ReferenceType::Confbridge => {
            start_confbridge_recording(reference_id, options).await
        }
    }
}

/// Record a call by snooping the channel twice, once per direction.
/// The recording row is inserted only after the snoop channel ids and
/// filenames are fixed, so a reader never sees a half named recording.
async fn start_call_recording(
    call_id: &str,
    options: RecordingOptions,
) -> Result<models::Recording> {
    let call = CALL_SERVICE.db.get_call(call_id).await?;
    if call.is_ended() {
        return Err(DomainError::AlreadyEnded.into());
    }
    let channel = CALL_SERVICE.db.get_channel(&call.channel_id).await?;
    if channel.is_ended() {
        return Err(DomainError::AlreadyEnded.into());
    }

    let id = uuid();
    let now = Utc::now();
    let name = recording_name(ReferenceType::Call, call_id, now);
    let (file_in, file_out) = snoop_filenames(&name, &options.format);
    let snoop_in_id = uuid();
    let snoop_out_id = uuid();

    let recording = CALL_SERVICE
        .db
        .create_recording(NewRecording {
            id: id.clone(),
            customer_id: call.customer_id.clone(),
            reference_type: ReferenceType::Call.to_string(),
            reference_id: call_id.to_string(),
            status: RecordingStatus::Initiating.to_string(),
            format: options.format.clone(),
            recording_name: name,
            filenames: Some(json!([file_in, file_out])),
            switch_id: Some(channel.switch_id.clone()),
            channel_ids: Some(json!([snoop_in_id, snoop_out_id])),
            tm_start: None,
            tm_create: now,
        })
        .await?;

    for (snoop_id, spy, filename) in [
        (&snoop_in_id, "in", &file_in),
        (&snoop_out_id, "out", &file_out),
    ]
    .iter()
    {
        let app_args = format!(
            "context={},customer_id={},reference_id={},filename={}",
            CONTEXT_RECORDING, call.customer_id, id, filename,
        );
        CALL_SERVICE
            .switch
            .create_snoop(
                &channel.switch_id,
                RpcCreateSnoop {
                    id: channel.id.clone(),
                    snoop_id: snoop_id.to_string(),
                    spy: spy.to_string(),
                    app: CALL_SERVICE.config.application.clone(),
                    app_args,
                },
            )
            .await?;
    }

    CALL_SERVICE
        .db
        .update_call_recording(call_id, Some(id))
        .await?;
    info!(recording = %recording.id, call = %call_id, "call recording started");
    CALL_SERVICE
        .events
        .publish(DomainEventType::RecordingCreated, &recording);
    Ok(recording)
}

/// A conference is already mixed on its bridge, so it records with a
/// single bridge record instead of snoops.
async fn start_confbridge_recording(
    confbridge_id: &str,
    options: RecordingOptions,
) -> Result<models::Recording> {
    let confbridge = CALL_SERVICE.db.get_confbridge(confbridge_id).await?;
    if confbridge.is_ended() {
        return Err(DomainError::AlreadyEnded.into());
    }
    let bridge_id = confbridge
        .bridge_id
        .clone()
        .ok_or(DomainError::NotFound("bridge"))?;
    let bridge = CALL_SERVICE.db.get_bridge(&bridge_id).await?;

    let id = uuid();
    let now = Utc::now();
    let name = recording_name(ReferenceType::Confbridge, confbridge_id, now);
    let filename = format!("{}.{}", name, options.format);

    let recording = CALL_SERVICE
        .db
        .create_recording(NewRecording {
            id: id.clone(),
            customer_id: confbridge.customer_id.clone(),
            reference_type: ReferenceType::Confbridge.to_string(),
            reference_id: confbridge_id.to_string(),
            status: RecordingStatus::Initiating.to_string(),
            format: options.format.clone(),
            recording_name: name.clone(),
            filenames: Some(json!([filename])),
            switch_id: Some(bridge.switch_id.clone()),
            channel_ids: Some(json!([])),
            tm_start: None,
            tm_create: now,
        })
        .await?;

    CALL_SERVICE
        .switch
        .bridge_record(
            &bridge.switch_id,
            RpcBridgeRecord {
                bridge_id,
                name,
                format: options.format,
                max_duration: options.max_duration,
                max_silence: options.max_silence,
                beep: options.beep,
                terminate_on: options.terminate_on,
                if_exists: options.if_exists,
            },
        )
        .await?;

    let confbridge = CALL_SERVICE
        .db
        .confbridge_add_recording(confbridge_id, &id)
        .await?;
    info!(
        recording = %recording.id,
        confbridge = %confbridge_id,
        "conference recording started"
    );
    CALL_SERVICE
        .events
        .publish(DomainEventType::RecordingCreated, &recording);
    CALL_SERVICE
        .events
        .publish(DomainEventType::ConfbridgeUpdated, &confbridge);
    Ok(recording)
}

/// A snoop channel reached the application: tell the switch to write
/// its leg to the file carried in the stasis bag.
pub async fn on_snoop_channel_start(channel: &models::Channel) -> Result<()> {
    let recording_id = channel
        .stasis_value(&StasisDataKey::ReferenceId.to_string())
        .ok_or(DomainError::NotFound("recording"))?;
    let filename = channel
        .stasis_value("filename")
        .ok_or(DomainError::NotFound("recording"))?;
    let recording = CALL_SERVICE.db.get_recording(&recording_id).await?;

    CALL_SERVICE
        .switch
        .record(
            &channel.switch_id,
            RpcRecord {
                id: channel.id.clone(),
                name: filename,
                format: recording.format.clone(),
                max_duration: 0,
                max_silence: 0,
                beep: false,
                terminate_on: "none".to_string(),
                if_exists: "fail".to_string(),
            },
        )
        .await?;

    let recording = CALL_SERVICE
        .db
        .update_recording_status(&recording_id, RecordingStatus::Recording)
        .await?;
    CALL_SERVICE
        .events
        .publish(DomainEventType::RecordingUpdated, &recording);
    Ok(())
}

pub async fn stop(recording_id: &str) -> Result<models::Recording> {
    let recording = CALL_SERVICE.db.get_recording(recording_id).await?;
    match recording.status() {
        RecordingStatus::Stopping | RecordingStatus::Ended => {
            return Ok(recording)
        }
        _ => {}
    }

    let recording = CALL_SERVICE
        .db
        .update_recording_status(recording_id, RecordingStatus::Stopping)
        .await?;

    match recording.reference_type() {
        Some(ReferenceType::Call) => {
            // dropping the snoop legs ends the file writes; the final
            // status lands when their destroy events come back
            for channel_id in recording.channel_ids() {
                Channel::new(&channel_id).hangup("normal").await?;
            }
        }
        Some(ReferenceType::Confbridge) => {
            if let Some(switch_id) = recording.switch_id.clone() {
                CALL_SERVICE
                    .switch
                    .stop_recording(&switch_id, &recording.recording_name)
                    .await?;
            }
            let recording = CALL_SERVICE
                .db
                .update_recording_status(recording_id, RecordingStatus::Ended)
                .await?;
            CALL_SERVICE
                .events
                .publish(DomainEventType::RecordingUpdated, &recording);
            return Ok(recording);
        }
        None => {
            return Err(DomainError::UnsupportedReferenceType(
                recording.reference_type.clone(),
            )
            .into())
        }
    }

    CALL_SERVICE
        .events
        .publish(DomainEventType::RecordingUpdated, &recording);
    Ok(recording)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn recording_names_carry_reference_and_start() {
        let start = Utc.ymd(2024, 5, 14).and_hms(9, 30, 0);
        let name = recording_name(ReferenceType::Call, "c42", start);
        assert_eq!(name, format!("call_c42_{}", start.timestamp()));
    }

    #[test]
    fn call_recordings_get_one_file_per_direction() {
        let (file_in, file_out) = snoop_filenames("call_c42_1715678000", "wav");
        assert_eq!(file_in, "call_c42_1715678000_in.wav");
        assert_eq!(file_out, "call_c42_1715678000_out.wav");
    }
}
