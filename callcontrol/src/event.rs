use crate::external_media;
use crate::groupcall;
use crate::recording;
use crate::server::CALL_SERVICE;
use anyhow::Result;
use chrono::Utc;
use lazy_static::lazy_static;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tandem_db::message::*;
use tandem_db::models::{
    Call, CallStatus, Channel, ChannelType, Direction, MuteDirection, NewCall,
    NewChannel, RecordingStatus,
};
use tandem_rpc::client::SwitchControl;
use tandem_utils::uuid;
use tracing::{info, warn};

const LOOKUP_INTERVAL: Duration = Duration::from_millis(300);
const LOOKUP_ATTEMPTS: usize = 10;

lazy_static! {
    static ref CONTEXTS: HashMap<&'static str, (ChannelType, Direction)> = {
        let mut contexts = HashMap::new();
        contexts.insert(
            CONTEXT_CALL_INCOMING,
            (ChannelType::Call, Direction::Incoming),
        );
        contexts.insert(
            CONTEXT_CALL_OUTGOING,
            (ChannelType::Call, Direction::Outgoing),
        );
        contexts
            .insert(CONTEXT_CALL_SERVICE, (ChannelType::Call, Direction::None));
        contexts.insert(
            CONTEXT_CONF_INCOMING,
            (ChannelType::Conference, Direction::Incoming),
        );
        contexts.insert(
            CONTEXT_CONF_OUTGOING,
            (ChannelType::Conference, Direction::Outgoing),
        );
        contexts.insert(CONTEXT_JOIN_CALL, (ChannelType::Join, Direction::None));
        contexts.insert(
            CONTEXT_RECORDING,
            (ChannelType::Recording, Direction::None),
        );
        contexts.insert(
            CONTEXT_EXTERNAL_MEDIA,
            (ChannelType::External, Direction::None),
        );
        contexts.insert(
            CONTEXT_APPLICATION,
            (ChannelType::Application, Direction::None),
        );
        contexts
    };
}

pub fn resolve_context(context: &str) -> Option<(ChannelType, Direction)> {
    CONTEXTS.get(context).copied()
}

/// Normalise the stasis argument bag into the persisted form. Known
/// keys keep their canonical names, unknown keys are kept verbatim.
/// External media channels are the exception: the switch reports the
/// owning bridge id as the only, opaque key.
pub fn parse_stasis_args(tech: &str, args: &HashMap<String, String>) -> Value {
    let mut data = serde_json::Map::new();
    if tech == TECH_EXTERNAL_MEDIA {
        let bridge_id = args.keys().next().cloned().unwrap_or_default();
        data.insert(
            StasisDataKey::BridgeId.to_string(),
            Value::String(bridge_id),
        );
        return Value::Object(data);
    }
    for (raw_key, value) in args {
        // the Unknown bucket displays its variant name, so unknown
        // keys persist under their wire name, not the bucket's
        let key = match StasisDataKey::from_str(raw_key) {
            Ok(StasisDataKey::Unknown(key)) => key,
            Ok(key) => key.to_string(),
            Err(_) => raw_key.clone(),
        };
        data.insert(key, Value::String(value.clone()));
    }
    Value::Object(data)
}

pub async fn handle_switch_event(event: SwitchEvent) -> Result<()> {
    match event {
        SwitchEvent::ChannelCreated(event) => handle_channel_created(event).await,
        SwitchEvent::StasisStart(event) => handle_stasis_start(event).await,
        SwitchEvent::ChannelStateChanged(event) => {
            handle_state_changed(event).await
        }
        SwitchEvent::ChannelDestroyed(event) => {
            handle_channel_destroyed(event).await
        }
    }
}

/// Poll for the channel record. Events for one channel can overtake
/// each other, so a handler that needs the record waits a bounded
/// amount of time for the create to land before giving up.
pub async fn get_channel_with_timeout(id: &str) -> Result<Channel> {
    for _ in 0..LOOKUP_ATTEMPTS {
        match CALL_SERVICE.db.get_channel(id).await {
            Ok(channel) => return Ok(channel),
            Err(e) => {
                if e.downcast_ref::<DomainError>().is_none() {
                    return Err(e);
                }
            }
        }
        tokio::time::sleep(LOOKUP_INTERVAL).await;
    }
    Err(DomainError::LookupTimeout("channel").into())
}

fn optional(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

async fn handle_channel_created(event: ChannelCreated) -> Result<()> {
    let tech = event.name.split('/').next().unwrap_or("").to_string();
    let new = NewChannel {
        id: event.channel_id.clone(),
        customer_id: "".to_string(),
        switch_id: event.switch_id.clone(),
        name: event.name.clone(),
        tech,
        channel_type: ChannelType::None.to_string(),
        src_name: optional(event.caller_name),
        src_number: optional(event.caller_number),
        dst_name: optional(event.connected_name),
        dst_number: optional(event.connected_number),
        state: event.state.clone(),
        data: None,
        direction: Direction::None.to_string(),
        mute_direction: MuteDirection::None.to_string(),
        tm_create: Utc::now(),
    };
    let channel = CALL_SERVICE.db.create_channel(new).await?;
    info!(channel = %channel.id, name = %channel.name, "channel created");
    CALL_SERVICE
        .events
        .publish(DomainEventType::ChannelCreated, &channel);
    Ok(())
}

async fn handle_stasis_start(event: StasisStart) -> Result<()> {
    let channel = get_channel_with_timeout(&event.channel_id).await?;
    let stasis_data = parse_stasis_args(&channel.tech, &event.args);

    if channel.tech == TECH_EXTERNAL_MEDIA {
        let channel = CALL_SERVICE
            .db
            .update_channel_stasis(
                &channel.id,
                &event.application,
                stasis_data,
                ChannelType::External,
                Direction::None,
                None,
            )
            .await?;
        external_media::on_media_channel_start(&channel).await?;
        CALL_SERVICE
            .events
            .publish(DomainEventType::ChannelUpdated, &channel);
        return Ok(());
    }

    // a context the table doesn't know stays a channel of type none,
    // an unknown switch state on the other hand is a hard error
    let context = event.args.get("context").cloned().unwrap_or_default();
    let (channel_type, context_direction) = resolve_context(&context)
        .unwrap_or((ChannelType::None, Direction::None));
    let direction = event
        .args
        .get("direction")
        .and_then(|d| Direction::from_str(d).ok())
        .unwrap_or(context_direction);
    let customer_id = event.args.get("customer_id").cloned();

    let channel = CALL_SERVICE
        .db
        .update_channel_stasis(
            &channel.id,
            &event.application,
            stasis_data,
            channel_type,
            direction,
            customer_id,
        )
        .await?;
    info!(
        channel = %channel.id,
        context = %context,
        channel_type = %channel.channel_type,
        "channel entered application"
    );

    match channel_type {
        ChannelType::Call => {
            let channel = if direction == Direction::Incoming {
                sync_sip_info(&channel, true).await?
            } else {
                channel
            };
            ensure_call(&channel).await?;
            CALL_SERVICE
                .events
                .publish(DomainEventType::ChannelUpdated, &channel);
        }
        ChannelType::Conference => {
            join_confbridge(&channel).await?;
        }
        ChannelType::Join => {
            if let Some(bridge_id) =
                channel.stasis_value(&StasisDataKey::BridgeId.to_string())
            {
                let bridge = CALL_SERVICE
                    .db
                    .bridge_add_channel(&bridge_id, &channel.id)
                    .await?;
                CALL_SERVICE
                    .db
                    .update_channel_bridge(&channel.id, Some(bridge_id))
                    .await?;
                CALL_SERVICE
                    .events
                    .publish(DomainEventType::BridgeUpdated, &bridge);
            }
        }
        ChannelType::Recording => {
            recording::on_snoop_channel_start(&channel).await?;
        }
        ChannelType::External | ChannelType::Application | ChannelType::None => {
            CALL_SERVICE
                .events
                .publish(DomainEventType::ChannelUpdated, &channel);
        }
    }
    Ok(())
}

pub(crate) struct SipInfo {
    pub call_id: String,
    pub transport: String,
    pub pai: String,
    pub privacy: String,
}

/// SIP legs carry call id, transport, asserted identity and privacy in
/// channel variables. Inbound legs arrive with the values in the
/// stasis bag and the switch only fills gaps; outbound legs have no
/// headers at creation, so once they answer the switch is asked for
/// every value and the bag is ignored.
pub(crate) async fn fetch_sip_info(
    channel: &Channel,
    switch: &dyn SwitchControl,
    bag_first: bool,
) -> SipInfo {
    let fields = [
        (StasisDataKey::SipCallId, CHANNEL_VAR_SIP_CALL_ID),
        (StasisDataKey::Transport, CHANNEL_VAR_SIP_TRANSPORT),
        (StasisDataKey::SipPai, CHANNEL_VAR_SIP_PAI),
        (StasisDataKey::SipPrivacy, CHANNEL_VAR_SIP_PRIVACY),
    ];
    let mut values = Vec::with_capacity(fields.len());
    for (bag_key, variable) in fields.iter() {
        let bag_value = if bag_first {
            channel.stasis_value(&bag_key.to_string())
        } else {
            None
        };
        let value = match bag_value {
            Some(value) => value,
            None => switch
                .variable_get(&channel.switch_id, &channel.id, variable)
                .await
                .unwrap_or_default(),
        };
        values.push(value);
    }
    let mut values = values.into_iter();
    SipInfo {
        call_id: values.next().unwrap_or_default(),
        transport: values.next().unwrap_or_default(),
        pai: values.next().unwrap_or_default(),
        privacy: values.next().unwrap_or_default(),
    }
}

async fn sync_sip_info(channel: &Channel, bag_first: bool) -> Result<Channel> {
    let info =
        fetch_sip_info(channel, CALL_SERVICE.switch.as_ref(), bag_first).await;
    CALL_SERVICE
        .db
        .set_channel_sip_info(
            &channel.id,
            &info.call_id,
            &info.transport,
            &info.pai,
            &info.privacy,
        )
        .await
}

/// The call id a channel belongs to, whether it was handed over in the
/// stasis bag or recorded later in the data bag.
fn channel_call_id(channel: &Channel) -> Option<String> {
    channel
        .stasis_value(&StasisDataKey::CallId.to_string())
        .or_else(|| channel.data_value(&StasisDataKey::CallId.to_string()))
}

/// Attach the channel to its call record, creating one for inbound
/// channels that arrived without it.
async fn ensure_call(channel: &Channel) -> Result<Call> {
    if let Some(call_id) = channel_call_id(channel) {
        return CALL_SERVICE.db.get_call(&call_id).await;
    }
    let new = NewCall {
        id: uuid(),
        customer_id: channel.customer_id.clone(),
        channel_id: channel.id.clone(),
        bridge_id: None,
        status: CallStatus::Progressing.to_string(),
        direction: channel.direction.clone(),
        source: channel
            .stasis_value(&StasisDataKey::Source.to_string())
            .map(Value::String),
        destination: channel
            .stasis_value(&StasisDataKey::Target.to_string())
            .map(Value::String),
        master_call_id: None,
        groupcall_id: None,
        mute_direction: MuteDirection::None.to_string(),
        tm_create: Utc::now(),
    };
    let call = CALL_SERVICE.db.create_call(new).await?;
    CALL_SERVICE
        .db
        .update_channel_data(
            &channel.id,
            serde_json::json!({
                StasisDataKey::CallId.to_string(): call.id,
            }),
        )
        .await?;
    CALL_SERVICE
        .events
        .publish(DomainEventType::CallCreated, &call);
    Ok(call)
}

async fn join_confbridge(channel: &Channel) -> Result<()> {
    let confbridge_id = channel
        .stasis_value(&StasisDataKey::ConfbridgeId.to_string())
        .ok_or(DomainError::NotFound("confbridge"))?;
    let call_id = channel_call_id(channel).unwrap_or_default();
    let confbridge = CALL_SERVICE.db.get_confbridge(&confbridge_id).await?;
    if confbridge.is_ended() {
        return Err(DomainError::AlreadyEnded.into());
    }
    let bridge_id = confbridge
        .bridge_id
        .clone()
        .ok_or(DomainError::NotFound("bridge"))?;
    let (confbridge, bridge) = CALL_SERVICE
        .db
        .confbridge_join(&confbridge_id, &bridge_id, &channel.id, &call_id)
        .await?;
    CALL_SERVICE
        .db
        .update_channel_bridge(&channel.id, Some(bridge_id))
        .await?;
    if !call_id.is_empty() {
        CALL_SERVICE
            .db
            .update_call_confbridge(&call_id, Some(confbridge_id))
            .await?;
    }
    CALL_SERVICE
        .events
        .publish(DomainEventType::ConfbridgeUpdated, &confbridge);
    CALL_SERVICE
        .events
        .publish(DomainEventType::BridgeUpdated, &bridge);
    Ok(())
}

async fn handle_state_changed(event: ChannelStateChanged) -> Result<()> {
    match event.state.as_str() {
        "Ring" | "Ringing" => {
            let channel = get_channel_with_timeout(&event.channel_id).await?;
            let channel = CALL_SERVICE
                .db
                .update_channel_ringing(&channel.id, &event.state)
                .await?;
            if let Some(call_id) = channel_call_id(&channel) {
                let call = CALL_SERVICE
                    .db
                    .update_call_status(&call_id, CallStatus::Ringing)
                    .await?;
                CALL_SERVICE
                    .events
                    .publish(DomainEventType::CallUpdated, &call);
            }
            CALL_SERVICE
                .events
                .publish(DomainEventType::ChannelUpdated, &channel);
        }
        "Up" => {
            let channel = get_channel_with_timeout(&event.channel_id).await?;
            let channel = CALL_SERVICE
                .db
                .update_channel_answered(&channel.id, &event.state)
                .await?;
            // outbound legs only get their SIP identifiers once the
            // far end answered, so take every value from the switch
            // and ignore whatever the bag carried at creation
            let channel = if channel.direction() == Direction::Outgoing
                && channel.channel_type() == ChannelType::Call
            {
                sync_sip_info(&channel, false).await?
            } else {
                channel
            };
            if let Some(call_id) = channel_call_id(&channel) {
                let call = CALL_SERVICE
                    .db
                    .update_call_status(&call_id, CallStatus::Progressing)
                    .await?;
                CALL_SERVICE
                    .events
                    .publish(DomainEventType::CallUpdated, &call);
                if let Some(groupcall_id) = call.groupcall_id.clone() {
                    groupcall::on_call_answered(&groupcall_id, &call).await?;
                }
            }
            CALL_SERVICE
                .events
                .publish(DomainEventType::ChannelUpdated, &channel);
        }
        // every other state is unmapped and fails the event, the
        // stream decides whether to redeliver
        state => {
            return Err(DomainError::UnsupportedState(state.to_string()).into())
        }
    }
    Ok(())
}

async fn handle_channel_destroyed(event: ChannelDestroyed) -> Result<()> {
    let channel = match CALL_SERVICE
        .db
        .delete_channel(&event.channel_id, &event.cause)
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            // either never materialised or a redelivered destroy, both
            // are fine to drop
            if let Some(DomainError::NotFound(_)) = e.downcast_ref() {
                warn!(channel = %event.channel_id, "destroy for unknown channel");
                return Ok(());
            }
            return Err(e);
        }
    };
    info!(channel = %channel.id, cause = %event.cause, "channel destroyed");
    CALL_SERVICE
        .events
        .publish(DomainEventType::ChannelDeleted, &channel);

    if let Some(bridge_id) = channel.bridge_id.clone() {
        if let Some(confbridge_id) =
            channel.stasis_value(&StasisDataKey::ConfbridgeId.to_string())
        {
            if let Ok((confbridge, bridge)) = CALL_SERVICE
                .db
                .confbridge_leave(&confbridge_id, &bridge_id, &channel.id)
                .await
            {
                CALL_SERVICE
                    .events
                    .publish(DomainEventType::ConfbridgeUpdated, &confbridge);
                CALL_SERVICE
                    .events
                    .publish(DomainEventType::BridgeUpdated, &bridge);
            }
        } else if let Ok(bridge) = CALL_SERVICE
            .db
            .bridge_remove_channel(&bridge_id, &channel.id)
            .await
        {
            CALL_SERVICE
                .events
                .publish(DomainEventType::BridgeUpdated, &bridge);
        }
    }

    if let Some(call_id) = channel_call_id(&channel) {
        match CALL_SERVICE
            .db
            .delete_call(&call_id, "switch", &event.cause)
            .await
        {
            Ok(call) => {
                CALL_SERVICE
                    .events
                    .publish(DomainEventType::CallDeleted, &call);
                if let Some(groupcall_id) = call.groupcall_id.clone() {
                    groupcall::on_call_ended(&groupcall_id, &call).await?;
                }
            }
            Err(e) => {
                if e.downcast_ref::<DomainError>().is_none() {
                    return Err(e);
                }
            }
        }
    }

    match channel.channel_type() {
        ChannelType::Recording => {
            if let Some(recording_id) =
                channel.stasis_value(&StasisDataKey::ReferenceId.to_string())
            {
                if let Ok(recording) = CALL_SERVICE
                    .db
                    .update_recording_status(&recording_id, RecordingStatus::Ended)
                    .await
                {
                    CALL_SERVICE
                        .events
                        .publish(DomainEventType::RecordingUpdated, &recording);
                }
            }
        }
        ChannelType::External => {
            external_media::on_media_channel_destroyed(&channel).await?;
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{channel_record, MockSwitch};
    use tandem_db::message::{
        CHANNEL_VAR_SIP_CALL_ID, CHANNEL_VAR_SIP_TRANSPORT,
    };

    #[tokio::test]
    async fn answered_outgoing_leg_takes_sip_info_from_the_switch() {
        let switch = MockSwitch::default();
        switch.set_variable(CHANNEL_VAR_SIP_CALL_ID, "switch-call-id");
        switch.set_variable(CHANNEL_VAR_SIP_TRANSPORT, "tls");

        let mut channel = channel_record();
        channel.direction = "outgoing".to_string();
        channel.stasis_data = Some(serde_json::json!({
            "sip_call_id": "bag-call-id",
            "transport": "udp",
        }));

        let info = fetch_sip_info(&channel, &switch, false).await;
        assert_eq!(info.call_id, "switch-call-id");
        assert_eq!(info.transport, "tls");
    }

    #[tokio::test]
    async fn incoming_leg_prefers_the_stasis_bag() {
        let switch = MockSwitch::default();
        switch.set_variable(CHANNEL_VAR_SIP_CALL_ID, "switch-call-id");

        let mut channel = channel_record();
        channel.stasis_data = Some(serde_json::json!({
            "sip_call_id": "bag-call-id",
        }));

        let info = fetch_sip_info(&channel, &switch, true).await;
        assert_eq!(info.call_id, "bag-call-id");
        // gaps still come from the switch
        assert!(switch
            .calls()
            .contains(&format!("variable_get:{}", CHANNEL_VAR_SIP_TRANSPORT)));
    }

    #[test]
    fn context_table_resolves_types() {
        assert_eq!(
            resolve_context(CONTEXT_CALL_INCOMING),
            Some((ChannelType::Call, Direction::Incoming))
        );
        assert_eq!(
            resolve_context(CONTEXT_CONF_OUTGOING),
            Some((ChannelType::Conference, Direction::Outgoing))
        );
        assert_eq!(
            resolve_context(CONTEXT_RECORDING),
            Some((ChannelType::Recording, Direction::None))
        );
        assert_eq!(resolve_context("dialplan-internal"), None);
    }

    #[test]
    fn stasis_args_keep_unknown_keys() {
        let mut args = HashMap::new();
        args.insert("context".to_string(), "call-in".to_string());
        args.insert("x_experiment".to_string(), "on".to_string());
        args.insert("filename".to_string(), "call_c1_in.wav".to_string());
        args.insert("groupcall_id".to_string(), "g7".to_string());
        let data = parse_stasis_args("PJSIP", &args);
        assert_eq!(data["context"], "call-in");
        assert_eq!(data["x_experiment"], "on");
        assert_eq!(data["filename"], "call_c1_in.wav");
        assert_eq!(data["groupcall_id"], "g7");
        assert!(data.get("Unknown").is_none());
    }

    #[test]
    fn external_media_args_are_one_opaque_bridge_id() {
        let mut args = HashMap::new();
        args.insert("b0a1".to_string(), "".to_string());
        let data = parse_stasis_args(TECH_EXTERNAL_MEDIA, &args);
        assert_eq!(data["bridge_id"], "b0a1");
    }

}
