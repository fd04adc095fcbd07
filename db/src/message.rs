use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum_macros::{Display, EnumString};
use thiserror::Error;

/// Typed conditions the orchestration layer needs to tell apart from
/// plain infrastructure failures. Everything travels inside anyhow and
/// is recovered with downcast_ref at the decision points.
#[derive(Debug, Error, PartialEq)]
pub enum DomainError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("channel already ended")]
    AlreadyEnded,
    #[error("unsupported channel state {0}")]
    UnsupportedState(String),
    #[error("unsupported reference type {0}")]
    UnsupportedReferenceType(String),
    #[error("{0} lookup timed out")]
    LookupTimeout(&'static str),
}

/// Events the switch delivers on its event stream. Delivery is
/// at-least-once and may be reordered, the handlers have to cope.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum SwitchEvent {
    #[serde(rename = "channel_created")]
    ChannelCreated(ChannelCreated),
    #[serde(rename = "channel_state_changed")]
    ChannelStateChanged(ChannelStateChanged),
    #[serde(rename = "stasis_start")]
    StasisStart(StasisStart),
    #[serde(rename = "channel_destroyed")]
    ChannelDestroyed(ChannelDestroyed),
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ChannelCreated {
    pub switch_id: String,
    pub channel_id: String,
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub caller_name: String,
    #[serde(default)]
    pub caller_number: String,
    #[serde(default)]
    pub connected_name: String,
    #[serde(default)]
    pub connected_number: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ChannelStateChanged {
    pub switch_id: String,
    pub channel_id: String,
    pub state: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StasisStart {
    pub switch_id: String,
    pub channel_id: String,
    pub application: String,
    #[serde(default)]
    pub args: HashMap<String, String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ChannelDestroyed {
    pub switch_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub cause: String,
}

/// Keys the switch application hands over in the stasis argument bag.
/// Anything unrecognised lands in the Unknown bucket instead of being
/// silently dropped.
#[derive(Display, EnumString, PartialEq, Eq, Hash, Clone, Debug)]
pub enum StasisDataKey {
    #[strum(serialize = "context")]
    Context,
    #[strum(serialize = "direction")]
    Direction,
    #[strum(serialize = "customer_id")]
    CustomerId,
    #[strum(serialize = "call_id")]
    CallId,
    #[strum(serialize = "confbridge_id")]
    ConfbridgeId,
    #[strum(serialize = "bridge_id")]
    BridgeId,
    #[strum(serialize = "reference_type")]
    ReferenceType,
    #[strum(serialize = "reference_id")]
    ReferenceId,
    #[strum(serialize = "domain")]
    Domain,
    #[strum(serialize = "source")]
    Source,
    #[strum(serialize = "target")]
    Target,
    #[strum(serialize = "sip_call_id")]
    SipCallId,
    #[strum(serialize = "sip_pai")]
    SipPai,
    #[strum(serialize = "sip_privacy")]
    SipPrivacy,
    #[strum(serialize = "transport")]
    Transport,
    #[strum(default)]
    Unknown(String),
}

/// Dialplan contexts a channel can enter the application from.
pub const CONTEXT_CALL_INCOMING: &str = "call-in";
pub const CONTEXT_CALL_OUTGOING: &str = "call-out";
pub const CONTEXT_CALL_SERVICE: &str = "call-service";
pub const CONTEXT_CONF_INCOMING: &str = "conf-in";
pub const CONTEXT_CONF_OUTGOING: &str = "conf-out";
pub const CONTEXT_JOIN_CALL: &str = "join-call";
pub const CONTEXT_RECORDING: &str = "call-record";
pub const CONTEXT_EXTERNAL_MEDIA: &str = "call-external";
pub const CONTEXT_APPLICATION: &str = "call-application";

/// Channel variables the switch exposes for SIP legs.
pub const CHANNEL_VAR_SIP_CALL_ID: &str = "SIP_CALLID";
pub const CHANNEL_VAR_SIP_PAI: &str = "SIP_PAI";
pub const CHANNEL_VAR_SIP_PRIVACY: &str = "SIP_PRIVACY";
pub const CHANNEL_VAR_SIP_TRANSPORT: &str = "SIP_TRANSPORT";

/// Channel data keys the switch fills in after an external media channel
/// has been created.
pub const CHANNEL_DATA_LOCAL_ADDRESS: &str = "UNICASTRTP_LOCAL_ADDRESS";
pub const CHANNEL_DATA_LOCAL_PORT: &str = "UNICASTRTP_LOCAL_PORT";

/// The one technology whose stasis argument keys are opaque: the switch
/// reports the bridge id as the only key, so nothing in the bag parses
/// as key=value.
pub const TECH_EXTERNAL_MEDIA: &str = "UnicastRTP";

#[derive(Display, EnumString, PartialEq, Clone, Copy, Debug)]
pub enum DomainEventType {
    #[strum(serialize = "channel_created")]
    ChannelCreated,
    #[strum(serialize = "channel_updated")]
    ChannelUpdated,
    #[strum(serialize = "channel_deleted")]
    ChannelDeleted,
    #[strum(serialize = "call_created")]
    CallCreated,
    #[strum(serialize = "call_updated")]
    CallUpdated,
    #[strum(serialize = "call_deleted")]
    CallDeleted,
    #[strum(serialize = "bridge_created")]
    BridgeCreated,
    #[strum(serialize = "bridge_updated")]
    BridgeUpdated,
    #[strum(serialize = "bridge_deleted")]
    BridgeDeleted,
    #[strum(serialize = "confbridge_updated")]
    ConfbridgeUpdated,
    #[strum(serialize = "groupcall_created")]
    GroupcallCreated,
    #[strum(serialize = "groupcall_updated")]
    GroupcallUpdated,
    #[strum(serialize = "recording_created")]
    RecordingCreated,
    #[strum(serialize = "recording_updated")]
    RecordingUpdated,
    #[strum(serialize = "external_media_created")]
    ExternalMediaCreated,
    #[strum(serialize = "external_media_updated")]
    ExternalMediaUpdated,
    #[strum(serialize = "external_media_deleted")]
    ExternalMediaDeleted,
    #[strum(serialize = "groupcall_deleted")]
    GroupcallDeleted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn switch_event_parses_tagged_json() {
        let raw = r#"{
            "type": "stasis_start",
            "switch_id": "switch-1",
            "channel_id": "ch1",
            "application": "tandem",
            "args": {"context": "call-in", "direction": "incoming"}
        }"#;
        let event: SwitchEvent = serde_json::from_str(raw).unwrap();
        match event {
            SwitchEvent::StasisStart(start) => {
                assert_eq!(start.channel_id, "ch1");
                assert_eq!(
                    start.args.get("context"),
                    Some(&"call-in".to_string())
                );
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn stasis_key_unknown_bucket() {
        assert_eq!(
            StasisDataKey::from_str("context").unwrap(),
            StasisDataKey::Context
        );
        assert_eq!(
            StasisDataKey::from_str("whatever").unwrap(),
            StasisDataKey::Unknown("whatever".to_string())
        );
    }
}
