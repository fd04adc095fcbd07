use serde::{Deserialize, Serialize};
use strum_macros::EnumString;

pub const EVENT_STREAM: &str = "tandem:switch:events";
pub const EVENT_GROUP: &str = "callcontrol";
pub const DOMAIN_EVENT_STREAM: &str = "tandem:events";

pub fn switch_stream(switch_id: &str) -> String {
    format!("tandem:switch:{}:rpc", switch_id)
}

#[derive(
    strum_macros::Display,
    EnumString,
    Debug,
    PartialEq,
    Clone,
    Deserialize,
    Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RpcMethod {
    Answer,
    Ring,
    Hangup,
    Hold,
    Unhold,
    StartMoh,
    StopMoh,
    Mute,
    Unmute,
    StartSilence,
    StopSilence,
    SendDtmf,
    Play,
    StopPlayback,
    Dial,
    Redirect,
    ContinueInDialplan,
    CreateChannel,
    CreateSnoop,
    Record,
    StopRecording,
    BridgeRecord,
    ExternalMediaStart,
    GetVariable,
    SetVariable,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RpcMessage {
    pub method: RpcMethod,
    pub id: String,
    pub params: serde_json::Value,
    /// Stream the switch should answer on, for the few methods that
    /// want a reply. Empty means fire and forget.
    #[serde(default)]
    pub reply_to: String,
}

/// Reply entries the switch posts back on a reply stream.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RpcReply {
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub error: String,
}

pub const RPC_ERROR_NOT_FOUND: &str = "not_found";

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RpcChannel {
    pub id: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RpcHangup {
    pub id: String,
    pub cause: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RpcMute {
    pub id: String,
    pub direction: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RpcDtmf {
    pub id: String,
    pub dtmf: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RpcPlay {
    pub id: String,
    pub media: Vec<String>,
    pub playback_id: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RpcStopPlayback {
    pub id: String,
    pub playback_id: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RpcDial {
    pub id: String,
    pub caller: String,
    pub timeout: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RpcRedirect {
    pub id: String,
    pub endpoint: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RpcContinue {
    pub id: String,
    pub context: String,
    pub extension: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RpcCreateChannel {
    pub id: String,
    pub endpoint: String,
    pub app: String,
    pub app_args: String,
    pub caller_id: String,
    pub timeout: u64,
    pub variables: std::collections::HashMap<String, String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RpcCreateSnoop {
    pub id: String,
    pub snoop_id: String,
    pub spy: String,
    pub app: String,
    pub app_args: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RpcRecord {
    pub id: String,
    pub name: String,
    pub format: String,
    pub max_duration: u64,
    pub max_silence: u64,
    pub beep: bool,
    pub terminate_on: String,
    pub if_exists: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RpcBridgeRecord {
    pub bridge_id: String,
    pub name: String,
    pub format: String,
    pub max_duration: u64,
    pub max_silence: u64,
    pub beep: bool,
    pub terminate_on: String,
    pub if_exists: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RpcExternalMedia {
    pub channel_id: String,
    pub app: String,
    /// Opaque application data handed back as the only stasis argument
    /// key when the media channel enters the application.
    pub data: String,
    pub external_host: String,
    pub encapsulation: String,
    pub transport: String,
    pub format: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RpcVariable {
    pub id: String,
    pub variable: String,
    #[serde(default)]
    pub value: String,
}
