use super::schema::{
    bridges, calls, channels, confbridges, external_medias, groupcalls,
    recordings,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

pub trait CacheKey {
    fn cache_keys(&self) -> Vec<String>;
}

#[derive(Display, EnumString, PartialEq, Clone, Copy, Debug)]
pub enum ChannelType {
    #[strum(serialize = "call")]
    Call,
    #[strum(serialize = "conference")]
    Conference,
    #[strum(serialize = "join")]
    Join,
    #[strum(serialize = "recording")]
    Recording,
    #[strum(serialize = "external")]
    External,
    #[strum(serialize = "application")]
    Application,
    #[strum(serialize = "none")]
    None,
}

#[derive(Display, EnumString, PartialEq, Clone, Copy, Debug)]
pub enum Direction {
    #[strum(serialize = "incoming")]
    Incoming,
    #[strum(serialize = "outgoing")]
    Outgoing,
    #[strum(serialize = "none")]
    None,
}

/// Which sides of a channel currently have audio suppressed. The
/// add/remove algebra is what the mute/unmute facade actions persist.
#[derive(Display, EnumString, PartialEq, Clone, Copy, Debug)]
pub enum MuteDirection {
    #[strum(serialize = "none")]
    None,
    #[strum(serialize = "in")]
    In,
    #[strum(serialize = "out")]
    Out,
    #[strum(serialize = "both")]
    Both,
}

impl MuteDirection {
    pub fn add(self, other: MuteDirection) -> MuteDirection {
        match (self, other) {
            (a, MuteDirection::None) => a,
            (_, MuteDirection::Both) | (MuteDirection::Both, _) => {
                MuteDirection::Both
            }
            (MuteDirection::None, b) => b,
            (MuteDirection::In, MuteDirection::Out)
            | (MuteDirection::Out, MuteDirection::In) => MuteDirection::Both,
            (a, b) if a == b => a,
            (a, _) => a,
        }
    }

    pub fn remove(self, other: MuteDirection) -> MuteDirection {
        match (self, other) {
            (a, MuteDirection::None) => a,
            (_, MuteDirection::Both) => MuteDirection::None,
            (MuteDirection::Both, MuteDirection::In) => MuteDirection::Out,
            (MuteDirection::Both, MuteDirection::Out) => MuteDirection::In,
            (a, b) if a == b => MuteDirection::None,
            (a, _) => a,
        }
    }
}

#[derive(Display, EnumString, PartialEq, Clone, Copy, Debug)]
pub enum CallStatus {
    #[strum(serialize = "dialing")]
    Dialing,
    #[strum(serialize = "ringing")]
    Ringing,
    #[strum(serialize = "progressing")]
    Progressing,
    #[strum(serialize = "terminating")]
    Terminating,
    #[strum(serialize = "hangup")]
    Hangup,
}

#[derive(Display, EnumString, PartialEq, Clone, Copy, Debug)]
pub enum RingMethod {
    #[strum(serialize = "ring_all")]
    RingAll,
    #[strum(serialize = "linear")]
    Linear,
}

#[derive(Display, EnumString, PartialEq, Clone, Copy, Debug)]
pub enum AnswerMethod {
    #[strum(serialize = "hangup_others")]
    HangupOthers,
    #[strum(serialize = "none")]
    None,
}

#[derive(Display, EnumString, PartialEq, Clone, Copy, Debug)]
pub enum GroupcallStatus {
    #[strum(serialize = "progressing")]
    Progressing,
    #[strum(serialize = "answered")]
    Answered,
    #[strum(serialize = "hangup")]
    Hangup,
}

#[derive(Display, EnumString, PartialEq, Clone, Copy, Debug)]
pub enum RecordingStatus {
    #[strum(serialize = "initiating")]
    Initiating,
    #[strum(serialize = "recording")]
    Recording,
    #[strum(serialize = "stopping")]
    Stopping,
    #[strum(serialize = "ended")]
    Ended,
}

#[derive(Display, EnumString, PartialEq, Clone, Copy, Debug)]
pub enum ReferenceType {
    #[strum(serialize = "call")]
    Call,
    #[strum(serialize = "confbridge")]
    Confbridge,
}

#[derive(Queryable, Deserialize, Serialize, Debug, Clone)]
pub struct Channel {
    pub id: String,
    pub customer_id: String,
    pub switch_id: String,
    pub name: String,
    pub tech: String,
    pub channel_type: String,
    pub sip_call_id: Option<String>,
    pub sip_transport: Option<String>,
    pub src_name: Option<String>,
    pub src_number: Option<String>,
    pub dst_name: Option<String>,
    pub dst_number: Option<String>,
    pub state: String,
    pub data: Option<Value>,
    pub stasis_name: Option<String>,
    pub stasis_data: Option<Value>,
    pub bridge_id: Option<String>,
    pub playback_id: Option<String>,
    pub direction: String,
    pub mute_direction: String,
    pub hangup_cause: Option<String>,
    pub tm_create: DateTime<Utc>,
    pub tm_update: Option<DateTime<Utc>>,
    pub tm_answer: Option<DateTime<Utc>>,
    pub tm_ringing: Option<DateTime<Utc>>,
    pub tm_end: Option<DateTime<Utc>>,
    pub tm_delete: Option<DateTime<Utc>>,
}

impl CacheKey for Channel {
    fn cache_keys(&self) -> Vec<String> {
        vec![format!("tandem:cache:channel:{}", self.id)]
    }
}

impl Channel {
    /// A channel is ended once it has been soft deleted.
    pub fn is_ended(&self) -> bool {
        self.tm_delete.is_some()
    }

    pub fn channel_type(&self) -> ChannelType {
        ChannelType::from_str(&self.channel_type).unwrap_or(ChannelType::None)
    }

    pub fn direction(&self) -> Direction {
        Direction::from_str(&self.direction).unwrap_or(Direction::None)
    }

    pub fn mute_direction(&self) -> MuteDirection {
        MuteDirection::from_str(&self.mute_direction)
            .unwrap_or(MuteDirection::None)
    }

    pub fn stasis_value(&self, key: &str) -> Option<String> {
        self.stasis_data
            .as_ref()?
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
    }

    pub fn data_value(&self, key: &str) -> Option<String> {
        self.data
            .as_ref()?
            .get(key)
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
    }

    /// JSON-backed collections are never exposed absent, always empty.
    pub fn normalize(mut self) -> Self {
        if self.data.is_none() {
            self.data = Some(Value::Object(Default::default()));
        }
        if self.stasis_data.is_none() {
            self.stasis_data = Some(Value::Object(Default::default()));
        }
        self
    }
}

#[derive(Insertable, Deserialize, Serialize, Debug, Clone)]
#[table_name = "channels"]
pub struct NewChannel {
    pub id: String,
    pub customer_id: String,
    pub switch_id: String,
    pub name: String,
    pub tech: String,
    pub channel_type: String,
    pub src_name: Option<String>,
    pub src_number: Option<String>,
    pub dst_name: Option<String>,
    pub dst_number: Option<String>,
    pub state: String,
    pub data: Option<Value>,
    pub direction: String,
    pub mute_direction: String,
    pub tm_create: DateTime<Utc>,
}

#[derive(Queryable, Deserialize, Serialize, Debug, Clone)]
pub struct Call {
    pub id: String,
    pub customer_id: String,
    pub channel_id: String,
    pub bridge_id: Option<String>,
    pub status: String,
    pub direction: String,
    pub source: Option<Value>,
    pub destination: Option<Value>,
    pub action_id: Option<String>,
    pub master_call_id: Option<String>,
    pub chained_call_ids: Option<Value>,
    pub recording_id: Option<String>,
    pub recording_ids: Option<Value>,
    pub external_media_id: Option<String>,
    pub confbridge_id: Option<String>,
    pub groupcall_id: Option<String>,
    pub mute_direction: String,
    pub hangup_by: Option<String>,
    pub hangup_reason: Option<String>,
    pub dialroute_id: Option<String>,
    pub dialroutes: Option<Value>,
    pub tm_create: DateTime<Utc>,
    pub tm_update: Option<DateTime<Utc>>,
    pub tm_progressing: Option<DateTime<Utc>>,
    pub tm_ringing: Option<DateTime<Utc>>,
    pub tm_hangup: Option<DateTime<Utc>>,
    pub tm_delete: Option<DateTime<Utc>>,
}

impl CacheKey for Call {
    fn cache_keys(&self) -> Vec<String> {
        vec![format!("tandem:cache:call:{}", self.id)]
    }
}

impl Call {
    pub fn is_ended(&self) -> bool {
        self.tm_delete.is_some()
    }

    pub fn status(&self) -> CallStatus {
        CallStatus::from_str(&self.status).unwrap_or(CallStatus::Hangup)
    }

    pub fn chained_call_ids(&self) -> Vec<String> {
        json_string_array(self.chained_call_ids.as_ref())
    }

    pub fn normalize(mut self) -> Self {
        if self.chained_call_ids.is_none() {
            self.chained_call_ids = Some(Value::Array(Vec::new()));
        }
        if self.recording_ids.is_none() {
            self.recording_ids = Some(Value::Array(Vec::new()));
        }
        if self.dialroutes.is_none() {
            self.dialroutes = Some(Value::Array(Vec::new()));
        }
        self
    }
}

#[derive(Insertable, Deserialize, Serialize, Debug, Clone)]
#[table_name = "calls"]
pub struct NewCall {
    pub id: String,
    pub customer_id: String,
    pub channel_id: String,
    pub bridge_id: Option<String>,
    pub status: String,
    pub direction: String,
    pub source: Option<Value>,
    pub destination: Option<Value>,
    pub master_call_id: Option<String>,
    pub groupcall_id: Option<String>,
    pub mute_direction: String,
    pub tm_create: DateTime<Utc>,
}

#[derive(Queryable, Deserialize, Serialize, Debug, Clone)]
pub struct Bridge {
    pub id: String,
    pub customer_id: String,
    pub switch_id: String,
    pub name: String,
    pub tech: String,
    pub channel_ids: Option<Value>,
    pub reference_type: String,
    pub reference_id: Option<String>,
    pub tm_create: DateTime<Utc>,
    pub tm_update: Option<DateTime<Utc>>,
    pub tm_delete: Option<DateTime<Utc>>,
}

impl CacheKey for Bridge {
    fn cache_keys(&self) -> Vec<String> {
        vec![format!("tandem:cache:bridge:{}", self.id)]
    }
}

impl Bridge {
    pub fn is_ended(&self) -> bool {
        self.tm_delete.is_some()
    }

    pub fn channel_ids(&self) -> Vec<String> {
        json_string_array(self.channel_ids.as_ref())
    }

    pub fn normalize(mut self) -> Self {
        if self.channel_ids.is_none() {
            self.channel_ids = Some(Value::Array(Vec::new()));
        }
        self
    }
}

#[derive(Insertable, Deserialize, Serialize, Debug, Clone)]
#[table_name = "bridges"]
pub struct NewBridge {
    pub id: String,
    pub customer_id: String,
    pub switch_id: String,
    pub name: String,
    pub tech: String,
    pub channel_ids: Option<Value>,
    pub reference_type: String,
    pub reference_id: Option<String>,
    pub tm_create: DateTime<Utc>,
}

#[derive(Queryable, Deserialize, Serialize, Debug, Clone)]
pub struct Confbridge {
    pub id: String,
    pub customer_id: String,
    pub status: String,
    pub bridge_id: Option<String>,
    pub channel_call_ids: Option<Value>,
    pub recording_id: Option<String>,
    pub recording_ids: Option<Value>,
    pub external_media_id: Option<String>,
    pub tm_create: DateTime<Utc>,
    pub tm_update: Option<DateTime<Utc>>,
    pub tm_delete: Option<DateTime<Utc>>,
}

impl CacheKey for Confbridge {
    fn cache_keys(&self) -> Vec<String> {
        vec![format!("tandem:cache:confbridge:{}", self.id)]
    }
}

impl Confbridge {
    pub fn is_ended(&self) -> bool {
        self.tm_delete.is_some()
    }

    /// channel id -> call id lookup for every member of the conference.
    pub fn channel_call_ids(&self) -> HashMap<String, String> {
        let mut result = HashMap::new();
        if let Some(Value::Object(map)) = self.channel_call_ids.as_ref() {
            for (k, v) in map {
                if let Some(v) = v.as_str() {
                    result.insert(k.clone(), v.to_string());
                }
            }
        }
        result
    }

    pub fn recording_ids(&self) -> Vec<String> {
        json_string_array(self.recording_ids.as_ref())
    }

    pub fn normalize(mut self) -> Self {
        if self.channel_call_ids.is_none() {
            self.channel_call_ids = Some(Value::Object(Default::default()));
        }
        if self.recording_ids.is_none() {
            self.recording_ids = Some(Value::Array(Vec::new()));
        }
        self
    }
}

#[derive(Insertable, Deserialize, Serialize, Debug, Clone)]
#[table_name = "confbridges"]
pub struct NewConfbridge {
    pub id: String,
    pub customer_id: String,
    pub status: String,
    pub bridge_id: Option<String>,
    pub tm_create: DateTime<Utc>,
}

#[derive(Queryable, Deserialize, Serialize, Debug, Clone)]
pub struct Groupcall {
    pub id: String,
    pub customer_id: String,
    pub status: String,
    pub source: Option<Value>,
    pub destinations: Option<Value>,
    pub master_call_id: Option<String>,
    pub master_groupcall_id: Option<String>,
    pub ring_method: String,
    pub answer_method: String,
    pub answer_call_id: Option<String>,
    pub answer_groupcall_id: Option<String>,
    pub call_ids: Option<Value>,
    pub groupcall_ids: Option<Value>,
    pub call_count: i64,
    pub groupcall_count: i64,
    pub dial_index: i64,
    pub tm_create: DateTime<Utc>,
    pub tm_update: Option<DateTime<Utc>>,
    pub tm_delete: Option<DateTime<Utc>>,
}

impl CacheKey for Groupcall {
    fn cache_keys(&self) -> Vec<String> {
        vec![format!("tandem:cache:groupcall:{}", self.id)]
    }
}

impl Groupcall {
    pub fn is_ended(&self) -> bool {
        self.tm_delete.is_some()
    }

    pub fn ring_method(&self) -> RingMethod {
        RingMethod::from_str(&self.ring_method).unwrap_or(RingMethod::RingAll)
    }

    pub fn answer_method(&self) -> AnswerMethod {
        AnswerMethod::from_str(&self.answer_method).unwrap_or(AnswerMethod::None)
    }

    pub fn call_ids(&self) -> Vec<String> {
        json_string_array(self.call_ids.as_ref())
    }

    pub fn groupcall_ids(&self) -> Vec<String> {
        json_string_array(self.groupcall_ids.as_ref())
    }

    pub fn destinations(&self) -> Vec<Value> {
        match self.destinations.as_ref() {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        }
    }

    pub fn normalize(mut self) -> Self {
        if self.destinations.is_none() {
            self.destinations = Some(Value::Array(Vec::new()));
        }
        if self.call_ids.is_none() {
            self.call_ids = Some(Value::Array(Vec::new()));
        }
        if self.groupcall_ids.is_none() {
            self.groupcall_ids = Some(Value::Array(Vec::new()));
        }
        self
    }
}

#[derive(Insertable, Deserialize, Serialize, Debug, Clone)]
#[table_name = "groupcalls"]
pub struct NewGroupcall {
    pub id: String,
    pub customer_id: String,
    pub status: String,
    pub source: Option<Value>,
    pub destinations: Option<Value>,
    pub master_call_id: Option<String>,
    pub master_groupcall_id: Option<String>,
    pub ring_method: String,
    pub answer_method: String,
    pub call_count: i64,
    pub groupcall_count: i64,
    pub dial_index: i64,
    pub tm_create: DateTime<Utc>,
}

#[derive(Queryable, Deserialize, Serialize, Debug, Clone)]
pub struct Recording {
    pub id: String,
    pub customer_id: String,
    pub reference_type: String,
    pub reference_id: String,
    pub status: String,
    pub format: String,
    pub recording_name: String,
    pub filenames: Option<Value>,
    pub switch_id: Option<String>,
    pub channel_ids: Option<Value>,
    pub tm_start: Option<DateTime<Utc>>,
    pub tm_end: Option<DateTime<Utc>>,
    pub tm_create: DateTime<Utc>,
    pub tm_update: Option<DateTime<Utc>>,
    pub tm_delete: Option<DateTime<Utc>>,
}

impl CacheKey for Recording {
    fn cache_keys(&self) -> Vec<String> {
        vec![format!("tandem:cache:recording:{}", self.id)]
    }
}

impl Recording {
    pub fn is_ended(&self) -> bool {
        self.tm_delete.is_some()
    }

    pub fn status(&self) -> RecordingStatus {
        RecordingStatus::from_str(&self.status).unwrap_or(RecordingStatus::Ended)
    }

    pub fn reference_type(&self) -> Option<ReferenceType> {
        ReferenceType::from_str(&self.reference_type).ok()
    }

    pub fn filenames(&self) -> Vec<String> {
        json_string_array(self.filenames.as_ref())
    }

    pub fn channel_ids(&self) -> Vec<String> {
        json_string_array(self.channel_ids.as_ref())
    }

    pub fn normalize(mut self) -> Self {
        if self.filenames.is_none() {
            self.filenames = Some(Value::Array(Vec::new()));
        }
        if self.channel_ids.is_none() {
            self.channel_ids = Some(Value::Array(Vec::new()));
        }
        self
    }
}

#[derive(Insertable, Deserialize, Serialize, Debug, Clone)]
#[table_name = "recordings"]
pub struct NewRecording {
    pub id: String,
    pub customer_id: String,
    pub reference_type: String,
    pub reference_id: String,
    pub status: String,
    pub format: String,
    pub recording_name: String,
    pub filenames: Option<Value>,
    pub switch_id: Option<String>,
    pub channel_ids: Option<Value>,
    pub tm_start: Option<DateTime<Utc>>,
    pub tm_create: DateTime<Utc>,
}

#[derive(Queryable, Deserialize, Serialize, Debug, Clone)]
pub struct ExternalMedia {
    pub id: String,
    pub customer_id: String,
    pub switch_id: String,
    pub channel_id: String,
    pub reference_type: String,
    pub reference_id: String,
    pub encapsulation: String,
    pub transport: String,
    pub format: String,
    pub external_host: String,
    pub local_ip: String,
    pub local_port: i64,
    pub tm_create: DateTime<Utc>,
    pub tm_update: Option<DateTime<Utc>>,
    pub tm_delete: Option<DateTime<Utc>>,
}

impl CacheKey for ExternalMedia {
    fn cache_keys(&self) -> Vec<String> {
        vec![format!("tandem:cache:external_media:{}", self.id)]
    }
}

impl ExternalMedia {
    pub fn is_ended(&self) -> bool {
        self.tm_delete.is_some()
    }
}

#[derive(Insertable, Deserialize, Serialize, Debug, Clone)]
#[table_name = "external_medias"]
pub struct NewExternalMedia {
    pub id: String,
    pub customer_id: String,
    pub switch_id: String,
    pub channel_id: String,
    pub reference_type: String,
    pub reference_id: String,
    pub encapsulation: String,
    pub transport: String,
    pub format: String,
    pub external_host: String,
    pub local_ip: String,
    pub local_port: i64,
    pub tm_create: DateTime<Utc>,
}

fn json_string_array(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|v| v.to_string())
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mute_direction_add() {
        assert_eq!(
            MuteDirection::None.add(MuteDirection::In),
            MuteDirection::In
        );
        assert_eq!(
            MuteDirection::In.add(MuteDirection::Out),
            MuteDirection::Both
        );
        assert_eq!(
            MuteDirection::Out.add(MuteDirection::Out),
            MuteDirection::Out
        );
        assert_eq!(
            MuteDirection::In.add(MuteDirection::Both),
            MuteDirection::Both
        );
    }

    #[test]
    fn mute_direction_remove() {
        assert_eq!(
            MuteDirection::Both.remove(MuteDirection::In),
            MuteDirection::Out
        );
        assert_eq!(
            MuteDirection::Both.remove(MuteDirection::Out),
            MuteDirection::In
        );
        assert_eq!(
            MuteDirection::In.remove(MuteDirection::In),
            MuteDirection::None
        );
        assert_eq!(
            MuteDirection::Out.remove(MuteDirection::In),
            MuteDirection::Out
        );
        // unmuting both always clears, whatever the prior state
        for prior in [
            MuteDirection::None,
            MuteDirection::In,
            MuteDirection::Out,
            MuteDirection::Both,
        ]
        .iter()
        {
            assert_eq!(prior.remove(MuteDirection::Both), MuteDirection::None);
        }
    }

    #[test]
    fn confbridge_channel_call_ids() {
        let confbridge = Confbridge {
            id: "cb1".to_string(),
            customer_id: "cust1".to_string(),
            status: "progressing".to_string(),
            bridge_id: Some("b1".to_string()),
            channel_call_ids: Some(json!({"ch1": "c1", "ch2": "c2"})),
            recording_id: None,
            recording_ids: None,
            external_media_id: None,
            tm_create: Utc::now(),
            tm_update: None,
            tm_delete: None,
        };
        let map = confbridge.channel_call_ids();
        assert_eq!(map.get("ch1"), Some(&"c1".to_string()));
        assert_eq!(map.get("ch2"), Some(&"c2".to_string()));

        let normalized = confbridge.normalize();
        assert!(normalized.recording_ids.is_some());
    }

    #[test]
    fn groupcall_collections_normalized() {
        let groupcall = Groupcall {
            id: "g1".to_string(),
            customer_id: "cust1".to_string(),
            status: "progressing".to_string(),
            source: None,
            destinations: None,
            master_call_id: None,
            master_groupcall_id: None,
            ring_method: "ring_all".to_string(),
            answer_method: "hangup_others".to_string(),
            answer_call_id: None,
            answer_groupcall_id: None,
            call_ids: None,
            groupcall_ids: None,
            call_count: 0,
            groupcall_count: 0,
            dial_index: 0,
            tm_create: Utc::now(),
            tm_update: None,
            tm_delete: None,
        }
        .normalize();
        assert_eq!(groupcall.call_ids, Some(json!([])));
        assert_eq!(groupcall.groupcall_ids, Some(json!([])));
        assert_eq!(groupcall.destinations, Some(json!([])));
        assert_eq!(groupcall.ring_method(), RingMethod::RingAll);
        assert_eq!(groupcall.answer_method(), AnswerMethod::HangupOthers);
    }
}
