use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use tandem_db::models;
use tandem_rpc::client::{SwitchControl, SwitchError};
use tandem_rpc::message::{
    RpcBridgeRecord, RpcCreateChannel, RpcCreateSnoop, RpcExternalMedia,
    RpcRecord,
};

pub(crate) fn channel_record() -> models::Channel {
    models::Channel {
        id: "ch1".to_string(),
        customer_id: "cust1".to_string(),
        switch_id: "switch-1".to_string(),
        name: "PJSIP/agent-1".to_string(),
        tech: "PJSIP".to_string(),
        channel_type: "call".to_string(),
        sip_call_id: None,
        sip_transport: None,
        src_name: None,
        src_number: None,
        dst_name: None,
        dst_number: None,
        state: "Up".to_string(),
        data: None,
        stasis_name: None,
        stasis_data: None,
        bridge_id: None,
        playback_id: None,
        direction: "incoming".to_string(),
        mute_direction: "none".to_string(),
        hangup_cause: None,
        tm_create: Utc::now(),
        tm_update: None,
        tm_answer: None,
        tm_ringing: None,
        tm_end: None,
        tm_delete: None,
    }
}

/// Records every command and answers variable queries from a preset
/// map, empty string for anything unset.
#[derive(Default)]
pub(crate) struct MockSwitch {
    pub(crate) calls: Mutex<Vec<String>>,
    pub(crate) variables: Mutex<HashMap<String, String>>,
    pub hangup_not_found: bool,
}

impl MockSwitch {
    fn push(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_variable(&self, variable: &str, value: &str) {
        self.variables
            .lock()
            .unwrap()
            .insert(variable.to_string(), value.to_string());
    }
}

#[async_trait]
impl SwitchControl for MockSwitch {
    async fn answer(&self, _: &str, _: &str) -> Result<()> {
        self.push("answer");
        Ok(())
    }
    async fn ring(&self, _: &str, _: &str) -> Result<()> {
        self.push("ring");
        Ok(())
    }
    async fn hangup(&self, _: &str, channel_id: &str, _: &str) -> Result<()> {
        self.push(&format!("hangup:{channel_id}"));
        if self.hangup_not_found {
            return Err(SwitchError::NotFound.into());
        }
        Ok(())
    }
    async fn hold(&self, _: &str, _: &str) -> Result<()> {
        self.push("hold");
        Ok(())
    }
    async fn unhold(&self, _: &str, _: &str) -> Result<()> {
        self.push("unhold");
        Ok(())
    }
    async fn start_moh(&self, _: &str, _: &str) -> Result<()> {
        self.push("start_moh");
        Ok(())
    }
    async fn stop_moh(&self, _: &str, _: &str) -> Result<()> {
        self.push("stop_moh");
        Ok(())
    }
    async fn mute(&self, _: &str, _: &str, direction: &str) -> Result<()> {
        self.push(&format!("mute:{direction}"));
        Ok(())
    }
    async fn unmute(&self, _: &str, _: &str, direction: &str) -> Result<()> {
        self.push(&format!("unmute:{direction}"));
        Ok(())
    }
    async fn start_silence(&self, _: &str, _: &str) -> Result<()> {
        self.push("start_silence");
        Ok(())
    }
    async fn stop_silence(&self, _: &str, _: &str) -> Result<()> {
        self.push("stop_silence");
        Ok(())
    }
    async fn send_dtmf(&self, _: &str, _: &str, dtmf: &str) -> Result<()> {
        self.push(&format!("dtmf:{dtmf}"));
        Ok(())
    }
    async fn play(
        &self,
        _: &str,
        _: &str,
        _: Vec<String>,
        playback_id: &str,
    ) -> Result<()> {
        self.push(&format!("play:{playback_id}"));
        Ok(())
    }
    async fn stop_playback(
        &self,
        _: &str,
        _: &str,
        playback_id: &str,
    ) -> Result<()> {
        self.push(&format!("stop_playback:{playback_id}"));
        Ok(())
    }
    async fn dial(&self, _: &str, _: &str, _: &str, _: u64) -> Result<()> {
        self.push("dial");
        Ok(())
    }
    async fn redirect(&self, _: &str, _: &str, endpoint: &str) -> Result<()> {
        self.push(&format!("redirect:{endpoint}"));
        Ok(())
    }
    async fn continue_in_dialplan(
        &self,
        _: &str,
        _: &str,
        _: &str,
        _: &str,
    ) -> Result<()> {
        self.push("continue");
        Ok(())
    }
    async fn create_channel(
        &self,
        _: &str,
        request: RpcCreateChannel,
    ) -> Result<()> {
        self.push(&format!("create_channel:{}", request.endpoint));
        Ok(())
    }
    async fn create_snoop(
        &self,
        _: &str,
        request: RpcCreateSnoop,
    ) -> Result<()> {
        self.push(&format!("create_snoop:{}", request.spy));
        Ok(())
    }
    async fn record(&self, _: &str, request: RpcRecord) -> Result<()> {
        self.push(&format!("record:{}", request.name));
        Ok(())
    }
    async fn stop_recording(&self, _: &str, name: &str) -> Result<()> {
        self.push(&format!("stop_recording:{name}"));
        Ok(())
    }
    async fn bridge_record(
        &self,
        _: &str,
        request: RpcBridgeRecord,
    ) -> Result<()> {
        self.push(&format!("bridge_record:{}", request.name));
        Ok(())
    }
    async fn external_media_start(
        &self,
        _: &str,
        request: RpcExternalMedia,
    ) -> Result<()> {
        self.push(&format!("external_media:{}", request.external_host));
        Ok(())
    }
    async fn variable_get(
        &self,
        _: &str,
        _: &str,
        variable: &str,
    ) -> Result<String> {
        self.push(&format!("variable_get:{variable}"));
        Ok(self
            .variables
            .lock()
            .unwrap()
            .get(variable)
            .cloned()
            .unwrap_or_default())
    }
    async fn variable_set(
        &self,
        _: &str,
        _: &str,
        _: &str,
        _: &str,
    ) -> Result<()> {
        self.push("variable_set");
        Ok(())
    }
}
