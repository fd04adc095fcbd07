use crate::server::CALL_SERVICE;
use anyhow::Result;
use chrono::Utc;
use std::str::FromStr;
use tandem_db::message::{
    DomainError, DomainEventType, StasisDataKey, CHANNEL_DATA_LOCAL_ADDRESS,
    CHANNEL_DATA_LOCAL_PORT,
};
use tandem_db::models::{self, NewExternalMedia, ReferenceType};
use tandem_rpc::message::RpcExternalMedia;
use tandem_utils::uuid;
use tracing::info;

pub const DEFAULT_ENCAPSULATION: &str = "rtp";
pub const DEFAULT_TRANSPORT: &str = "udp";
pub const DEFAULT_FORMAT: &str = "ulaw";

pub struct ExternalMediaRequest {
    pub reference_type: String,
    pub reference_id: String,
    pub external_host: String,
    pub encapsulation: Option<String>,
    pub transport: Option<String>,
    pub format: Option<String>,
}

/// Fork the media of a call or conference to an outside receiver. The
/// switch answers with a UnicastRTP channel that joins the reference's
/// bridge; the locally allocated RTP address only becomes known once
/// that channel is up.
pub async fn start(
    request: ExternalMediaRequest,
) -> Result<models::ExternalMedia> {
    let reference_type =
        ReferenceType::from_str(&request.reference_type).map_err(|_| {
            DomainError::UnsupportedReferenceType(request.reference_type.clone())
        })?;

    let (customer_id, switch_id, bridge_id) = match reference_type {
        ReferenceType::Call => {
            let call = CALL_SERVICE.db.get_call(&request.reference_id).await?;
            if call.is_ended() {
                return Err(DomainError::AlreadyEnded.into());
            }
            let channel = CALL_SERVICE.db.get_channel(&call.channel_id).await?;
            let bridge_id = call
                .bridge_id
                .clone()
                .ok_or(DomainError::NotFound("bridge"))?;
            (call.customer_id.clone(), channel.switch_id.clone(), bridge_id)
        }
        ReferenceType::Confbridge => {
            let confbridge =
                CALL_SERVICE.db.get_confbridge(&request.reference_id).await?;
            if confbridge.is_ended() {
                return Err(DomainError::AlreadyEnded.into());
            }
            let bridge_id = confbridge
                .bridge_id
                .clone()
                .ok_or(DomainError::NotFound("bridge"))?;
            let bridge = CALL_SERVICE.db.get_bridge(&bridge_id).await?;
            (
                confbridge.customer_id.clone(),
                bridge.switch_id.clone(),
                bridge_id,
            )
        }
    };

    let id = uuid();
    let channel_id = uuid();
    let encapsulation = request
        .encapsulation
        .unwrap_or_else(|| DEFAULT_ENCAPSULATION.to_string());
    let transport = request
        .transport
        .unwrap_or_else(|| DEFAULT_TRANSPORT.to_string());
    let format = request
        .format
        .unwrap_or_else(|| DEFAULT_FORMAT.to_string());

    let external_media = CALL_SERVICE
        .db
        .create_external_media(NewExternalMedia {
            id: id.clone(),
            customer_id,
            switch_id: switch_id.clone(),
            channel_id: channel_id.clone(),
            reference_type: reference_type.to_string(),
            reference_id: request.reference_id.clone(),
            encapsulation: encapsulation.clone(),
            transport: transport.clone(),
            format: format.clone(),
            external_host: request.external_host.clone(),
            local_ip: "".to_string(),
            local_port: 0,
            tm_create: Utc::now(),
        })
        .await?;

    CALL_SERVICE
        .switch
        .external_media_start(
            &switch_id,
            RpcExternalMedia {
                channel_id,
                app: CALL_SERVICE.config.application.clone(),
                // comes back as the one opaque stasis argument key
                data: bridge_id,
                external_host: request.external_host,
                encapsulation,
                transport,
                format,
            },
        )
        .await?;

    match reference_type {
        ReferenceType::Call => {
            CALL_SERVICE
                .db
                .update_call_external_media(&request.reference_id, Some(id))
                .await?;
        }
        ReferenceType::Confbridge => {
            CALL_SERVICE
                .db
                .update_confbridge_external_media(
                    &request.reference_id,
                    Some(id),
                )
                .await?;
        }
    }

    info!(
        external_media = %external_media.id,
        reference = %request.reference_id,
        "external media started"
    );
    CALL_SERVICE
        .events
        .publish(DomainEventType::ExternalMediaCreated, &external_media);
    Ok(external_media)
}

pub fn parse_local_port(value: &str) -> i64 {
    value.parse().unwrap_or(0)
}

/// The media channel entered the application: join it to the bridge it
/// was created for and capture the RTP address the switch allocated.
/// Either variable may be missing, in which case the defaults stand.
pub async fn on_media_channel_start(channel: &models::Channel) -> Result<()> {
    let external_media = CALL_SERVICE
        .db
        .get_external_media_by_channel(&channel.id)
        .await?;

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

    let switch = CALL_SERVICE.switch.as_ref();
    let local_ip = switch
        .variable_get(&channel.switch_id, &channel.id, CHANNEL_DATA_LOCAL_ADDRESS)
        .await
        .unwrap_or_default();
    let local_port = switch
        .variable_get(&channel.switch_id, &channel.id, CHANNEL_DATA_LOCAL_PORT)
        .await
        .map(|port| parse_local_port(&port))
        .unwrap_or(0);

    let external_media = CALL_SERVICE
        .db
        .update_external_media_local_addr(
            &external_media.id,
            &local_ip,
            local_port,
        )
        .await?;
    CALL_SERVICE
        .events
        .publish(DomainEventType::ExternalMediaUpdated, &external_media);
    Ok(())
}

/// The media channel is gone: drop the row and detach it from its
/// reference.
pub async fn on_media_channel_destroyed(
    channel: &models::Channel,
) -> Result<()> {
    let external_media = match CALL_SERVICE
        .db
        .get_external_media_by_channel(&channel.id)
        .await
    {
        Ok(external_media) => external_media,
        Err(e) => {
            if let Some(DomainError::NotFound(_)) = e.downcast_ref() {
                return Ok(());
            }
            return Err(e);
        }
    };

    let external_media = CALL_SERVICE
        .db
        .delete_external_media(&external_media.id)
        .await?;

    match ReferenceType::from_str(&external_media.reference_type) {
        Ok(ReferenceType::Call) => {
            let _ = CALL_SERVICE
                .db
                .update_call_external_media(&external_media.reference_id, None)
                .await;
        }
        Ok(ReferenceType::Confbridge) => {
            let _ = CALL_SERVICE
                .db
                .update_confbridge_external_media(
                    &external_media.reference_id,
                    None,
                )
                .await;
        }
        Err(_) => {}
    }

    CALL_SERVICE
        .events
        .publish(DomainEventType::ExternalMediaDeleted, &external_media);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_port_defaults_to_zero() {
        assert_eq!(parse_local_port("10542"), 10542);
        assert_eq!(parse_local_port(""), 0);
        assert_eq!(parse_local_port("not-a-port"), 0);
    }

    #[test]
    fn transport_defaults() {
        assert_eq!(DEFAULT_ENCAPSULATION, "rtp");
        assert_eq!(DEFAULT_TRANSPORT, "udp");
        assert_eq!(DEFAULT_FORMAT, "ulaw");
    }
}
