use crate::address::Address;
use crate::channel::Channel;
use crate::server::CALL_SERVICE;
use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use tandem_db::message::{
    DomainEventType, StasisDataKey, CONTEXT_CALL_OUTGOING,
};
use tandem_db::models::{
    self, AnswerMethod, CallStatus, Direction, GroupcallStatus, MuteDirection,
    NewCall, NewGroupcall, RingMethod,
};
use tandem_redis::DistributedMutex;
use tandem_utils::uuid;
use tracing::{error, info};

const DEFAULT_DIAL_TIMEOUT: u64 = 60;

pub struct GroupcallRequest {
    pub customer_id: String,
    pub source: Address,
    pub destinations: Vec<Address>,
    pub ring_method: RingMethod,
    pub answer_method: AnswerMethod,
    pub master_call_id: Option<String>,
    pub master_groupcall_id: Option<String>,
    pub timeout: Option<u64>,
}

fn groupcall_lock(id: &str) -> DistributedMutex {
    DistributedMutex::new(format!("tandem:lock:groupcall:{}", id))
}

/// Legs that lose the race once `winner` has answered.
pub fn losing_call_ids(groupcall: &models::Groupcall, winner: &str) -> Vec<String> {
    groupcall
        .call_ids()
        .into_iter()
        .filter(|call_id| call_id != winner)
        .collect()
}

/// The destination a linear groupcall should try next, if any remain.
/// `dial_index` already points past every destination that was dialed.
pub fn next_destination(groupcall: &models::Groupcall) -> Option<Address> {
    let destinations = groupcall.destinations();
    destinations
        .get(groupcall.dial_index as usize)
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

/// Fan a dial out over the destination list. Ring-all dials every
/// destination at once, linear dials one and advances on failure.
pub async fn start(request: GroupcallRequest) -> Result<models::Groupcall> {
    let id = uuid();
    let destinations = request
        .destinations
        .iter()
        .map(|d| serde_json::to_value(d).unwrap_or(json!(null)))
        .collect::<Vec<_>>();

    let groupcall = CALL_SERVICE
        .db
        .create_groupcall(NewGroupcall {
            id: id.clone(),
            customer_id: request.customer_id.clone(),
            status: GroupcallStatus::Progressing.to_string(),
            source: Some(serde_json::to_value(&request.source)?),
            destinations: Some(json!(destinations)),
            master_call_id: request.master_call_id.clone(),
            master_groupcall_id: request.master_groupcall_id.clone(),
            ring_method: request.ring_method.to_string(),
            answer_method: request.answer_method.to_string(),
            call_count: 0,
            groupcall_count: 0,
            dial_index: 0,
            tm_create: Utc::now(),
        })
        .await?;
    info!(
        groupcall = %groupcall.id,
        destinations = request.destinations.len(),
        ring_method = %groupcall.ring_method,
        "groupcall started"
    );
    CALL_SERVICE
        .events
        .publish(DomainEventType::GroupcallCreated, &groupcall);

    if let Some(parent_id) = &request.master_groupcall_id {
        CALL_SERVICE
            .db
            .groupcall_add_groupcall_id(parent_id, &id)
            .await?;
    }

    let timeout = request.timeout.unwrap_or(DEFAULT_DIAL_TIMEOUT);
    match request.ring_method {
        RingMethod::RingAll => {
            for destination in request.destinations {
                let groupcall = groupcall.clone();
                let source = request.source.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        dial_destination(&groupcall, &source, &destination, timeout)
                            .await
                    {
                        error!(
                            groupcall = %groupcall.id,
                            "groupcall leg failed to dial: {e:#}"
                        );
                    }
                });
            }
        }
        RingMethod::Linear => {
            if let Some(destination) = request.destinations.first() {
                dial_destination(&groupcall, &request.source, destination, timeout)
                    .await?;
                CALL_SERVICE.db.groupcall_increment_dial_index(&id).await?;
            }
        }
    }

    CALL_SERVICE.db.get_groupcall(&id).await
}

/// Originate one leg. The call row exists before the switch is told to
/// dial, so the stasis handler always finds it by the id carried in
/// the application arguments.
async fn dial_destination(
    groupcall: &models::Groupcall,
    source: &Address,
    destination: &Address,
    timeout: u64,
) -> Result<models::Call> {
    let call_id = uuid();
    let channel_id = uuid();

    let call = CALL_SERVICE
        .db
        .create_call(NewCall {
            id: call_id.clone(),
            customer_id: groupcall.customer_id.clone(),
            channel_id: channel_id.clone(),
            bridge_id: None,
            status: CallStatus::Dialing.to_string(),
            direction: Direction::Outgoing.to_string(),
            source: Some(serde_json::to_value(source)?),
            destination: Some(serde_json::to_value(destination)?),
            master_call_id: groupcall.master_call_id.clone(),
            groupcall_id: Some(groupcall.id.clone()),
            mute_direction: MuteDirection::None.to_string(),
            tm_create: Utc::now(),
        })
        .await?;

    let app_args = format!(
        "{}={},{}={},{}={},{}={},{}={}",
        StasisDataKey::Context,
        CONTEXT_CALL_OUTGOING,
        StasisDataKey::Direction,
        Direction::Outgoing,
        StasisDataKey::CustomerId,
        groupcall.customer_id,
        StasisDataKey::CallId,
        call_id,
        "groupcall_id",
        groupcall.id,
    );
    CALL_SERVICE
        .switch
        .create_channel(
            &CALL_SERVICE.config.switch_id,
            tandem_rpc::message::RpcCreateChannel {
                id: channel_id,
                endpoint: destination.endpoint(),
                app: CALL_SERVICE.config.application.clone(),
                app_args,
                caller_id: source.target.clone(),
                timeout,
                variables: HashMap::new(),
            },
        )
        .await?;

    CALL_SERVICE
        .db
        .groupcall_add_call_id(&groupcall.id, &call_id)
        .await?;
    CALL_SERVICE
        .events
        .publish(DomainEventType::CallCreated, &call);
    Ok(call)
}

/// A leg went to Up. The first answer wins under the groupcall lock,
/// everything else either loses the race or, under hangup-others, gets
/// torn down.
pub async fn on_call_answered(
    groupcall_id: &str,
    call: &models::Call,
) -> Result<()> {
    let mutex = groupcall_lock(groupcall_id);
    mutex.lock().await;

    let answered = CALL_SERVICE
        .db
        .groupcall_answer_once(groupcall_id, &call.id, None)
        .await?;

    match answered {
        Some(_) => {
            let groupcall = CALL_SERVICE
                .db
                .update_groupcall_status(
                    groupcall_id,
                    &GroupcallStatus::Answered.to_string(),
                )
                .await?;
            info!(
                groupcall = %groupcall_id,
                call = %call.id,
                "groupcall answered"
            );
            if groupcall.answer_method() == AnswerMethod::HangupOthers {
                hangup_losing_legs(&groupcall, &call.id).await?;
            }
            CALL_SERVICE
                .events
                .publish(DomainEventType::GroupcallUpdated, &groupcall);
            propagate_answer(&groupcall, &call.id).await?;
        }
        None => {
            // lost the race; under hangup-others this leg goes too
            let groupcall = CALL_SERVICE.db.get_groupcall(groupcall_id).await?;
            if groupcall.answer_method() == AnswerMethod::HangupOthers
                && groupcall.answer_call_id.as_deref() != Some(&call.id)
            {
                Channel::new(&call.channel_id)
                    .hangup("answered_elsewhere")
                    .await?;
            }
        }
    }
    Ok(())
}

/// A leg ended. Decrement the live counter, advance a linear dial if
/// destinations remain, and retire the groupcall once nothing is live.
pub async fn on_call_ended(
    groupcall_id: &str,
    call: &models::Call,
) -> Result<()> {
    let mutex = groupcall_lock(groupcall_id);
    mutex.lock().await;

    let groupcall = CALL_SERVICE
        .db
        .groupcall_decrease_call_count(groupcall_id)
        .await?;

    if groupcall.answer_call_id.is_none()
        && groupcall.ring_method() == RingMethod::Linear
        && groupcall.call_count == 0
    {
        if let Some(destination) = next_destination(&groupcall) {
            let source: Address = groupcall
                .source
                .as_ref()
                .and_then(|value| serde_json::from_value(value.clone()).ok())
                .unwrap_or_else(|| Address {
                    address_type: "".to_string(),
                    target: "".to_string(),
                    target_name: "".to_string(),
                });
            info!(
                groupcall = %groupcall_id,
                dial_index = groupcall.dial_index,
                "linear groupcall advancing to next destination"
            );
            dial_destination(
                &groupcall,
                &source,
                &destination,
                DEFAULT_DIAL_TIMEOUT,
            )
            .await?;
            CALL_SERVICE
                .db
                .groupcall_increment_dial_index(groupcall_id)
                .await?;
            return Ok(());
        }
    }

    if is_idle(&groupcall) {
        info!(
            groupcall = %groupcall_id,
            last_call = %call.id,
            "groupcall has nothing live left"
        );
        finalize(groupcall).await?;
    }
    Ok(())
}

/// Nothing live left on this groupcall, calls or child groupcalls.
pub fn is_idle(groupcall: &models::Groupcall) -> bool {
    groupcall.call_count == 0 && groupcall.groupcall_count == 0
}

async fn hangup_losing_legs(
    groupcall: &models::Groupcall,
    winner: &str,
) -> Result<()> {
    for losing_call_id in losing_call_ids(groupcall, winner) {
        if let Ok(losing_call) = CALL_SERVICE.db.get_call(&losing_call_id).await
        {
            if losing_call.is_ended() {
                continue;
            }
            Channel::new(&losing_call.channel_id)
                .hangup("answered_elsewhere")
                .await?;
        }
    }
    Ok(())
}

/// Claim the answer on each ancestor in turn, so a leg answering deep
/// in a nested groupcall settles the whole chain. Stops at the first
/// ancestor that was already claimed.
async fn propagate_answer(
    groupcall: &models::Groupcall,
    answer_call_id: &str,
) -> Result<()> {
    let mut child_id = groupcall.id.clone();
    let mut next = groupcall.master_groupcall_id.clone();
    while let Some(parent_id) = next {
        let mutex = groupcall_lock(&parent_id);
        mutex.lock().await;
        let claimed = CALL_SERVICE
            .db
            .groupcall_answer_once(&parent_id, answer_call_id, Some(child_id))
            .await?;
        if claimed.is_none() {
            return Ok(());
        }
        let parent = CALL_SERVICE
            .db
            .update_groupcall_status(
                &parent_id,
                &GroupcallStatus::Answered.to_string(),
            )
            .await?;
        info!(
            groupcall = %parent_id,
            call = %answer_call_id,
            "groupcall answered through a child groupcall"
        );
        if parent.answer_method() == AnswerMethod::HangupOthers {
            hangup_losing_legs(&parent, answer_call_id).await?;
        }
        CALL_SERVICE
            .events
            .publish(DomainEventType::GroupcallUpdated, &parent);
        child_id = parent_id;
        next = parent.master_groupcall_id;
    }
    Ok(())
}

/// Retire a finished groupcall, then walk up the master chain and
/// retire each parent that this leaves with nothing live either.
async fn finalize(groupcall: models::Groupcall) -> Result<()> {
    let mut current = groupcall;
    loop {
        let answered = current.answer_call_id.is_some()
            || current.answer_groupcall_id.is_some();
        let status = if answered {
            GroupcallStatus::Answered
        } else {
            GroupcallStatus::Hangup
        };
        CALL_SERVICE
            .db
            .update_groupcall_status(&current.id, &status.to_string())
            .await?;
        let deleted = CALL_SERVICE.db.delete_groupcall(&current.id).await?;
        info!(
            groupcall = %deleted.id,
            status = %deleted.status,
            "groupcall finished"
        );
        CALL_SERVICE
            .events
            .publish(DomainEventType::GroupcallDeleted, &deleted);

        let parent_id = match deleted.master_groupcall_id {
            Some(parent_id) => parent_id,
            None => return Ok(()),
        };
        let mutex = groupcall_lock(&parent_id);
        mutex.lock().await;
        let parent = CALL_SERVICE
            .db
            .groupcall_decrease_groupcall_count(&parent_id)
            .await?;
        if !is_idle(&parent) {
            return Ok(());
        }
        current = parent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_db::models::Groupcall;

    fn groupcall_with(
        call_ids: Vec<&str>,
        destinations: Vec<Address>,
        dial_index: i64,
    ) -> Groupcall {
        let call_count = call_ids.len() as i64;
        Groupcall {
            id: "g1".to_string(),
            customer_id: "cust1".to_string(),
            status: GroupcallStatus::Progressing.to_string(),
            source: None,
            destinations: Some(json!(destinations
                .iter()
                .map(|d| serde_json::to_value(d).unwrap())
                .collect::<Vec<_>>())),
            master_call_id: None,
            master_groupcall_id: None,
            ring_method: RingMethod::Linear.to_string(),
            answer_method: AnswerMethod::HangupOthers.to_string(),
            answer_call_id: None,
            answer_groupcall_id: None,
            call_ids: Some(json!(call_ids)),
            groupcall_ids: Some(json!([])),
            call_count,
            groupcall_count: 0,
            dial_index,
            tm_create: Utc::now(),
            tm_update: None,
            tm_delete: None,
        }
    }

    #[test]
    fn losing_legs_exclude_the_winner() {
        let groupcall = groupcall_with(vec!["c1", "c2", "c3"], vec![], 0);
        assert_eq!(
            losing_call_ids(&groupcall, "c2"),
            vec!["c1".to_string(), "c3".to_string()]
        );
    }

    #[test]
    fn linear_advance_stops_at_the_end() {
        let destinations = vec![
            Address::parse("tel:+15550001111").unwrap(),
            Address::parse("tel:+15550002222").unwrap(),
        ];
        let groupcall = groupcall_with(vec![], destinations.clone(), 1);
        assert_eq!(next_destination(&groupcall), Some(destinations[1].clone()));

        let exhausted = groupcall_with(vec![], destinations, 2);
        assert_eq!(next_destination(&exhausted), None);
    }

    #[test]
    fn live_child_groupcalls_keep_the_parent_open() {
        let mut groupcall = groupcall_with(vec![], vec![], 0);
        assert!(is_idle(&groupcall));

        groupcall.groupcall_count = 1;
        assert!(!is_idle(&groupcall));

        groupcall.groupcall_count = 0;
        groupcall.call_count = 1;
        assert!(!is_idle(&groupcall));
    }
}
