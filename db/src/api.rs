use super::models::*;
use super::schema::*;
use crate::message::DomainError;
use anyhow::{anyhow, Error, Result};
use chrono::{DateTime, Utc};
use diesel::dsl::sql;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sql_types::{BigInt, Jsonb, Nullable, Text, Timestamptz};
use diesel::PgConnection;
use lazy_static::lazy_static;
use serde::{de, Serialize};
use serde_json::Value;
use std::fs;
use tandem_redis::REDIS;
use tokio::task::spawn_blocking;
use tracing::warn;

const CACHE_EXPIRE: u64 = 86400;

lazy_static! {
    pub static ref DB: Database = Database::new_tandem().unwrap();
}

#[derive(serde::Deserialize)]
pub struct Config {
    pub db: String,
}

#[derive(Clone)]
pub struct Database {
    pub pool: Pool<ConnectionManager<PgConnection>>,
}

fn db_error(entity: &'static str, e: diesel::result::Error) -> Error {
    match e {
        diesel::result::Error::NotFound => DomainError::NotFound(entity).into(),
        e => anyhow!(e),
    }
}

impl Database {
    pub fn new(database_url: &str) -> Result<Database, Error> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder()
            .connection_timeout(std::time::Duration::from_secs(5))
            .build(manager)?;
        Ok(Database { pool })
    }

    pub fn new_tandem() -> Result<Database, Error> {
        let contents = fs::read_to_string("/etc/tandem/tandem.conf")?;
        let config: Config = toml::from_str(&contents)?;
        Self::new(&config.db)
    }

    pub async fn get_cache<T: de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Option<Option<T>> {
        let result: String = REDIS.get(key).await.ok()?;
        if result == "None" {
            return Some(None);
        }
        let o = serde_json::from_str::<T>(&result).ok()?;
        Some(Some(o))
    }

    pub async fn put_cache<T: Serialize>(&self, key: &str, o: Option<&T>) {
        if let Some(o) = o {
            if let Ok(result) = serde_json::to_string(o) {
                if let Err(e) = REDIS.setex(key, CACHE_EXPIRE, &result).await {
                    warn!(key, "cache refresh failed {e}");
                }
            }
        } else if let Err(e) = REDIS.setex(key, CACHE_EXPIRE, "None").await {
            warn!(key, "cache refresh failed {e}");
        }
    }

    /// Refresh the cache from a row that came back from the database.
    /// The cache is never written from in-memory mutated structs, only
    /// from what was actually persisted.
    async fn refresh_cache<T: CacheKey + Serialize>(&self, o: &T) {
        for key in o.cache_keys() {
            self.put_cache(&key, Some(o)).await;
        }
    }

    // channels

    /// Channel creation is driven by switch events, which arrive at
    /// least once. A redelivered create finds the existing row instead
    /// of failing.
    pub async fn create_channel(&self, new: NewChannel) -> Result<Channel> {
        let pool = self.pool.clone();
        let channel = spawn_blocking(move || -> Result<Channel> {
            let db_conn = pool.get()?;
            let inserted = diesel::insert_into(channels::table)
                .values(&new)
                .on_conflict(channels::id)
                .do_nothing()
                .get_result::<Channel>(&db_conn)
                .optional()
                .map_err(|e| anyhow!(e))?;
            match inserted {
                Some(channel) => Ok(channel),
                None => channels::table
                    .filter(channels::id.eq(&new.id))
                    .first::<Channel>(&db_conn)
                    .map_err(|e| db_error("channel", e)),
            }
        })
        .await??
        .normalize();
        self.refresh_cache(&channel).await;
        Ok(channel)
    }

    pub async fn get_channel(&self, id: &str) -> Result<Channel> {
        let key = format!("tandem:cache:channel:{}", id);
        if let Some(Some(channel)) = self.get_cache::<Channel>(&key).await {
            return Ok(channel);
        }

        let pool = self.pool.clone();
        let id = id.to_string();
        let channel = spawn_blocking(move || -> Result<Option<Channel>> {
            let db_conn = pool.get()?;
            channels::table
                .filter(channels::id.eq(&id))
                .first::<Channel>(&db_conn)
                .optional()
                .map_err(|e| anyhow!(e))
        })
        .await??
        .ok_or(DomainError::NotFound("channel"))?
        .normalize();
        self.put_cache(&key, Some(&channel)).await;
        Ok(channel)
    }

    pub async fn list_channels(
        &self,
        customer_id: &str,
        token: Option<DateTime<Utc>>,
        size: i64,
    ) -> Result<Vec<Channel>> {
        let token = token.unwrap_or_else(Utc::now);
        let pool = self.pool.clone();
        let customer_id = customer_id.to_string();
        let result = spawn_blocking(move || -> Result<Vec<Channel>> {
            let db_conn = pool.get()?;
            channels::table
                .filter(channels::customer_id.eq(&customer_id))
                .filter(channels::tm_create.lt(token))
                .order_by(channels::tm_create.desc())
                .limit(size)
                .load::<Channel>(&db_conn)
                .map_err(|e| anyhow!(e))
        })
        .await??;
        Ok(result.into_iter().map(|c| c.normalize()).collect())
    }

    /// Stasis name, argument bag, resolved type and direction are one
    /// atomic write so no reader sees a half classified channel.
    pub async fn update_channel_stasis(
        &self,
        id: &str,
        stasis_name: &str,
        stasis_data: Value,
        channel_type: ChannelType,
        direction: Direction,
        customer_id: Option<String>,
    ) -> Result<Channel> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let stasis_name = stasis_name.to_string();
        let channel = spawn_blocking(move || -> Result<Channel> {
            let db_conn = pool.get()?;
            let statement =
                diesel::update(channels::table.filter(channels::id.eq(&id)));
            match customer_id {
                Some(customer_id) => statement
                    .set((
                        channels::customer_id.eq(customer_id),
                        channels::stasis_name.eq(Some(stasis_name)),
                        channels::stasis_data.eq(Some(stasis_data)),
                        channels::channel_type.eq(channel_type.to_string()),
                        channels::direction.eq(direction.to_string()),
                        channels::tm_update.eq(Some(Utc::now())),
                    ))
                    .get_result::<Channel>(&db_conn),
                None => statement
                    .set((
                        channels::stasis_name.eq(Some(stasis_name)),
                        channels::stasis_data.eq(Some(stasis_data)),
                        channels::channel_type.eq(channel_type.to_string()),
                        channels::direction.eq(direction.to_string()),
                        channels::tm_update.eq(Some(Utc::now())),
                    ))
                    .get_result::<Channel>(&db_conn),
            }
            .map_err(|e| db_error("channel", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&channel).await;
        Ok(channel)
    }

    pub async fn update_channel_state(
        &self,
        id: &str,
        state: &str,
    ) -> Result<Channel> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let state = state.to_string();
        let channel = spawn_blocking(move || -> Result<Channel> {
            let db_conn = pool.get()?;
            diesel::update(channels::table.filter(channels::id.eq(&id)))
                .set((
                    channels::state.eq(&state),
                    channels::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Channel>(&db_conn)
                .map_err(|e| db_error("channel", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&channel).await;
        Ok(channel)
    }

    pub async fn update_channel_answered(
        &self,
        id: &str,
        state: &str,
    ) -> Result<Channel> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let state = state.to_string();
        let channel = spawn_blocking(move || -> Result<Channel> {
            let db_conn = pool.get()?;
            diesel::update(channels::table.filter(channels::id.eq(&id)))
                .set((
                    channels::state.eq(&state),
                    channels::tm_answer.eq(Some(Utc::now())),
                    channels::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Channel>(&db_conn)
                .map_err(|e| db_error("channel", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&channel).await;
        Ok(channel)
    }

    pub async fn update_channel_ringing(
        &self,
        id: &str,
        state: &str,
    ) -> Result<Channel> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let state = state.to_string();
        let channel = spawn_blocking(move || -> Result<Channel> {
            let db_conn = pool.get()?;
            diesel::update(channels::table.filter(channels::id.eq(&id)))
                .set((
                    channels::state.eq(&state),
                    channels::tm_ringing.eq(Some(Utc::now())),
                    channels::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Channel>(&db_conn)
                .map_err(|e| db_error("channel", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&channel).await;
        Ok(channel)
    }

    /// SIP metadata write. The PAI and privacy values live in the data
    /// bag, call id and transport have their own columns; one statement
    /// covers all of them.
    pub async fn set_channel_sip_info(
        &self,
        id: &str,
        sip_call_id: &str,
        sip_transport: &str,
        sip_pai: &str,
        sip_privacy: &str,
    ) -> Result<Channel> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let sip_call_id = sip_call_id.to_string();
        let sip_transport = sip_transport.to_string();
        let patch = serde_json::json!({
            "sip_pai": sip_pai,
            "sip_privacy": sip_privacy,
        });
        let channel = spawn_blocking(move || -> Result<Channel> {
            let db_conn = pool.get()?;
            diesel::update(channels::table.filter(channels::id.eq(&id)))
                .set((
                    channels::sip_call_id.eq(Some(sip_call_id)),
                    channels::sip_transport.eq(Some(sip_transport)),
                    channels::data.eq(sql::<Nullable<Jsonb>>(
                        "coalesce(data, '{}'::jsonb) || ",
                    )
                    .bind::<Jsonb, _>(patch)),
                    channels::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Channel>(&db_conn)
                .map_err(|e| db_error("channel", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&channel).await;
        Ok(channel)
    }

    pub async fn update_channel_data(
        &self,
        id: &str,
        patch: Value,
    ) -> Result<Channel> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let channel = spawn_blocking(move || -> Result<Channel> {
            let db_conn = pool.get()?;
            diesel::update(channels::table.filter(channels::id.eq(&id)))
                .set((
                    channels::data.eq(sql::<Nullable<Jsonb>>(
                        "coalesce(data, '{}'::jsonb) || ",
                    )
                    .bind::<Jsonb, _>(patch)),
                    channels::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Channel>(&db_conn)
                .map_err(|e| db_error("channel", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&channel).await;
        Ok(channel)
    }

    pub async fn update_channel_playback(
        &self,
        id: &str,
        playback_id: Option<String>,
    ) -> Result<Channel> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let channel = spawn_blocking(move || -> Result<Channel> {
            let db_conn = pool.get()?;
            diesel::update(channels::table.filter(channels::id.eq(&id)))
                .set((
                    channels::playback_id.eq(playback_id),
                    channels::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Channel>(&db_conn)
                .map_err(|e| db_error("channel", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&channel).await;
        Ok(channel)
    }

    pub async fn update_channel_mute_direction(
        &self,
        id: &str,
        mute_direction: MuteDirection,
    ) -> Result<Channel> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let mute_direction = mute_direction.to_string();
        let channel = spawn_blocking(move || -> Result<Channel> {
            let db_conn = pool.get()?;
            diesel::update(channels::table.filter(channels::id.eq(&id)))
                .set((
                    channels::mute_direction.eq(&mute_direction),
                    channels::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Channel>(&db_conn)
                .map_err(|e| db_error("channel", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&channel).await;
        Ok(channel)
    }

    pub async fn update_channel_bridge(
        &self,
        id: &str,
        bridge_id: Option<String>,
    ) -> Result<Channel> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let channel = spawn_blocking(move || -> Result<Channel> {
            let db_conn = pool.get()?;
            diesel::update(channels::table.filter(channels::id.eq(&id)))
                .set((
                    channels::bridge_id.eq(bridge_id),
                    channels::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Channel>(&db_conn)
                .map_err(|e| db_error("channel", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&channel).await;
        Ok(channel)
    }

    /// Soft delete: hangup cause, end timestamp and delete timestamp are
    /// set together, exactly once.
    pub async fn delete_channel(
        &self,
        id: &str,
        hangup_cause: &str,
    ) -> Result<Channel> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let hangup_cause = hangup_cause.to_string();
        let channel = spawn_blocking(move || -> Result<Channel> {
            let db_conn = pool.get()?;
            let now = Utc::now();
            diesel::update(
                channels::table
                    .filter(channels::id.eq(&id))
                    .filter(channels::tm_delete.is_null()),
            )
            .set((
                channels::hangup_cause.eq(Some(hangup_cause)),
                channels::tm_end.eq(Some(now)),
                channels::tm_delete.eq(Some(now)),
                channels::tm_update.eq(Some(now)),
            ))
            .get_result::<Channel>(&db_conn)
            .map_err(|e| db_error("channel", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&channel).await;
        Ok(channel)
    }

    // calls

    pub async fn create_call(&self, new: NewCall) -> Result<Call> {
        let pool = self.pool.clone();
        let call = spawn_blocking(move || -> Result<Call> {
            let db_conn = pool.get()?;
            diesel::insert_into(calls::table)
                .values(&new)
                .get_result::<Call>(&db_conn)
                .map_err(|e| anyhow!(e))
        })
        .await??
        .normalize();
        self.refresh_cache(&call).await;
        Ok(call)
    }

    pub async fn get_call(&self, id: &str) -> Result<Call> {
        let key = format!("tandem:cache:call:{}", id);
        if let Some(Some(call)) = self.get_cache::<Call>(&key).await {
            return Ok(call);
        }

        let pool = self.pool.clone();
        let id = id.to_string();
        let call = spawn_blocking(move || -> Result<Option<Call>> {
            let db_conn = pool.get()?;
            calls::table
                .filter(calls::id.eq(&id))
                .first::<Call>(&db_conn)
                .optional()
                .map_err(|e| anyhow!(e))
        })
        .await??
        .ok_or(DomainError::NotFound("call"))?
        .normalize();
        self.put_cache(&key, Some(&call)).await;
        Ok(call)
    }

    pub async fn list_calls(
        &self,
        customer_id: &str,
        token: Option<DateTime<Utc>>,
        size: i64,
    ) -> Result<Vec<Call>> {
        let token = token.unwrap_or_else(Utc::now);
        let pool = self.pool.clone();
        let customer_id = customer_id.to_string();
        let result = spawn_blocking(move || -> Result<Vec<Call>> {
            let db_conn = pool.get()?;
            calls::table
                .filter(calls::customer_id.eq(&customer_id))
                .filter(calls::tm_create.lt(token))
                .order_by(calls::tm_create.desc())
                .limit(size)
                .load::<Call>(&db_conn)
                .map_err(|e| anyhow!(e))
        })
        .await??;
        Ok(result.into_iter().map(|c| c.normalize()).collect())
    }

    pub async fn update_call_status(
        &self,
        id: &str,
        status: CallStatus,
    ) -> Result<Call> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let call = spawn_blocking(move || -> Result<Call> {
            let db_conn = pool.get()?;
            let now = Utc::now();
            let statement = diesel::update(calls::table.filter(calls::id.eq(&id)));
            let call = match status {
                CallStatus::Progressing => statement
                    .set((
                        calls::status.eq(status.to_string()),
                        calls::tm_progressing.eq(Some(now)),
                        calls::tm_update.eq(Some(now)),
                    ))
                    .get_result::<Call>(&db_conn),
                CallStatus::Ringing => statement
                    .set((
                        calls::status.eq(status.to_string()),
                        calls::tm_ringing.eq(Some(now)),
                        calls::tm_update.eq(Some(now)),
                    ))
                    .get_result::<Call>(&db_conn),
                CallStatus::Hangup => statement
                    .set((
                        calls::status.eq(status.to_string()),
                        calls::tm_hangup.eq(Some(now)),
                        calls::tm_update.eq(Some(now)),
                    ))
                    .get_result::<Call>(&db_conn),
                _ => statement
                    .set((
                        calls::status.eq(status.to_string()),
                        calls::tm_update.eq(Some(now)),
                    ))
                    .get_result::<Call>(&db_conn),
            };
            call.map_err(|e| db_error("call", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&call).await;
        Ok(call)
    }

    /// Route failover moves a call to a fresh channel and bridge in one
    /// statement so concurrent readers never observe a stale pair.
    pub async fn update_call_channel_and_bridge(
        &self,
        id: &str,
        channel_id: &str,
        bridge_id: Option<String>,
    ) -> Result<Call> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let channel_id = channel_id.to_string();
        let call = spawn_blocking(move || -> Result<Call> {
            let db_conn = pool.get()?;
            diesel::update(calls::table.filter(calls::id.eq(&id)))
                .set((
                    calls::channel_id.eq(&channel_id),
                    calls::bridge_id.eq(bridge_id),
                    calls::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Call>(&db_conn)
                .map_err(|e| db_error("call", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&call).await;
        Ok(call)
    }

    pub async fn call_append_chained_call_id(
        &self,
        id: &str,
        chained_call_id: &str,
    ) -> Result<Call> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let chained_call_id = chained_call_id.to_string();
        let call = spawn_blocking(move || -> Result<Call> {
            let db_conn = pool.get()?;
            diesel::update(calls::table.filter(calls::id.eq(&id)))
                .set((
                    calls::chained_call_ids.eq(sql::<Nullable<Jsonb>>(
                        "(coalesce(chained_call_ids, '[]'::jsonb) - ",
                    )
                    .bind::<Text, _>(chained_call_id.clone())
                    .sql(") || jsonb_build_array(")
                    .bind::<Text, _>(chained_call_id.clone())
                    .sql("::text)")),
                    calls::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Call>(&db_conn)
                .map_err(|e| db_error("call", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&call).await;
        Ok(call)
    }

    pub async fn update_call_recording(
        &self,
        id: &str,
        recording_id: Option<String>,
    ) -> Result<Call> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let call = spawn_blocking(move || -> Result<Call> {
            let db_conn = pool.get()?;
            match recording_id {
                Some(recording_id) => {
                    diesel::update(calls::table.filter(calls::id.eq(&id)))
                        .set((
                            calls::recording_id.eq(Some(recording_id.clone())),
                            calls::recording_ids.eq(sql::<Nullable<Jsonb>>(
                                "(coalesce(recording_ids, '[]'::jsonb) - ",
                            )
                            .bind::<Text, _>(recording_id.clone())
                            .sql(") || jsonb_build_array(")
                            .bind::<Text, _>(recording_id)
                            .sql("::text)")),
                            calls::tm_update.eq(Some(Utc::now())),
                        ))
                        .get_result::<Call>(&db_conn)
                }
                None => diesel::update(calls::table.filter(calls::id.eq(&id)))
                    .set((
                        calls::recording_id.eq(None::<String>),
                        calls::tm_update.eq(Some(Utc::now())),
                    ))
                    .get_result::<Call>(&db_conn),
            }
            .map_err(|e| db_error("call", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&call).await;
        Ok(call)
    }

    pub async fn update_call_external_media(
        &self,
        id: &str,
        external_media_id: Option<String>,
    ) -> Result<Call> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let call = spawn_blocking(move || -> Result<Call> {
            let db_conn = pool.get()?;
            diesel::update(calls::table.filter(calls::id.eq(&id)))
                .set((
                    calls::external_media_id.eq(external_media_id),
                    calls::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Call>(&db_conn)
                .map_err(|e| db_error("call", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&call).await;
        Ok(call)
    }

    pub async fn update_call_confbridge(
        &self,
        id: &str,
        confbridge_id: Option<String>,
    ) -> Result<Call> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let call = spawn_blocking(move || -> Result<Call> {
            let db_conn = pool.get()?;
            diesel::update(calls::table.filter(calls::id.eq(&id)))
                .set((
                    calls::confbridge_id.eq(confbridge_id),
                    calls::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Call>(&db_conn)
                .map_err(|e| db_error("call", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&call).await;
        Ok(call)
    }

    pub async fn update_call_mute_direction(
        &self,
        id: &str,
        mute_direction: MuteDirection,
    ) -> Result<Call> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let mute_direction = mute_direction.to_string();
        let call = spawn_blocking(move || -> Result<Call> {
            let db_conn = pool.get()?;
            diesel::update(calls::table.filter(calls::id.eq(&id)))
                .set((
                    calls::mute_direction.eq(&mute_direction),
                    calls::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Call>(&db_conn)
                .map_err(|e| db_error("call", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&call).await;
        Ok(call)
    }

    pub async fn update_call_action(
        &self,
        id: &str,
        action_id: Option<String>,
    ) -> Result<Call> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let call = spawn_blocking(move || -> Result<Call> {
            let db_conn = pool.get()?;
            diesel::update(calls::table.filter(calls::id.eq(&id)))
                .set((
                    calls::action_id.eq(action_id),
                    calls::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Call>(&db_conn)
                .map_err(|e| db_error("call", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&call).await;
        Ok(call)
    }

    pub async fn update_call_dialroute(
        &self,
        id: &str,
        dialroute_id: &str,
        dialroute: Value,
    ) -> Result<Call> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let dialroute_id = dialroute_id.to_string();
        let call = spawn_blocking(move || -> Result<Call> {
            let db_conn = pool.get()?;
            diesel::update(calls::table.filter(calls::id.eq(&id)))
                .set((
                    calls::dialroute_id.eq(Some(dialroute_id)),
                    calls::dialroutes.eq(sql::<Nullable<Jsonb>>(
                        "coalesce(dialroutes, '[]'::jsonb) || jsonb_build_array(",
                    )
                    .bind::<Jsonb, _>(dialroute)
                    .sql(")")),
                    calls::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Call>(&db_conn)
                .map_err(|e| db_error("call", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&call).await;
        Ok(call)
    }

    pub async fn delete_call(
        &self,
        id: &str,
        hangup_by: &str,
        hangup_reason: &str,
    ) -> Result<Call> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let hangup_by = hangup_by.to_string();
        let hangup_reason = hangup_reason.to_string();
        let call = spawn_blocking(move || -> Result<Call> {
            let db_conn = pool.get()?;
            let now = Utc::now();
            diesel::update(
                calls::table
                    .filter(calls::id.eq(&id))
                    .filter(calls::tm_delete.is_null()),
            )
            .set((
                calls::status.eq(CallStatus::Hangup.to_string()),
                calls::hangup_by.eq(Some(hangup_by)),
                calls::hangup_reason.eq(Some(hangup_reason)),
                calls::tm_hangup.eq(Some(now)),
                calls::tm_delete.eq(Some(now)),
                calls::tm_update.eq(Some(now)),
            ))
            .get_result::<Call>(&db_conn)
            .map_err(|e| db_error("call", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&call).await;
        Ok(call)
    }

    // bridges

    pub async fn create_bridge(&self, new: NewBridge) -> Result<Bridge> {
        let pool = self.pool.clone();
        let bridge = spawn_blocking(move || -> Result<Bridge> {
            let db_conn = pool.get()?;
            diesel::insert_into(bridges::table)
                .values(&new)
                .get_result::<Bridge>(&db_conn)
                .map_err(|e| anyhow!(e))
        })
        .await??
        .normalize();
        self.refresh_cache(&bridge).await;
        Ok(bridge)
    }

    pub async fn get_bridge(&self, id: &str) -> Result<Bridge> {
        let key = format!("tandem:cache:bridge:{}", id);
        if let Some(Some(bridge)) = self.get_cache::<Bridge>(&key).await {
            return Ok(bridge);
        }

        let pool = self.pool.clone();
        let id = id.to_string();
        let bridge = spawn_blocking(move || -> Result<Option<Bridge>> {
            let db_conn = pool.get()?;
            bridges::table
                .filter(bridges::id.eq(&id))
                .first::<Bridge>(&db_conn)
                .optional()
                .map_err(|e| anyhow!(e))
        })
        .await??
        .ok_or(DomainError::NotFound("bridge"))?
        .normalize();
        self.put_cache(&key, Some(&bridge)).await;
        Ok(bridge)
    }

    pub async fn list_bridges(
        &self,
        customer_id: &str,
        token: Option<DateTime<Utc>>,
        size: i64,
    ) -> Result<Vec<Bridge>> {
        let token = token.unwrap_or_else(Utc::now);
        let pool = self.pool.clone();
        let customer_id = customer_id.to_string();
        let result = spawn_blocking(move || -> Result<Vec<Bridge>> {
            let db_conn = pool.get()?;
            bridges::table
                .filter(bridges::customer_id.eq(&customer_id))
                .filter(bridges::tm_create.lt(token))
                .order_by(bridges::tm_create.desc())
                .limit(size)
                .load::<Bridge>(&db_conn)
                .map_err(|e| anyhow!(e))
        })
        .await??;
        Ok(result.into_iter().map(|b| b.normalize()).collect())
    }

    /// Membership is keyed by value: the id is removed before the
    /// append, so delivering the same join twice leaves one entry.
    pub async fn bridge_add_channel(
        &self,
        id: &str,
        channel_id: &str,
    ) -> Result<Bridge> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let channel_id = channel_id.to_string();
        let bridge = spawn_blocking(move || -> Result<Bridge> {
            let db_conn = pool.get()?;
            diesel::update(bridges::table.filter(bridges::id.eq(&id)))
                .set((
                    bridges::channel_ids.eq(sql::<Nullable<Jsonb>>(
                        "(coalesce(channel_ids, '[]'::jsonb) - ",
                    )
                    .bind::<Text, _>(channel_id.clone())
                    .sql(") || jsonb_build_array(")
                    .bind::<Text, _>(channel_id.clone())
                    .sql("::text)")),
                    bridges::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Bridge>(&db_conn)
                .map_err(|e| db_error("bridge", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&bridge).await;
        Ok(bridge)
    }

    pub async fn bridge_remove_channel(
        &self,
        id: &str,
        channel_id: &str,
    ) -> Result<Bridge> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let channel_id = channel_id.to_string();
        let bridge = spawn_blocking(move || -> Result<Bridge> {
            let db_conn = pool.get()?;
            diesel::update(bridges::table.filter(bridges::id.eq(&id)))
                .set((
                    bridges::channel_ids.eq(sql::<Nullable<Jsonb>>(
                        "coalesce(channel_ids, '[]'::jsonb) - ",
                    )
                    .bind::<Text, _>(channel_id.clone())),
                    bridges::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Bridge>(&db_conn)
                .map_err(|e| db_error("bridge", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&bridge).await;
        Ok(bridge)
    }

    pub async fn delete_bridge(&self, id: &str) -> Result<Bridge> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let bridge = spawn_blocking(move || -> Result<Bridge> {
            let db_conn = pool.get()?;
            let now = Utc::now();
            diesel::update(
                bridges::table
                    .filter(bridges::id.eq(&id))
                    .filter(bridges::tm_delete.is_null()),
            )
            .set((
                bridges::tm_delete.eq(Some(now)),
                bridges::tm_update.eq(Some(now)),
            ))
            .get_result::<Bridge>(&db_conn)
            .map_err(|e| db_error("bridge", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&bridge).await;
        Ok(bridge)
    }

    // confbridges

    pub async fn create_confbridge(
        &self,
        new: NewConfbridge,
    ) -> Result<Confbridge> {
        let pool = self.pool.clone();
        let confbridge = spawn_blocking(move || -> Result<Confbridge> {
            let db_conn = pool.get()?;
            diesel::insert_into(confbridges::table)
                .values(&new)
                .get_result::<Confbridge>(&db_conn)
                .map_err(|e| anyhow!(e))
        })
        .await??
        .normalize();
        self.refresh_cache(&confbridge).await;
        Ok(confbridge)
    }

    pub async fn get_confbridge(&self, id: &str) -> Result<Confbridge> {
        let key = format!("tandem:cache:confbridge:{}", id);
        if let Some(Some(confbridge)) = self.get_cache::<Confbridge>(&key).await {
            return Ok(confbridge);
        }

        let pool = self.pool.clone();
        let id = id.to_string();
        let confbridge = spawn_blocking(move || -> Result<Option<Confbridge>> {
            let db_conn = pool.get()?;
            confbridges::table
                .filter(confbridges::id.eq(&id))
                .first::<Confbridge>(&db_conn)
                .optional()
                .map_err(|e| anyhow!(e))
        })
        .await??
        .ok_or(DomainError::NotFound("confbridge"))?
        .normalize();
        self.put_cache(&key, Some(&confbridge)).await;
        Ok(confbridge)
    }

    pub async fn list_confbridges(
        &self,
        customer_id: &str,
        token: Option<DateTime<Utc>>,
        size: i64,
    ) -> Result<Vec<Confbridge>> {
        let token = token.unwrap_or_else(Utc::now);
        let pool = self.pool.clone();
        let customer_id = customer_id.to_string();
        let result = spawn_blocking(move || -> Result<Vec<Confbridge>> {
            let db_conn = pool.get()?;
            confbridges::table
                .filter(confbridges::customer_id.eq(&customer_id))
                .filter(confbridges::tm_create.lt(token))
                .order_by(confbridges::tm_create.desc())
                .limit(size)
                .load::<Confbridge>(&db_conn)
                .map_err(|e| anyhow!(e))
        })
        .await??;
        Ok(result.into_iter().map(|c| c.normalize()).collect())
    }

    /// A member join touches the confbridge channel to call lookup and
    /// the bridge member list inside one transaction; neither is ever
    /// left orphaned. Caches are refreshed only after the commit.
    pub async fn confbridge_join(
        &self,
        id: &str,
        bridge_id: &str,
        channel_id: &str,
        call_id: &str,
    ) -> Result<(Confbridge, Bridge)> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let bridge_id = bridge_id.to_string();
        let channel_id = channel_id.to_string();
        let call_id = call_id.to_string();
        let (confbridge, bridge) =
            spawn_blocking(move || -> Result<(Confbridge, Bridge)> {
                let db_conn = pool.get()?;
                let result = db_conn
                    .transaction::<(Confbridge, Bridge), diesel::result::Error, _>(
                        || {
                            let confbridge = diesel::update(
                                confbridges::table
                                    .filter(confbridges::id.eq(&id)),
                            )
                            .set((
                                confbridges::channel_call_ids.eq(sql::<
                                    Nullable<Jsonb>,
                                >(
                                    "coalesce(channel_call_ids, '{}'::jsonb) || jsonb_build_object(",
                                )
                                .bind::<Text, _>(channel_id.clone())
                                .sql("::text, ")
                                .bind::<Text, _>(call_id.clone())
                                .sql("::text)")),
                                confbridges::tm_update.eq(Some(Utc::now())),
                            ))
                            .get_result::<Confbridge>(&db_conn)?;

                            let bridge = diesel::update(
                                bridges::table.filter(bridges::id.eq(&bridge_id)),
                            )
                            .set((
                                bridges::channel_ids.eq(sql::<Nullable<Jsonb>>(
                                    "(coalesce(channel_ids, '[]'::jsonb) - ",
                                )
                                .bind::<Text, _>(channel_id.clone())
                                .sql(") || jsonb_build_array(")
                                .bind::<Text, _>(channel_id.clone())
                                .sql("::text)")),
                                bridges::tm_update.eq(Some(Utc::now())),
                            ))
                            .get_result::<Bridge>(&db_conn)?;

                            Ok((confbridge, bridge))
                        },
                    )
                    .map_err(|e| db_error("confbridge", e))?;
                Ok(result)
            })
            .await??;
        let confbridge = confbridge.normalize();
        let bridge = bridge.normalize();
        self.refresh_cache(&confbridge).await;
        self.refresh_cache(&bridge).await;
        Ok((confbridge, bridge))
    }

    pub async fn confbridge_leave(
        &self,
        id: &str,
        bridge_id: &str,
        channel_id: &str,
    ) -> Result<(Confbridge, Bridge)> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let bridge_id = bridge_id.to_string();
        let channel_id = channel_id.to_string();
        let (confbridge, bridge) =
            spawn_blocking(move || -> Result<(Confbridge, Bridge)> {
                let db_conn = pool.get()?;
                let result = db_conn
                    .transaction::<(Confbridge, Bridge), diesel::result::Error, _>(
                        || {
                            let confbridge = diesel::update(
                                confbridges::table
                                    .filter(confbridges::id.eq(&id)),
                            )
                            .set((
                                confbridges::channel_call_ids.eq(sql::<
                                    Nullable<Jsonb>,
                                >(
                                    "coalesce(channel_call_ids, '{}'::jsonb) - ",
                                )
                                .bind::<Text, _>(channel_id.clone())),
                                confbridges::tm_update.eq(Some(Utc::now())),
                            ))
                            .get_result::<Confbridge>(&db_conn)?;

                            let bridge = diesel::update(
                                bridges::table.filter(bridges::id.eq(&bridge_id)),
                            )
                            .set((
                                bridges::channel_ids.eq(sql::<Nullable<Jsonb>>(
                                    "coalesce(channel_ids, '[]'::jsonb) - ",
                                )
                                .bind::<Text, _>(channel_id.clone())),
                                bridges::tm_update.eq(Some(Utc::now())),
                            ))
                            .get_result::<Bridge>(&db_conn)?;

                            Ok((confbridge, bridge))
                        },
                    )
                    .map_err(|e| db_error("confbridge", e))?;
                Ok(result)
            })
            .await??;
        let confbridge = confbridge.normalize();
        let bridge = bridge.normalize();
        self.refresh_cache(&confbridge).await;
        self.refresh_cache(&bridge).await;
        Ok((confbridge, bridge))
    }

    pub async fn confbridge_add_recording(
        &self,
        id: &str,
        recording_id: &str,
    ) -> Result<Confbridge> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let recording_id = recording_id.to_string();
        let confbridge = spawn_blocking(move || -> Result<Confbridge> {
            let db_conn = pool.get()?;
            diesel::update(confbridges::table.filter(confbridges::id.eq(&id)))
                .set((
                    confbridges::recording_id.eq(Some(recording_id.clone())),
                    confbridges::recording_ids.eq(sql::<Nullable<Jsonb>>(
                        "(coalesce(recording_ids, '[]'::jsonb) - ",
                    )
                    .bind::<Text, _>(recording_id.clone())
                    .sql(") || jsonb_build_array(")
                    .bind::<Text, _>(recording_id)
                    .sql("::text)")),
                    confbridges::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Confbridge>(&db_conn)
                .map_err(|e| db_error("confbridge", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&confbridge).await;
        Ok(confbridge)
    }

    pub async fn update_confbridge_status(
        &self,
        id: &str,
        status: &str,
    ) -> Result<Confbridge> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let status = status.to_string();
        let confbridge = spawn_blocking(move || -> Result<Confbridge> {
            let db_conn = pool.get()?;
            diesel::update(confbridges::table.filter(confbridges::id.eq(&id)))
                .set((
                    confbridges::status.eq(&status),
                    confbridges::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Confbridge>(&db_conn)
                .map_err(|e| db_error("confbridge", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&confbridge).await;
        Ok(confbridge)
    }

    pub async fn update_confbridge_external_media(
        &self,
        id: &str,
        external_media_id: Option<String>,
    ) -> Result<Confbridge> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let confbridge = spawn_blocking(move || -> Result<Confbridge> {
            let db_conn = pool.get()?;
            diesel::update(confbridges::table.filter(confbridges::id.eq(&id)))
                .set((
                    confbridges::external_media_id.eq(external_media_id),
                    confbridges::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Confbridge>(&db_conn)
                .map_err(|e| db_error("confbridge", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&confbridge).await;
        Ok(confbridge)
    }

    pub async fn delete_confbridge(&self, id: &str) -> Result<Confbridge> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let confbridge = spawn_blocking(move || -> Result<Confbridge> {
            let db_conn = pool.get()?;
            let now = Utc::now();
            diesel::update(
                confbridges::table
                    .filter(confbridges::id.eq(&id))
                    .filter(confbridges::tm_delete.is_null()),
            )
            .set((
                confbridges::tm_delete.eq(Some(now)),
                confbridges::tm_update.eq(Some(now)),
            ))
            .get_result::<Confbridge>(&db_conn)
            .map_err(|e| db_error("confbridge", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&confbridge).await;
        Ok(confbridge)
    }

    // groupcalls

    pub async fn create_groupcall(&self, new: NewGroupcall) -> Result<Groupcall> {
        let pool = self.pool.clone();
        let groupcall = spawn_blocking(move || -> Result<Groupcall> {
            let db_conn = pool.get()?;
            diesel::insert_into(groupcalls::table)
                .values(&new)
                .get_result::<Groupcall>(&db_conn)
                .map_err(|e| anyhow!(e))
        })
        .await??
        .normalize();
        self.refresh_cache(&groupcall).await;
        Ok(groupcall)
    }

    pub async fn get_groupcall(&self, id: &str) -> Result<Groupcall> {
        let key = format!("tandem:cache:groupcall:{}", id);
        if let Some(Some(groupcall)) = self.get_cache::<Groupcall>(&key).await {
            return Ok(groupcall);
        }

        let pool = self.pool.clone();
        let id = id.to_string();
        let groupcall = spawn_blocking(move || -> Result<Option<Groupcall>> {
            let db_conn = pool.get()?;
            groupcalls::table
                .filter(groupcalls::id.eq(&id))
                .first::<Groupcall>(&db_conn)
                .optional()
                .map_err(|e| anyhow!(e))
        })
        .await??
        .ok_or(DomainError::NotFound("groupcall"))?
        .normalize();
        self.put_cache(&key, Some(&groupcall)).await;
        Ok(groupcall)
    }

    pub async fn list_groupcalls(
        &self,
        customer_id: &str,
        token: Option<DateTime<Utc>>,
        size: i64,
    ) -> Result<Vec<Groupcall>> {
        let token = token.unwrap_or_else(Utc::now);
        let pool = self.pool.clone();
        let customer_id = customer_id.to_string();
        let result = spawn_blocking(move || -> Result<Vec<Groupcall>> {
            let db_conn = pool.get()?;
            groupcalls::table
                .filter(groupcalls::customer_id.eq(&customer_id))
                .filter(groupcalls::tm_create.lt(token))
                .order_by(groupcalls::tm_create.desc())
                .limit(size)
                .load::<Groupcall>(&db_conn)
                .map_err(|e| anyhow!(e))
        })
        .await??;
        Ok(result.into_iter().map(|g| g.normalize()).collect())
    }

    /// Registering a dialled leg bumps the live counter together with
    /// the id list in one statement.
    pub async fn groupcall_add_call_id(
        &self,
        id: &str,
        call_id: &str,
    ) -> Result<Groupcall> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let call_id = call_id.to_string();
        let groupcall = spawn_blocking(move || -> Result<Groupcall> {
            let db_conn = pool.get()?;
            diesel::update(groupcalls::table.filter(groupcalls::id.eq(&id)))
                .set((
                    groupcalls::call_ids.eq(sql::<Nullable<Jsonb>>(
                        "(coalesce(call_ids, '[]'::jsonb) - ",
                    )
                    .bind::<Text, _>(call_id.clone())
                    .sql(") || jsonb_build_array(")
                    .bind::<Text, _>(call_id.clone())
                    .sql("::text)")),
                    groupcalls::call_count
                        .eq(sql::<BigInt>("call_count + 1")),
                    groupcalls::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Groupcall>(&db_conn)
                .map_err(|e| db_error("groupcall", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&groupcall).await;
        Ok(groupcall)
    }

    pub async fn groupcall_add_groupcall_id(
        &self,
        id: &str,
        groupcall_id: &str,
    ) -> Result<Groupcall> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let groupcall_id = groupcall_id.to_string();
        let groupcall = spawn_blocking(move || -> Result<Groupcall> {
            let db_conn = pool.get()?;
            diesel::update(groupcalls::table.filter(groupcalls::id.eq(&id)))
                .set((
                    groupcalls::groupcall_ids.eq(sql::<Nullable<Jsonb>>(
                        "(coalesce(groupcall_ids, '[]'::jsonb) - ",
                    )
                    .bind::<Text, _>(groupcall_id.clone())
                    .sql(") || jsonb_build_array(")
                    .bind::<Text, _>(groupcall_id.clone())
                    .sql("::text)")),
                    groupcalls::groupcall_count
                        .eq(sql::<BigInt>("groupcall_count + 1")),
                    groupcalls::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Groupcall>(&db_conn)
                .map_err(|e| db_error("groupcall", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&groupcall).await;
        Ok(groupcall)
    }

    /// Counters only ever move down by one atomic statement per
    /// completion event, never by recounting the id lists, so
    /// concurrent completions cannot lose updates.
    pub async fn groupcall_decrease_call_count(
        &self,
        id: &str,
    ) -> Result<Groupcall> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let groupcall = spawn_blocking(move || -> Result<Groupcall> {
            let db_conn = pool.get()?;
            diesel::update(groupcalls::table.filter(groupcalls::id.eq(&id)))
                .set((
                    groupcalls::call_count
                        .eq(sql::<BigInt>("greatest(call_count - 1, 0)")),
                    groupcalls::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Groupcall>(&db_conn)
                .map_err(|e| db_error("groupcall", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&groupcall).await;
        Ok(groupcall)
    }

    pub async fn groupcall_decrease_groupcall_count(
        &self,
        id: &str,
    ) -> Result<Groupcall> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let groupcall = spawn_blocking(move || -> Result<Groupcall> {
            let db_conn = pool.get()?;
            diesel::update(groupcalls::table.filter(groupcalls::id.eq(&id)))
                .set((
                    groupcalls::groupcall_count
                        .eq(sql::<BigInt>("greatest(groupcall_count - 1, 0)")),
                    groupcalls::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Groupcall>(&db_conn)
                .map_err(|e| db_error("groupcall", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&groupcall).await;
        Ok(groupcall)
    }

    pub async fn groupcall_increment_dial_index(
        &self,
        id: &str,
    ) -> Result<Groupcall> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let groupcall = spawn_blocking(move || -> Result<Groupcall> {
            let db_conn = pool.get()?;
            diesel::update(groupcalls::table.filter(groupcalls::id.eq(&id)))
                .set((
                    groupcalls::dial_index
                        .eq(sql::<BigInt>("dial_index + 1")),
                    groupcalls::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Groupcall>(&db_conn)
                .map_err(|e| db_error("groupcall", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&groupcall).await;
        Ok(groupcall)
    }

    /// Lock the groupcall row and record the winning leg, but only if
    /// no other leg has won already. Returns None when someone beat us
    /// to it. Explicit transaction; the cache is refreshed only after
    /// the commit went through.
    pub async fn groupcall_answer_once(
        &self,
        id: &str,
        answer_call_id: &str,
        answer_groupcall_id: Option<String>,
    ) -> Result<Option<Groupcall>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let answer_call_id = answer_call_id.to_string();
        let updated = spawn_blocking(move || -> Result<Option<Groupcall>> {
            let db_conn = pool.get()?;
            db_conn
                .transaction::<Option<Groupcall>, diesel::result::Error, _>(
                    || {
                        let groupcall = groupcalls::table
                            .filter(groupcalls::id.eq(&id))
                            .for_update()
                            .first::<Groupcall>(&db_conn)?;
                        if groupcall.answer_call_id.is_some() {
                            return Ok(None);
                        }
                        let updated = diesel::update(
                            groupcalls::table.filter(groupcalls::id.eq(&id)),
                        )
                        .set((
                            groupcalls::answer_call_id
                                .eq(Some(answer_call_id.clone())),
                            groupcalls::answer_groupcall_id
                                .eq(answer_groupcall_id.clone()),
                            groupcalls::tm_update.eq(Some(Utc::now())),
                        ))
                        .get_result::<Groupcall>(&db_conn)?;
                        Ok(Some(updated))
                    },
                )
                .map_err(|e| db_error("groupcall", e))
        })
        .await??;
        let updated = updated.map(|g| g.normalize());
        if let Some(groupcall) = updated.as_ref() {
            self.refresh_cache(groupcall).await;
        }
        Ok(updated)
    }

    pub async fn update_groupcall_status(
        &self,
        id: &str,
        status: &str,
    ) -> Result<Groupcall> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let status = status.to_string();
        let groupcall = spawn_blocking(move || -> Result<Groupcall> {
            let db_conn = pool.get()?;
            diesel::update(groupcalls::table.filter(groupcalls::id.eq(&id)))
                .set((
                    groupcalls::status.eq(&status),
                    groupcalls::tm_update.eq(Some(Utc::now())),
                ))
                .get_result::<Groupcall>(&db_conn)
                .map_err(|e| db_error("groupcall", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&groupcall).await;
        Ok(groupcall)
    }

    pub async fn delete_groupcall(&self, id: &str) -> Result<Groupcall> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let groupcall = spawn_blocking(move || -> Result<Groupcall> {
            let db_conn = pool.get()?;
            let now = Utc::now();
            diesel::update(
                groupcalls::table
                    .filter(groupcalls::id.eq(&id))
                    .filter(groupcalls::tm_delete.is_null()),
            )
            .set((
                groupcalls::tm_delete.eq(Some(now)),
                groupcalls::tm_update.eq(Some(now)),
            ))
            .get_result::<Groupcall>(&db_conn)
            .map_err(|e| db_error("groupcall", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&groupcall).await;
        Ok(groupcall)
    }

    // recordings

    pub async fn create_recording(&self, new: NewRecording) -> Result<Recording> {
        let pool = self.pool.clone();
        let recording = spawn_blocking(move || -> Result<Recording> {
            let db_conn = pool.get()?;
            diesel::insert_into(recordings::table)
                .values(&new)
                .get_result::<Recording>(&db_conn)
                .map_err(|e| anyhow!(e))
        })
        .await??
        .normalize();
        self.refresh_cache(&recording).await;
        Ok(recording)
    }

    pub async fn get_recording(&self, id: &str) -> Result<Recording> {
        let key = format!("tandem:cache:recording:{}", id);
        if let Some(Some(recording)) = self.get_cache::<Recording>(&key).await {
            return Ok(recording);
        }

        let pool = self.pool.clone();
        let id = id.to_string();
        let recording = spawn_blocking(move || -> Result<Option<Recording>> {
            let db_conn = pool.get()?;
            recordings::table
                .filter(recordings::id.eq(&id))
                .first::<Recording>(&db_conn)
                .optional()
                .map_err(|e| anyhow!(e))
        })
        .await??
        .ok_or(DomainError::NotFound("recording"))?
        .normalize();
        self.put_cache(&key, Some(&recording)).await;
        Ok(recording)
    }

    pub async fn list_recordings(
        &self,
        customer_id: &str,
        token: Option<DateTime<Utc>>,
        size: i64,
    ) -> Result<Vec<Recording>> {
        let token = token.unwrap_or_else(Utc::now);
        let pool = self.pool.clone();
        let customer_id = customer_id.to_string();
        let result = spawn_blocking(move || -> Result<Vec<Recording>> {
            let db_conn = pool.get()?;
            recordings::table
                .filter(recordings::customer_id.eq(&customer_id))
                .filter(recordings::tm_create.lt(token))
                .order_by(recordings::tm_create.desc())
                .limit(size)
                .load::<Recording>(&db_conn)
                .map_err(|e| anyhow!(e))
        })
        .await??;
        Ok(result.into_iter().map(|r| r.normalize()).collect())
    }

    pub async fn update_recording_status(
        &self,
        id: &str,
        status: RecordingStatus,
    ) -> Result<Recording> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let recording = spawn_blocking(move || -> Result<Recording> {
            let db_conn = pool.get()?;
            let now = Utc::now();
            let statement =
                diesel::update(recordings::table.filter(recordings::id.eq(&id)));
            let recording = match status {
                // the start timestamp is set by whichever leg begins
                // writing first and never moves after that
                RecordingStatus::Recording => statement
                    .set((
                        recordings::status.eq(status.to_string()),
                        recordings::tm_start.eq(sql::<Nullable<Timestamptz>>(
                            "coalesce(tm_start, now())",
                        )),
                        recordings::tm_update.eq(Some(now)),
                    ))
                    .get_result::<Recording>(&db_conn),
                RecordingStatus::Ended => statement
                    .set((
                        recordings::status.eq(status.to_string()),
                        recordings::tm_end.eq(Some(now)),
                        recordings::tm_update.eq(Some(now)),
                    ))
                    .get_result::<Recording>(&db_conn),
                _ => statement
                    .set((
                        recordings::status.eq(status.to_string()),
                        recordings::tm_update.eq(Some(now)),
                    ))
                    .get_result::<Recording>(&db_conn),
            };
            recording.map_err(|e| db_error("recording", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&recording).await;
        Ok(recording)
    }

    pub async fn delete_recording(&self, id: &str) -> Result<Recording> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let recording = spawn_blocking(move || -> Result<Recording> {
            let db_conn = pool.get()?;
            let now = Utc::now();
            diesel::update(
                recordings::table
                    .filter(recordings::id.eq(&id))
                    .filter(recordings::tm_delete.is_null()),
            )
            .set((
                recordings::tm_delete.eq(Some(now)),
                recordings::tm_update.eq(Some(now)),
            ))
            .get_result::<Recording>(&db_conn)
            .map_err(|e| db_error("recording", e))
        })
        .await??
        .normalize();
        self.refresh_cache(&recording).await;
        Ok(recording)
    }

    // external media

    pub async fn create_external_media(
        &self,
        new: NewExternalMedia,
    ) -> Result<ExternalMedia> {
        let pool = self.pool.clone();
        let external_media = spawn_blocking(move || -> Result<ExternalMedia> {
            let db_conn = pool.get()?;
            diesel::insert_into(external_medias::table)
                .values(&new)
                .get_result::<ExternalMedia>(&db_conn)
                .map_err(|e| anyhow!(e))
        })
        .await??;
        self.refresh_cache(&external_media).await;
        Ok(external_media)
    }

    pub async fn get_external_media(&self, id: &str) -> Result<ExternalMedia> {
        let key = format!("tandem:cache:external_media:{}", id);
        if let Some(Some(external_media)) =
            self.get_cache::<ExternalMedia>(&key).await
        {
            return Ok(external_media);
        }

        let pool = self.pool.clone();
        let id = id.to_string();
        let external_media =
            spawn_blocking(move || -> Result<Option<ExternalMedia>> {
                let db_conn = pool.get()?;
                external_medias::table
                    .filter(external_medias::id.eq(&id))
                    .first::<ExternalMedia>(&db_conn)
                    .optional()
                    .map_err(|e| anyhow!(e))
            })
            .await??
            .ok_or(DomainError::NotFound("external media"))?;
        self.put_cache(&key, Some(&external_media)).await;
        Ok(external_media)
    }

    pub async fn list_external_medias(
        &self,
        customer_id: &str,
        token: Option<DateTime<Utc>>,
        size: i64,
    ) -> Result<Vec<ExternalMedia>> {
        let token = token.unwrap_or_else(Utc::now);
        let pool = self.pool.clone();
        let customer_id = customer_id.to_string();
        let result = spawn_blocking(move || -> Result<Vec<ExternalMedia>> {
            let db_conn = pool.get()?;
            external_medias::table
                .filter(external_medias::customer_id.eq(&customer_id))
                .filter(external_medias::tm_create.lt(token))
                .order_by(external_medias::tm_create.desc())
                .limit(size)
                .load::<ExternalMedia>(&db_conn)
                .map_err(|e| anyhow!(e))
        })
        .await??;
        Ok(result)
    }

    /// Lookup by the switch channel carrying the media. Used by the
    /// event loop, which only knows the channel id at that point.
    pub async fn get_external_media_by_channel(
        &self,
        channel_id: &str,
    ) -> Result<ExternalMedia> {
        let pool = self.pool.clone();
        let channel_id = channel_id.to_string();
        let external_media =
            spawn_blocking(move || -> Result<Option<ExternalMedia>> {
                let db_conn = pool.get()?;
                external_medias::table
                    .filter(external_medias::channel_id.eq(&channel_id))
                    .filter(external_medias::tm_delete.is_null())
                    .first::<ExternalMedia>(&db_conn)
                    .optional()
                    .map_err(|e| anyhow!(e))
            })
            .await??
            .ok_or(DomainError::NotFound("external media"))?;
        self.refresh_cache(&external_media).await;
        Ok(external_media)
    }

    pub async fn update_external_media_local_addr(
        &self,
        id: &str,
        local_ip: &str,
        local_port: i64,
    ) -> Result<ExternalMedia> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let local_ip = local_ip.to_string();
        let external_media = spawn_blocking(move || -> Result<ExternalMedia> {
            let db_conn = pool.get()?;
            diesel::update(
                external_medias::table.filter(external_medias::id.eq(&id)),
            )
            .set((
                external_medias::local_ip.eq(&local_ip),
                external_medias::local_port.eq(local_port),
                external_medias::tm_update.eq(Some(Utc::now())),
            ))
            .get_result::<ExternalMedia>(&db_conn)
            .map_err(|e| db_error("external media", e))
        })
        .await??;
        self.refresh_cache(&external_media).await;
        Ok(external_media)
    }

    pub async fn delete_external_media(&self, id: &str) -> Result<ExternalMedia> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let external_media = spawn_blocking(move || -> Result<ExternalMedia> {
            let db_conn = pool.get()?;
            let now = Utc::now();
            diesel::update(
                external_medias::table
                    .filter(external_medias::id.eq(&id))
                    .filter(external_medias::tm_delete.is_null()),
            )
            .set((
                external_medias::tm_delete.eq(Some(now)),
                external_medias::tm_update.eq(Some(now)),
            ))
            .get_result::<ExternalMedia>(&db_conn)
            .map_err(|e| db_error("external media", e))
        })
        .await??;
        self.refresh_cache(&external_media).await;
        Ok(external_media)
    }
}
