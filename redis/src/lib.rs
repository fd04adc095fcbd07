use anyhow::{anyhow, Result};
use consistent_hash_ring::{Ring, RingBuilder};
use crossbeam::queue::ArrayQueue;
use itertools::Itertools;
use lazy_static::lazy_static;
use rand::distributions::Alphanumeric;
use rand::Rng;
pub use redis;
use redis::aio::Connection;
use redis::{Client, ErrorKind, RedisError};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use std::{fs, time};

lazy_static! {
    pub static ref REDIS: RedisPool = RedisPool::new_tandem().unwrap();
}

#[derive(Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeConfig>,
}

#[derive(Deserialize)]
pub struct NodeConfig {
    pub addr: String,
}

pub struct Node {
    conns: ArrayQueue<Connection>,
    client: Arc<Client>,
}

async fn get_connection(client: &Client, ms: u64) -> Result<Connection> {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(ms)) => {
            Err(anyhow!("connection timeout"))
        }
        result = client.get_async_connection() => {
            let connection = result?;
            Ok(connection)
        }
    }
}

impl Node {
    pub fn new(addr: String) -> Result<Self> {
        let client = Arc::new(Client::open(addr)?);
        let conns = ArrayQueue::new(100);
        Ok(Self { conns, client })
    }
}

#[derive(Clone)]
pub struct RedisPool {
    nodes: Arc<Vec<Node>>,
    ring: Arc<Ring<usize>>,
}

pub struct PoolConnection {
    conn: Option<Connection>,
    in_query: bool,
    had_error: bool,
    node: usize,
}

impl Drop for PoolConnection {
    fn drop(&mut self) {
        if self.in_query || self.had_error {
            // if the connection is still in a query,
            // and it hasn't got a response yet,
            // don't put it back to the pool
            //
            // if the connection had io error,
            // don't put it back to the pool
            return;
        }
        let conn = self.conn.take().unwrap();
        if let Some(node) = REDIS.nodes.get(self.node) {
            let _ = node.conns.push(conn);
        }
    }
}

impl RedisPool {
    pub fn new_tandem() -> Result<RedisPool> {
        let redis_conf = std::env::var("REDIS_CONF")
            .unwrap_or_else(|_| "/etc/tandem/redis.conf".to_string());
        let contents = fs::read_to_string(&redis_conf)?;
        let config: ClusterConfig = toml::from_str(&contents)?;
        Self::new(&config)
    }

    pub fn new(config: &ClusterConfig) -> Result<RedisPool> {
        if config.nodes.is_empty() {
            return Err(anyhow!("no redis nodes configured"));
        }
        let mut nodes = Vec::new();
        let mut ring = RingBuilder::default().vnodes(100).build();
        for node in config.nodes.iter() {
            let node = Node::new(node.addr.clone())?;
            nodes.push(node);
            ring.insert(nodes.len() - 1);
        }
        Ok(RedisPool {
            nodes: Arc::new(nodes),
            ring: Arc::new(ring),
        })
    }

    pub async fn get_conn(&self, key: &str) -> Result<PoolConnection> {
        let i = *self.ring.get(key);
        let node = &self.nodes[i];

        let conn = node.conns.pop();
        let conn = if let Some(conn) = conn {
            conn
        } else {
            get_connection(&node.client, 1000).await?
        };
        Ok(PoolConnection {
            conn: Some(conn),
            in_query: false,
            had_error: false,
            node: i,
        })
    }

    pub async fn query<T: redis::FromRedisValue>(
        &self,
        cmd: &str,
        key: &str,
        args: &[&str],
    ) -> Result<T> {
        let mut n = 0;
        let mut m = 0;
        loop {
            if let Ok(mut conn) = self.get_conn(key).await {
                conn.in_query = true;
                let result: Result<T, RedisError> = redis::cmd(cmd)
                    .arg(args)
                    .query_async(conn.conn.as_mut().unwrap())
                    .await;
                conn.in_query = false;

                if let Err(e) = result.as_ref() {
                    if e.is_io_error() || e.kind() == ErrorKind::BusyLoadingError {
                        conn.had_error = true;
                    } else {
                        return result.map_err(|e| anyhow!(e));
                    }
                } else {
                    return result.map_err(|e| anyhow!(e));
                }
            }

            if m > 100 {
                return Err(anyhow!("redis retried more than 100 times, quit"));
            }
            if n > 10 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                n = 0;
            }

            m += 1;
            n += 1;
        }
    }

    pub async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<usize> {
        self.query("XACK", stream, &[stream, group, id]).await
    }

    pub async fn xread_timeout<T: redis::FromRedisValue>(
        &self,
        stream: &str,
        id: &str,
        timeout: usize,
        count: usize,
    ) -> Result<T> {
        self.query(
            "XREAD",
            stream,
            &[
                "block",
                &timeout.to_string(),
                "count",
                &count.to_string(),
                "STREAMS",
                stream,
                id,
            ],
        )
        .await
    }

    pub async fn xread_next_entry_timeout(
        &self,
        stream: &str,
        key_id: &str,
        timeout: usize,
    ) -> Result<(String, String, String)> {
        let streams: Vec<redis::Value> =
            self.xread_timeout(stream, key_id, timeout, 1).await?;
        if streams.is_empty() {
            return Err(anyhow!("no streams found"));
        }
        let (_stream_name, entries): (String, Vec<redis::Value>) =
            redis::from_redis_value(&streams[0])?;
        for entry in entries {
            let (entry_id, entry_key_values): (String, Vec<String>) =
                redis::from_redis_value(&entry)?;
            if let Some((key, value)) = entry_key_values.iter().next_tuple() {
                return Ok((entry_id, key.clone(), value.clone()));
            }
        }
        Err(anyhow!("not a valid event"))
    }

    pub async fn xgroup_create(&self, stream: &str, group: &str) -> Result<String> {
        self.query("XGROUP", stream, &["CREATE", stream, group, "$", "MKSTREAM"])
            .await
    }

    pub async fn xreadgroup_timeout<T: redis::FromRedisValue>(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        timeout: usize,
        count: usize,
    ) -> Result<T> {
        self.query(
            "XREADGROUP",
            stream,
            &[
                "block",
                &timeout.to_string(),
                "group",
                group,
                consumer,
                "count",
                &count.to_string(),
                "STREAMS",
                stream,
                ">",
            ],
        )
        .await
    }

    pub async fn xadd_maxlen<T: redis::FromRedisValue>(
        &self,
        stream: &str,
        field: &str,
        value: &str,
        maxlen: u64,
    ) -> Result<T> {
        self.query(
            "XADD",
            stream,
            &[
                stream,
                "MAXLEN",
                "~",
                &maxlen.to_string(),
                "*",
                field,
                value,
            ],
        )
        .await
    }

    pub async fn srem(&self, key: &str, member: &str) -> Result<usize> {
        self.query("SREM", key, &[key, member]).await
    }

    pub async fn sadd(&self, key: &str, member: &str) -> Result<usize> {
        self.query("SADD", key, &[key, member]).await
    }

    pub async fn smembers<T: redis::FromRedisValue>(&self, key: &str) -> Result<T> {
        self.query("SMEMBERS", key, &[key]).await
    }

    pub async fn get<T: redis::FromRedisValue>(&self, key: &str) -> Result<T> {
        self.query("GET", key, &[key]).await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<String> {
        self.query("SET", key, &[key, value]).await
    }

    pub async fn setex(
        &self,
        key: &str,
        expire: u64,
        value: &str,
    ) -> Result<String> {
        self.query("SETEX", key, &[key, &expire.to_string(), value])
            .await
    }

    pub async fn del(&self, key: &str) -> Result<usize> {
        self.query("DEL", key, &[key]).await
    }

    pub async fn del_if_value(&self, key: &str, value: &str) -> Result<bool> {
        let script = r#"
            if redis.call("get",KEYS[1]) == ARGV[1] then
               redis.call("del",KEYS[1])
               return 1
            else
               return 0
            end
            "#;
        self.query("EVAL", key, &[script, "1", key, value]).await
    }

    pub async fn setexnx(&self, key: &str, value: &str, expire: u64) -> bool {
        self.query::<String>(
            "SET",
            key,
            &[key, value, "EX", &expire.to_string(), "NX"],
        )
        .await
        .unwrap_or_else(|_| "".to_string())
            == "OK"
    }

    pub async fn expire(&self, key: &str, expire: u64) -> Result<bool> {
        self.query("EXPIRE", key, &[key, &expire.to_string()]).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.query("EXISTS", key, &[key]).await
    }
}

pub struct DistributedMutex {
    key: String,
    random_string: String,
}

impl Drop for DistributedMutex {
    fn drop(&mut self) {
        self.unlock()
    }
}

impl DistributedMutex {
    pub fn new(key: String) -> DistributedMutex {
        let random_string = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .collect::<String>();

        DistributedMutex { key, random_string }
    }

    async fn acquire(&self) -> bool {
        REDIS.setexnx(&self.key, &self.random_string, 8).await
    }

    pub async fn lock(&self) {
        let start = time::Instant::now();
        loop {
            if self.acquire().await {
                return;
            }

            if start.elapsed().as_secs() > 8 {
                return;
            }

            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    pub fn unlock(&self) {
        let key = self.key.clone();
        let random_string = self.random_string.clone();
        tokio::spawn(async move {
            let _ = REDIS.del_if_value(&key, &random_string).await;
        });
    }
}
