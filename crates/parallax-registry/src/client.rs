//! The registry client.

use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use serde::Deserialize;
use std::net::IpAddr;

use crate::error::{RegistryError, Result};
use crate::keys::Keys;
use crate::records::WorkerAttributes;
use crate::reply::{
    self, FindBrokerReply, FindOrCreateReply, HealthCheckReply, PickedBroker, RecoveryBatch,
};
use crate::scripts::RegistryScripts;

/// Registry connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Connection URL.
    pub url: String,
    /// Registry key namespace.
    pub ns: String,
    /// Maximum pool connections.
    pub max_connections: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_owned(),
            ns: "parallax".to_owned(),
            max_connections: 10,
        }
    }
}

/// Arguments for the `join` script.
#[derive(Debug, Clone)]
pub struct JoinArgs {
    pub broker_id: String,
    pub load: u64,
    pub cluster: String,
    pub addr: String,
    pub hash_key: u64,
}

/// Arguments for the `find_or_create` script.
#[derive(Debug, Clone)]
pub struct FindOrCreateArgs {
    /// Owning broker for create mode; `None` means find-only.
    pub broker_id: Option<String>,
    /// Worker class name.
    pub name: String,
    /// Explicit worker id; `None` lets the script derive one.
    pub worker_id: Option<String>,
    /// Attribute bag stored on the record.
    pub attributes: WorkerAttributes,
    /// Caller clock in ms; doubles as the creation-time score. The
    /// recovery path passes the worker's original creation time here.
    pub now_ms: u64,
    /// Recovery TTL in ms; 0 means unlimited.
    pub ttl_ms: u64,
    /// Counts the creation as a recovery instead of a fresh create.
    pub for_recovery: bool,
}

/// Salvage script modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SalvageMode {
    /// Peer salvage; no-op unless the target record is `invalid`.
    Peer,
    /// Self-destroy, parking recoverable workers in the recovery set.
    SelfRecoverable,
    /// Self-destroy discarding every worker.
    SelfDiscard,
}

impl SalvageMode {
    const fn as_arg(self) -> u8 {
        match self {
            Self::Peer => 0,
            Self::SelfRecoverable => 1,
            Self::SelfDiscard => 2,
        }
    }
}

/// Destroy-worker script modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyWorkerMode {
    /// Delete the record outright.
    Delete,
    /// Park a recoverable record in the recovery set.
    Salvage,
}

impl DestroyWorkerMode {
    const fn as_arg(self) -> u8 {
        match self {
            Self::Delete => 0,
            Self::Salvage => 1,
        }
    }
}

/// Client for the shared registry.
///
/// Owns the connection pool, the prepared script set, and key
/// derivation. Script evaluation goes through `EVALSHA` with automatic
/// reload; [`Registry::prime_scripts`] loads the whole set up front so
/// the slow path is never taken mid-operation.
pub struct Registry {
    pool: Pool,
    client: redis::Client,
    keys: Keys,
    scripts: RegistryScripts,
}

impl Registry {
    /// Connects to the registry and verifies the connection.
    pub async fn connect(config: &RegistryConfig) -> Result<Self> {
        let pool_config = Config::from_url(config.url.as_str());
        let pool = pool_config
            .builder()
            .map_err(|e| RegistryError::Config(e.to_string()))?
            .max_size(config.max_connections)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| RegistryError::Config(e.to_string()))?;

        // Test the connection
        let mut conn = pool.get().await?;
        redis::cmd("PING").query_async::<String>(&mut *conn).await?;

        let client =
            redis::Client::open(config.url.as_str()).map_err(RegistryError::Redis)?;

        Ok(Self {
            pool,
            client,
            keys: Keys::new(config.ns.clone()),
            scripts: RegistryScripts::new(),
        })
    }

    /// Key deriver for this registry's namespace.
    #[must_use]
    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// Loads every script into the server cache.
    pub async fn prime_scripts(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        for script in self.scripts.all() {
            let sha: String = script.prepare_invoke().load_async(&mut *conn).await?;
            tracing::debug!(sha = %sha, "registry script loaded");
        }
        Ok(())
    }

    /// Returns the registry's wall clock in milliseconds.
    pub async fn server_time_ms(&self) -> Result<u64> {
        let mut conn = self.pool.get().await?;
        let (secs, micros): (u64, u64) =
            redis::cmd("TIME").query_async(&mut *conn).await?;
        Ok(secs * 1000 + micros / 1000)
    }

    /// Opens a dedicated pub/sub connection.
    ///
    /// Dropping the returned connection unsubscribes everything it holds,
    /// which is how a destroyed broker leaves its channels.
    pub async fn subscriber(&self) -> Result<redis::aio::PubSub> {
        Ok(self.client.get_async_pubsub().await?)
    }

    /// Resolves the local interface the registry connection uses.
    ///
    /// Peers must be able to reach this broker over a network the
    /// registry can also reach, so the listener binds here by default.
    pub async fn local_ip(&self) -> Result<IpAddr> {
        let info = self.client.get_connection_info();
        match &info.addr {
            redis::ConnectionAddr::Tcp(host, port)
            | redis::ConnectionAddr::TcpTls { host, port, .. } => {
                let stream = tokio::net::TcpStream::connect((host.as_str(), *port)).await?;
                Ok(stream.local_addr()?.ip())
            }
            other => Err(RegistryError::Config(format!(
                "cannot derive a bind address from {other:?}"
            ))),
        }
    }

    /// Runs the `join` script.
    pub async fn join(&self, args: &JoinArgs) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let value: redis::Value = self
            .scripts
            .join
            .key(self.keys.gh())
            .key(self.keys.bh())
            .key(self.keys.cz(&args.cluster))
            .key(self.keys.bz(&args.cluster))
            .key(self.keys.wz(&args.broker_id))
            .key(self.keys.rz())
            .key(self.keys.wh())
            .arg(&args.broker_id)
            .arg(self.keys.ch_prefix())
            .arg(args.load)
            .arg(&args.cluster)
            .arg(&args.addr)
            .arg(args.hash_key)
            .invoke_async(&mut *conn)
            .await?;
        reply::parse_unit(&value, "join")
    }

    /// Runs the `pick_broker` script.
    pub async fn pick_broker(
        &self,
        cluster: &str,
        max_retries: u32,
    ) -> Result<Option<PickedBroker>> {
        let mut conn = self.pool.get().await?;
        let value: redis::Value = self
            .scripts
            .pick_broker
            .key(self.keys.gh())
            .key(self.keys.bh())
            .key(self.keys.cz(cluster))
            .arg(cluster)
            .arg(max_retries)
            .invoke_async(&mut *conn)
            .await?;
        reply::parse_pick_broker(&value)
    }

    /// Runs the `find_or_create` script.
    pub async fn find_or_create(&self, args: &FindOrCreateArgs) -> Result<FindOrCreateReply> {
        let attributes = serde_json::to_string(&args.attributes)
            .map_err(|e| RegistryError::Serialisation(e.to_string()))?;
        let owner = args.broker_id.as_deref().unwrap_or("");

        let mut conn = self.pool.get().await?;
        let value: redis::Value = self
            .scripts
            .find_or_create
            .key(self.keys.gh())
            .key(self.keys.wh())
            .key(self.keys.bh())
            .key(self.keys.rz())
            .key(self.keys.wz(owner))
            .arg(owner)
            .arg(&args.name)
            .arg(args.worker_id.as_deref().unwrap_or(""))
            .arg(attributes)
            .arg(args.now_ms)
            .arg(args.ttl_ms)
            .arg(u8::from(args.for_recovery))
            .invoke_async(&mut *conn)
            .await?;
        reply::parse_find_or_create(&value)
    }

    /// Runs the `find_broker` script.
    pub async fn find_broker(
        &self,
        self_broker_id: &str,
        worker_id: &str,
    ) -> Result<FindBrokerReply> {
        let mut conn = self.pool.get().await?;
        let value: redis::Value = self
            .scripts
            .find_broker
            .key(self.keys.gh())
            .key(self.keys.wh())
            .key(self.keys.bh())
            .arg(self_broker_id)
            .arg(worker_id)
            .invoke_async(&mut *conn)
            .await?;
        reply::parse_find_broker(&value)
    }

    /// Runs the `health_check` script for this broker's cluster ring.
    pub async fn health_check(
        &self,
        self_broker_id: &str,
        cluster: &str,
    ) -> Result<HealthCheckReply> {
        let mut conn = self.pool.get().await?;
        let value: redis::Value = self
            .scripts
            .health_check
            .key(self.keys.gh())
            .key(self.keys.bh())
            .key(self.keys.cz(cluster))
            .key(self.keys.bz(cluster))
            .arg(self_broker_id)
            .invoke_async(&mut *conn)
            .await?;
        reply::parse_health_check(&value)
    }

    /// Runs the `salvage` script against a target broker.
    pub async fn salvage(
        &self,
        target_broker_id: &str,
        cluster: &str,
        mode: SalvageMode,
    ) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let value: redis::Value = self
            .scripts
            .salvage
            .key(self.keys.gh())
            .key(self.keys.wh())
            .key(self.keys.bh())
            .key(self.keys.cz(cluster))
            .key(self.keys.bz(cluster))
            .key(self.keys.wz(target_broker_id))
            .key(self.keys.rz())
            .arg(target_broker_id)
            .arg(mode.as_arg())
            .invoke_async(&mut *conn)
            .await?;
        reply::parse_unit(&value, "salvage")
    }

    /// Runs the `fetch_for_recovery` script.
    pub async fn fetch_for_recovery(
        &self,
        now_ms: u64,
        ttl_ms: u64,
        max_fetch: u32,
    ) -> Result<RecoveryBatch> {
        let mut conn = self.pool.get().await?;
        let value: redis::Value = self
            .scripts
            .fetch_for_recovery
            .key(self.keys.gh())
            .key(self.keys.wh())
            .key(self.keys.rz())
            .arg(now_ms)
            .arg(ttl_ms)
            .arg(max_fetch)
            .invoke_async(&mut *conn)
            .await?;
        reply::parse_recovery_batch(&value)
    }

    /// Runs the `destroy_worker` script on behalf of the owning broker.
    pub async fn destroy_worker(
        &self,
        self_broker_id: &str,
        worker_id: &str,
        mode: DestroyWorkerMode,
        now_ms: u64,
    ) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let value: redis::Value = self
            .scripts
            .destroy_worker
            .key(self.keys.gh())
            .key(self.keys.wh())
            .key(self.keys.rz())
            .key(self.keys.wz(self_broker_id))
            .arg(worker_id)
            .arg(mode.as_arg())
            .arg(now_ms)
            .invoke_async(&mut *conn)
            .await?;
        reply::parse_unit(&value, "destroy_worker")
    }

    /// Single-shot load score update for a broker.
    pub async fn update_load(&self, cluster: &str, broker_id: &str, load: u64) -> Result<()> {
        let mut conn = self.pool.get().await?;
        conn.zadd::<_, _, _, ()>(self.keys.cz(cluster), broker_id, load)
            .await?;
        Ok(())
    }

    /// Removes a broker from both cluster sets (used by broker destroy).
    pub async fn remove_from_rings(&self, cluster: &str, broker_id: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        conn.zrem::<_, _, ()>(self.keys.cz(cluster), broker_id).await?;
        conn.zrem::<_, _, ()>(self.keys.bz(cluster), broker_id).await?;
        Ok(())
    }
}

/// Administrative single commands, used outside the scripts for load
/// updates, tests, and teardown.
impl Registry {
    /// `HGET`.
    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.pool.get().await?;
        Ok(conn.hget(key, field).await?)
    }

    /// `HSET`.
    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    /// `HDEL`.
    pub async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        conn.hdel::<_, _, ()>(key, field).await?;
        Ok(())
    }

    /// `ZADD`.
    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.pool.get().await?;
        conn.zadd::<_, _, _, ()>(key, member, score).await?;
        Ok(())
    }

    /// `ZSCORE`.
    pub async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut conn = self.pool.get().await?;
        Ok(conn.zscore(key, member).await?)
    }

    /// `ZCARD`.
    pub async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.pool.get().await?;
        Ok(conn.zcard(key).await?)
    }

    /// `ZRANGE 0 -1` — full membership, lowest score first.
    pub async fn zmembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.pool.get().await?;
        Ok(conn.zrange(key, 0, -1).await?)
    }

    /// `DEL`.
    pub async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    /// `PUBLISH`; returns the current subscriber count.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        let mut conn = self.pool.get().await?;
        Ok(conn.publish(channel, payload).await?)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("ns", &self.keys.ns())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = RegistryConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.ns, "parallax");
        assert_eq!(config.max_connections, 10);
    }

    #[test]
    fn mode_arguments() {
        assert_eq!(SalvageMode::Peer.as_arg(), 0);
        assert_eq!(SalvageMode::SelfRecoverable.as_arg(), 1);
        assert_eq!(SalvageMode::SelfDiscard.as_arg(), 2);
        assert_eq!(DestroyWorkerMode::Delete.as_arg(), 0);
        assert_eq!(DestroyWorkerMode::Salvage.as_arg(), 1);
    }
}
