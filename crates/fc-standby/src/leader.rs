use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::{Result, StandbyError};

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    redis.call("EXPIRE", KEYS[1], ARGV[2])
    return 1
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    redis.call("DEL", KEYS[1])
    return 1
else
    return 0
end
"#;

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub redis_url: String,
    /// Role name; the lock key is `<key_prefix>:<role>`.
    pub role: String,
    pub key_prefix: String,
    pub lock_ttl: Duration,
    pub refresh_interval: Duration,
    pub instance_id: String,
}

impl LeaderConfig {
    pub fn for_role(redis_url: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            role: role.into(),
            key_prefix: "fc:leader".to_string(),
            lock_ttl: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(10),
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    fn lock_key(&self) -> String {
        format!("{}:{}", self.key_prefix, self.role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderStatus {
    Leader,
    Follower,
    Unknown,
}

pub struct LeaderElector {
    config: LeaderConfig,
    conn: ConnectionManager,
    lock_key: String,
    is_leader: AtomicBool,
    running: AtomicBool,
    status_tx: watch::Sender<LeaderStatus>,
    status_rx: watch::Receiver<LeaderStatus>,
    shutdown_tx: broadcast::Sender<()>,
}

impl LeaderElector {
    pub async fn connect(config: LeaderConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| StandbyError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client).await?;

        let (status_tx, status_rx) = watch::channel(LeaderStatus::Unknown);
        let (shutdown_tx, _) = broadcast::channel(1);
        let lock_key = config.lock_key();

        Ok(Self {
            config,
            conn,
            lock_key,
            is_leader: AtomicBool::new(false),
            running: AtomicBool::new(false),
            status_tx,
            status_rx,
            shutdown_tx,
        })
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> LeaderStatus {
        *self.status_rx.borrow()
    }

    /// Watch channel for role transitions; consumers pause or resume
    /// intake on change.
    pub fn subscribe(&self) -> watch::Receiver<LeaderStatus> {
        self.status_rx.clone()
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(StandbyError::AlreadyRunning);
        }

        info!(
            role = %self.config.role,
            instance_id = %self.config.instance_id,
            lock_key = %self.lock_key,
            "leader election started"
        );

        let elector = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(elector.config.refresh_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => elector.tick().await,
                    _ = shutdown_rx.recv() => {
                        elector.release().await;
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    async fn tick(&self) {
        let mut conn = self.conn.clone();

        if self.is_leader() {
            match self.extend(&mut conn).await {
                Ok(true) => debug!(role = %self.config.role, "lease extended"),
                Ok(false) => {
                    warn!(role = %self.config.role, "lease lost");
                    self.transition(LeaderStatus::Follower);
                }
                Err(e) => {
                    // Treat an unreachable lock store as a loss: another
                    // replica may already hold the role.
                    error!(role = %self.config.role, error = %e, "lease extension failed");
                    self.transition(LeaderStatus::Follower);
                }
            }
        } else {
            match self.try_acquire(&mut conn).await {
                Ok(true) => self.transition(LeaderStatus::Leader),
                Ok(false) => self.transition(LeaderStatus::Follower),
                Err(e) => {
                    error!(role = %self.config.role, error = %e, "acquisition failed");
                    self.transition(LeaderStatus::Unknown);
                }
            }
        }
    }

    async fn try_acquire(&self, conn: &mut ConnectionManager) -> Result<bool> {
        let acquired: Option<String> = redis::cmd("SET")
            .arg(&self.lock_key)
            .arg(&self.config.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(self.config.lock_ttl.as_secs())
            .query_async(conn)
            .await?;
        Ok(acquired.is_some())
    }

    async fn extend(&self, conn: &mut ConnectionManager) -> Result<bool> {
        let extended: i32 = redis::Script::new(EXTEND_SCRIPT)
            .key(&self.lock_key)
            .arg(&self.config.instance_id)
            .arg(self.config.lock_ttl.as_secs())
            .invoke_async(conn)
            .await?;
        Ok(extended == 1)
    }

    async fn release(&self) {
        if !self.is_leader() {
            return;
        }
        let mut conn = self.conn.clone();
        match redis::Script::new(RELEASE_SCRIPT)
            .key(&self.lock_key)
            .arg(&self.config.instance_id)
            .invoke_async::<i32>(&mut conn)
            .await
        {
            Ok(1) => info!(role = %self.config.role, "lock released"),
            Ok(_) => debug!(role = %self.config.role, "lock was already gone"),
            Err(e) => error!(role = %self.config.role, error = %e, "lock release failed"),
        }
        self.transition(LeaderStatus::Follower);
    }

    fn transition(&self, status: LeaderStatus) {
        let was_leader = self
            .is_leader
            .swap(status == LeaderStatus::Leader, Ordering::SeqCst);
        let now_leader = status == LeaderStatus::Leader;
        let _ = self.status_tx.send(status);

        if was_leader != now_leader {
            if now_leader {
                info!(
                    role = %self.config.role,
                    instance_id = %self.config.instance_id,
                    "became leader"
                );
            } else {
                warn!(
                    role = %self.config.role,
                    instance_id = %self.config.instance_id,
                    "lost leadership"
                );
            }
        }
    }

    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = LeaderConfig::for_role("redis://localhost:6379", "consumer");
        assert_eq!(config.lock_ttl, Duration::from_secs(30));
        assert_eq!(config.refresh_interval, Duration::from_secs(10));
        assert_eq!(config.lock_key(), "fc:leader:consumer");
    }

    #[test]
    fn roles_get_distinct_keys() {
        let consumer = LeaderConfig::for_role("redis://localhost:6379", "consumer");
        let scheduler = LeaderConfig::for_role("redis://localhost:6379", "scheduler");
        assert_ne!(consumer.lock_key(), scheduler.lock_key());
    }
}
