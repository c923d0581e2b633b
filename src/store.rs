//! Record stores for SIP credentials and presence, keyed by user id

use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use crate::config::SipEndpointConfig;
use crate::presence::PresenceStatus;

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// `Ok(None)` when the user has no SIP account configured
    async fn load_config(&self, user_id: &str) -> anyhow::Result<Option<SipEndpointConfig>>;

    async fn save_config(&self, user_id: &str, config: &SipEndpointConfig) -> anyhow::Result<()>;
}

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Users without a stored record are online
    async fn load_presence(&self, user_id: &str) -> anyhow::Result<PresenceStatus>;

    async fn save_presence(
        &self,
        user_id: &str,
        status: PresenceStatus,
        updated_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub status: PresenceStatus,
    pub updated_at: DateTime<Utc>,
}

/// Process-local store backing both traits
#[derive(Debug, Default)]
pub struct MemoryStore {
    configs: RwLock<HashMap<String, SipEndpointConfig>>,
    presence: RwLock<HashMap<String, PresenceRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every save fail, to exercise store outages
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn presence_record(&self, user_id: &str) -> Option<PresenceRecord> {
        self.presence.read().await.get(user_id).cloned()
    }

    fn check_writable(&self) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("store is read-only");
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn load_config(&self, user_id: &str) -> anyhow::Result<Option<SipEndpointConfig>> {
        Ok(self.configs.read().await.get(user_id).cloned())
    }

    async fn save_config(&self, user_id: &str, config: &SipEndpointConfig) -> anyhow::Result<()> {
        self.check_writable()?;
        self.configs
            .write()
            .await
            .insert(user_id.to_string(), config.clone());
        Ok(())
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn load_presence(&self, user_id: &str) -> anyhow::Result<PresenceStatus> {
        Ok(self
            .presence
            .read()
            .await
            .get(user_id)
            .map(|record| record.status)
            .unwrap_or_default())
    }

    async fn save_presence(
        &self,
        user_id: &str,
        status: PresenceStatus,
        updated_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.check_writable()?;
        self.presence
            .write()
            .await
            .insert(user_id.to_string(), PresenceRecord { status, updated_at });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_config_round_trip_and_missing() {
        let store = MemoryStore::new();
        assert_eq!(store.load_config("u-1").await.unwrap(), None);

        let config = SipEndpointConfig::new("sip.x.com", "1001", "p");
        store.save_config("u-1", &config).await.unwrap();
        assert_eq!(store.load_config("u-1").await.unwrap(), Some(config));
    }

    #[tokio::test]
    async fn test_presence_defaults_online_and_records_timestamp() {
        let store = MemoryStore::new();
        assert_eq!(store.load_presence("u-1").await.unwrap(), PresenceStatus::Online);

        let at = Utc::now();
        store
            .save_presence("u-1", PresenceStatus::Away, at)
            .await
            .unwrap();
        assert_eq!(
            store.presence_record("u-1").await,
            Some(PresenceRecord {
                status: PresenceStatus::Away,
                updated_at: at
            })
        );
    }

    #[tokio::test]
    async fn test_fail_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let config = SipEndpointConfig::new("sip.x.com", "1001", "p");
        assert!(store.save_config("u-1", &config).await.is_err());
        assert_eq!(store.load_config("u-1").await.unwrap(), None);
    }
}
