//! User presence and what it means for the engine stack

use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{SoftphoneError, SoftphoneResult};
use crate::store::PresenceStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Online,
    Away,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresenceStatus {
    type Err = SoftphoneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(PresenceStatus::Online),
            "away" => Ok(PresenceStatus::Away),
            "offline" => Ok(PresenceStatus::Offline),
            other => Err(SoftphoneError::config(format!("unknown presence {:?}", other))),
        }
    }
}

/// What presence asks of the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackDirective {
    /// Create a stack if none exists
    Ensure,
    /// Leave an existing stack alone, create nothing
    Keep,
    TearDown,
}

/// Outcome of a teardown request under the call-continuity policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownDecision {
    Proceed,
    RefusedInCall,
    NotRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceChange {
    pub previous: PresenceStatus,
    pub current: PresenceStatus,
}

#[derive(Debug, Clone, Default)]
pub struct PresenceCoordinator {
    status: PresenceStatus,
}

impl PresenceCoordinator {
    pub fn new(status: PresenceStatus) -> Self {
        Self { status }
    }

    pub fn status(&self) -> PresenceStatus {
        self.status
    }

    pub fn directive(&self) -> StackDirective {
        match self.status {
            PresenceStatus::Online => StackDirective::Ensure,
            PresenceStatus::Away => StackDirective::Keep,
            PresenceStatus::Offline => StackDirective::TearDown,
        }
    }

    pub fn allows_new_stack(&self) -> bool {
        self.directive() == StackDirective::Ensure
    }

    /// Offline wants the stack gone, but never while a call is up
    pub fn teardown_decision(&self, call_active: bool) -> TeardownDecision {
        match (self.directive(), call_active) {
            (StackDirective::TearDown, false) => TeardownDecision::Proceed,
            (StackDirective::TearDown, true) => TeardownDecision::RefusedInCall,
            _ => TeardownDecision::NotRequested,
        }
    }

    /// Persist `next`, then adopt it locally. A store failure leaves the
    /// local status untouched.
    pub async fn change(
        &mut self,
        store: &dyn PresenceStore,
        user_id: &str,
        next: PresenceStatus,
    ) -> SoftphoneResult<PresenceChange> {
        if let Err(e) = store.save_presence(user_id, next, Utc::now()).await {
            warn!("Failed to persist presence {} for {}: {:#}", next, user_id, e);
            return Err(SoftphoneError::store(e));
        }
        let previous = self.status;
        self.status = next;
        info!("Presence {} -> {}", previous, next);
        Ok(PresenceChange {
            previous,
            current: next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_directives() {
        assert_eq!(
            PresenceCoordinator::new(PresenceStatus::Online).directive(),
            StackDirective::Ensure
        );
        assert!(!PresenceCoordinator::new(PresenceStatus::Away).allows_new_stack());
        assert_eq!(
            PresenceCoordinator::new(PresenceStatus::Away).teardown_decision(false),
            TeardownDecision::NotRequested
        );
    }

    #[test]
    fn test_offline_teardown_refused_during_call() {
        let presence = PresenceCoordinator::new(PresenceStatus::Offline);
        assert_eq!(presence.teardown_decision(true), TeardownDecision::RefusedInCall);
        assert_eq!(presence.teardown_decision(false), TeardownDecision::Proceed);
    }

    #[test]
    fn test_parse() {
        assert_eq!("Away".parse::<PresenceStatus>().unwrap(), PresenceStatus::Away);
        assert!("busy".parse::<PresenceStatus>().is_err());
    }

    #[tokio::test]
    async fn test_change_persists_before_updating() {
        let store = MemoryStore::new();
        let mut presence = PresenceCoordinator::new(PresenceStatus::Online);

        let change = presence
            .change(&store, "u-1", PresenceStatus::Away)
            .await
            .unwrap();
        assert_eq!(change.previous, PresenceStatus::Online);
        assert_eq!(presence.status(), PresenceStatus::Away);
        assert_eq!(
            store.load_presence("u-1").await.unwrap(),
            PresenceStatus::Away
        );
    }

    #[tokio::test]
    async fn test_failed_save_keeps_local_status() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let mut presence = PresenceCoordinator::new(PresenceStatus::Online);

        let result = presence.change(&store, "u-1", PresenceStatus::Offline).await;
        assert!(matches!(result, Err(SoftphoneError::Store { .. })));
        assert_eq!(presence.status(), PresenceStatus::Online);
    }
}
