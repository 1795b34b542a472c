use chrono::{DateTime, Utc};
use poise::serenity_prelude::RoleId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Durable map of users who joined but have not completed verification.
///
/// One entry per user: the roles they held at join (restored on
/// verification) and the join timestamp (consumed by the fallback sweep).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingStore {
    /// Schema version for migrations
    pub version: u32,

    /// Last update timestamp
    pub last_updated: u64,

    /// Map of Discord ID (as string) to pending user
    pub users: HashMap<String, PendingUser>,
}

/// A user awaiting verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingUser {
    /// Roles held before stripping, captured once per join cycle.
    /// Empty means there is nothing to restore and the fallback role
    /// is granted instead.
    pub original_roles: Vec<RoleId>,

    /// Timestamp of the most recent join event
    pub joined_at: DateTime<Utc>,
}

impl Default for PendingStore {
    fn default() -> Self {
        Self {
            version: 1,
            last_updated: current_timestamp(),
            users: HashMap::new(),
        }
    }
}

impl PendingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file, or create new if not exists
    pub async fn load(path: &str) -> crate::error::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| crate::error::BotError::StateParse {
                    path: path.to_string(),
                    source: e,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(crate::error::BotError::StateLoad {
                path: path.to_string(),
                source: e,
            }),
        }
    }

    /// Save to a JSON file atomically
    pub async fn save(&self, path: &str) -> crate::error::Result<()> {
        let content = serde_json::to_string_pretty(self)?;

        // Write to temp file first, then rename for atomicity
        let temp_path = format!("{}.tmp", path);
        tokio::fs::write(&temp_path, &content).await.map_err(|e| {
            crate::error::BotError::StateSave {
                path: path.to_string(),
                source: e,
            }
        })?;

        tokio::fs::rename(&temp_path, path).await.map_err(|e| {
            crate::error::BotError::StateSave {
                path: path.to_string(),
                source: e,
            }
        })?;

        Ok(())
    }

    /// Insert a pending user unless one already exists.
    ///
    /// Returns false (and leaves the stored entry untouched) when the user
    /// is already pending, so a duplicate join event never overwrites the
    /// role capture from the first one.
    pub fn insert_if_absent(&mut self, user_id: &str, user: PendingUser) -> bool {
        if self.users.contains_key(user_id) {
            return false;
        }
        self.users.insert(user_id.to_string(), user);
        self.last_updated = current_timestamp();
        true
    }

    pub fn get(&self, user_id: &str) -> Option<&PendingUser> {
        self.users.get(user_id)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    /// Remove a pending user, returning the stored entry if present
    pub fn remove(&mut self, user_id: &str) -> Option<PendingUser> {
        let removed = self.users.remove(user_id);
        if removed.is_some() {
            self.last_updated = current_timestamp();
        }
        removed
    }

    /// Remove and return every user whose join is older than `max_age`.
    ///
    /// Entries are removed before the caller processes them, so the
    /// fallback grant fires at most once per join cycle even when two
    /// sweeps overlap.
    pub fn take_older_than(
        &mut self,
        now: DateTime<Utc>,
        max_age: std::time::Duration,
    ) -> Vec<(String, PendingUser)> {
        let cutoff = now - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let due: Vec<String> = self
            .users
            .iter()
            .filter(|(_, u)| u.joined_at <= cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        let mut taken = Vec::with_capacity(due.len());
        for id in due {
            if let Some(user) = self.users.remove(&id) {
                taken.push((id, user));
            }
        }
        if !taken.is_empty() {
            self.last_updated = current_timestamp();
        }
        taken
    }

    pub fn user_ids(&self) -> Vec<String> {
        self.users.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Shared pending store type
pub type SharedPendingStore = Arc<tokio::sync::RwLock<PendingStore>>;

pub fn create_shared_pending_store(store: PendingStore) -> SharedPendingStore {
    Arc::new(tokio::sync::RwLock::new(store))
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pending(roles: Vec<u64>, joined_at: DateTime<Utc>) -> PendingUser {
        PendingUser {
            original_roles: roles.into_iter().map(RoleId::new).collect(),
            joined_at,
        }
    }

    #[test]
    fn test_insert_if_absent_never_overwrites_capture() {
        let mut store = PendingStore::new();
        let first_join = Utc::now();

        assert!(store.insert_if_absent("123", pending(vec![10, 11], first_join)));
        // Second join without an intervening leave must keep the first capture.
        assert!(!store.insert_if_absent("123", pending(vec![], Utc::now())));

        let stored = store.get("123").unwrap();
        assert_eq!(stored.original_roles, vec![RoleId::new(10), RoleId::new(11)]);
    }

    #[test]
    fn test_take_older_than_removes_unconditionally() {
        let mut store = PendingStore::new();
        let now = Utc::now();
        let old = now - chrono::Duration::hours(2);

        store.insert_if_absent("1", pending(vec![], old));
        store.insert_if_absent("2", pending(vec![], now));

        let taken = store.take_older_than(now, Duration::from_secs(3600));
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].0, "1");

        // A second overlapping sweep sees nothing: at-most-once.
        let again = store.take_older_than(now, Duration::from_secs(3600));
        assert!(again.is_empty());
        assert!(store.contains("2"));
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending_users.json");
        let path = path.to_str().unwrap();

        let mut store = PendingStore::new();
        store.insert_if_absent("42", pending(vec![7], Utc::now()));
        store.save(path).await.unwrap();

        let loaded = PendingStore::load(path).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(
            loaded.get("42").unwrap().original_roles,
            vec![RoleId::new(7)]
        );
    }

    #[tokio::test]
    async fn test_load_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does_not_exist.json");
        let store = PendingStore::load(path.to_str().unwrap()).await.unwrap();
        assert!(store.is_empty());
    }
}
