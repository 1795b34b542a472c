use chrono::{DateTime, Utc};
use poise::serenity_prelude::ChannelId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Durable map of open verification tickets, one per user at most.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketStore {
    /// Schema version for migrations
    pub version: u32,

    /// Last update timestamp
    pub last_updated: u64,

    /// Map of Discord ID (as string) to open ticket
    pub tickets: HashMap<String, TicketRecord>,
}

/// An open per-user verification channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketRecord {
    pub channel_id: ChannelId,
    pub created_at: DateTime<Utc>,
}

impl Default for TicketStore {
    fn default() -> Self {
        Self {
            version: 1,
            last_updated: current_timestamp(),
            tickets: HashMap::new(),
        }
    }
}

impl TicketStore {
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

    /// Register a ticket for a user. Returns false when the user already
    /// has an open ticket (at most one per user).
    pub fn insert(&mut self, user_id: &str, ticket: TicketRecord) -> bool {
        if self.tickets.contains_key(user_id) {
            return false;
        }
        self.tickets.insert(user_id.to_string(), ticket);
        self.last_updated = current_timestamp();
        true
    }

    pub fn get(&self, user_id: &str) -> Option<&TicketRecord> {
        self.tickets.get(user_id)
    }

    pub fn remove(&mut self, user_id: &str) -> Option<TicketRecord> {
        let removed = self.tickets.remove(user_id);
        if removed.is_some() {
            self.last_updated = current_timestamp();
        }
        removed
    }

    /// Remove and return every ticket older than `max_age`.
    ///
    /// Same take-then-process contract as the pending store: removal
    /// happens before the caller acts, so a ticket is closed at most once.
    pub fn take_older_than(
        &mut self,
        now: DateTime<Utc>,
        max_age: std::time::Duration,
    ) -> Vec<(String, TicketRecord)> {
        let cutoff = now - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let due: Vec<String> = self
            .tickets
            .iter()
            .filter(|(_, t)| t.created_at <= cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        let mut taken = Vec::with_capacity(due.len());
        for id in due {
            if let Some(ticket) = self.tickets.remove(&id) {
                taken.push((id, ticket));
            }
        }
        if !taken.is_empty() {
            self.last_updated = current_timestamp();
        }
        taken
    }

    pub fn user_ids(&self) -> Vec<String> {
        self.tickets.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}

/// Shared ticket store type
pub type SharedTicketStore = Arc<tokio::sync::RwLock<TicketStore>>;

pub fn create_shared_ticket_store(store: TicketStore) -> SharedTicketStore {
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

    fn ticket(channel: u64, created_at: DateTime<Utc>) -> TicketRecord {
        TicketRecord {
            channel_id: ChannelId::new(channel),
            created_at,
        }
    }

    #[test]
    fn test_at_most_one_ticket_per_user() {
        let mut store = TicketStore::new();
        assert!(store.insert("1", ticket(100, Utc::now())));
        assert!(!store.insert("1", ticket(200, Utc::now())));
        assert_eq!(store.get("1").unwrap().channel_id, ChannelId::new(100));
    }

    #[test]
    fn test_take_older_than_is_one_shot() {
        let mut store = TicketStore::new();
        let now = Utc::now();
        store.insert("old", ticket(1, now - chrono::Duration::hours(2)));
        store.insert("fresh", ticket(2, now));

        let taken = store.take_older_than(now, Duration::from_secs(3600));
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].0, "old");

        assert!(store
            .take_older_than(now, Duration::from_secs(3600))
            .is_empty());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verification_tickets.json");
        let path = path.to_str().unwrap();

        let mut store = TicketStore::new();
        store.insert("9", ticket(300, Utc::now()));
        store.save(path).await.unwrap();

        let loaded = TicketStore::load(path).await.unwrap();
        assert_eq!(loaded.get("9").unwrap().channel_id, ChannelId::new(300));
    }
}
