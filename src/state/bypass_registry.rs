use poise::serenity_prelude::RoleId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Roles that exempt their holders from verification entirely.
///
/// Persisted as a flat list; membership checks are O(1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BypassRegistry {
    pub bypass_roles: HashSet<RoleId>,

    /// Last update timestamp
    pub last_updated: u64,
}

impl Default for BypassRegistry {
    fn default() -> Self {
        Self {
            bypass_roles: HashSet::new(),
            last_updated: current_timestamp(),
        }
    }
}

impl BypassRegistry {
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

    /// Add a role to the bypass set. Returns false if already present.
    pub fn add(&mut self, role_id: RoleId) -> bool {
        let added = self.bypass_roles.insert(role_id);
        if added {
            self.last_updated = current_timestamp();
        }
        added
    }

    /// Remove a role from the bypass set. Returns false if not present.
    pub fn remove(&mut self, role_id: RoleId) -> bool {
        let removed = self.bypass_roles.remove(&role_id);
        if removed {
            self.last_updated = current_timestamp();
        }
        removed
    }

    pub fn contains(&self, role_id: RoleId) -> bool {
        self.bypass_roles.contains(&role_id)
    }

    /// True when any of the member's roles is a bypass role
    pub fn matches_any<'a, I>(&self, roles: I) -> bool
    where
        I: IntoIterator<Item = &'a RoleId>,
    {
        if self.bypass_roles.is_empty() {
            return false;
        }
        roles.into_iter().any(|r| self.bypass_roles.contains(r))
    }

    pub fn all(&self) -> Vec<RoleId> {
        self.bypass_roles.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.bypass_roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bypass_roles.is_empty()
    }
}

/// Shared bypass registry type
pub type SharedBypassRegistry = Arc<tokio::sync::RwLock<BypassRegistry>>;

pub fn create_shared_bypass_registry(registry: BypassRegistry) -> SharedBypassRegistry {
    Arc::new(tokio::sync::RwLock::new(registry))
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

    #[test]
    fn test_add_and_remove() {
        let mut registry = BypassRegistry::new();
        assert!(registry.add(RoleId::new(100)));
        assert!(!registry.add(RoleId::new(100)));
        assert!(registry.contains(RoleId::new(100)));
        assert!(registry.remove(RoleId::new(100)));
        assert!(!registry.remove(RoleId::new(100)));
    }

    #[test]
    fn test_matches_any() {
        let mut registry = BypassRegistry::new();
        registry.add(RoleId::new(100));

        let member_roles = vec![RoleId::new(5), RoleId::new(100)];
        assert!(registry.matches_any(&member_roles));

        let other_roles = vec![RoleId::new(5), RoleId::new(6)];
        assert!(!registry.matches_any(&other_roles));
    }

    #[test]
    fn test_empty_registry_never_matches() {
        let registry = BypassRegistry::new();
        let roles = vec![RoleId::new(1)];
        assert!(!registry.matches_any(&roles));
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bypass_roles.json");
        let path = path.to_str().unwrap();

        let mut registry = BypassRegistry::new();
        registry.add(RoleId::new(777));
        registry.save(path).await.unwrap();

        let loaded = BypassRegistry::load(path).await.unwrap();
        assert!(loaded.contains(RoleId::new(777)));
        assert_eq!(loaded.len(), 1);
    }
}
