use chrono::Utc;
use dashmap::DashMap;
use poise::serenity_prelude::{
    ChannelId, ChannelType, CreateChannel, GuildId, Http, PermissionOverwrite,
    PermissionOverwriteType, Permissions, RoleId, UserId,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::BotConfig;
use crate::error::{BotError, Result};
use crate::state::{SharedTicketStore, TicketRecord};

/// Channel names accept a narrow character set; everything else collapses
/// to a dash.
const MAX_CHANNEL_NAME_LEN: usize = 32;

/// Creates and tears down per-user verification ticket channels.
///
/// At most one open ticket per user, enforced through the durable ticket
/// store. Entry attempts are rate limited per user in memory only; a
/// restart resets the cooldowns, which is acceptable for an anti-spam
/// measure.
pub struct TicketManager {
    config: Arc<BotConfig>,
    tickets: SharedTicketStore,
    last_attempt: DashMap<UserId, Instant>,
}

impl TicketManager {
    pub fn new(config: Arc<BotConfig>, tickets: SharedTicketStore) -> Self {
        Self {
            config,
            tickets,
            last_attempt: DashMap::new(),
        }
    }

    /// Remaining cooldown for a user, updating the attempt timestamp when
    /// the user is allowed through.
    pub fn check_cooldown(&self, user_id: UserId) -> Option<Duration> {
        let now = Instant::now();
        if let Some(last) = self.last_attempt.get(&user_id) {
            let elapsed = now.duration_since(*last);
            if elapsed < self.config.entry_cooldown {
                return Some(self.config.entry_cooldown - elapsed);
            }
        }
        self.last_attempt.insert(user_id, now);
        None
    }

    /// Open a private ticket channel for a user.
    ///
    /// Visible to the user, the bot, and the optional staff role; hidden
    /// from everyone else. Fails with `DuplicateTicket` when the user
    /// already has one open, and the existing channel is left untouched.
    pub async fn open_ticket(
        &self,
        http: &Http,
        guild_id: GuildId,
        user_id: UserId,
        user_name: &str,
        bot_id: UserId,
    ) -> Result<ChannelId> {
        {
            let tickets = self.tickets.read().await;
            if tickets.get(&user_id.to_string()).is_some() {
                return Err(BotError::DuplicateTicket { user_id });
            }
        }

        let name = sanitize_channel_name(&format!("verify-{}", user_name));
        let overwrites = self.ticket_overwrites(guild_id, user_id, bot_id);

        let mut builder = CreateChannel::new(name)
            .kind(ChannelType::Text)
            .permissions(overwrites);
        if let Some(category) = self.config.ticket_category_id {
            builder = builder.category(category);
        }

        let channel = guild_id.create_channel(http, builder).await?;

        let inserted = {
            let mut tickets = self.tickets.write().await;
            let inserted = tickets.insert(
                &user_id.to_string(),
                TicketRecord {
                    channel_id: channel.id,
                    created_at: Utc::now(),
                },
            );
            if inserted {
                if let Err(e) = tickets.save(&self.config.tickets_path()).await {
                    warn!("Could not persist ticket store: {}", e);
                }
            }
            inserted
        };

        // Lost a race with a concurrent open for the same user: the
        // stored ticket wins, this channel goes away.
        if !inserted {
            if let Err(e) = channel.delete(http).await {
                warn!("Could not delete duplicate ticket channel {}: {}", channel.id, e);
            }
            return Err(BotError::DuplicateTicket { user_id });
        }

        info!(
            "Opened verification ticket {} for user {}",
            channel.id, user_id
        );
        Ok(channel.id)
    }

    /// Close a ticket channel and drop its store entry.
    pub async fn close_ticket(&self, http: &Http, user_id: UserId) -> Option<ChannelId> {
        let removed = {
            let mut tickets = self.tickets.write().await;
            let removed = tickets.remove(&user_id.to_string());
            if removed.is_some() {
                if let Err(e) = tickets.save(&self.config.tickets_path()).await {
                    warn!("Could not persist ticket store: {}", e);
                }
            }
            removed
        };

        let channel_id = removed.map(|t| t.channel_id)?;
        if let Err(e) = channel_id.delete(http).await {
            warn!("Could not delete ticket channel {}: {}", channel_id, e);
        }
        Some(channel_id)
    }

    fn ticket_overwrites(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        bot_id: UserId,
    ) -> Vec<PermissionOverwrite> {
        let member_perms = Permissions::VIEW_CHANNEL
            | Permissions::SEND_MESSAGES
            | Permissions::READ_MESSAGE_HISTORY;

        let mut overwrites = vec![
            // @everyone shares the guild's ID.
            PermissionOverwrite {
                allow: Permissions::empty(),
                deny: Permissions::VIEW_CHANNEL,
                kind: PermissionOverwriteType::Role(RoleId::new(guild_id.get())),
            },
            PermissionOverwrite {
                allow: member_perms,
                deny: Permissions::empty(),
                kind: PermissionOverwriteType::Member(user_id),
            },
            PermissionOverwrite {
                allow: member_perms | Permissions::MANAGE_CHANNELS,
                deny: Permissions::empty(),
                kind: PermissionOverwriteType::Member(bot_id),
            },
        ];

        if let Some(staff) = self.config.ticket_staff_role_id {
            overwrites.push(PermissionOverwrite {
                allow: member_perms,
                deny: Permissions::empty(),
                kind: PermissionOverwriteType::Role(staff),
            });
        }

        overwrites
    }
}

/// Lowercase, keep `[a-z0-9-]`, collapse runs of dashes, trim to the
/// platform-safe length. Falls back to "verify-member" when nothing
/// usable remains.
pub fn sanitize_channel_name(raw: &str) -> String {
    let mut name = String::with_capacity(raw.len());
    let mut last_dash = true;
    for c in raw.chars().flat_map(|c| c.to_lowercase()) {
        if c.is_ascii_alphanumeric() {
            name.push(c);
            last_dash = false;
        } else if !last_dash {
            name.push('-');
            last_dash = true;
        }
    }
    while name.ends_with('-') {
        name.pop();
    }
    name.truncate(MAX_CHANNEL_NAME_LEN);
    while name.ends_with('-') {
        name.pop();
    }
    if name.is_empty() {
        "verify-member".to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_channel_name_basic() {
        assert_eq!(sanitize_channel_name("verify-Alice"), "verify-alice");
        assert_eq!(sanitize_channel_name("verify-bob_99"), "verify-bob-99");
    }

    #[test]
    fn test_sanitize_channel_name_collapses_junk() {
        assert_eq!(
            sanitize_channel_name("verify-??weird!! name"),
            "verify-weird-name"
        );
        // Nothing usable left.
        assert_eq!(sanitize_channel_name("???"), "verify-member");
    }

    #[test]
    fn test_sanitize_channel_name_truncates() {
        let long = format!("verify-{}", "a".repeat(100));
        let name = sanitize_channel_name(&long);
        assert!(name.len() <= MAX_CHANNEL_NAME_LEN);
        assert!(!name.ends_with('-'));
    }

    #[tokio::test]
    async fn test_cooldown_blocks_rapid_attempts() {
        use crate::state::{create_shared_ticket_store, TicketStore};

        let config = Arc::new(BotConfig {
            entry_cooldown: Duration::from_secs(30),
            ..BotConfig::default()
        });
        let manager = TicketManager::new(config, create_shared_ticket_store(TicketStore::new()));

        let user = UserId::new(42);
        assert!(manager.check_cooldown(user).is_none());
        // Immediate retry is rejected with time remaining.
        let remaining = manager.check_cooldown(user).unwrap();
        assert!(remaining <= Duration::from_secs(30));

        // Other users are unaffected.
        assert!(manager.check_cooldown(UserId::new(43)).is_none());
    }
}
