use std::time::Duration;

use poise::serenity_prelude::{ChannelId, GuildId, RoleId};
use tracing::warn;

/// Which completion mechanism gates access for new members.
///
/// The two flows share the pending-user store but are never run against the
/// same user: `Timeout` grants the fallback role after a fixed delay,
/// `Ticket` opens a private channel and grants on ticket auto-close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationFlow {
    Timeout,
    Ticket,
}

/// Runtime configuration, read once from the environment at startup.
///
/// Every numeric key fails closed: an absent or unparseable value disables
/// the dependent feature with a warning instead of crashing the process.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub guild_id: Option<GuildId>,

    /// Marker role added to members while they await verification.
    pub unverified_role_id: Option<RoleId>,

    /// Free/basic role granted on verification or after the timeout.
    pub member_role_id: Option<RoleId>,

    /// Paid/subscription roles that must not be grantable to an
    /// unverified user except via the flow or an admin override.
    pub gated_role_ids: Vec<RoleId>,

    pub logs_channel_id: Option<ChannelId>,
    pub welcome_channel_id: Option<ChannelId>,

    /// Category under which per-user ticket channels are created.
    pub ticket_category_id: Option<ChannelId>,
    /// Optional staff role granted visibility into ticket channels.
    pub ticket_staff_role_id: Option<RoleId>,

    pub booking_link: Option<String>,
    /// Personal access token for the booking provider API. Absent token
    /// disables booking verification; /verify then grants directly.
    pub booking_api_token: Option<String>,

    pub flow: VerificationFlow,

    /// Cooldown between verification entry attempts per user.
    pub entry_cooldown: Duration,
    /// Age at which an open ticket is closed and processed.
    pub ticket_auto_close: Duration,
    /// Interval between reconciliation sweeps.
    pub check_interval: Duration,
    /// Elapsed time after join at which the fallback role is granted.
    pub fallback_delay: Duration,
    /// Wait after role restoration before declaring it complete, to absorb
    /// platform propagation delay. Bounded; the reconciliation loop catches
    /// anything this misses.
    pub restore_grace: Duration,

    /// Directory holding the flat-file JSON stores.
    pub state_path: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            guild_id: None,
            unverified_role_id: None,
            member_role_id: None,
            gated_role_ids: Vec::new(),
            logs_channel_id: None,
            welcome_channel_id: None,
            ticket_category_id: None,
            ticket_staff_role_id: None,
            booking_link: None,
            booking_api_token: None,
            flow: VerificationFlow::Timeout,
            entry_cooldown: Duration::from_secs(30),
            ticket_auto_close: Duration::from_secs(3600),
            check_interval: Duration::from_secs(120),
            fallback_delay: Duration::from_secs(3600),
            restore_grace: Duration::from_secs(2),
            state_path: "state".to_string(),
        }
    }
}

impl BotConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let flow = match std::env::var("VERIFICATION_FLOW").ok().as_deref() {
            Some("ticket") => VerificationFlow::Ticket,
            Some("timeout") | None => VerificationFlow::Timeout,
            Some(other) => {
                warn!(
                    "Unknown VERIFICATION_FLOW '{}', falling back to timeout flow",
                    other
                );
                VerificationFlow::Timeout
            }
        };

        Self {
            guild_id: parse_id("GUILD_ID", env_var("GUILD_ID")).map(GuildId::new),
            unverified_role_id: parse_id("UNVERIFIED_ROLE_ID", env_var("UNVERIFIED_ROLE_ID"))
                .map(RoleId::new),
            member_role_id: parse_id("MEMBER_ROLE_ID", env_var("MEMBER_ROLE_ID")).map(RoleId::new),
            gated_role_ids: parse_id_list("PAID_ROLE_IDS", env_var("PAID_ROLE_IDS"))
                .into_iter()
                .map(RoleId::new)
                .collect(),
            logs_channel_id: parse_id("LOGS_CHANNEL_ID", env_var("LOGS_CHANNEL_ID"))
                .map(ChannelId::new),
            welcome_channel_id: parse_id("WELCOME_CHANNEL_ID", env_var("WELCOME_CHANNEL_ID"))
                .map(ChannelId::new),
            ticket_category_id: parse_id(
                "VERIFICATION_TICKETS_CATEGORY_ID",
                env_var("VERIFICATION_TICKETS_CATEGORY_ID"),
            )
            .map(ChannelId::new),
            ticket_staff_role_id: parse_id("TICKET_STAFF_ROLE_ID", env_var("TICKET_STAFF_ROLE_ID"))
                .map(RoleId::new),
            booking_link: env_var("CALL_BOOKING_LINK"),
            booking_api_token: env_var("BOOKING_API_TOKEN"),
            flow,
            entry_cooldown: parse_seconds(
                "VERIFICATION_COOLDOWN_SECONDS",
                env_var("VERIFICATION_COOLDOWN_SECONDS"),
                defaults.entry_cooldown,
            ),
            ticket_auto_close: parse_seconds(
                "TICKET_AUTO_CLOSE_SECONDS",
                env_var("TICKET_AUTO_CLOSE_SECONDS"),
                defaults.ticket_auto_close,
            ),
            check_interval: parse_seconds(
                "CHECK_INTERVAL_SECONDS",
                env_var("CHECK_INTERVAL_SECONDS"),
                defaults.check_interval,
            ),
            fallback_delay: parse_seconds(
                "FALLBACK_DELAY_SECONDS",
                env_var("FALLBACK_DELAY_SECONDS"),
                defaults.fallback_delay,
            ),
            restore_grace: parse_seconds(
                "RESTORE_GRACE_SECONDS",
                env_var("RESTORE_GRACE_SECONDS"),
                defaults.restore_grace,
            ),
            state_path: env_var("STATE_PATH").unwrap_or(defaults.state_path),
        }
    }

    /// True when the given role is in the gated/paid set.
    pub fn is_gated(&self, role_id: RoleId) -> bool {
        self.gated_role_ids.contains(&role_id)
    }

    pub fn pending_users_path(&self) -> String {
        format!("{}/pending_users.json", self.state_path)
    }

    pub fn tickets_path(&self) -> String {
        format!("{}/verification_tickets.json", self.state_path)
    }

    pub fn bypass_roles_path(&self) -> String {
        format!("{}/bypass_roles.json", self.state_path)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a Discord snowflake. Invalid values disable the feature (None).
fn parse_id(key: &str, raw: Option<String>) -> Option<u64> {
    let raw = raw?;
    match raw.trim().parse::<u64>() {
        Ok(id) if id > 0 => Some(id),
        _ => {
            warn!("{} is not a valid ID ('{}'), feature disabled", key, raw);
            None
        }
    }
}

/// Parse a comma-separated snowflake list, skipping invalid entries.
fn parse_id_list(key: &str, raw: Option<String>) -> Vec<u64> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    let mut ids = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.parse::<u64>() {
            Ok(id) if id > 0 => ids.push(id),
            _ => warn!("{} contains an invalid ID '{}', skipping", key, part),
        }
    }
    ids
}

/// Parse a duration in whole seconds, clamped to at least one second.
fn parse_seconds(key: &str, raw: Option<String>, default: Duration) -> Duration {
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs.max(1)),
        Err(_) => {
            warn!(
                "{} is not a valid number of seconds ('{}'), using default {}s",
                key,
                raw,
                default.as_secs()
            );
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_valid() {
        assert_eq!(
            parse_id("GUILD_ID", Some("123456789012345678".to_string())),
            Some(123456789012345678)
        );
    }

    #[test]
    fn test_parse_id_fails_closed() {
        assert_eq!(parse_id("GUILD_ID", Some("not-a-number".to_string())), None);
        assert_eq!(parse_id("GUILD_ID", Some("0".to_string())), None);
        assert_eq!(parse_id("GUILD_ID", None), None);
    }

    #[test]
    fn test_parse_id_list_skips_invalid_entries() {
        let ids = parse_id_list("PAID_ROLE_IDS", Some("111, 222,abc,,333".to_string()));
        assert_eq!(ids, vec![111, 222, 333]);
    }

    #[test]
    fn test_parse_id_list_empty() {
        assert!(parse_id_list("PAID_ROLE_IDS", None).is_empty());
        assert!(parse_id_list("PAID_ROLE_IDS", Some("  ".to_string())).is_empty());
    }

    #[test]
    fn test_parse_seconds_default_and_minimum() {
        let default = Duration::from_secs(120);
        assert_eq!(parse_seconds("X", None, default), default);
        assert_eq!(parse_seconds("X", Some("bogus".to_string()), default), default);
        // Clamp to at least one second.
        assert_eq!(
            parse_seconds("X", Some("0".to_string()), default),
            Duration::from_secs(1)
        );
        assert_eq!(
            parse_seconds("X", Some("45".to_string()), default),
            Duration::from_secs(45)
        );
    }
}
