use poise::serenity_prelude::{self as serenity, GuildId, Http, RoleId, UserId};
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::error::Result;

/// How many times an idempotent role mutation is attempted before the
/// failure is reported. Transient platform errors (rate limit, blip) are
/// absorbed here; the reconciliation loop catches anything that slips.
const ROLE_MUTATION_ATTEMPTS: u32 = 2;

/// Who last changed a member's roles, according to the audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleChangeActor {
    /// A human member holding Administrator
    HumanAdmin(UserId),
    /// Another bot or integration
    Bot(UserId),
    /// A human without Administrator
    NonAdmin(UserId),
    /// Audit log unavailable, empty, or racy. Callers must treat this
    /// as non-admin (deny rather than allow a bypass).
    Unknown,
}

/// Outcome of granting a batch of roles
#[derive(Debug, Clone, Default)]
pub struct RoleGrantOutcome {
    pub granted: Vec<RoleId>,
    pub failed: Vec<RoleId>,
}

/// Wraps the platform's role directory: add/remove roles with an audit
/// reason, enumerate guild roles, and resolve role-change provenance.
pub struct RoleManager;

impl RoleManager {
    pub fn new() -> Self {
        Self
    }

    /// Add a single role to a member, with bounded retries.
    pub async fn add_role(
        &self,
        http: &Http,
        guild_id: GuildId,
        user_id: UserId,
        role_id: RoleId,
        reason: &str,
    ) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=ROLE_MUTATION_ATTEMPTS {
            match http
                .add_member_role(guild_id, user_id, role_id, Some(reason))
                .await
            {
                Ok(()) => {
                    debug!("Added role {} to user {}", role_id, user_id);
                    return Ok(());
                }
                Err(e) => {
                    if attempt < ROLE_MUTATION_ATTEMPTS {
                        debug!(
                            "Retrying role add {} for user {} after error: {}",
                            role_id, user_id, e
                        );
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .map(Into::into)
            .unwrap_or_else(|| crate::error::BotError::Internal {
                message: "role add failed without an error".to_string(),
            }))
    }

    /// Remove a single role from a member, with bounded retries.
    pub async fn remove_role(
        &self,
        http: &Http,
        guild_id: GuildId,
        user_id: UserId,
        role_id: RoleId,
        reason: &str,
    ) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=ROLE_MUTATION_ATTEMPTS {
            match http
                .remove_member_role(guild_id, user_id, role_id, Some(reason))
                .await
            {
                Ok(()) => {
                    debug!("Removed role {} from user {}", role_id, user_id);
                    return Ok(());
                }
                Err(e) => {
                    if attempt < ROLE_MUTATION_ATTEMPTS {
                        debug!(
                            "Retrying role remove {} for user {} after error: {}",
                            role_id, user_id, e
                        );
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .map(Into::into)
            .unwrap_or_else(|| crate::error::BotError::Internal {
                message: "role remove failed without an error".to_string(),
            }))
    }

    /// Grant a batch of roles, reporting which succeeded and which failed.
    /// Individual failures are logged and do not abort the batch.
    pub async fn add_roles(
        &self,
        http: &Http,
        guild_id: GuildId,
        user_id: UserId,
        role_ids: &[RoleId],
        reason: &str,
    ) -> RoleGrantOutcome {
        let mut outcome = RoleGrantOutcome::default();
        for role_id in role_ids {
            match self.add_role(http, guild_id, user_id, *role_id, reason).await {
                Ok(()) => outcome.granted.push(*role_id),
                Err(e) => {
                    warn!(
                        "Failed to add role {} to user {} in guild {}: {}",
                        role_id, user_id, guild_id, e
                    );
                    outcome.failed.push(*role_id);
                }
            }
        }
        outcome
    }

    /// Strip a batch of roles best-effort, returning those removed.
    pub async fn remove_roles(
        &self,
        http: &Http,
        guild_id: GuildId,
        user_id: UserId,
        role_ids: &[RoleId],
        reason: &str,
    ) -> Vec<RoleId> {
        let mut removed = Vec::new();
        for role_id in role_ids {
            match self
                .remove_role(http, guild_id, user_id, *role_id, reason)
                .await
            {
                Ok(()) => removed.push(*role_id),
                Err(e) => {
                    warn!(
                        "Failed to remove role {} from user {} in guild {}: {}",
                        role_id, user_id, guild_id, e
                    );
                }
            }
        }
        removed
    }

    /// All role IDs currently defined in the guild.
    pub async fn guild_role_ids(&self, http: &Http, guild_id: GuildId) -> Result<HashSet<RoleId>> {
        let roles = guild_id.roles(http).await?;
        Ok(roles.keys().copied().collect())
    }

    /// Resolve who performed the most recent role change targeting `target`.
    ///
    /// Inspects the guild audit log for member-role-update entries. Any
    /// failure (missing VIEW_AUDIT_LOG, empty log, entry race) yields
    /// `Unknown`; the verification guard treats that as non-admin.
    pub async fn last_role_actor(
        &self,
        http: &Http,
        guild_id: GuildId,
        target: UserId,
    ) -> RoleChangeActor {
        use serenity::model::guild::audit_log::{Action, MemberAction};

        let logs = match guild_id
            .audit_logs(
                http,
                Some(Action::Member(MemberAction::RoleUpdate)),
                None,
                None,
                Some(10),
            )
            .await
        {
            Ok(logs) => logs,
            Err(e) => {
                warn!(
                    "Audit log lookup failed for user {} in guild {}: {}",
                    target, guild_id, e
                );
                return RoleChangeActor::Unknown;
            }
        };

        let entry = logs
            .entries
            .iter()
            .find(|entry| entry.target_id.map(|t| t.get()) == Some(target.get()));

        let Some(entry) = entry else {
            return RoleChangeActor::Unknown;
        };
        let actor_id = entry.user_id;

        // The audit response carries the actor user objects, so the bot
        // flag is available without another fetch.
        if let Some(actor) = logs.users.iter().find(|u| u.1.id == actor_id) {
            if actor.1.bot {
                return RoleChangeActor::Bot(actor_id);
            }
        }

        match self.actor_is_admin(http, guild_id, actor_id).await {
            Ok(true) => RoleChangeActor::HumanAdmin(actor_id),
            Ok(false) => RoleChangeActor::NonAdmin(actor_id),
            Err(e) => {
                warn!(
                    "Could not resolve permissions of audit actor {}: {}",
                    actor_id, e
                );
                RoleChangeActor::Unknown
            }
        }
    }

    async fn actor_is_admin(
        &self,
        http: &Http,
        guild_id: GuildId,
        actor_id: UserId,
    ) -> Result<bool> {
        let guild = guild_id.to_partial_guild(http).await?;
        let member = guild.member(http, actor_id).await?;
        #[allow(deprecated)]
        let permissions = guild.member_permissions(&member);
        Ok(permissions.administrator())
    }
}

impl Default for RoleManager {
    fn default() -> Self {
        Self::new()
    }
}
