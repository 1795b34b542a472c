use parking_lot::Mutex;
use poise::serenity_prelude::UserId;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::error_reference;
use crate::{Context, Error};

const ADMIN_RATE_LIMIT: usize = 10;
const ADMIN_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Outcome of the admin authorization gate.
///
/// Every deny variant fails closed: if we cannot prove the caller is an
/// administrator, they are not one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    DenyNotAdmin,
    DenyRateLimited { retry_after: Duration },
    /// Permissions could not be resolved (guild fetch failed, DM context)
    DenyUnverifiable,
}

/// Sliding-window rate limiter keyed by user.
pub struct RateLimiter {
    max: usize,
    window: Duration,
    hits: Mutex<HashMap<UserId, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record an attempt. Returns the wait time when the user is over
    /// the limit; the rejected attempt does not count against them.
    pub fn check(&self, user_id: UserId) -> Option<Duration> {
        self.check_at(user_id, Instant::now())
    }

    fn check_at(&self, user_id: UserId, now: Instant) -> Option<Duration> {
        let mut hits = self.hits.lock();
        let entry = hits.entry(user_id).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);

        if entry.len() >= self.max {
            let oldest = entry[0];
            return Some(self.window.saturating_sub(now.duration_since(oldest)));
        }
        entry.push(now);
        None
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(ADMIN_RATE_LIMIT, ADMIN_RATE_WINDOW)
    }
}

/// Decide whether the calling user may run an admin command.
pub async fn authorize(ctx: &Context<'_>) -> AuthDecision {
    let Some(guild_id) = ctx.guild_id() else {
        return AuthDecision::DenyUnverifiable;
    };
    let author = ctx.author().id;

    if let Some(retry_after) = ctx.data().admin_rate_limiter.check(author) {
        return AuthDecision::DenyRateLimited { retry_after };
    }

    let guild = match guild_id.to_partial_guild(ctx.http()).await {
        Ok(guild) => guild,
        Err(e) => {
            warn!("Could not fetch guild for admin check: {}", e);
            return AuthDecision::DenyUnverifiable;
        }
    };
    let member = match guild.member(ctx.http(), author).await {
        Ok(member) => member,
        Err(e) => {
            warn!("Could not fetch member {} for admin check: {}", author, e);
            return AuthDecision::DenyUnverifiable;
        }
    };

    #[allow(deprecated)]
    let permissions = guild.member_permissions(&member);
    if permissions.administrator() {
        AuthDecision::Allow
    } else {
        AuthDecision::DenyNotAdmin
    }
}

/// poise command check for admin-only commands. Denials get an ephemeral
/// reply carrying a short reference so users can report the incident
/// without the logs leaking into chat.
pub async fn admin_check(ctx: Context<'_>) -> Result<bool, Error> {
    match authorize(&ctx).await {
        AuthDecision::Allow => Ok(true),
        AuthDecision::DenyNotAdmin => {
            let reference = error_reference();
            warn!(
                "User {} denied admin command '{}' (ref {})",
                ctx.author().id,
                ctx.command().qualified_name,
                reference
            );
            crate::messages::send_log(
                ctx.http(),
                &ctx.data().config,
                "Unauthorized admin command",
                &format!(
                    "<@{}> tried `/{}` without Administrator. (ref: {})",
                    ctx.author().id,
                    ctx.command().qualified_name,
                    reference
                ),
                crate::messages::COLOR_WARNING,
            )
            .await;
            ctx.send(
                poise::CreateReply::default()
                    .content(format!(
                        "You need Administrator to use this command. (ref: {})",
                        reference
                    ))
                    .ephemeral(true),
            )
            .await?;
            Ok(false)
        }
        AuthDecision::DenyRateLimited { retry_after } => {
            ctx.send(
                poise::CreateReply::default()
                    .content(format!(
                        "Slow down: try again in {} second(s).",
                        retry_after.as_secs().max(1)
                    ))
                    .ephemeral(true),
            )
            .await?;
            Ok(false)
        }
        AuthDecision::DenyUnverifiable => {
            let reference = error_reference();
            warn!(
                "Could not verify permissions of {} for '{}' (ref {})",
                ctx.author().id,
                ctx.command().qualified_name,
                reference
            );
            ctx.send(
                poise::CreateReply::default()
                    .content(format!(
                        "Could not verify your permissions, please try again. (ref: {})",
                        reference
                    ))
                    .ephemeral(true),
            )
            .await?;
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_allows_under_limit() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let user = UserId::new(1);
        assert!(limiter.check(user).is_none());
        assert!(limiter.check(user).is_none());
        assert!(limiter.check(user).is_none());
        assert!(limiter.check(user).is_some());
    }

    #[test]
    fn test_rate_limiter_is_per_user() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check(UserId::new(1)).is_none());
        assert!(limiter.check(UserId::new(2)).is_none());
        assert!(limiter.check(UserId::new(1)).is_some());
    }

    #[test]
    fn test_rate_limiter_window_expires() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let user = UserId::new(1);
        let start = Instant::now();

        assert!(limiter.check_at(user, start).is_none());
        let retry = limiter.check_at(user, start + Duration::from_secs(10)).unwrap();
        assert!(retry <= Duration::from_secs(50));
        // Past the window the user is clean again.
        assert!(limiter
            .check_at(user, start + Duration::from_secs(61))
            .is_none());
    }
}
