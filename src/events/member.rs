use poise::serenity_prelude as serenity;
use tracing::{debug, info};

use crate::managers::verification::JoinOutcome;
use crate::messages;
use crate::{Data, Error};

/// Handle a new member joining the guild.
///
/// The verification manager decides between bypass and tracking; this
/// layer only adds the user-facing messaging around that decision.
pub async fn handle_member_add(
    ctx: &serenity::Context,
    new_member: &serenity::Member,
    data: &Data,
) -> Result<(), Error> {
    let user_id = new_member.user.id;
    info!(
        "New member joined: {} ({})",
        new_member.user.name, user_id
    );

    let outcome = data
        .verification
        .handle_member_join(&ctx.http, new_member)
        .await;

    match outcome {
        JoinOutcome::Bypassed => {
            messages::send_log(
                &ctx.http,
                &data.config,
                "Member bypassed verification",
                &format!("<@{}> joined with a bypass role.", user_id),
                messages::COLOR_INFO,
            )
            .await;
        }
        JoinOutcome::Tracked { stripped } => {
            let welcome = serenity::CreateMessage::new().content(format!(
                "**Welcome, <@{}>!**\n\n\
                 To unlock the community, start verification with `/start_verification`.\n\
                 If you were here before, your roles are safe and come back once you're verified.",
                user_id
            ));
            if let Some(channel) = data.config.welcome_channel_id {
                messages::send_to_channel(&ctx.http, channel, welcome).await;
            } else {
                messages::send_dm(&ctx.http, user_id, welcome).await;
            }

            messages::send_log(
                &ctx.http,
                &data.config,
                "Member awaiting verification",
                &format!(
                    "<@{}> joined; {} role(s) held for restoration.",
                    user_id,
                    stripped.len()
                ),
                messages::COLOR_INFO,
            )
            .await;
        }
    }

    Ok(())
}

/// Handle a member leaving: clear all verification tracking.
pub async fn handle_member_remove(
    ctx: &serenity::Context,
    guild_id: serenity::GuildId,
    user: &serenity::User,
    data: &Data,
) -> Result<(), Error> {
    debug!("Member left guild {}: {}", guild_id, user.id);
    data.verification.handle_member_leave(&ctx.http, user.id).await;
    Ok(())
}

/// Handle a role update: feed the interference guard.
///
/// Without the previous member snapshot (uncached member) we cannot tell
/// what was added, so the event is dropped and the reconciliation loop
/// picks up anything that slipped through.
pub async fn handle_member_update(
    ctx: &serenity::Context,
    old_if_available: &Option<serenity::Member>,
    event: &serenity::GuildMemberUpdateEvent,
    data: &Data,
) -> Result<(), Error> {
    let Some(old) = old_if_available else {
        debug!(
            "No cached snapshot for member update of {}, leaving to reconciliation",
            event.user.id
        );
        return Ok(());
    };

    data.verification
        .handle_role_update(
            &ctx.http,
            event.guild_id,
            event.user.id,
            &old.roles,
            &event.roles,
        )
        .await;

    Ok(())
}
