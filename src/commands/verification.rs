use poise::serenity_prelude as serenity;
use tracing::{info, warn};

use crate::config::VerificationFlow;
use crate::messages;
use crate::{Context, Error};

/// Enter the verification flow
#[poise::command(slash_command, guild_only)]
pub async fn start_verification(ctx: Context<'_>) -> Result<(), Error> {
    let data = ctx.data();
    let user_id = ctx.author().id;
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };

    if !data.verification.is_tracked(user_id) {
        ctx.send(
            poise::CreateReply::default()
                .content("You're all set already, no verification needed.")
                .ephemeral(true),
        )
        .await?;
        return Ok(());
    }

    if let Some(remaining) = data.ticket_manager.check_cooldown(user_id) {
        ctx.send(
            poise::CreateReply::default()
                .content(format!(
                    "Please wait {} second(s) before trying again.",
                    remaining.as_secs().max(1)
                ))
                .ephemeral(true),
        )
        .await?;
        return Ok(());
    }

    ctx.defer_ephemeral().await?;

    match data.config.flow {
        VerificationFlow::Ticket => {
            let bot_id = ctx.serenity_context().cache.current_user().id;
            match data
                .ticket_manager
                .open_ticket(ctx.http(), guild_id, user_id, &ctx.author().name, bot_id)
                .await
            {
                Ok(channel_id) => {
                    data.verification.attach_ticket(user_id, channel_id);
                    messages::send_to_channel(
                        ctx.http(),
                        channel_id,
                        messages::ticket_intro(user_id, data.config.booking_link.as_deref()),
                    )
                    .await;
                    ctx.say(format!("Your verification channel is ready: <#{}>", channel_id))
                        .await?;
                }
                Err(crate::error::BotError::DuplicateTicket { .. }) => {
                    ctx.say("You already have an open verification channel.").await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        VerificationFlow::Timeout => {
            data.verification.begin_verification(user_id);
            let mut content = String::from(
                "Verification started! Run `/verify` with the email you booked with \
                 once your call is confirmed.",
            );
            if let Some(link) = &data.config.booking_link {
                content.push_str(&format!("\nBook here: {}", link));
            }
            ctx.say(content).await?;
        }
    }

    Ok(())
}

/// Complete verification and restore your roles
#[poise::command(slash_command, guild_only)]
pub async fn verify(
    ctx: Context<'_>,
    #[description = "Email address you booked your call with"] email: String,
) -> Result<(), Error> {
    let data = ctx.data();
    let user_id = ctx.author().id;
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };

    if !data.verification.is_tracked(user_id) {
        ctx.send(
            poise::CreateReply::default()
                .content("You're not awaiting verification.")
                .ephemeral(true),
        )
        .await?;
        return Ok(());
    }

    ctx.defer_ephemeral().await?;

    if data.booking.is_configured() {
        match data.booking.has_booking(&email).await {
            Ok(true) => {}
            Ok(false) => {
                ctx.say(
                    "No active booking found for that email. Make sure you've \
                     booked your call and used the same email address.",
                )
                .await?;
                return Ok(());
            }
            Err(e) => {
                warn!("Booking lookup failed for user {}: {}", user_id, e);
                ctx.say("Couldn't reach the booking system right now, please try again later.")
                    .await?;
                return Ok(());
            }
        }
    } else {
        info!("Booking checker not configured, granting /verify for {} directly", user_id);
    }

    data.verification.begin_verification(user_id);
    let report = data
        .verification
        .restore_member_roles(ctx.http(), guild_id, user_id)
        .await;

    if report.is_noop() && !data.verification.is_tracked(user_id) {
        ctx.say("You're verified! No stored roles needed restoring.").await?;
    } else {
        ctx.say(format!(
            "You're verified! Restored {} role(s).{}",
            report.granted.len(),
            if report.failed.is_empty() {
                String::new()
            } else {
                format!(" {} role(s) could not be granted; staff have been notified.", report.failed.len())
            }
        ))
        .await?;
    }

    messages::send_dm(ctx.http(), user_id, messages::verified_dm()).await;
    messages::send_log(
        ctx.http(),
        &data.config,
        "Member verified",
        &format!(
            "<@{}> completed verification: {} restored, {} missing, {} failed.",
            user_id,
            report.granted.len(),
            report.missing.len(),
            report.failed.len()
        ),
        messages::COLOR_SUCCESS,
    )
    .await;

    Ok(())
}

/// Manually verify a member and restore their roles (admin only)
#[poise::command(slash_command, guild_only, check = "crate::commands::guard::admin_check")]
pub async fn force_verify(
    ctx: Context<'_>,
    #[description = "Member to verify"] user: serenity::User,
) -> Result<(), Error> {
    let data = ctx.data();
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };

    ctx.defer_ephemeral().await?;

    if !data.verification.is_tracked(user.id) {
        ctx.say(format!("<@{}> is not awaiting verification.", user.id)).await?;
        return Ok(());
    }

    data.verification.begin_verification(user.id);
    let report = data
        .verification
        .restore_member_roles(ctx.http(), guild_id, user.id)
        .await;

    let mut lines = vec![format!(
        "Verified <@{}>: restored {} role(s).",
        user.id,
        report.granted.len()
    )];
    if !report.missing.is_empty() {
        lines.push(format!(
            "{} stored role(s) no longer exist and were skipped.",
            report.missing.len()
        ));
    }
    if !report.failed.is_empty() {
        lines.push(format!("{} role(s) could not be granted.", report.failed.len()));
    }
    ctx.say(lines.join("\n")).await?;

    messages::send_log(
        ctx.http(),
        &data.config,
        "Member force-verified",
        &format!("<@{}> was verified by <@{}>.", user.id, ctx.author().id),
        messages::COLOR_SUCCESS,
    )
    .await;

    Ok(())
}

/// List members currently awaiting verification (admin only)
#[poise::command(slash_command, guild_only, check = "crate::commands::guard::admin_check")]
pub async fn check_pending(ctx: Context<'_>) -> Result<(), Error> {
    let snapshots = ctx.data().verification.list_pending();

    if snapshots.is_empty() {
        ctx.send(
            poise::CreateReply::default()
                .content("Nobody is awaiting verification.")
                .ephemeral(true),
        )
        .await?;
        return Ok(());
    }

    let mut body = String::new();
    for snapshot in snapshots.iter().take(25) {
        body.push_str(&format!(
            "<@{}> joined <t:{}:R>, {} stored role(s){}\n",
            snapshot.user_id,
            snapshot.joined_at.timestamp(),
            snapshot.original_roles.len(),
            if snapshot.started_verification { ", in progress" } else { "" }
        ));
    }
    if snapshots.len() > 25 {
        body.push_str(&format!("...and {} more", snapshots.len() - 25));
    }

    let embed = serenity::CreateEmbed::new()
        .title(format!("Awaiting verification ({})", snapshots.len()))
        .description(body)
        .color(messages::COLOR_INFO);
    ctx.send(poise::CreateReply::default().embed(embed).ephemeral(true))
        .await?;
    Ok(())
}

/// Show the stored verification record for a member (admin only)
#[poise::command(slash_command, guild_only, check = "crate::commands::guard::admin_check")]
pub async fn check_stored_roles(
    ctx: Context<'_>,
    #[description = "Member to inspect"] user: serenity::User,
) -> Result<(), Error> {
    let Some(snapshot) = ctx.data().verification.debug_dump(user.id) else {
        ctx.send(
            poise::CreateReply::default()
                .content(format!("No verification record for <@{}>.", user.id))
                .ephemeral(true),
        )
        .await?;
        return Ok(());
    };

    let roles = if snapshot.original_roles.is_empty() {
        "(none)".to_string()
    } else {
        snapshot
            .original_roles
            .iter()
            .map(|r| format!("<@&{}>", r))
            .collect::<Vec<_>>()
            .join(" ")
    };

    let embed = serenity::CreateEmbed::new()
        .title(format!("Verification record for {}", user.name))
        .field("State", format!("{:?}", snapshot.state), true)
        .field("Started", snapshot.started_verification.to_string(), true)
        .field("Joined", format!("<t:{}:R>", snapshot.joined_at.timestamp()), true)
        .field("Stored roles", roles, false)
        .field(
            "Ticket",
            snapshot
                .ticket_channel
                .map(|c| format!("<#{}>", c))
                .unwrap_or_else(|| "(none)".to_string()),
            true,
        )
        .color(messages::COLOR_INFO);
    ctx.send(poise::CreateReply::default().embed(embed).ephemeral(true))
        .await?;
    Ok(())
}

/// Remove tracking for members who already left (admin only)
#[poise::command(slash_command, guild_only, check = "crate::commands::guard::admin_check")]
pub async fn cleanup_tracking(ctx: Context<'_>) -> Result<(), Error> {
    let data = ctx.data();
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };

    ctx.defer_ephemeral().await?;

    // Page through the full member list; tracked sets are small but the
    // guild may not be.
    let mut present = std::collections::HashSet::new();
    let mut after: Option<serenity::UserId> = None;
    loop {
        let page = guild_id.members(ctx.http(), Some(1000), after).await?;
        let Some(last) = page.last() else { break };
        after = Some(last.user.id);
        let full_page = page.len() == 1000;
        present.extend(page.into_iter().map(|m| m.user.id));
        if !full_page {
            break;
        }
    }

    let report = data.verification.cleanup_stale(&present).await;
    for channel_id in &report.orphan_channels {
        if let Err(e) = channel_id.delete(ctx.http()).await {
            warn!("Could not delete orphaned ticket channel {}: {}", channel_id, e);
        }
    }

    ctx.say(format!(
        "Cleanup done: removed {} stale record(s) and {} orphaned ticket(s).",
        report.records_removed, report.tickets_removed
    ))
    .await?;
    Ok(())
}

/// Verification system overview (admin only)
#[poise::command(slash_command, guild_only, check = "crate::commands::guard::admin_check")]
pub async fn verification_stats(ctx: Context<'_>) -> Result<(), Error> {
    let data = ctx.data();
    ctx.defer_ephemeral().await?;

    let awaiting = data.verification.awaiting_count();
    let in_flight = data.verification.being_verified_count();
    let open_tickets = data.tickets.read().await.len();
    let bypass_count = data.bypass.read().await.len();

    let mut embed = serenity::CreateEmbed::new()
        .title("Verification stats")
        .field("Awaiting verification", awaiting.to_string(), true)
        .field("Restores in flight", in_flight.to_string(), true)
        .field("Open tickets", open_tickets.to_string(), true)
        .field("Bypass roles", bypass_count.to_string(), true)
        .color(messages::COLOR_INFO);

    if data.booking.is_configured() {
        match data.booking.active_booking_count().await {
            Ok(count) => {
                embed = embed.field("Active bookings", count.to_string(), true);
            }
            Err(e) => warn!("Could not fetch booking count: {}", e),
        }
    }

    ctx.send(poise::CreateReply::default().embed(embed).ephemeral(true))
        .await?;
    Ok(())
}
