use poise::serenity_prelude as serenity;
use tracing::info;

use crate::messages;
use crate::{Context, Error};

/// Add a role to the verification bypass list (admin only)
#[poise::command(slash_command, guild_only, check = "crate::commands::guard::admin_check")]
pub async fn bypass_add(
    ctx: Context<'_>,
    #[description = "Role whose holders skip verification"] role: serenity::Role,
) -> Result<(), Error> {
    let data = ctx.data();

    let added = {
        let mut registry = data.bypass.write().await;
        let added = registry.add(role.id);
        if added {
            registry.save(&data.config.bypass_roles_path()).await?;
        }
        added
    };

    if added {
        info!("Role {} added to bypass list by {}", role.id, ctx.author().id);
        ctx.send(
            poise::CreateReply::default()
                .content(format!("<@&{}> holders now skip verification.", role.id))
                .ephemeral(true),
        )
        .await?;
        messages::send_log(
            ctx.http(),
            &data.config,
            "Bypass role added",
            &format!("<@{}> added <@&{}> to the bypass list.", ctx.author().id, role.id),
            messages::COLOR_INFO,
        )
        .await;
    } else {
        ctx.send(
            poise::CreateReply::default()
                .content(format!("<@&{}> is already on the bypass list.", role.id))
                .ephemeral(true),
        )
        .await?;
    }
    Ok(())
}

/// Remove a role from the verification bypass list (admin only)
#[poise::command(slash_command, guild_only, check = "crate::commands::guard::admin_check")]
pub async fn bypass_remove(
    ctx: Context<'_>,
    #[description = "Role to remove from the bypass list"] role: serenity::Role,
) -> Result<(), Error> {
    let data = ctx.data();

    let removed = {
        let mut registry = data.bypass.write().await;
        let removed = registry.remove(role.id);
        if removed {
            registry.save(&data.config.bypass_roles_path()).await?;
        }
        removed
    };

    if removed {
        info!("Role {} removed from bypass list by {}", role.id, ctx.author().id);
        ctx.send(
            poise::CreateReply::default()
                .content(format!("<@&{}> holders go through verification again.", role.id))
                .ephemeral(true),
        )
        .await?;
        messages::send_log(
            ctx.http(),
            &data.config,
            "Bypass role removed",
            &format!(
                "<@{}> removed <@&{}> from the bypass list.",
                ctx.author().id,
                role.id
            ),
            messages::COLOR_WARNING,
        )
        .await;
    } else {
        ctx.send(
            poise::CreateReply::default()
                .content(format!("<@&{}> was not on the bypass list.", role.id))
                .ephemeral(true),
        )
        .await?;
    }
    Ok(())
}

/// Show the verification bypass list (admin only)
#[poise::command(slash_command, guild_only, check = "crate::commands::guard::admin_check")]
pub async fn bypass_list(ctx: Context<'_>) -> Result<(), Error> {
    let roles = ctx.data().bypass.read().await.all();

    let body = if roles.is_empty() {
        "No bypass roles configured; everyone goes through verification.".to_string()
    } else {
        roles
            .iter()
            .map(|r| format!("<@&{}>", r))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let embed = serenity::CreateEmbed::new()
        .title(format!("Bypass roles ({})", roles.len()))
        .description(body)
        .color(messages::COLOR_INFO);
    ctx.send(poise::CreateReply::default().embed(embed).ephemeral(true))
        .await?;
    Ok(())
}
