use crate::{Context, Error};

/// Check if the bot is responsive
#[poise::command(slash_command)]
pub async fn ping(ctx: Context<'_>) -> Result<(), Error> {
    let start = std::time::Instant::now();
    let reply = ctx.say("Pong!").await?;
    let elapsed = start.elapsed();
    reply
        .edit(
            ctx,
            poise::CreateReply::default().content(format!("Pong! ({}ms)", elapsed.as_millis())),
        )
        .await?;
    Ok(())
}

/// Show help for available commands
#[poise::command(slash_command)]
pub async fn help(
    ctx: Context<'_>,
    #[description = "Command to get help for"] command: Option<String>,
) -> Result<(), Error> {
    poise::builtins::help(
        ctx,
        command.as_deref(),
        poise::builtins::HelpConfiguration {
            extra_text_at_bottom: "Start with /start_verification to unlock the community.",
            ephemeral: true,
            ..Default::default()
        },
    )
    .await?;
    Ok(())
}
