use crate::{Context, Error};

const MAX_LOG_LINES: usize = 50;
const MAX_REPLY_LEN: usize = 1900;

/// Show recent log entries (admin only)
#[poise::command(slash_command, guild_only, check = "crate::commands::guard::admin_check")]
pub async fn debug_logs(
    ctx: Context<'_>,
    #[description = "Number of entries (max 50)"] count: Option<usize>,
) -> Result<(), Error> {
    let count = count.unwrap_or(20).min(MAX_LOG_LINES);
    let entries = ctx.data().log_buffer.get_recent(count);

    if entries.is_empty() {
        ctx.send(
            poise::CreateReply::default()
                .content("The log buffer is empty.")
                .ephemeral(true),
        )
        .await?;
        return Ok(());
    }

    // Fit into one message: drop oldest lines first.
    let mut lines: Vec<String> = entries.iter().map(|e| e.format()).collect();
    let mut body = lines.join("\n");
    while body.len() > MAX_REPLY_LEN && lines.len() > 1 {
        lines.remove(0);
        body = lines.join("\n");
    }

    ctx.send(
        poise::CreateReply::default()
            .content(format!("```\n{}\n```", body))
            .ephemeral(true),
    )
    .await?;
    Ok(())
}
