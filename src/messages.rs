use poise::serenity_prelude::{
    ChannelId, Colour, CreateActionRow, CreateButton, CreateEmbed, CreateMessage, Http, Timestamp,
    UserId,
};
use tracing::warn;

use crate::config::BotConfig;

pub const COLOR_INFO: Colour = Colour(0x5865F2);
pub const COLOR_SUCCESS: Colour = Colour(0x57F287);
pub const COLOR_WARNING: Colour = Colour(0xFEE75C);

/// Greeting posted into a freshly opened ticket channel. Carries the
/// booking link as a button when one is configured.
pub fn ticket_intro(user_id: UserId, booking_link: Option<&str>) -> CreateMessage {
    let embed = CreateEmbed::new()
        .title("Welcome!")
        .description(format!(
            "Hey <@{}>, thanks for joining!\n\n\
             To unlock the community, book your onboarding call below. \
             Once it's confirmed, run `/verify` with the email you booked with \
             and your access will be restored.\n\n\
             This channel closes automatically after a while; if it does, \
             you'll still get member access.",
            user_id
        ))
        .color(COLOR_INFO)
        .timestamp(Timestamp::now());

    let mut message = CreateMessage::new().content(format!("<@{}>", user_id)).embed(embed);
    if let Some(link) = booking_link {
        message = message.components(vec![CreateActionRow::Buttons(vec![
            CreateButton::new_link(link).label("Book your call"),
        ])]);
    }
    message
}

/// Direct message sent after a successful verification.
pub fn verified_dm() -> CreateMessage {
    CreateMessage::new().embed(
        CreateEmbed::new()
            .title("You're verified!")
            .description("Your roles have been restored. Welcome aboard!")
            .color(COLOR_SUCCESS)
            .timestamp(Timestamp::now()),
    )
}

/// Direct message for members who timed out of the flow and received the
/// fallback role instead.
pub fn fallback_dm(booking_link: Option<&str>) -> CreateMessage {
    let mut description = String::from(
        "Your verification window closed, so we've given you free member \
         access. You can upgrade any time",
    );
    match booking_link {
        Some(link) => description.push_str(&format!(" by booking a call: {}", link)),
        None => description.push('.'),
    }
    CreateMessage::new().embed(
        CreateEmbed::new()
            .title("Welcome!")
            .description(description)
            .color(COLOR_INFO)
            .timestamp(Timestamp::now()),
    )
}

/// Post an embed to the configured logs channel. Best-effort: a missing
/// channel or send failure is logged and swallowed.
pub async fn send_log(http: &Http, config: &BotConfig, title: &str, body: &str, color: Colour) {
    let Some(channel) = config.logs_channel_id else {
        return;
    };
    let embed = CreateEmbed::new()
        .title(title.to_string())
        .description(body.to_string())
        .color(color)
        .timestamp(Timestamp::now());
    if let Err(e) = channel.send_message(http, CreateMessage::new().embed(embed)).await {
        warn!("Could not post to logs channel {}: {}", channel, e);
    }
}

/// Best-effort DM. Users with DMs disabled are common, so failure is a
/// debug-level event rather than a warning.
pub async fn send_dm(http: &Http, user_id: UserId, message: CreateMessage) {
    match user_id.create_dm_channel(http).await {
        Ok(channel) => {
            if let Err(e) = channel.send_message(http, message).await {
                tracing::debug!("Could not DM user {}: {}", user_id, e);
            }
        }
        Err(e) => tracing::debug!("Could not open DM channel with {}: {}", user_id, e),
    }
}

/// Post into an arbitrary channel, swallowing failures.
pub async fn send_to_channel(http: &Http, channel_id: ChannelId, message: CreateMessage) {
    if let Err(e) = channel_id.send_message(http, message).await {
        warn!("Could not send message to channel {}: {}", channel_id, e);
    }
}
