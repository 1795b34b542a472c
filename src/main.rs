use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use poise::serenity_prelude as serenity;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Discord bot gating community access behind member verification
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Force re-sync of slash commands (use when commands aren't showing up)
    #[arg(long, short = 's')]
    sync_commands: bool,

    /// Register commands per-guild instead of globally (faster for testing)
    #[arg(long)]
    guild_commands: bool,
}

mod commands;
mod config;
mod error;
mod events;
mod logging;
mod managers;
mod messages;
mod state;

use commands::{
    bypass_add, bypass_list, bypass_remove, check_pending, check_stored_roles, cleanup_tracking,
    debug_logs, force_verify, help, ping, start_verification, verification_stats, verify,
};
use commands::guard::RateLimiter;
use config::BotConfig;
use error::error_reference;
use events::{handle_member_add, handle_member_remove, handle_member_update};
use managers::permission_checker::run_startup_permission_check;
use managers::{BookingChecker, TicketManager, VerificationManager};
use state::{
    create_shared_bypass_registry, create_shared_pending_store, create_shared_ticket_store,
    BypassRegistry, PendingStore, SharedBypassRegistry, SharedTicketStore, TicketStore,
};

type Error = Box<dyn std::error::Error + Send + Sync>;
type Context<'a> = poise::Context<'a, Data, Error>;

/// Shared application state
pub struct Data {
    pub config: Arc<BotConfig>,
    pub verification: Arc<VerificationManager>,
    pub ticket_manager: Arc<TicketManager>,
    pub booking: Arc<BookingChecker>,
    pub tickets: SharedTicketStore,
    pub bypass: SharedBypassRegistry,
    pub log_buffer: logging::SharedLogBuffer,
    pub admin_rate_limiter: RateLimiter,
}

async fn event_handler(
    ctx: &serenity::Context,
    event: &serenity::FullEvent,
    _framework: poise::FrameworkContext<'_, Data, Error>,
    data: &Data,
) -> Result<(), Error> {
    match event {
        serenity::FullEvent::GuildMemberAddition { new_member } => {
            if let Err(e) = handle_member_add(ctx, new_member, data).await {
                error!("Failed to handle new member: {}", e);
            }
        }
        serenity::FullEvent::GuildMemberRemoval { guild_id, user, .. } => {
            if let Err(e) = handle_member_remove(ctx, *guild_id, user, data).await {
                error!("Failed to handle member removal: {}", e);
            }
        }
        serenity::FullEvent::GuildMemberUpdate {
            old_if_available,
            event,
            ..
        } => {
            if let Err(e) = handle_member_update(ctx, old_if_available, event, data).await {
                error!("Failed to handle member update: {}", e);
            }
        }
        _ => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    // Log buffer backing /debug_logs
    let log_buffer = logging::create_log_buffer(1000);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true),
        )
        .with(tracing_subscriber::filter::LevelFilter::INFO)
        .with(logging::LogCaptureLayer::new(log_buffer.clone()))
        .init();

    let token = std::env::var("DISCORD_TOKEN").expect("Missing DISCORD_TOKEN environment variable");
    let config = Arc::new(BotConfig::from_env());
    if config.guild_id.is_none() {
        warn!("GUILD_ID not set: reconciliation and startup checks are disabled");
    }

    tokio::fs::create_dir_all(&config.state_path).await.ok();

    info!("Loading pending users...");
    let pending = PendingStore::load(&config.pending_users_path())
        .await
        .unwrap_or_else(|e| {
            warn!("Could not load pending users: {}, starting empty", e);
            PendingStore::new()
        });
    let pending = create_shared_pending_store(pending);

    info!("Loading bypass roles...");
    let bypass = BypassRegistry::load(&config.bypass_roles_path())
        .await
        .unwrap_or_else(|e| {
            warn!("Could not load bypass roles: {}, starting empty", e);
            BypassRegistry::new()
        });
    let bypass = create_shared_bypass_registry(bypass);

    info!("Loading verification tickets...");
    let tickets = TicketStore::load(&config.tickets_path())
        .await
        .unwrap_or_else(|e| {
            warn!("Could not load tickets: {}, starting empty", e);
            TicketStore::new()
        });
    let tickets = create_shared_ticket_store(tickets);

    let verification = Arc::new(VerificationManager::new(
        config.clone(),
        pending.clone(),
        bypass.clone(),
        tickets.clone(),
    ));
    verification.hydrate().await;

    let ticket_manager = Arc::new(TicketManager::new(config.clone(), tickets.clone()));
    let booking = Arc::new(BookingChecker::new(config.clone()));
    if !booking.is_configured() {
        warn!("BOOKING_API_TOKEN not set: /verify will grant without a booking check");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sync_commands = args.sync_commands;
    let guild_commands = args.guild_commands;

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![
                ping(),
                help(),
                start_verification(),
                verify(),
                force_verify(),
                check_pending(),
                check_stored_roles(),
                cleanup_tracking(),
                verification_stats(),
                bypass_add(),
                bypass_remove(),
                bypass_list(),
                debug_logs(),
            ],
            event_handler: |ctx, event, framework, data| {
                Box::pin(event_handler(ctx, event, framework, data))
            },
            pre_command: |ctx| {
                Box::pin(async move {
                    info!(
                        "Command '{}' invoked by {} (ID: {})",
                        ctx.command().qualified_name,
                        ctx.author().name,
                        ctx.author().id,
                    );
                })
            },
            on_error: |error| {
                Box::pin(async move {
                    match error {
                        poise::FrameworkError::Command { error, ctx, .. } => {
                            let reference = error_reference();
                            error!(
                                "Error in command '{}' (ref {}): {}",
                                ctx.command().qualified_name,
                                reference,
                                error
                            );
                            let _ = ctx
                                .send(
                                    poise::CreateReply::default()
                                        .content(format!(
                                            "Something went wrong. (ref: {})",
                                            reference
                                        ))
                                        .ephemeral(true),
                                )
                                .await;
                        }
                        poise::FrameworkError::ArgumentParse { error, input, ctx, .. } => {
                            error!(
                                "Argument parse error in '{}': {} (input: {:?})",
                                ctx.command().qualified_name,
                                error,
                                input
                            );
                        }
                        poise::FrameworkError::GuildOnly { ctx, .. } => {
                            let _ = ctx
                                .send(
                                    poise::CreateReply::default()
                                        .content("This command only works in a server.")
                                        .ephemeral(true),
                                )
                                .await;
                        }
                        other => {
                            error!("Framework error: {}", other);
                        }
                    }
                })
            },
            ..Default::default()
        })
        .setup({
            let config = config.clone();
            let verification = verification.clone();
            let ticket_manager = ticket_manager.clone();
            let booking = booking.clone();
            let tickets = tickets.clone();
            let bypass = bypass.clone();
            let log_buffer = log_buffer.clone();

            move |ctx, ready, framework| {
                Box::pin(async move {
                    info!("Bot logged in as: {}", ready.user.name);

                    run_startup_permission_check(ctx.http.as_ref(), &config).await;

                    if guild_commands || sync_commands {
                        let guilds: Vec<serenity::GuildId> = match config.guild_id {
                            Some(id) => vec![id],
                            None => ready.guilds.iter().map(|g| g.id).collect(),
                        };
                        for guild_id in guilds {
                            info!("Registering commands to guild: {}", guild_id);
                            poise::builtins::register_in_guild(
                                ctx,
                                &framework.options().commands,
                                guild_id,
                            )
                            .await?;
                        }
                    } else {
                        info!("Registering commands globally (may take up to an hour)");
                        poise::builtins::register_globally(ctx, &framework.options().commands)
                            .await?;
                    }

                    tokio::spawn(managers::reconciler::run(
                        ctx.http.clone(),
                        config.clone(),
                        verification.clone(),
                        shutdown_rx,
                    ));

                    Ok(Data {
                        config,
                        verification,
                        ticket_manager,
                        booking,
                        tickets,
                        bypass,
                        log_buffer,
                        admin_rate_limiter: RateLimiter::default(),
                    })
                })
            }
        })
        .build();

    let intents = serenity::GatewayIntents::non_privileged() | serenity::GatewayIntents::GUILD_MEMBERS;
    info!("Requesting privileged intents: [\"GUILD_MEMBERS\"]");

    let mut client = serenity::ClientBuilder::new(token, intents)
        .framework(framework)
        .await?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
            shard_manager.shutdown_all().await;
        }
    });

    info!("Starting bot...");
    if let Err(e) = client.start().await {
        let err_str = e.to_string();
        if err_str.contains("Disallowed") || err_str.contains("intents") {
            error!("Failed to start bot: {}", e);
            error!("Enable the GUILD_MEMBERS privileged intent in the Discord Developer Portal");
            return Err(anyhow::anyhow!(
                "Disallowed gateway intents; enable GUILD_MEMBERS in the Developer Portal"
            ));
        }
        return Err(e.into());
    }
    warn!("Bot ended.");

    Ok(())
}
