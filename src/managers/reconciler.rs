use poise::serenity_prelude::Http;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{BotConfig, VerificationFlow};
use crate::managers::verification::VerificationManager;
use crate::messages;

/// How often the due-date sweep (fallback grants, ticket auto-close)
/// runs. Independent of the heavier reconciliation cadence.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Periodic repair loop for the verification system.
///
/// On the reconciliation cadence it re-checks tracked users against
/// platform ground truth (events can be missed across gateway drops);
/// on the faster sweep cadence it runs the flow-specific due-date pass:
/// fallback grants for the timeout flow, auto-close for the ticket flow.
/// Per-user failures are logged and never stop a pass.
///
/// Runs until the shutdown signal flips.
pub async fn run(
    http: Arc<Http>,
    config: Arc<BotConfig>,
    verification: Arc<VerificationManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reconcile_interval = tokio::time::interval(config.check_interval);
    reconcile_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut sweep_interval = tokio::time::interval(SWEEP_INTERVAL);
    sweep_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(
        "Reconciliation loop started (reconcile every {}s, sweep every {}s)",
        config.check_interval.as_secs(),
        SWEEP_INTERVAL.as_secs()
    );

    loop {
        tokio::select! {
            _ = reconcile_interval.tick() => {
                reconcile(&http, &config, &verification).await;
            }
            _ = sweep_interval.tick() => {
                sweep_due(&http, &config, &verification).await;
            }
            _ = shutdown.changed() => {
                info!("Reconciliation loop stopping");
                return;
            }
        }
    }
}

async fn reconcile(http: &Http, config: &BotConfig, verification: &VerificationManager) {
    let Some(guild_id) = config.guild_id else {
        debug!("GUILD_ID not configured, reconciliation skipped");
        return;
    };

    for user_id in verification.tracked_user_ids() {
        if let Err(e) = verification.reconcile_user(http, guild_id, user_id).await {
            warn!("Reconciliation failed for user {}: {}", user_id, e);
        }
    }
}

async fn sweep_due(http: &Http, config: &BotConfig, verification: &VerificationManager) {
    let Some(guild_id) = config.guild_id else {
        return;
    };

    let now = chrono::Utc::now();
    match config.flow {
        VerificationFlow::Timeout => {
            for user_id in verification.take_due_for_fallback(now).await {
                verification.grant_fallback(http, guild_id, user_id).await;
                messages::send_dm(http, user_id, messages::fallback_dm(config.booking_link.as_deref()))
                    .await;
                messages::send_log(
                    http,
                    config,
                    "Verification window closed",
                    &format!("<@{}> received free member access after the timeout.", user_id),
                    messages::COLOR_INFO,
                )
                .await;
            }
        }
        VerificationFlow::Ticket => {
            for (user_id, ticket) in verification.take_due_tickets(now).await {
                if let Err(e) = ticket.channel_id.delete(http).await {
                    warn!(
                        "Could not delete expired ticket channel {}: {}",
                        ticket.channel_id, e
                    );
                }
                verification.grant_fallback(http, guild_id, user_id).await;
                messages::send_dm(http, user_id, messages::fallback_dm(config.booking_link.as_deref()))
                    .await;
                messages::send_log(
                    http,
                    config,
                    "Ticket auto-closed",
                    &format!(
                        "Ticket for <@{}> expired; free member access granted.",
                        user_id
                    ),
                    messages::COLOR_WARNING,
                )
                .await;
            }
        }
    }
}
