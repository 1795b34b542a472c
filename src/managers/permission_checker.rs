use poise::serenity_prelude::{GuildId, Http, Permissions, RoleId};
use tracing::{error, info, warn};

use crate::config::BotConfig;

/// A single permission with its status
#[derive(Debug, Clone)]
pub struct PermissionStatus {
    pub name: &'static str,
    pub description: &'static str,
    pub has_permission: bool,
}

/// Everything the verification flow needs. VIEW_AUDIT_LOG is load-bearing:
/// without it the interference guard cannot attribute role changes and
/// reverts every grant.
pub fn required_permissions() -> Vec<(&'static str, &'static str, Permissions)> {
    vec![
        ("VIEW_CHANNEL", "See channels and categories", Permissions::VIEW_CHANNEL),
        ("SEND_MESSAGES", "Send messages in channels", Permissions::SEND_MESSAGES),
        ("EMBED_LINKS", "Send rich embeds in messages", Permissions::EMBED_LINKS),
        ("MANAGE_ROLES", "Strip and restore member roles", Permissions::MANAGE_ROLES),
        ("MANAGE_CHANNELS", "Create and delete ticket channels", Permissions::MANAGE_CHANNELS),
        ("VIEW_AUDIT_LOG", "Attribute role changes to their actor", Permissions::VIEW_AUDIT_LOG),
    ]
}

/// Result of the startup self-check against the configured guild
#[derive(Debug)]
pub struct GuildPermissionCheck {
    pub guild_id: GuildId,
    pub guild_name: String,
    pub permission_statuses: Vec<PermissionStatus>,
    pub has_all_permissions: bool,
    pub bot_role_position: Option<u16>,
    pub bot_role_name: Option<String>,
    pub role_hierarchy_ok: bool,
    /// Managed roles sitting at or above the bot's highest role
    pub roles_above_bot: Vec<(String, u16)>,
}

/// Check the bot's permissions and role hierarchy in the guild.
///
/// The hierarchy check only considers roles the flow actually touches:
/// the unverified marker, the member role, and the gated set.
pub async fn check_guild_permissions(
    http: &Http,
    guild_id: GuildId,
    config: &BotConfig,
) -> Result<GuildPermissionCheck, String> {
    let guild = guild_id
        .to_partial_guild(http)
        .await
        .map_err(|e| format!("Failed to fetch guild {}: {}", guild_id, e))?;
    let guild_name = guild.name.clone();

    let bot_user = http
        .get_current_user()
        .await
        .map_err(|e| format!("Failed to get bot user: {}", e))?;
    let bot_member = guild
        .member(http, bot_user.id)
        .await
        .map_err(|e| format!("Failed to get bot member in guild {}: {}", guild_id, e))?;

    #[allow(deprecated)]
    let bot_permissions = guild.member_permissions(&bot_member);

    let mut permission_statuses = Vec::new();
    let mut has_all_permissions = true;
    for (name, description, permission) in required_permissions() {
        let has_perm = bot_permissions.contains(permission);
        has_all_permissions &= has_perm;
        permission_statuses.push(PermissionStatus {
            name,
            description,
            has_permission: has_perm,
        });
    }

    let mut bot_role_position: Option<u16> = None;
    let mut bot_role_name: Option<String> = None;
    for role_id in &bot_member.roles {
        if let Some(role) = guild.roles.get(role_id) {
            if bot_role_position.map_or(true, |p| role.position > p) {
                bot_role_position = Some(role.position);
                bot_role_name = Some(role.name.clone());
            }
        }
    }

    let mut managed: Vec<RoleId> = config.gated_role_ids.clone();
    managed.extend(config.unverified_role_id);
    managed.extend(config.member_role_id);

    let mut roles_above_bot: Vec<(String, u16)> = Vec::new();
    for role_id in &managed {
        let Some(role) = guild.roles.get(role_id) else {
            warn!("Configured role {} does not exist in the guild", role_id);
            continue;
        };
        if bot_role_position.map_or(true, |bot_pos| role.position >= bot_pos) {
            roles_above_bot.push((role.name.clone(), role.position));
        }
    }
    roles_above_bot.sort_by(|a, b| b.1.cmp(&a.1));
    let role_hierarchy_ok = roles_above_bot.is_empty();

    Ok(GuildPermissionCheck {
        guild_id,
        guild_name,
        permission_statuses,
        has_all_permissions,
        bot_role_position,
        bot_role_name,
        role_hierarchy_ok,
        roles_above_bot,
    })
}

/// Log the check with a log level matching its severity
pub fn log_permission_check(check: &GuildPermissionCheck) {
    info!("========================================");
    info!("       BOT PERMISSION CHECK");
    info!("========================================");
    info!("Guild: '{}' (ID: {})", check.guild_name, check.guild_id);

    match (&check.bot_role_name, check.bot_role_position) {
        (Some(name), Some(pos)) => info!("Bot's highest role: '{}' (position {})", name, pos),
        _ => warn!("Bot has no roles assigned!"),
    }

    info!("Server Permissions:");
    for status in &check.permission_statuses {
        if status.has_permission {
            info!("  [YES] {:<16} - {}", status.name, status.description);
        } else {
            error!("  [NO]  {:<16} - {}", status.name, status.description);
        }
    }

    if check.role_hierarchy_ok {
        info!("Role hierarchy: [OK] bot role is above every role it manages");
    } else {
        error!("Role hierarchy: [FAIL] roles at or above the bot's position:");
        for (name, pos) in &check.roles_above_bot {
            error!("  - '{}' (position {})", name, pos);
        }
        error!("  Fix: Server Settings > Roles > drag the bot's role higher");
    }

    if check.has_all_permissions && check.role_hierarchy_ok {
        info!("Status: ALL CHECKS PASSED");
    } else {
        error!("Status: ISSUES DETECTED - verification operations may fail!");
        let missing: Vec<_> = check
            .permission_statuses
            .iter()
            .filter(|s| !s.has_permission)
            .map(|s| s.name)
            .collect();
        if !missing.is_empty() {
            error!("  Missing permissions: {}", missing.join(", "));
        }
    }
    info!("========================================");
}

/// Run the self-check at startup. Issues are logged, never fatal; the
/// bot starts anyway so admins can fix permissions live.
pub async fn run_startup_permission_check(http: &Http, config: &BotConfig) -> bool {
    let Some(guild_id) = config.guild_id else {
        warn!("GUILD_ID not configured, startup permission check skipped");
        return false;
    };
    match check_guild_permissions(http, guild_id, config).await {
        Ok(check) => {
            log_permission_check(&check);
            check.has_all_permissions && check.role_hierarchy_ok
        }
        Err(e) => {
            error!("Startup permission check failed: {}", e);
            false
        }
    }
}
