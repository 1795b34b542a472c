use chrono::{DateTime, Utc};
use dashmap::DashMap;
use poise::serenity_prelude::{ChannelId, GuildId, Http, Member, RoleId, UserId};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::BotConfig;
use crate::managers::role_manager::{RoleChangeActor, RoleManager};
use crate::state::{
    PendingUser, SharedBypassRegistry, SharedPendingStore, SharedTicketStore, TicketRecord,
};

/// Where a tracked user sits in the verification flow.
///
/// `Verified` is the absence of a record; `Bypassed` is terminal at join
/// and never creates one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationState {
    /// Roles stripped (or fallback timer running), completion pending
    AwaitingVerification,
    /// Restoration in flight; the interference guard is disabled for
    /// this user so it cannot fight the restore's own role writes
    BeingVerified,
}

/// One open verification record. At most one per user.
#[derive(Debug, Clone)]
struct VerificationRecord {
    joined_at: DateTime<Utc>,
    /// Captured once per join cycle; immutable until the record is deleted
    original_roles: Vec<RoleId>,
    state: VerificationState,
    /// Set when the user actually entered the flow (opened a ticket,
    /// submitted a booking, or an admin overrode). Restoration is refused
    /// without it.
    started_verification: bool,
    ticket_channel: Option<ChannelId>,
}

/// Read-only view of a record, for admin inspection commands.
#[derive(Debug, Clone)]
pub struct RecordSnapshot {
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
    pub original_roles: Vec<RoleId>,
    pub state: VerificationState,
    pub started_verification: bool,
    pub ticket_channel: Option<ChannelId>,
}

/// What happened when a member joined.
#[derive(Debug, Clone)]
pub enum JoinOutcome {
    /// Member held a bypass role; no record created
    Bypassed,
    /// Record created (or already present); roles listed were stripped
    Tracked { stripped: Vec<RoleId> },
}

/// Result of a restoration attempt, for caller reporting.
///
/// `missing` holds roles from the original capture that no longer exist
/// in the guild; `failed` holds roles the platform refused to grant.
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    pub granted: Vec<RoleId>,
    pub missing: Vec<RoleId>,
    pub failed: Vec<RoleId>,
}

impl RestoreReport {
    pub fn is_noop(&self) -> bool {
        self.granted.is_empty() && self.missing.is_empty() && self.failed.is_empty()
    }
}

/// Decision of the real-time interference guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardAction {
    /// User not awaiting verification, restoration in flight, or no
    /// gated role involved
    Ignore,
    /// A human administrator granted the role: authorized override
    AdminOverride,
    /// Unauthorized grant; these roles must be removed
    Revert(Vec<RoleId>),
}

/// Counts reported by the stale-tracking cleanup.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub records_removed: usize,
    pub tickets_removed: usize,
    /// Ticket channels whose owners left; callers should delete these
    pub orphan_channels: Vec<ChannelId>,
}

/// The member verification state machine.
///
/// Owns every tracking structure keyed by user ID and serializes all
/// mutations to a given user's record behind a per-user async lock.
/// Durable state is mirrored to the pending-user store after each
/// mutation; persistence failures degrade to in-memory-only operation
/// rather than aborting the flow.
pub struct VerificationManager {
    config: Arc<BotConfig>,
    roles: RoleManager,

    records: DashMap<UserId, VerificationRecord>,
    user_locks: DashMap<UserId, Arc<Mutex<()>>>,

    pending: SharedPendingStore,
    bypass: SharedBypassRegistry,
    tickets: SharedTicketStore,
}

impl VerificationManager {
    pub fn new(
        config: Arc<BotConfig>,
        pending: SharedPendingStore,
        bypass: SharedBypassRegistry,
        tickets: SharedTicketStore,
    ) -> Self {
        Self {
            config,
            roles: RoleManager::new(),
            records: DashMap::new(),
            user_locks: DashMap::new(),
            pending,
            bypass,
            tickets,
        }
    }

    /// Rebuild in-memory records from the durable stores after a restart.
    /// Users with an open ticket resume with the started marker set.
    pub async fn hydrate(&self) {
        let pending = self.pending.read().await;
        let tickets = self.tickets.read().await;

        for (id, user) in &pending.users {
            let Ok(user_id) = id.parse::<u64>().map(UserId::new) else {
                warn!("Skipping pending entry with invalid user ID '{}'", id);
                continue;
            };
            let ticket = tickets.get(id);
            self.records.insert(
                user_id,
                VerificationRecord {
                    joined_at: user.joined_at,
                    original_roles: user.original_roles.clone(),
                    state: VerificationState::AwaitingVerification,
                    started_verification: ticket.is_some(),
                    ticket_channel: ticket.map(|t| t.channel_id),
                },
            );
        }

        info!(
            "Recovered {} verification record(s) from durable storage",
            self.records.len()
        );
    }

    fn user_lock(&self, user_id: UserId) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Handle a join event. Bypass roles short-circuit everything; other
    /// members have their roles captured and stripped, and a record is
    /// created in `AwaitingVerification`.
    ///
    /// Idempotent: a duplicate join never overwrites the first capture.
    pub async fn handle_member_join(&self, http: &Http, member: &Member) -> JoinOutcome {
        let user_id = member.user.id;
        let guild_id = member.guild_id;
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        // Bypass short-circuit: no stripping, no record.
        if self.bypass.read().await.matches_any(&member.roles) {
            info!("User {} joined with a bypass role, no verification", user_id);
            if let Some(member_role) = self.config.member_role_id {
                if !member.roles.contains(&member_role) {
                    if let Err(e) = self
                        .roles
                        .add_role(http, guild_id, user_id, member_role, "Bypass role at join")
                        .await
                    {
                        warn!("Could not grant member role to bypassed user {}: {}", user_id, e);
                    }
                }
            }
            return JoinOutcome::Bypassed;
        }

        let capture = roles_to_capture(&member.roles, self.config.unverified_role_id);

        let created = if let Some(record) = self.records.get(&user_id) {
            // Duplicate join without a leave in between: keep the
            // original capture untouched.
            debug!(
                "Join for already-tracked user {} (state {:?}), keeping capture",
                user_id, record.state
            );
            false
        } else {
            self.records.insert(
                user_id,
                VerificationRecord {
                    joined_at: Utc::now(),
                    original_roles: capture.clone(),
                    state: VerificationState::AwaitingVerification,
                    started_verification: false,
                    ticket_channel: None,
                },
            );
            true
        };

        // Strip captured roles best-effort; individual failures are
        // logged inside remove_roles and never abort the join.
        let stripped = if capture.is_empty() {
            info!("User {} joined with no roles to remove", user_id);
            Vec::new()
        } else {
            let removed = self
                .roles
                .remove_roles(http, guild_id, user_id, &capture, "Joined, pending verification")
                .await;
            info!(
                "User {} joined, removed {} of {} role(s) pending verification",
                user_id,
                removed.len(),
                capture.len()
            );
            removed
        };

        if let Some(marker) = self.config.unverified_role_id {
            if !member.roles.contains(&marker) {
                if let Err(e) = self
                    .roles
                    .add_role(http, guild_id, user_id, marker, "Joined, pending verification")
                    .await
                {
                    warn!("Could not add unverified role to {}: {}", user_id, e);
                }
            }
        }

        if created {
            self.persist().await;
        }

        JoinOutcome::Tracked { stripped }
    }

    /// Mark that the user entered the flow. Returns false when the user
    /// is not tracked.
    pub fn begin_verification(&self, user_id: UserId) -> bool {
        match self.records.get_mut(&user_id) {
            Some(mut record) => {
                record.started_verification = true;
                true
            }
            None => false,
        }
    }

    /// Attach an open ticket channel to the user's record.
    pub fn attach_ticket(&self, user_id: UserId, channel_id: ChannelId) {
        if let Some(mut record) = self.records.get_mut(&user_id) {
            record.ticket_channel = Some(channel_id);
            record.started_verification = true;
        }
    }

    /// Verification-completion path: re-grant the captured roles plus the
    /// member role, clear the marker, and delete the record.
    ///
    /// Refused (warning, empty report) when the user has no record or
    /// never started verification — restoring roles for a user who never
    /// entered the flow is a caller error, not a system failure.
    pub async fn restore_member_roles(
        &self,
        http: &Http,
        guild_id: GuildId,
        user_id: UserId,
    ) -> RestoreReport {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let original_roles = match self.begin_restore(user_id) {
            Some(roles) => roles,
            None => return RestoreReport::default(),
        };

        // From here the guard ignores this user; every exit path below
        // must end with the record deleted.
        let existing = match self.roles.guild_role_ids(http, guild_id).await {
            Ok(ids) => ids,
            Err(e) => {
                // Without the guild role list we cannot tell deleted
                // roles from real ones; grant what we can and let the
                // report show the rest as failed.
                warn!("Could not list guild roles during restore: {}", e);
                original_roles.iter().copied().collect()
            }
        };

        let (restorable, missing) = partition_existing(&original_roles, &existing);

        let mut to_grant = restorable;
        if let Some(member_role) = self.config.member_role_id {
            if !to_grant.contains(&member_role) {
                to_grant.push(member_role);
            }
        }

        let outcome = self
            .roles
            .add_roles(http, guild_id, user_id, &to_grant, "Verification complete")
            .await;

        // Bounded wait for the platform to apply the grants before the
        // marker comes off; the reconciliation loop covers the rest.
        if !self.config.restore_grace.is_zero() {
            tokio::time::sleep(self.config.restore_grace).await;
        }

        if let Some(marker) = self.config.unverified_role_id {
            if let Err(e) = self
                .roles
                .remove_role(http, guild_id, user_id, marker, "Verification complete")
                .await
            {
                warn!("Could not remove unverified role from {}: {}", user_id, e);
            }
        }

        let ticket_channel = self.untrack_user(user_id).await;
        if let Some(channel_id) = ticket_channel {
            if let Err(e) = channel_id.delete(http).await {
                warn!("Could not delete ticket channel {}: {}", channel_id, e);
            }
        }

        let report = RestoreReport {
            granted: outcome.granted,
            missing,
            failed: outcome.failed,
        };

        info!(
            "Restored {} role(s) for user {} ({} missing, {} failed)",
            report.granted.len(),
            user_id,
            report.missing.len(),
            report.failed.len()
        );

        report
    }

    /// First half of restoration, platform-free: validate preconditions
    /// and flip the record to `BeingVerified`. Returns the captured roles
    /// to re-grant, or None when the request is refused.
    fn begin_restore(&self, user_id: UserId) -> Option<Vec<RoleId>> {
        let mut record = match self.records.get_mut(&user_id) {
            Some(record) => record,
            None => {
                warn!("Restore requested for untracked user {}", user_id);
                return None;
            }
        };
        if !record.started_verification {
            warn!(
                "Restore requested for user {} who never started verification",
                user_id
            );
            return None;
        }
        if record.state == VerificationState::BeingVerified {
            warn!("Restore already in flight for user {}", user_id);
            return None;
        }
        record.state = VerificationState::BeingVerified;
        Some(record.original_roles.clone())
    }

    /// Pure guard decision for a role-update event: given the old and new
    /// role sets and the audit-trail actor, decide whether to ignore,
    /// treat as an admin override, or revert the grant.
    pub fn guard_action(
        &self,
        user_id: UserId,
        old_roles: &[RoleId],
        new_roles: &[RoleId],
        actor: &RoleChangeActor,
    ) -> GuardAction {
        match self.records.get(&user_id).map(|r| r.state) {
            Some(VerificationState::AwaitingVerification) => {}
            // Not tracked, or our own restoration is writing roles.
            _ => return GuardAction::Ignore,
        }

        let added = diff_added(old_roles, new_roles);
        let gated: Vec<RoleId> = added
            .into_iter()
            .filter(|r| self.config.is_gated(*r))
            .collect();
        if gated.is_empty() {
            return GuardAction::Ignore;
        }

        match actor {
            RoleChangeActor::HumanAdmin(_) => GuardAction::AdminOverride,
            // Bots, non-admins, and unreadable audit logs all deny:
            // the guard fails closed.
            _ => GuardAction::Revert(gated),
        }
    }

    /// Real-time interference guard. Consult the audit trail only when a
    /// gated role was actually added to an awaiting user.
    pub async fn handle_role_update(
        &self,
        http: &Http,
        guild_id: GuildId,
        user_id: UserId,
        old_roles: &[RoleId],
        new_roles: &[RoleId],
    ) {
        // Cheap pre-check before the audit-log fetch.
        let worth_checking = matches!(
            self.records.get(&user_id).map(|r| r.state),
            Some(VerificationState::AwaitingVerification)
        ) && diff_added(old_roles, new_roles)
            .iter()
            .any(|r| self.config.is_gated(*r));
        if !worth_checking {
            return;
        }

        let actor = self.roles.last_role_actor(http, guild_id, user_id).await;

        match self.guard_action(user_id, old_roles, new_roles, &actor) {
            GuardAction::Ignore => {}
            GuardAction::AdminOverride => {
                info!(
                    "Admin {:?} granted a gated role to awaiting user {}, treating as override",
                    actor, user_id
                );
                self.begin_verification(user_id);
                self.restore_member_roles(http, guild_id, user_id).await;
            }
            GuardAction::Revert(roles) => {
                warn!(
                    "Reverting unauthorized gated role grant to user {} (actor {:?})",
                    user_id, actor
                );
                self.roles
                    .remove_roles(
                        http,
                        guild_id,
                        user_id,
                        &roles,
                        "Reverted unauthorized grant during verification",
                    )
                    .await;
            }
        }
    }

    /// Handle a leave event: drop every tracking structure and delete the
    /// ticket channel best-effort. Local cleanup always succeeds.
    pub async fn handle_member_leave(&self, http: &Http, user_id: UserId) {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let ticket_channel = self.untrack_user(user_id).await;
        self.user_locks.remove(&user_id);

        if let Some(channel_id) = ticket_channel {
            if let Err(e) = channel_id.delete(http).await {
                warn!(
                    "Could not delete ticket channel {} for departed user {}: {}",
                    channel_id, user_id, e
                );
            }
        }
        info!("Cleared all tracking for departed user {}", user_id);
    }

    /// Remove the user from records, pending store, and ticket store.
    /// Returns the ticket channel that should be deleted, if any.
    pub async fn untrack_user(&self, user_id: UserId) -> Option<ChannelId> {
        self.records.remove(&user_id);

        let key = user_id.to_string();
        let ticket = {
            let mut tickets = self.tickets.write().await;
            let removed = tickets.remove(&key);
            if removed.is_some() {
                if let Err(e) = tickets.save(&self.config.tickets_path()).await {
                    warn!("Could not persist ticket store: {}", e);
                }
            }
            removed
        };

        self.persist().await;
        ticket.map(|t| t.channel_id)
    }

    /// Sweep entry point for the timeout flow: remove and return every
    /// awaiting user whose join is older than the fallback delay.
    ///
    /// Entries are removed before the caller grants anything, so the
    /// fallback fires at most once per join cycle even if sweeps overlap
    /// or a user's grant keeps failing.
    pub async fn take_due_for_fallback(&self, now: DateTime<Utc>) -> Vec<UserId> {
        let mut store = self.pending.write().await;
        let taken = store.take_older_than(now, self.config.fallback_delay);

        let mut due = Vec::with_capacity(taken.len());
        for (id, entry) in taken {
            let Ok(user_id) = id.parse::<u64>().map(UserId::new) else {
                warn!("Dropping pending entry with invalid user ID '{}'", id);
                continue;
            };
            // A restore in flight wins over the timer.
            if matches!(
                self.records.get(&user_id).map(|r| r.state),
                Some(VerificationState::BeingVerified)
            ) {
                store.insert_if_absent(&id, entry);
                continue;
            }
            self.records.remove(&user_id);
            due.push(user_id);
        }

        if !due.is_empty() {
            if let Err(e) = store.save(&self.config.pending_users_path()).await {
                warn!("Could not persist pending store after sweep: {}", e);
            }
        }
        due
    }

    /// Sweep entry point for the ticket flow: remove and return tickets
    /// older than the auto-close age, clearing all tracking for their
    /// owners. Same take-then-process contract as the fallback sweep.
    pub async fn take_due_tickets(&self, now: DateTime<Utc>) -> Vec<(UserId, TicketRecord)> {
        let taken = {
            let mut tickets = self.tickets.write().await;
            let taken = tickets.take_older_than(now, self.config.ticket_auto_close);
            if !taken.is_empty() {
                if let Err(e) = tickets.save(&self.config.tickets_path()).await {
                    warn!("Could not persist ticket store after sweep: {}", e);
                }
            }
            taken
        };

        let mut due = Vec::with_capacity(taken.len());
        for (id, ticket) in taken {
            let Ok(user_id) = id.parse::<u64>().map(UserId::new) else {
                warn!("Dropping ticket entry with invalid user ID '{}'", id);
                continue;
            };
            self.records.remove(&user_id);
            due.push((user_id, ticket));
        }
        if !due.is_empty() {
            self.persist().await;
        }
        due
    }

    /// Grant the fallback role to a user who timed out of the flow,
    /// unless they already hold a paid role. The caller has already
    /// removed the user from the pending set.
    pub async fn grant_fallback(&self, http: &Http, guild_id: GuildId, user_id: UserId) {
        let member = match guild_id.member(http, user_id).await {
            Ok(member) => member,
            Err(e) => {
                debug!(
                    "Skipping fallback grant for {}: member fetch failed ({})",
                    user_id, e
                );
                return;
            }
        };

        let has_paid = member.roles.iter().any(|r| self.config.is_gated(*r));
        if !has_paid {
            if let Some(member_role) = self.config.member_role_id {
                if !member.roles.contains(&member_role) {
                    if let Err(e) = self
                        .roles
                        .add_role(
                            http,
                            guild_id,
                            user_id,
                            member_role,
                            "No paid role after timeout, granting free member",
                        )
                        .await
                    {
                        error!("Fallback grant failed for user {}: {}", user_id, e);
                    } else {
                        info!("Granted fallback member role to user {}", user_id);
                    }
                }
            } else {
                warn!("MEMBER_ROLE_ID not configured, fallback grant skipped");
            }
        }

        if let Some(marker) = self.config.unverified_role_id {
            if member.roles.contains(&marker) {
                if let Err(e) = self
                    .roles
                    .remove_role(http, guild_id, user_id, marker, "Verification window closed")
                    .await
                {
                    warn!("Could not remove unverified role from {}: {}", user_id, e);
                }
            }
        }
    }

    /// Reconcile one tracked user against platform ground truth: a gated
    /// role held by an awaiting user gets the same audit-trail treatment
    /// as the real-time guard.
    pub async fn reconcile_user(
        &self,
        http: &Http,
        guild_id: GuildId,
        user_id: UserId,
    ) -> crate::error::Result<()> {
        if !matches!(
            self.records.get(&user_id).map(|r| r.state),
            Some(VerificationState::AwaitingVerification)
        ) {
            return Ok(());
        }

        let member = guild_id.member(http, user_id).await?;
        let gated_held: Vec<RoleId> = member
            .roles
            .iter()
            .copied()
            .filter(|r| self.config.is_gated(*r))
            .collect();
        if gated_held.is_empty() {
            return Ok(());
        }

        match self.roles.last_role_actor(http, guild_id, user_id).await {
            RoleChangeActor::HumanAdmin(actor) => {
                info!(
                    "Reconciliation: admin {} granted gated role(s) to {}, restoring",
                    actor, user_id
                );
                self.begin_verification(user_id);
                self.restore_member_roles(http, guild_id, user_id).await;
            }
            actor => {
                warn!(
                    "Reconciliation: stripping gated role(s) from awaiting user {} (actor {:?})",
                    user_id, actor
                );
                self.roles
                    .remove_roles(
                        http,
                        guild_id,
                        user_id,
                        &gated_held,
                        "Reverted unauthorized grant during verification",
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Drop tracking for users no longer in the guild.
    pub async fn cleanup_stale(&self, present: &HashSet<UserId>) -> CleanupReport {
        let mut report = CleanupReport::default();

        let stale: Vec<UserId> = self
            .records
            .iter()
            .map(|r| *r.key())
            .filter(|id| !present.contains(id))
            .collect();
        for user_id in stale {
            if let Some(channel) = self.untrack_user(user_id).await {
                report.orphan_channels.push(channel);
                report.tickets_removed += 1;
            }
            self.user_locks.remove(&user_id);
            report.records_removed += 1;
        }

        // Tickets can outlive records after a crash mid-cleanup.
        let orphan_tickets: Vec<String> = {
            let tickets = self.tickets.read().await;
            tickets
                .user_ids()
                .into_iter()
                .filter(|id| {
                    id.parse::<u64>()
                        .map(|n| !present.contains(&UserId::new(n)))
                        .unwrap_or(true)
                })
                .collect()
        };
        if !orphan_tickets.is_empty() {
            let mut tickets = self.tickets.write().await;
            for id in orphan_tickets {
                if let Some(ticket) = tickets.remove(&id) {
                    report.orphan_channels.push(ticket.channel_id);
                    report.tickets_removed += 1;
                }
            }
            if let Err(e) = tickets.save(&self.config.tickets_path()).await {
                warn!("Could not persist ticket store after cleanup: {}", e);
            }
        }

        report
    }

    /// Snapshot of every open record, oldest join first.
    pub fn list_pending(&self) -> Vec<RecordSnapshot> {
        let mut snapshots: Vec<RecordSnapshot> = self
            .records
            .iter()
            .map(|entry| snapshot(*entry.key(), entry.value()))
            .collect();
        snapshots.sort_by_key(|s| s.joined_at);
        snapshots
    }

    /// Snapshot of one user's record, for debugging.
    pub fn debug_dump(&self, user_id: UserId) -> Option<RecordSnapshot> {
        self.records
            .get(&user_id)
            .map(|record| snapshot(user_id, record.value()))
    }

    pub fn is_tracked(&self, user_id: UserId) -> bool {
        self.records.contains_key(&user_id)
    }

    pub fn tracked_user_ids(&self) -> Vec<UserId> {
        self.records.iter().map(|r| *r.key()).collect()
    }

    pub fn awaiting_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.state == VerificationState::AwaitingVerification)
            .count()
    }

    pub fn being_verified_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.state == VerificationState::BeingVerified)
            .count()
    }

    /// Mirror in-memory records into the pending store and flush it.
    /// On write failure the in-memory state stays authoritative for this
    /// process lifetime; the error is logged, not propagated.
    async fn persist(&self) {
        let mut store = self.pending.write().await;
        store.users.clear();
        for entry in self.records.iter() {
            store.users.insert(
                entry.key().to_string(),
                PendingUser {
                    original_roles: entry.original_roles.clone(),
                    joined_at: entry.joined_at,
                },
            );
        }
        if let Err(e) = store.save(&self.config.pending_users_path()).await {
            error!(
                "Could not persist pending users (state survives in memory only): {}",
                e
            );
        }
    }
}

fn snapshot(user_id: UserId, record: &VerificationRecord) -> RecordSnapshot {
    RecordSnapshot {
        user_id,
        joined_at: record.joined_at,
        original_roles: record.original_roles.clone(),
        state: record.state,
        started_verification: record.started_verification,
        ticket_channel: record.ticket_channel,
    }
}

/// Roles worth capturing at join: everything except the unverified
/// marker itself. The platform's member role list never includes
/// @everyone.
pub fn roles_to_capture(member_roles: &[RoleId], unverified: Option<RoleId>) -> Vec<RoleId> {
    member_roles
        .iter()
        .copied()
        .filter(|r| Some(*r) != unverified)
        .collect()
}

/// Roles present in `new` but not in `old`.
pub fn diff_added(old: &[RoleId], new: &[RoleId]) -> Vec<RoleId> {
    new.iter()
        .copied()
        .filter(|r| !old.contains(r))
        .collect()
}

/// Split a captured role list into those that still exist in the guild
/// and those that were deleted since capture.
pub fn partition_existing(
    roles: &[RoleId],
    existing: &HashSet<RoleId>,
) -> (Vec<RoleId>, Vec<RoleId>) {
    let mut restorable = Vec::new();
    let mut missing = Vec::new();
    for role in roles {
        if existing.contains(role) {
            restorable.push(*role);
        } else {
            missing.push(*role);
        }
    }
    (restorable, missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{
        create_shared_bypass_registry, create_shared_pending_store, create_shared_ticket_store,
        BypassRegistry, PendingStore, TicketStore,
    };

    fn test_manager(state_dir: &str) -> VerificationManager {
        let config = Arc::new(BotConfig {
            member_role_id: Some(RoleId::new(900)),
            unverified_role_id: Some(RoleId::new(901)),
            gated_role_ids: vec![RoleId::new(500), RoleId::new(501)],
            state_path: state_dir.to_string(),
            restore_grace: std::time::Duration::ZERO,
            ..BotConfig::default()
        });
        VerificationManager::new(
            config,
            create_shared_pending_store(PendingStore::new()),
            create_shared_bypass_registry(BypassRegistry::new()),
            create_shared_ticket_store(TicketStore::new()),
        )
    }

    fn insert_awaiting(manager: &VerificationManager, user: u64, roles: Vec<u64>) {
        manager.records.insert(
            UserId::new(user),
            VerificationRecord {
                joined_at: Utc::now(),
                original_roles: roles.into_iter().map(RoleId::new).collect(),
                state: VerificationState::AwaitingVerification,
                started_verification: false,
                ticket_channel: None,
            },
        );
    }

    #[test]
    fn test_roles_to_capture_excludes_marker() {
        let marker = RoleId::new(901);
        let roles = vec![RoleId::new(1), marker, RoleId::new(2)];
        let capture = roles_to_capture(&roles, Some(marker));
        assert_eq!(capture, vec![RoleId::new(1), RoleId::new(2)]);
    }

    #[test]
    fn test_diff_added() {
        let old = vec![RoleId::new(1), RoleId::new(2)];
        let new = vec![RoleId::new(2), RoleId::new(3)];
        assert_eq!(diff_added(&old, &new), vec![RoleId::new(3)]);
        assert!(diff_added(&new, &new).is_empty());
    }

    #[test]
    fn test_partition_existing_reports_missing_distinctly() {
        let roles = vec![RoleId::new(1), RoleId::new(2)];
        let existing: HashSet<RoleId> = [RoleId::new(2)].into_iter().collect();
        let (restorable, missing) = partition_existing(&roles, &existing);
        assert_eq!(restorable, vec![RoleId::new(2)]);
        assert_eq!(missing, vec![RoleId::new(1)]);
    }

    #[tokio::test]
    async fn test_guard_reverts_non_admin_gated_grant() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path().to_str().unwrap());
        insert_awaiting(&manager, 42, vec![]);

        let old = vec![];
        let new = vec![RoleId::new(500)];
        let action = manager.guard_action(
            UserId::new(42),
            &old,
            &new,
            &RoleChangeActor::Bot(UserId::new(7)),
        );
        assert_eq!(action, GuardAction::Revert(vec![RoleId::new(500)]));

        // Audit-log failure is treated the same way: deny.
        let action = manager.guard_action(UserId::new(42), &old, &new, &RoleChangeActor::Unknown);
        assert_eq!(action, GuardAction::Revert(vec![RoleId::new(500)]));
    }

    #[tokio::test]
    async fn test_guard_allows_admin_override() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path().to_str().unwrap());
        insert_awaiting(&manager, 42, vec![]);

        let action = manager.guard_action(
            UserId::new(42),
            &[],
            &[RoleId::new(500)],
            &RoleChangeActor::HumanAdmin(UserId::new(1)),
        );
        assert_eq!(action, GuardAction::AdminOverride);
    }

    #[tokio::test]
    async fn test_guard_disabled_during_restoration() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path().to_str().unwrap());
        insert_awaiting(&manager, 42, vec![RoleId::new(10).get()]);
        manager.begin_verification(UserId::new(42));

        // Restoration flips the record to BeingVerified.
        let roles = manager.begin_restore(UserId::new(42)).unwrap();
        assert_eq!(roles, vec![RoleId::new(10)]);

        let action = manager.guard_action(
            UserId::new(42),
            &[],
            &[RoleId::new(500)],
            &RoleChangeActor::Bot(UserId::new(7)),
        );
        assert_eq!(action, GuardAction::Ignore);
    }

    #[tokio::test]
    async fn test_guard_ignores_untracked_and_ungated() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path().to_str().unwrap());

        // Untracked user.
        let action = manager.guard_action(
            UserId::new(1),
            &[],
            &[RoleId::new(500)],
            &RoleChangeActor::Bot(UserId::new(7)),
        );
        assert_eq!(action, GuardAction::Ignore);

        // Tracked user, but the added role is not gated.
        insert_awaiting(&manager, 2, vec![]);
        let action = manager.guard_action(
            UserId::new(2),
            &[],
            &[RoleId::new(999)],
            &RoleChangeActor::Bot(UserId::new(7)),
        );
        assert_eq!(action, GuardAction::Ignore);
    }

    #[tokio::test]
    async fn test_restore_refused_without_started_marker() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path().to_str().unwrap());
        insert_awaiting(&manager, 42, vec![10]);

        assert!(manager.begin_restore(UserId::new(42)).is_none());
        // Still awaiting: the refusal must not corrupt state.
        assert_eq!(
            manager.debug_dump(UserId::new(42)).unwrap().state,
            VerificationState::AwaitingVerification
        );
    }

    #[tokio::test]
    async fn test_untrack_user_clears_everything() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path().to_str().unwrap());
        let user = UserId::new(42);

        insert_awaiting(&manager, 42, vec![10]);
        manager.attach_ticket(user, ChannelId::new(777));
        {
            let mut tickets = manager.tickets.write().await;
            tickets.insert(
                "42",
                TicketRecord {
                    channel_id: ChannelId::new(777),
                    created_at: Utc::now(),
                },
            );
        }
        manager.persist().await;

        let channel = manager.untrack_user(user).await;
        assert_eq!(channel, Some(ChannelId::new(777)));

        assert!(!manager.is_tracked(user));
        assert!(!manager.pending.read().await.contains("42"));
        assert!(manager.tickets.read().await.get("42").is_none());
    }

    #[tokio::test]
    async fn test_fallback_take_is_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path().to_str().unwrap());
        let old_join = Utc::now() - chrono::Duration::hours(2);

        manager.records.insert(
            UserId::new(42),
            VerificationRecord {
                joined_at: old_join,
                original_roles: vec![],
                state: VerificationState::AwaitingVerification,
                started_verification: false,
                ticket_channel: None,
            },
        );
        manager.persist().await;

        let now = Utc::now();
        let first = manager.take_due_for_fallback(now).await;
        assert_eq!(first, vec![UserId::new(42)]);

        // Overlapping second sweep over the same set: nothing left.
        let second = manager.take_due_for_fallback(now).await;
        assert!(second.is_empty());
        assert!(!manager.is_tracked(UserId::new(42)));
    }

    #[tokio::test]
    async fn test_fallback_skips_user_being_verified() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path().to_str().unwrap());
        let old_join = Utc::now() - chrono::Duration::hours(2);

        manager.records.insert(
            UserId::new(42),
            VerificationRecord {
                joined_at: old_join,
                original_roles: vec![],
                state: VerificationState::BeingVerified,
                started_verification: true,
                ticket_channel: None,
            },
        );
        manager.persist().await;

        let due = manager.take_due_for_fallback(Utc::now()).await;
        assert!(due.is_empty());
        assert!(manager.is_tracked(UserId::new(42)));
        // The pending entry was put back for the next sweep.
        assert!(manager.pending.read().await.contains("42"));
    }

    #[tokio::test]
    async fn test_hydrate_recovers_records_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path().to_str().unwrap());

        {
            let mut pending = manager.pending.write().await;
            pending.insert_if_absent(
                "42",
                PendingUser {
                    original_roles: vec![RoleId::new(10)],
                    joined_at: Utc::now(),
                },
            );
        }
        {
            let mut tickets = manager.tickets.write().await;
            tickets.insert(
                "42",
                TicketRecord {
                    channel_id: ChannelId::new(777),
                    created_at: Utc::now(),
                },
            );
        }

        manager.hydrate().await;

        let record = manager.debug_dump(UserId::new(42)).unwrap();
        assert_eq!(record.state, VerificationState::AwaitingVerification);
        assert_eq!(record.original_roles, vec![RoleId::new(10)]);
        // An open ticket means the user already started the flow.
        assert!(record.started_verification);
        assert_eq!(record.ticket_channel, Some(ChannelId::new(777)));
    }
}
