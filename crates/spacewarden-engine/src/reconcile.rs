//! The reconciliation engine.
//!
//! Two producers converge on the durable invite queue: membership events
//! (a user joined a watched space) and full reconciliation passes (startup
//! and every N sync cycles).  Both paths apply the same blocklist and
//! dedup checks and are therefore safe to fire redundantly; the queue's
//! partial unique index keeps at most one live intent per `(user, room)`.
//!
//! The engine only produces queue items.  It never calls the invite
//! primitive itself; network failure handling belongs to the dispatcher.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use spacewarden_shared::{RoomId, UserId};
use spacewarden_store::{BlockReason, SharedDatabase, StoreError};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::client::Homeserver;

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The bot's own user ID, never invited or blocked.
    pub bot_user: UserId,
    /// Run a full reconciliation every this many sync cycles.  `0`
    /// disables the periodic trigger; event-driven reconciliation still
    /// runs.
    pub reconcile_interval_cycles: u64,
}

/// The reconciliation engine.  Cheap to share behind an [`Arc`].
pub struct Engine {
    db: SharedDatabase,
    client: Arc<dyn Homeserver>,
    config: EngineConfig,
    /// Wakes the dispatcher when new items are enqueued.
    dispatch_notify: Arc<Notify>,
    /// Monotonic sync-cycle counter.
    sync_count: AtomicU64,
    startup_reconcile_done: AtomicBool,
    /// At most one full reconciliation runs at a time.
    reconcile_running: AtomicBool,
}

impl Engine {
    pub fn new(
        db: SharedDatabase,
        client: Arc<dyn Homeserver>,
        config: EngineConfig,
        dispatch_notify: Arc<Notify>,
    ) -> Self {
        Self {
            db,
            client,
            config,
            dispatch_notify,
            sync_count: AtomicU64::new(0),
            startup_reconcile_done: AtomicBool::new(false),
            reconcile_running: AtomicBool::new(false),
        }
    }

    /// Completed sync cycles since startup.
    pub fn sync_count(&self) -> u64 {
        self.sync_count.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Event-driven triggers
    // ------------------------------------------------------------------

    /// React to a user joining a room.
    ///
    /// If the room is a target room, an outstanding invite for the pair is
    /// marked accepted.  If the room is a watched space, an invite intent
    /// is enqueued for every target room of that space.
    pub async fn handle_member_joined(&self, room: &RoomId, user: &UserId) -> Result<(), StoreError> {
        if *user == self.config.bot_user {
            return Ok(());
        }

        let db = self.db.lock().await;

        if db.is_target_room(room)? && db.mark_accepted(user, room)? > 0 {
            info!(user = %user, room = %room, "invite accepted");
        }

        let targets = db.target_rooms_for_space(room)?;
        if targets.is_empty() {
            return Ok(());
        }

        info!(user = %user, space = %room, targets = targets.len(), "member joined watched space");
        let queued = enqueue_for_targets(&db, user, room, &targets)?;
        drop(db);

        if queued > 0 {
            self.dispatch_notify.notify_one();
        }
        Ok(())
    }

    /// React to an invite directed at a room member.
    ///
    /// Only invites for the bot itself matter: accepting them is how
    /// operators bootstrap the bot into spaces and rooms, and joining is
    /// what makes a room visible for member scans.
    pub async fn handle_member_invited(&self, room: &RoomId, user: &UserId) {
        if *user != self.config.bot_user {
            return;
        }
        match self.client.join_room(room).await {
            Ok(()) => info!(room = %room, "joined room on invite"),
            Err(e) => warn!(room = %room, error = %e, "cannot join room on invite"),
        }
    }

    /// React to a user leaving or being banned from a room.
    ///
    /// Leaves and bans in target rooms create a block so the user is not
    /// re-invited, and cancel any live queue item for the pair.
    pub async fn handle_member_left(
        &self,
        room: &RoomId,
        user: &UserId,
        banned: bool,
    ) -> Result<(), StoreError> {
        if *user == self.config.bot_user {
            return Ok(());
        }

        let db = self.db.lock().await;
        if !db.is_target_room(room)? {
            return Ok(());
        }

        let reason = if banned {
            BlockReason::Banned
        } else {
            BlockReason::Left
        };
        db.add_block(user, room, reason)?;
        let cancelled = db.cancel_active_invites(user, room)?;

        info!(
            user = %user,
            room = %room,
            reason = reason.as_str(),
            cancelled,
            "blocked user from re-invitation"
        );
        Ok(())
    }

    /// Count a completed sync cycle and, when due, start a full
    /// reconciliation in the background.
    ///
    /// The first cycle always reconciles (startup catch-up); afterwards
    /// the configured interval applies.
    pub fn handle_sync_complete(self: &Arc<Self>) {
        let count = self.sync_count.fetch_add(1, Ordering::Relaxed) + 1;

        if !self.startup_reconcile_done.swap(true, Ordering::Relaxed) {
            self.spawn_reconcile("startup");
            return;
        }

        let interval = self.config.reconcile_interval_cycles;
        if interval > 0 && count % interval == 0 {
            self.spawn_reconcile("periodic");
        }
    }

    fn spawn_reconcile(self: &Arc<Self>, source: &'static str) {
        if self.reconcile_running.swap(true, Ordering::SeqCst) {
            debug!(source, "full reconciliation already running, skipping");
            return;
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.full_reconcile(source).await;
            engine.reconcile_running.store(false, Ordering::SeqCst);
        });
    }

    // ------------------------------------------------------------------
    // Full reconciliation
    // ------------------------------------------------------------------

    /// Compare every configured space against its target rooms and enqueue
    /// invites for members missing from the targets.
    ///
    /// Long-running by design: membership is fetched per space/room and
    /// the task yields between spaces so event handling stays prompt.
    pub async fn full_reconcile(&self, source: &str) {
        let spaces = match self.db.lock().await.space_ids() {
            Ok(spaces) => spaces,
            Err(e) => {
                warn!(source, error = %e, "reconciliation aborted: cannot list spaces");
                return;
            }
        };

        if spaces.is_empty() {
            debug!(source, "no autoinvite rules configured, skipping reconciliation");
            return;
        }

        info!(source, spaces = spaces.len(), "starting full reconciliation");
        let mut total_queued = 0usize;

        for space in &spaces {
            match self.reconcile_space(space).await {
                Ok(queued) => total_queued += queued,
                Err(e) => warn!(source, space = %space, error = %e, "space reconciliation failed"),
            }
            // Keep the event loop responsive between scans.
            tokio::task::yield_now().await;
        }

        info!(source, queued = total_queued, "full reconciliation done");
        if total_queued > 0 {
            self.dispatch_notify.notify_one();
        }
    }

    async fn reconcile_space(&self, space: &RoomId) -> Result<usize, StoreError> {
        self.ensure_joined(space).await;
        let space_members = match self.client.joined_members(space).await {
            Ok(members) => members,
            Err(e) => {
                warn!(space = %space, error = %e, "cannot fetch space members");
                return Ok(0);
            }
        };

        let targets = self.db.lock().await.target_rooms_for_space(space)?;
        let mut queued = 0usize;

        for room in &targets {
            self.ensure_joined(room).await;
            let room_members = match self.client.joined_members(room).await {
                Ok(members) => members,
                Err(e) => {
                    warn!(room = %room, error = %e, "cannot fetch room members");
                    continue;
                }
            };

            // Deterministic order makes reconciliation logs comparable
            // between passes.
            let mut missing: Vec<&UserId> = space_members
                .iter()
                .filter(|user| !room_members.contains(*user))
                .collect();
            missing.sort();

            let db = self.db.lock().await;
            for user in missing {
                if *user == self.config.bot_user {
                    continue;
                }
                if db.is_blocked(user, room)? {
                    debug!(user = %user, room = %room, "skipping blocked user");
                    continue;
                }
                if db.enqueue_invite(user, room, Some(space))? {
                    queued += 1;
                }
            }
        }

        Ok(queued)
    }

    /// Best-effort join before a member scan.  Joining an already-joined
    /// room is a server-side no-op, so a bot kicked from a configured room
    /// (or configured before ever being invited) recovers on the next
    /// pass.
    async fn ensure_joined(&self, room: &RoomId) {
        if let Err(e) = self.client.join_room(room).await {
            debug!(room = %room, error = %e, "join before scan failed");
        }
    }

    // ------------------------------------------------------------------
    // Manual invites
    // ------------------------------------------------------------------

    /// Enqueue invite intents for one user across matching rules.
    ///
    /// Returns `(matched_rules, queued)`: rules that matched the optional
    /// space filter, and how many fresh intents were actually enqueued
    /// after blocklist and dedup checks.
    pub async fn manual_invite(
        &self,
        user: &UserId,
        space: Option<&RoomId>,
    ) -> Result<(usize, usize), StoreError> {
        let db = self.db.lock().await;

        let rules: Vec<(RoomId, RoomId)> = db
            .list_rules()?
            .into_iter()
            .filter(|rule| space.map_or(true, |s| rule.space_id == *s))
            .map(|rule| (rule.space_id, rule.room_id))
            .collect();

        let mut queued = 0usize;
        for (space_id, room_id) in &rules {
            if db.is_blocked(user, room_id)? {
                debug!(user = %user, room = %room_id, "manual invite skipped: blocked");
                continue;
            }
            if db.enqueue_invite(user, room_id, Some(space_id))? {
                queued += 1;
            }
        }
        drop(db);

        if queued > 0 {
            self.dispatch_notify.notify_one();
        }
        Ok((rules.len(), queued))
    }
}

/// Enqueue one user for every target room of a space, honoring blocks.
fn enqueue_for_targets(
    db: &spacewarden_store::Database,
    user: &UserId,
    space: &RoomId,
    targets: &[RoomId],
) -> Result<usize, StoreError> {
    let mut queued = 0usize;
    for room in targets {
        if db.is_blocked(user, room)? {
            debug!(user = %user, room = %room, "skipping blocked user");
            continue;
        }
        if db.enqueue_invite(user, room, Some(space))? {
            queued += 1;
        }
    }
    Ok(queued)
}
