//! The operator command gateway.
//!
//! One entry point, [`CommandGateway::handle_message`], takes raw message
//! text and returns the reply to post, if any.  The pipeline is strict:
//! prefix filter, shape validation, authorization, then the handler.  A
//! message that fails validation gets a constant error string that echoes
//! nothing back; a handler that hits a store or network failure gets an
//! equally constant internal-error string, with the detail kept in the log.

use std::sync::Arc;
use std::time::Instant;

use spacewarden_shared::{
    authorize, parse_command, Command, Decision, PowerLevelFacts, RoomId, RoomRef, UserId,
    NOT_AUTHORIZED_MESSAGE,
};
use spacewarden_store::{SharedDatabase, StoreError};
use tracing::{debug, info, warn};

use crate::client::Homeserver;
use crate::reconcile::Engine;

/// Constant reply for internal failures.  Details go to the log only.
const INTERNAL_ERROR_MESSAGE: &str = "Internal error.";

/// Constant reply when an alias does not resolve.  Identical for unknown
/// aliases and resolution failures, so probing reveals nothing.
const UNRESOLVED_ROOM_MESSAGE: &str = "Cannot resolve room.";

const HELP_TEXT: &str = "Commands:\n\
    help -- this list\n\
    status -- uptime and queue counters\n\
    rooms -- list autoinvite rules\n\
    invite <user> [space] -- queue invites for a user\n\
    autoinvite add <space> <room> -- add a rule\n\
    autoinvite remove <space> <room> -- remove a rule\n\
    autoinvite list -- list rules\n\
    unblock <user> [room] -- lift re-invitation blocks";

/// Gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Command prefix, e.g. `!!`.
    pub prefix: String,
    /// Minimum power level for restricted commands.
    pub min_power_level: i64,
}

/// Parses, authorizes, and executes operator commands.
pub struct CommandGateway {
    db: SharedDatabase,
    client: Arc<dyn Homeserver>,
    engine: Arc<Engine>,
    config: GatewayConfig,
    started_at: Instant,
}

impl CommandGateway {
    pub fn new(
        db: SharedDatabase,
        client: Arc<dyn Homeserver>,
        engine: Arc<Engine>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            db,
            client,
            engine,
            config,
            started_at: Instant::now(),
        }
    }

    /// Handle one message.  Returns the reply to post, or `None` when the
    /// message is not addressed to the bot at all.
    pub async fn handle_message(
        &self,
        room: &RoomId,
        sender: &UserId,
        body: &str,
    ) -> Option<String> {
        if !body.starts_with(&self.config.prefix) {
            return None;
        }

        let command = match parse_command(&self.config.prefix, body) {
            Ok(command) => command,
            Err(e) => {
                debug!(room = %room, sender = %sender, error = %e, "rejected command");
                return Some(e.to_string());
            }
        };

        if !command.is_public() {
            let facts = self.gather_facts(room, sender).await;
            if authorize(&command, &facts, self.config.min_power_level) == Decision::Deny {
                info!(room = %room, sender = %sender, "command denied");
                return Some(NOT_AUTHORIZED_MESSAGE.to_owned());
            }
        }

        info!(room = %room, sender = %sender, ?command, "executing command");
        let reply = match self.execute(&command, sender).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(room = %room, sender = %sender, error = %e, "command failed");
                INTERNAL_ERROR_MESSAGE.to_owned()
            }
        };
        Some(reply)
    }

    /// Fetch the sender's power levels in the current room and in every
    /// configured space.  Lookup failures leave the fact absent, which the
    /// gate treats as no power.
    async fn gather_facts(&self, room: &RoomId, sender: &UserId) -> PowerLevelFacts {
        let spaces = match self.db.lock().await.space_ids() {
            Ok(spaces) => spaces,
            Err(e) => {
                warn!(error = %e, "cannot list spaces for authorization");
                Vec::new()
            }
        };

        let room_level = match self.client.power_level(room, sender).await {
            Ok(level) => level,
            Err(e) => {
                debug!(room = %room, error = %e, "power level lookup failed");
                None
            }
        };

        let mut space_levels = Vec::with_capacity(spaces.len());
        for space in &spaces {
            match self.client.power_level(space, sender).await {
                Ok(Some(level)) => space_levels.push(level),
                Ok(None) => {}
                Err(e) => {
                    debug!(space = %space, error = %e, "power level lookup failed");
                }
            }
        }

        PowerLevelFacts {
            room_level,
            space_levels,
        }
    }

    async fn execute(&self, command: &Command, sender: &UserId) -> Result<String, StoreError> {
        match command {
            Command::Help => Ok(HELP_TEXT.to_owned()),
            Command::Status => self.status().await,
            Command::Rooms | Command::AutoinviteList => self.list_rules().await,
            Command::Invite { user, space } => self.invite(user, space.as_ref()).await,
            Command::AutoinviteAdd { space, room } => self.add_rule(space, room, sender).await,
            Command::AutoinviteRemove { space, room } => self.remove_rule(space, room).await,
            Command::Unblock { user, room } => self.unblock(user, room.as_ref()).await,
        }
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    async fn status(&self) -> Result<String, StoreError> {
        let (rules, stats) = {
            let db = self.db.lock().await;
            (db.list_rules()?.len(), db.queue_stats()?)
        };

        Ok(format!(
            "Uptime: {}\nSync cycles: {}\nAutoinvite rules: {}\nInvite queue: {} pending, {} invited, {} accepted, {} expired, {} blocked, {} failed",
            format_duration(self.started_at.elapsed().as_secs()),
            self.engine.sync_count(),
            rules,
            stats.pending,
            stats.invited,
            stats.accepted,
            stats.expired,
            stats.blocked,
            stats.failed,
        ))
    }

    async fn list_rules(&self) -> Result<String, StoreError> {
        let rules = self.db.lock().await.list_rules()?;
        if rules.is_empty() {
            return Ok("No autoinvite rules configured.".to_owned());
        }

        // list_rules orders by space then room, so one pass groups them.
        let mut out = String::from("Autoinvite rules:");
        let mut current_space: Option<&RoomId> = None;
        for rule in &rules {
            if current_space != Some(&rule.space_id) {
                out.push_str(&format!("\n{}", rule.space_id));
                current_space = Some(&rule.space_id);
            }
            out.push_str(&format!("\n  -> {}", rule.room_id));
        }
        Ok(out)
    }

    async fn invite(&self, user: &UserId, space: Option<&RoomId>) -> Result<String, StoreError> {
        let (matched, queued) = self.engine.manual_invite(user, space).await?;
        if matched == 0 {
            return Ok("No matching autoinvite rules.".to_owned());
        }
        Ok(format!(
            "Queued {queued} invite(s) for {user} ({matched} rule(s) matched)."
        ))
    }

    async fn add_rule(
        &self,
        space: &RoomRef,
        room: &RoomRef,
        sender: &UserId,
    ) -> Result<String, StoreError> {
        let (space_id, room_id) = match (self.resolve(space).await, self.resolve(room).await) {
            (Some(space_id), Some(room_id)) => (space_id, room_id),
            _ => return Ok(UNRESOLVED_ROOM_MESSAGE.to_owned()),
        };

        let created = self
            .db
            .lock()
            .await
            .add_rule(&space_id, &room_id, Some(sender))?;
        if !created {
            return Ok("Rule already exists.".to_owned());
        }

        // Best effort: the bot needs membership in both rooms to see
        // joins and send invites, but the rule stands either way.
        for target in [&space_id, &room_id] {
            if let Err(e) = self.client.join_room(target).await {
                warn!(room = %target, error = %e, "cannot join room for new rule");
            }
        }

        info!(space = %space_id, room = %room_id, added_by = %sender, "autoinvite rule added");
        Ok(format!("Autoinvite rule added: {space_id} -> {room_id}"))
    }

    async fn remove_rule(&self, space: &RoomRef, room: &RoomRef) -> Result<String, StoreError> {
        let (space_id, room_id) = match (self.resolve(space).await, self.resolve(room).await) {
            (Some(space_id), Some(room_id)) => (space_id, room_id),
            _ => return Ok(UNRESOLVED_ROOM_MESSAGE.to_owned()),
        };

        if self.db.lock().await.remove_rule(&space_id, &room_id)? {
            info!(space = %space_id, room = %room_id, "autoinvite rule removed");
            Ok(format!("Autoinvite rule removed: {space_id} -> {room_id}"))
        } else {
            Ok("No such rule.".to_owned())
        }
    }

    async fn unblock(&self, user: &UserId, room: Option<&RoomId>) -> Result<String, StoreError> {
        let removed = {
            let db = self.db.lock().await;
            match room {
                Some(room) => db.remove_block(user, room)?,
                None => db.remove_blocks_for_user(user)?,
            }
        };

        if removed == 0 {
            return Ok("No blocks found.".to_owned());
        }
        info!(user = %user, removed, "blocks lifted");
        Ok(format!("Removed {removed} block(s) for {user}."))
    }

    async fn resolve(&self, room: &RoomRef) -> Option<RoomId> {
        match room {
            RoomRef::Id(id) => Some(id.clone()),
            RoomRef::Alias(alias) => match self.client.resolve_alias(alias).await {
                Ok(id) => Some(id),
                Err(e) => {
                    debug!(alias = %alias, error = %e, "alias resolution failed");
                    None
                }
            },
        }
    }
}

/// Render seconds as `1d 2h 3m 4s`, omitting leading zero units.
fn format_duration(total_secs: u64) -> String {
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 || !parts.is_empty() {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 || !parts.is_empty() {
        parts.push(format!("{minutes}m"));
    }
    parts.push(format!("{seconds}s"));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHomeserver;
    use crate::reconcile::EngineConfig;
    use spacewarden_store::{BlockReason, Database};
    use tokio::sync::Notify;

    fn user(s: &str) -> UserId {
        s.parse().unwrap()
    }

    fn room(s: &str) -> RoomId {
        s.parse().unwrap()
    }

    fn gateway(db: SharedDatabase, client: Arc<MockHomeserver>) -> CommandGateway {
        let engine = Arc::new(Engine::new(
            db.clone(),
            client.clone(),
            EngineConfig {
                bot_user: user("@warden:example.com"),
                reconcile_interval_cycles: 20,
            },
            Arc::new(Notify::new()),
        ));
        CommandGateway::new(
            db,
            client,
            engine,
            GatewayConfig {
                prefix: "!!".to_owned(),
                min_power_level: 50,
            },
        )
    }

    async fn admin_client(control_room: &RoomId, sender: &UserId) -> Arc<MockHomeserver> {
        let client = Arc::new(MockHomeserver::new());
        client.set_power_level(control_room, sender, 100).await;
        client
    }

    #[tokio::test]
    async fn non_prefixed_messages_are_ignored() {
        let db = Database::open_in_memory().unwrap().into_shared();
        let gw = gateway(db, Arc::new(MockHomeserver::new()));

        let reply = gw
            .handle_message(&room("!r:ex.com"), &user("@a:ex.com"), "hello there")
            .await;
        assert_eq!(reply, None);
    }

    #[tokio::test]
    async fn help_needs_no_power() {
        let db = Database::open_in_memory().unwrap().into_shared();
        let gw = gateway(db, Arc::new(MockHomeserver::new()));

        let reply = gw
            .handle_message(&room("!r:ex.com"), &user("@nobody:ex.com"), "!!help")
            .await
            .unwrap();
        assert!(reply.contains("autoinvite add"));
    }

    #[tokio::test]
    async fn restricted_command_without_power_is_denied() {
        let db = Database::open_in_memory().unwrap().into_shared();
        let gw = gateway(db.clone(), Arc::new(MockHomeserver::new()));

        let reply = gw
            .handle_message(&room("!r:ex.com"), &user("@nobody:ex.com"), "!!rooms")
            .await
            .unwrap();
        assert_eq!(reply, NOT_AUTHORIZED_MESSAGE);
    }

    #[tokio::test]
    async fn space_power_authorizes_in_any_room() {
        let db = Database::open_in_memory().unwrap().into_shared();
        let space = room("!space:ex.com");
        db.lock()
            .await
            .add_rule(&space, &room("!t:ex.com"), None)
            .unwrap();

        let sender = user("@admin:ex.com");
        let client = Arc::new(MockHomeserver::new());
        client.set_power_level(&space, &sender, 50).await;

        let gw = gateway(db, client);
        let reply = gw
            .handle_message(&room("!anywhere:ex.com"), &sender, "!!rooms")
            .await
            .unwrap();
        assert!(reply.contains("!space:ex.com"));
    }

    #[tokio::test]
    async fn injection_payload_touches_nothing() {
        let db = Database::open_in_memory().unwrap().into_shared();
        let control = room("!ctl:ex.com");
        let sender = user("@admin:ex.com");
        let client = admin_client(&control, &sender).await;
        let gw = gateway(db.clone(), client.clone());

        let reply = gw
            .handle_message(
                &control,
                &sender,
                "!!autoinvite add !space:ex.com' OR '1'='1 !room:example.com",
            )
            .await
            .unwrap();

        assert_eq!(reply, "Malformed identifier argument.");
        assert!(db.lock().await.list_rules().unwrap().is_empty());
        assert!(client.invites().await.is_empty());
        assert!(client.joins().await.is_empty());
    }

    #[tokio::test]
    async fn add_rule_by_id_joins_both_rooms() {
        let db = Database::open_in_memory().unwrap().into_shared();
        let control = room("!ctl:ex.com");
        let sender = user("@admin:ex.com");
        let client = admin_client(&control, &sender).await;
        let gw = gateway(db.clone(), client.clone());

        let reply = gw
            .handle_message(&control, &sender, "!!autoinvite add !s:ex.com !r:ex.com")
            .await
            .unwrap();

        assert_eq!(reply, "Autoinvite rule added: !s:ex.com -> !r:ex.com");
        let rules = db.lock().await.list_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].added_by, Some(sender));
        assert_eq!(client.joins().await, vec![room("!s:ex.com"), room("!r:ex.com")]);
    }

    #[tokio::test]
    async fn add_rule_resolves_aliases() {
        let db = Database::open_in_memory().unwrap().into_shared();
        let control = room("!ctl:ex.com");
        let sender = user("@admin:ex.com");
        let client = admin_client(&control, &sender).await;
        client
            .add_alias(&"#general:ex.com".parse().unwrap(), &room("!r:ex.com"))
            .await;
        let gw = gateway(db.clone(), client);

        let reply = gw
            .handle_message(&control, &sender, "!!autoinvite add !s:ex.com #general:ex.com")
            .await
            .unwrap();

        assert_eq!(reply, "Autoinvite rule added: !s:ex.com -> !r:ex.com");
    }

    #[tokio::test]
    async fn unresolvable_alias_gets_constant_reply() {
        let db = Database::open_in_memory().unwrap().into_shared();
        let control = room("!ctl:ex.com");
        let sender = user("@admin:ex.com");
        let gw = gateway(db.clone(), admin_client(&control, &sender).await);

        let reply = gw
            .handle_message(&control, &sender, "!!autoinvite add #nope:ex.com !r:ex.com")
            .await
            .unwrap();

        assert_eq!(reply, UNRESOLVED_ROOM_MESSAGE);
        assert!(db.lock().await.list_rules().unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_rule_is_reported() {
        let db = Database::open_in_memory().unwrap().into_shared();
        let control = room("!ctl:ex.com");
        let sender = user("@admin:ex.com");
        let gw = gateway(db.clone(), admin_client(&control, &sender).await);

        gw.handle_message(&control, &sender, "!!autoinvite add !s:ex.com !r:ex.com")
            .await;
        let reply = gw
            .handle_message(&control, &sender, "!!autoinvite add !s:ex.com !r:ex.com")
            .await
            .unwrap();

        assert_eq!(reply, "Rule already exists.");
    }

    #[tokio::test]
    async fn remove_rule_and_missing_rule() {
        let db = Database::open_in_memory().unwrap().into_shared();
        let control = room("!ctl:ex.com");
        let sender = user("@admin:ex.com");
        db.lock()
            .await
            .add_rule(&room("!s:ex.com"), &room("!r:ex.com"), None)
            .unwrap();
        let gw = gateway(db.clone(), admin_client(&control, &sender).await);

        let reply = gw
            .handle_message(&control, &sender, "!!autoinvite remove !s:ex.com !r:ex.com")
            .await
            .unwrap();
        assert_eq!(reply, "Autoinvite rule removed: !s:ex.com -> !r:ex.com");

        let reply = gw
            .handle_message(&control, &sender, "!!autoinvite remove !s:ex.com !r:ex.com")
            .await
            .unwrap();
        assert_eq!(reply, "No such rule.");
    }

    #[tokio::test]
    async fn invite_reports_matched_and_queued() {
        let db = Database::open_in_memory().unwrap().into_shared();
        let control = room("!ctl:ex.com");
        let sender = user("@admin:ex.com");
        db.lock()
            .await
            .add_rule(&room("!s:ex.com"), &room("!r:ex.com"), None)
            .unwrap();
        let gw = gateway(db.clone(), admin_client(&control, &sender).await);

        let reply = gw
            .handle_message(&control, &sender, "!!invite @alice:ex.com")
            .await
            .unwrap();
        assert_eq!(reply, "Queued 1 invite(s) for @alice:ex.com (1 rule(s) matched).");
        assert_eq!(db.lock().await.queue_stats().unwrap().pending, 1);

        let reply = gw
            .handle_message(&control, &sender, "!!invite @alice:ex.com !other:ex.com")
            .await
            .unwrap();
        assert_eq!(reply, "No matching autoinvite rules.");
    }

    #[tokio::test]
    async fn unblock_lifts_blocks() {
        let db = Database::open_in_memory().unwrap().into_shared();
        let control = room("!ctl:ex.com");
        let sender = user("@admin:ex.com");
        let alice = user("@alice:ex.com");
        {
            let db = db.lock().await;
            db.add_block(&alice, &room("!r1:ex.com"), BlockReason::Left)
                .unwrap();
            db.add_block(&alice, &room("!r2:ex.com"), BlockReason::Banned)
                .unwrap();
        }
        let gw = gateway(db.clone(), admin_client(&control, &sender).await);

        let reply = gw
            .handle_message(&control, &sender, "!!unblock @alice:ex.com")
            .await
            .unwrap();
        assert_eq!(reply, "Removed 2 block(s) for @alice:ex.com.");
        assert!(!db
            .lock()
            .await
            .is_blocked(&alice, &room("!r1:ex.com"))
            .unwrap());

        let reply = gw
            .handle_message(&control, &sender, "!!unblock @alice:ex.com")
            .await
            .unwrap();
        assert_eq!(reply, "No blocks found.");
    }

    #[tokio::test]
    async fn status_reports_counters() {
        let db = Database::open_in_memory().unwrap().into_shared();
        let control = room("!ctl:ex.com");
        let sender = user("@admin:ex.com");
        {
            let db = db.lock().await;
            db.add_rule(&room("!s:ex.com"), &room("!r:ex.com"), None)
                .unwrap();
            db.enqueue_invite(&user("@a:ex.com"), &room("!r:ex.com"), None)
                .unwrap();
        }
        let gw = gateway(db, admin_client(&control, &sender).await);

        let reply = gw
            .handle_message(&control, &sender, "!!status")
            .await
            .unwrap();
        assert!(reply.contains("Autoinvite rules: 1"));
        assert!(reply.contains("1 pending"));
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(4), "4s");
        assert_eq!(format_duration(185), "3m 5s");
        assert_eq!(format_duration(90_061), "1d 1h 1m 1s");
    }
}
