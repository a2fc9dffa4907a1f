//! # spacewarden-bot
//!
//! Matrix bot binary: logs in, syncs, and feeds events into the engine.
//!
//! Layout:
//! - the sync loop ([`matrix::MatrixClient::run_sync`]) produces
//!   [`ChatEvent`]s on a channel;
//! - the main loop deduplicates them against the store and routes them to
//!   the reconciliation engine and the command gateway;
//! - the invite dispatcher drains the queue in the background.

mod config;
mod matrix;

use std::sync::Arc;
use std::time::Duration;

use spacewarden_engine::{
    ChatEvent, CommandGateway, DispatcherConfig, Engine, EngineConfig, GatewayConfig,
    Homeserver, InviteDispatcher,
};
use spacewarden_store::{Database, SharedDatabase};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::BotConfig;
use crate::matrix::MatrixClient;

/// Seen-event retention, in days.
const EVENT_RETENTION_DAYS: i64 = 7;

/// Run the seen-event cleanup every this many sync cycles.
const CLEANUP_INTERVAL_CYCLES: u64 = 100;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,spacewarden=debug")),
        )
        .init();

    info!("starting spacewarden v{}", env!("CARGO_PKG_VERSION"));

    let config = BotConfig::from_env()?;
    info!(
        homeserver = %config.homeserver,
        user = %config.user_id,
        prefix = %config.command_prefix,
        "loaded configuration"
    );

    let db = match &config.db_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    if let Some(path) = db.path() {
        info!(path = %path.display(), "database open");
    }
    let since = db.get_next_batch()?;
    let db: SharedDatabase = db.into_shared();

    let client = Arc::new(MatrixClient::login(&config).await?);

    // Wiring: the engine produces queue items and pokes the dispatcher
    // through the notify handle; the gateway runs commands against both.
    let dispatch_notify = Arc::new(Notify::new());
    let engine = Arc::new(Engine::new(
        db.clone(),
        client.clone() as Arc<dyn Homeserver>,
        EngineConfig {
            bot_user: client.user_id().clone(),
            reconcile_interval_cycles: config.reconcile_interval_cycles,
        },
        dispatch_notify.clone(),
    ));
    let dispatcher = InviteDispatcher::new(
        db.clone(),
        client.clone() as Arc<dyn Homeserver>,
        DispatcherConfig {
            max_attempts: config.invite_max_attempts,
            accept_timeout: match config.invite_accept_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            poll_interval: Duration::from_secs(30),
        },
        dispatch_notify,
    );
    let gateway = CommandGateway::new(
        db.clone(),
        client.clone() as Arc<dyn Homeserver>,
        engine.clone(),
        GatewayConfig {
            prefix: config.command_prefix.clone(),
            min_power_level: config.min_power_level,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, mut event_rx) = mpsc::channel::<ChatEvent>(256);

    let dispatcher_task = tokio::spawn(dispatcher.run(shutdown_rx.clone()));
    let sync_task = tokio::spawn(client.clone().run_sync(since, event_tx, shutdown_rx));

    // Replayed events older than this are state catch-up, not live
    // commands.
    let started_at_ms = chrono::Utc::now().timestamp_millis();
    let mut cycles_since_cleanup = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                handle_event(
                    event,
                    &db,
                    &engine,
                    &gateway,
                    client.as_ref(),
                    started_at_ms,
                    &mut cycles_since_cleanup,
                )
                .await;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = sync_task.await;
    let _ = dispatcher_task.await;
    info!("spacewarden stopped");
    Ok(())
}

async fn handle_event(
    event: ChatEvent,
    db: &SharedDatabase,
    engine: &Arc<Engine>,
    gateway: &CommandGateway,
    client: &MatrixClient,
    started_at_ms: i64,
    cycles_since_cleanup: &mut u64,
) {
    match event {
        ChatEvent::MemberJoined {
            event_id,
            room,
            user,
            timestamp_ms,
        } => {
            if seen(db, event_id.as_deref(), "member", room.as_str(), Some(user.as_str()), timestamp_ms).await {
                return;
            }
            if let Err(e) = engine.handle_member_joined(&room, &user).await {
                warn!(room = %room, user = %user, error = %e, "join handling failed");
            }
        }

        ChatEvent::MemberInvited {
            event_id,
            room,
            user,
            timestamp_ms,
        } => {
            if seen(db, event_id.as_deref(), "member", room.as_str(), Some(user.as_str()), timestamp_ms).await {
                return;
            }
            engine.handle_member_invited(&room, &user).await;
        }

        ChatEvent::MemberLeft {
            event_id,
            room,
            user,
            banned,
            timestamp_ms,
        } => {
            if seen(db, event_id.as_deref(), "member", room.as_str(), Some(user.as_str()), timestamp_ms).await {
                return;
            }
            if let Err(e) = engine.handle_member_left(&room, &user, banned).await {
                warn!(room = %room, user = %user, error = %e, "leave handling failed");
            }
        }

        ChatEvent::Message {
            event_id,
            room,
            sender,
            body,
            timestamp_ms,
        } => {
            if sender == *client.user_id() {
                return;
            }
            // Messages replayed from before startup never run as commands.
            if timestamp_ms < started_at_ms {
                return;
            }
            if seen(db, event_id.as_deref(), "message", room.as_str(), Some(sender.as_str()), timestamp_ms).await {
                return;
            }

            if let Some(reply) = gateway.handle_message(&room, &sender, &body).await {
                if let Err(e) = client.send_notice(&room, &reply).await {
                    warn!(room = %room, error = %e, "cannot post reply");
                }
            }
        }

        ChatEvent::SyncComplete { next_batch } => {
            engine.handle_sync_complete();

            let db = db.lock().await;
            if let Some(token) = next_batch {
                if let Err(e) = db.set_next_batch(&token) {
                    warn!(error = %e, "cannot persist sync token");
                }
            }

            *cycles_since_cleanup += 1;
            if *cycles_since_cleanup >= CLEANUP_INTERVAL_CYCLES {
                *cycles_since_cleanup = 0;
                if let Err(e) = db.cleanup_old_events(EVENT_RETENTION_DAYS) {
                    warn!(error = %e, "seen-event cleanup failed");
                }
            }
        }
    }
}

/// Check-and-mark dedup for one event.  Events without an ID are always
/// processed.
async fn seen(
    db: &SharedDatabase,
    event_id: Option<&str>,
    event_type: &str,
    room_id: &str,
    sender: Option<&str>,
    timestamp_ms: i64,
) -> bool {
    let Some(event_id) = event_id else {
        return false;
    };

    let db = db.lock().await;
    match db.is_event_seen(event_id) {
        Ok(true) => {
            debug!(event_id, "skipping already-processed event");
            return true;
        }
        Ok(false) => {}
        Err(e) => {
            warn!(event_id, error = %e, "seen-event lookup failed");
            return false;
        }
    }

    if let Err(e) = db.mark_event_seen(event_id, event_type, room_id, sender, timestamp_ms) {
        warn!(event_id, error = %e, "cannot record seen event");
    }
    false
}
