//! The invite dispatcher.
//!
//! A single worker drains pending queue items in FIFO order and calls the
//! homeserver invite primitive.  Being the only consumer, it trivially
//! guarantees at most one in-flight invite per `(user, room)` pair.
//!
//! Status transitions are written before and after every external call, so
//! a crash or shutdown at any point leaves items either `pending` (safe to
//! resume, attempts preserved) or in a truthful terminal state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use spacewarden_store::{InviteQueueItem, InviteStatus, SharedDatabase};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::client::{ClientError, Homeserver};

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Retry ceiling for retryable invite failures.
    pub max_attempts: u32,
    /// How long an issued invite may wait for acceptance before it is
    /// marked expired.  `None` disables expiry.
    pub accept_timeout: Option<Duration>,
    /// Fallback poll interval for picking up items missed by wakeups
    /// (e.g. items resumed from a previous run).
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            accept_timeout: None,
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Outcome of processing one queue item.
enum Outcome {
    /// The item reached a new status; move on.
    Done,
    /// A retryable failure: wait, then re-fetch the queue.
    RetryAfter(Duration),
}

/// Drains the invite queue against the homeserver.
pub struct InviteDispatcher {
    db: SharedDatabase,
    client: Arc<dyn Homeserver>,
    config: DispatcherConfig,
    notify: Arc<Notify>,
}

impl InviteDispatcher {
    pub fn new(
        db: SharedDatabase,
        client: Arc<dyn Homeserver>,
        config: DispatcherConfig,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            db,
            client,
            config,
            notify,
        }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("invite dispatcher started");
        let mut tick = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tick.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            self.drain_once(&mut shutdown).await;
            self.sweep_expired().await;
        }

        info!("invite dispatcher stopped");
    }

    /// Process pending items until the queue is empty or shutdown is
    /// requested.
    pub async fn drain_once(&self, shutdown: &mut watch::Receiver<bool>) {
        loop {
            let batch = match self.db.lock().await.next_pending(16) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "cannot read invite queue");
                    return;
                }
            };
            if batch.is_empty() {
                return;
            }

            for item in batch {
                if *shutdown.borrow() {
                    // Items stay pending with their attempt counts; the
                    // next run resumes them.
                    return;
                }
                if let Outcome::RetryAfter(delay) = self.process(&item).await {
                    // A server-supplied retry_after can be long; never make
                    // shutdown wait for it.
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                    if *shutdown.borrow() {
                        return;
                    }
                    break;
                }
            }
        }
    }

    async fn process(&self, item: &InviteQueueItem) -> Outcome {
        // Defense against a block created after enqueueing.  Bind the
        // result first so the database guard is released before the arms
        // run; matching on the locked call directly keeps the guard alive
        // across the arms and deadlocks `set_status`.
        let blocked = self.db.lock().await.is_blocked(&item.user_id, &item.room_id);
        match blocked {
            Ok(true) => {
                debug!(user = %item.user_id, room = %item.room_id, "skipping blocked item");
                self.set_status(item, InviteStatus::Blocked).await;
                return Outcome::Done;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "blocklist check failed, leaving item pending");
                return Outcome::RetryAfter(self.backoff(item.attempts + 1));
            }
        }

        match self.client.invite(&item.room_id, &item.user_id).await {
            Ok(()) => {
                info!(user = %item.user_id, room = %item.room_id, "invited");
                let expires_at = self
                    .config
                    .accept_timeout
                    .map(|t| {
                        Utc::now()
                            + chrono::Duration::from_std(t)
                                .unwrap_or_else(|_| chrono::Duration::zero())
                    });
                if let Err(e) = self.db.lock().await.mark_invited(item.id, expires_at) {
                    warn!(error = %e, "failed to mark item invited");
                }
                Outcome::Done
            }
            Err(ClientError::AlreadyMember) => {
                debug!(user = %item.user_id, room = %item.room_id, "already a member");
                self.set_status(item, InviteStatus::Accepted).await;
                Outcome::Done
            }
            Err(e @ (ClientError::UnknownRoom | ClientError::UnknownUser | ClientError::Rejected(_))) => {
                warn!(user = %item.user_id, room = %item.room_id, error = %e, "invite failed permanently");
                self.set_status(item, InviteStatus::Failed).await;
                Outcome::Done
            }
            Err(e) => {
                // Retryable: rate limit or transient failure.
                let attempts = match self.db.lock().await.record_invite_attempt(item.id) {
                    Ok(attempts) => attempts,
                    Err(store_err) => {
                        warn!(error = %store_err, "cannot record invite attempt");
                        item.attempts + 1
                    }
                };

                if attempts >= self.config.max_attempts {
                    warn!(
                        user = %item.user_id,
                        room = %item.room_id,
                        attempts,
                        error = %e,
                        "retries exhausted"
                    );
                    self.set_status(item, InviteStatus::Failed).await;
                    return Outcome::Done;
                }

                let delay = match e {
                    ClientError::RateLimited { retry_after_ms } => {
                        Duration::from_millis(retry_after_ms.max(1))
                    }
                    _ => self.backoff(attempts),
                };
                debug!(
                    user = %item.user_id,
                    room = %item.room_id,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "transient invite failure, will retry"
                );
                Outcome::RetryAfter(delay)
            }
        }
    }

    /// Mark overdue `invited` items `expired` unless the user joined in
    /// the meantime.
    pub async fn sweep_expired(&self) {
        if self.config.accept_timeout.is_none() {
            return;
        }

        let overdue = match self.db.lock().await.overdue_invited(Utc::now()) {
            Ok(overdue) => overdue,
            Err(e) => {
                warn!(error = %e, "cannot list overdue invites");
                return;
            }
        };

        for item in overdue {
            let joined = match self.client.joined_members(&item.room_id).await {
                Ok(members) => members.contains(&item.user_id),
                // Leave the item for the next sweep rather than expiring
                // on incomplete information.
                Err(e) => {
                    warn!(room = %item.room_id, error = %e, "membership check failed");
                    continue;
                }
            };

            let status = if joined {
                InviteStatus::Accepted
            } else {
                InviteStatus::Expired
            };
            info!(user = %item.user_id, room = %item.room_id, status = status.as_str(), "acceptance deadline passed");
            self.set_status(&item, status).await;
        }
    }

    async fn set_status(&self, item: &InviteQueueItem, status: InviteStatus) {
        if let Err(e) = self.db.lock().await.set_invite_status(item.id, status) {
            warn!(error = %e, status = status.as_str(), "failed to update invite status");
        }
    }

    /// Linear backoff with jitter.
    fn backoff(&self, attempts: u32) -> Duration {
        let base = Duration::from_millis(500) * attempts;
        base + Duration::from_millis(rand::thread_rng().gen_range(0..250u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHomeserver;
    use spacewarden_shared::{RoomId, UserId};
    use spacewarden_store::{BlockReason, Database};

    fn user(s: &str) -> UserId {
        s.parse().unwrap()
    }

    fn room(s: &str) -> RoomId {
        s.parse().unwrap()
    }

    fn dispatcher(
        db: SharedDatabase,
        client: Arc<MockHomeserver>,
        config: DispatcherConfig,
    ) -> (InviteDispatcher, watch::Sender<bool>, watch::Receiver<bool>) {
        // The sender stays alive so `changed()` keeps waiting instead of
        // resolving with a closed-channel error.
        let (tx, rx) = watch::channel(false);
        (
            InviteDispatcher::new(db, client, config, Arc::new(Notify::new())),
            tx,
            rx,
        )
    }

    #[tokio::test]
    async fn successful_invite_marks_invited() {
        let db = Database::open_in_memory().unwrap().into_shared();
        let alice = user("@alice:ex.com");
        let target = room("!room:ex.com");
        db.lock()
            .await
            .enqueue_invite(&alice, &target, None)
            .unwrap();

        let client = Arc::new(MockHomeserver::new());
        let (dispatcher, _tx, mut shutdown) =
            dispatcher(db.clone(), client.clone(), DispatcherConfig::default());
        dispatcher.drain_once(&mut shutdown).await;

        assert_eq!(client.invites().await, vec![(target, alice)]);
        assert_eq!(db.lock().await.queue_stats().unwrap().invited, 1);
    }

    #[tokio::test]
    async fn block_created_after_enqueue_suppresses_invite() {
        let db = Database::open_in_memory().unwrap().into_shared();
        let alice = user("@alice:ex.com");
        let target = room("!room:ex.com");
        {
            let db = db.lock().await;
            db.enqueue_invite(&alice, &target, None).unwrap();
            db.add_block(&alice, &target, BlockReason::Left).unwrap();
        }

        let client = Arc::new(MockHomeserver::new());
        let (dispatcher, _tx, mut shutdown) =
            dispatcher(db.clone(), client.clone(), DispatcherConfig::default());
        dispatcher.drain_once(&mut shutdown).await;

        assert!(client.invites().await.is_empty());
        assert_eq!(db.lock().await.queue_stats().unwrap().blocked, 1);
    }

    #[tokio::test]
    async fn already_member_is_accepted_without_retry() {
        let db = Database::open_in_memory().unwrap().into_shared();
        db.lock()
            .await
            .enqueue_invite(&user("@alice:ex.com"), &room("!room:ex.com"), None)
            .unwrap();

        let client = Arc::new(MockHomeserver::new());
        client.push_invite_result(Err(ClientError::AlreadyMember)).await;

        let (dispatcher, _tx, mut shutdown) =
            dispatcher(db.clone(), client.clone(), DispatcherConfig::default());
        dispatcher.drain_once(&mut shutdown).await;

        assert_eq!(client.invites().await.len(), 1);
        assert_eq!(db.lock().await.queue_stats().unwrap().accepted, 1);
    }

    #[tokio::test]
    async fn unknown_room_fails_without_retry() {
        let db = Database::open_in_memory().unwrap().into_shared();
        db.lock()
            .await
            .enqueue_invite(&user("@alice:ex.com"), &room("!room:ex.com"), None)
            .unwrap();

        let client = Arc::new(MockHomeserver::new());
        client.push_invite_result(Err(ClientError::UnknownRoom)).await;

        let (dispatcher, _tx, mut shutdown) =
            dispatcher(db.clone(), client.clone(), DispatcherConfig::default());
        dispatcher.drain_once(&mut shutdown).await;

        assert_eq!(client.invites().await.len(), 1);
        assert_eq!(db.lock().await.queue_stats().unwrap().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_up_to_ceiling() {
        let db = Database::open_in_memory().unwrap().into_shared();
        db.lock()
            .await
            .enqueue_invite(&user("@alice:ex.com"), &room("!room:ex.com"), None)
            .unwrap();

        let client = Arc::new(MockHomeserver::new());
        for _ in 0..3 {
            client
                .push_invite_result(Err(ClientError::Transient("connection reset".into())))
                .await;
        }

        let (dispatcher, _tx, mut shutdown) = dispatcher(
            db.clone(),
            client.clone(),
            DispatcherConfig {
                max_attempts: 3,
                ..DispatcherConfig::default()
            },
        );
        dispatcher.drain_once(&mut shutdown).await;

        assert_eq!(client.invites().await.len(), 3);
        assert_eq!(db.lock().await.queue_stats().unwrap().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_then_success() {
        let db = Database::open_in_memory().unwrap().into_shared();
        db.lock()
            .await
            .enqueue_invite(&user("@alice:ex.com"), &room("!room:ex.com"), None)
            .unwrap();

        let client = Arc::new(MockHomeserver::new());
        client
            .push_invite_result(Err(ClientError::RateLimited { retry_after_ms: 100 }))
            .await;

        let (dispatcher, _tx, mut shutdown) =
            dispatcher(db.clone(), client.clone(), DispatcherConfig::default());
        dispatcher.drain_once(&mut shutdown).await;

        assert_eq!(client.invites().await.len(), 2);
        assert_eq!(db.lock().await.queue_stats().unwrap().invited, 1);
    }

    #[tokio::test]
    async fn shutdown_interrupts_backoff_wait() {
        let db = Database::open_in_memory().unwrap().into_shared();
        db.lock()
            .await
            .enqueue_invite(&user("@alice:ex.com"), &room("!room:ex.com"), None)
            .unwrap();

        let client = Arc::new(MockHomeserver::new());
        client
            .push_invite_result(Err(ClientError::RateLimited {
                retry_after_ms: 600_000,
            }))
            .await;

        let (tx, mut shutdown) = watch::channel(false);
        let dispatcher = InviteDispatcher::new(
            db.clone(),
            client,
            DispatcherConfig::default(),
            Arc::new(Notify::new()),
        );

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });

        // Without racing the backoff sleep against shutdown this would sit
        // out the full ten-minute retry delay.
        tokio::time::timeout(Duration::from_secs(5), dispatcher.drain_once(&mut shutdown))
            .await
            .expect("drain_once must return once shutdown flips");

        let pending = db.lock().await.next_pending(1).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
    }

    #[tokio::test]
    async fn expiry_sweep_distinguishes_joined_users() {
        let db = Database::open_in_memory().unwrap().into_shared();
        let target = room("!room:ex.com");
        let gone = user("@gone:ex.com");
        let joined = user("@joined:ex.com");
        {
            let db = db.lock().await;
            let deadline = Utc::now() - chrono::Duration::seconds(10);
            db.enqueue_invite(&gone, &target, None).unwrap();
            db.enqueue_invite(&joined, &target, None).unwrap();
            for item in db.next_pending(10).unwrap() {
                db.mark_invited(item.id, Some(deadline)).unwrap();
            }
        }

        let client = Arc::new(MockHomeserver::new());
        client.set_members(&target, ["@joined:ex.com"]).await;

        let (dispatcher, _tx, _shutdown) = dispatcher(
            db.clone(),
            client,
            DispatcherConfig {
                accept_timeout: Some(Duration::from_secs(60)),
                ..DispatcherConfig::default()
            },
        );
        dispatcher.sweep_expired().await;

        let stats = db.lock().await.queue_stats().unwrap();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.accepted, 1);
    }
}
