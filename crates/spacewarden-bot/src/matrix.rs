//! Matrix client-server API adapter.
//!
//! Implements [`Homeserver`] over plain HTTP (`/_matrix/client/v3`).  The
//! engine never sees any of this; it only sees the trait and the
//! [`ChatEvent`] stream produced by the sync loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use spacewarden_engine::{ChatEvent, ClientError, Homeserver};
use spacewarden_shared::{RoomAlias, RoomId, UserId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BotConfig;

/// Long-poll timeout passed to `/sync`.
const SYNC_TIMEOUT_MS: u64 = 30_000;

/// Delay before retrying a failed sync request.
const SYNC_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Fallback when a rate-limit response carries no `retry_after_ms`.
const DEFAULT_RETRY_AFTER_MS: u64 = 5_000;

/// An authenticated Matrix client.
pub struct MatrixClient {
    http: reqwest::Client,
    base: String,
    token: String,
    user_id: UserId,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ApiError {
    errcode: Option<String>,
    error: Option<String>,
    retry_after_ms: Option<u64>,
}

#[derive(Deserialize)]
struct LoginResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: SyncRooms,
}

#[derive(Deserialize, Default)]
struct SyncRooms {
    #[serde(default)]
    join: HashMap<String, JoinedRoom>,
}

#[derive(Deserialize)]
struct JoinedRoom {
    #[serde(default)]
    timeline: Timeline,
}

#[derive(Deserialize, Default)]
struct Timeline {
    #[serde(default)]
    events: Vec<RawEvent>,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    event_id: Option<String>,
    sender: Option<String>,
    state_key: Option<String>,
    origin_server_ts: Option<i64>,
    #[serde(default)]
    content: serde_json::Value,
}

#[derive(Deserialize)]
struct JoinedMembersResponse {
    #[serde(default)]
    joined: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize, Default)]
struct PowerLevelsContent {
    #[serde(default)]
    users: HashMap<String, i64>,
    #[serde(default)]
    users_default: i64,
}

#[derive(Deserialize)]
struct ResolveAliasResponse {
    room_id: String,
}

// ---------------------------------------------------------------------------
// Login and sync
// ---------------------------------------------------------------------------

impl MatrixClient {
    /// Log in with password, retrying rate-limited attempts.
    ///
    /// `login_max_retries` of 0 retries indefinitely; any non-rate-limit
    /// failure is fatal.
    pub async fn login(config: &BotConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("cannot build HTTP client")?;
        let base = config.homeserver.clone();

        let body = json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": config.user_id.as_str() },
            "password": config.password,
            "initial_device_display_name": "spacewarden",
        });

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let resp = http
                .post(format!("{base}/_matrix/client/v3/login"))
                .json(&body)
                .send()
                .await
                .context("login request failed")?;

            if resp.status().is_success() {
                let login: LoginResponse =
                    resp.json().await.context("malformed login response")?;
                info!(user = %config.user_id, "logged in");
                return Ok(Self {
                    http,
                    base,
                    token: login.access_token,
                    user_id: config.user_id.clone(),
                });
            }

            if resp.status() == StatusCode::TOO_MANY_REQUESTS {
                if config.login_max_retries > 0 && attempt >= config.login_max_retries {
                    bail!("login rate limited {attempt} times, giving up");
                }
                let delay = resp
                    .json::<ApiError>()
                    .await
                    .ok()
                    .and_then(|e| e.retry_after_ms)
                    .unwrap_or(DEFAULT_RETRY_AFTER_MS);
                warn!(attempt, delay_ms = delay, "login rate limited, retrying");
                tokio::time::sleep(Duration::from_millis(delay)).await;
                continue;
            }

            let status = resp.status();
            let detail = resp
                .json::<ApiError>()
                .await
                .ok()
                .and_then(|e| e.error)
                .unwrap_or_default();
            bail!("login failed with {status}: {detail}");
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Long-poll `/sync` forever, translating timeline events into
    /// [`ChatEvent`]s on `tx`.  Ends when shutdown flips or the receiver
    /// is dropped.
    pub async fn run_sync(
        self: Arc<Self>,
        mut since: Option<String>,
        tx: mpsc::Sender<ChatEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(resuming = since.is_some(), "sync loop started");
        loop {
            let sync = tokio::select! {
                sync = self.sync_once(since.as_deref()) => sync,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let sync = match sync {
                Ok(sync) => sync,
                Err(e) => {
                    warn!(error = %e, "sync failed, retrying");
                    tokio::time::sleep(SYNC_RETRY_DELAY).await;
                    continue;
                }
            };

            for (room_raw, joined) in sync.rooms.join {
                let room: RoomId = match room_raw.parse() {
                    Ok(room) => room,
                    Err(_) => continue,
                };
                for raw in joined.timeline.events {
                    if let Some(event) = translate_event(&room, raw) {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }

            since = Some(sync.next_batch.clone());
            let done = ChatEvent::SyncComplete {
                next_batch: Some(sync.next_batch),
            };
            if tx.send(done).await.is_err() {
                return;
            }
        }
        info!("sync loop stopped");
    }

    async fn sync_once(&self, since: Option<&str>) -> Result<SyncResponse, ClientError> {
        let mut req = self
            .http
            .get(format!("{}/_matrix/client/v3/sync", self.base))
            .bearer_auth(&self.token)
            .query(&[("timeout", SYNC_TIMEOUT_MS.to_string())]);
        if let Some(since) = since {
            req = req.query(&[("since", since)]);
        }

        let resp = req.send().await.map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        resp.json().await.map_err(transport_error)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/_matrix/client/v3{}", self.base, path)
    }
}

/// Turn one raw timeline event into a [`ChatEvent`], or drop it.
fn translate_event(room: &RoomId, raw: RawEvent) -> Option<ChatEvent> {
    let timestamp_ms = raw.origin_server_ts.unwrap_or(0);

    match raw.kind.as_str() {
        "m.room.member" => {
            // The affected user is the state key, not the sender.
            let user: UserId = raw.state_key?.parse().ok()?;
            match raw.content.get("membership")?.as_str()? {
                "join" => Some(ChatEvent::MemberJoined {
                    event_id: raw.event_id,
                    room: room.clone(),
                    user,
                    timestamp_ms,
                }),
                "invite" => Some(ChatEvent::MemberInvited {
                    event_id: raw.event_id,
                    room: room.clone(),
                    user,
                    timestamp_ms,
                }),
                membership @ ("leave" | "ban") => Some(ChatEvent::MemberLeft {
                    event_id: raw.event_id,
                    room: room.clone(),
                    user,
                    banned: membership == "ban",
                    timestamp_ms,
                }),
                _ => None,
            }
        }
        "m.room.message" => {
            let sender: UserId = raw.sender?.parse().ok()?;
            let body = raw.content.get("body")?.as_str()?.to_owned();
            Some(ChatEvent::Message {
                event_id: raw.event_id,
                room: room.clone(),
                sender,
                body,
                timestamp_ms,
            })
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Homeserver impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Homeserver for MatrixClient {
    async fn joined_members(&self, room: &RoomId) -> Result<HashSet<UserId>, ClientError> {
        let url = self.url(&format!("/rooms/{}/joined_members", escape(room.as_str())));
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }

        let body: JoinedMembersResponse = resp.json().await.map_err(transport_error)?;
        let mut members = HashSet::with_capacity(body.joined.len());
        for raw in body.joined.into_keys() {
            match raw.parse::<UserId>() {
                Ok(user) => {
                    members.insert(user);
                }
                Err(_) => debug!(room = %room, "skipping unparseable member ID"),
            }
        }
        Ok(members)
    }

    async fn invite(&self, room: &RoomId, user: &UserId) -> Result<(), ClientError> {
        let url = self.url(&format!("/rooms/{}/invite", escape(room.as_str())));
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&json!({ "user_id": user.as_str() }))
            .send()
            .await
            .map_err(transport_error)?;
        if resp.status().is_success() {
            return Ok(());
        }
        Err(api_error(resp).await)
    }

    async fn power_level(
        &self,
        room: &RoomId,
        user: &UserId,
    ) -> Result<Option<i64>, ClientError> {
        let url = self.url(&format!(
            "/rooms/{}/state/m.room.power_levels",
            escape(room.as_str())
        ));
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport_error)?;

        // No power-levels state means no fact, not an error.
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }

        let levels: PowerLevelsContent = resp.json().await.map_err(transport_error)?;
        let level = levels
            .users
            .get(user.as_str())
            .copied()
            .unwrap_or(levels.users_default);
        Ok(Some(level))
    }

    async fn resolve_alias(&self, alias: &RoomAlias) -> Result<RoomId, ClientError> {
        let url = self.url(&format!("/directory/room/{}", escape(alias.as_str())));
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }

        let body: ResolveAliasResponse = resp.json().await.map_err(transport_error)?;
        body.room_id
            .parse()
            .map_err(|_| ClientError::Rejected("alias resolved to an invalid room ID".into()))
    }

    async fn join_room(&self, room: &RoomId) -> Result<(), ClientError> {
        let url = self.url(&format!("/join/{}", escape(room.as_str())));
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&json!({}))
            .send()
            .await
            .map_err(transport_error)?;
        if resp.status().is_success() {
            return Ok(());
        }
        Err(api_error(resp).await)
    }

    async fn send_notice(&self, room: &RoomId, body: &str) -> Result<(), ClientError> {
        let txn = Uuid::new_v4();
        let url = self.url(&format!(
            "/rooms/{}/send/m.room.message/{txn}",
            escape(room.as_str())
        ));
        let resp = self
            .http
            .put(url)
            .bearer_auth(&self.token)
            .json(&json!({ "msgtype": "m.notice", "body": body }))
            .send()
            .await
            .map_err(transport_error)?;
        if resp.status().is_success() {
            return Ok(());
        }
        Err(api_error(resp).await)
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn transport_error(e: reqwest::Error) -> ClientError {
    ClientError::Transient(e.to_string())
}

/// Map a non-success response onto [`ClientError`].
async fn api_error(resp: reqwest::Response) -> ClientError {
    let status = resp.status();
    let body = resp.json::<ApiError>().await.ok();
    let errcode = body
        .as_ref()
        .and_then(|b| b.errcode.as_deref())
        .unwrap_or("");
    let message = body
        .as_ref()
        .and_then(|b| b.error.clone())
        .unwrap_or_default();

    if status == StatusCode::TOO_MANY_REQUESTS || errcode == "M_LIMIT_EXCEEDED" {
        let retry_after_ms = body
            .as_ref()
            .and_then(|b| b.retry_after_ms)
            .unwrap_or(DEFAULT_RETRY_AFTER_MS);
        return ClientError::RateLimited { retry_after_ms };
    }
    if status.is_server_error() {
        return ClientError::Transient(format!("{status}: {message}"));
    }
    match errcode {
        "M_NOT_FOUND" => ClientError::UnknownRoom,
        // Synapse reports an invite to an existing member as forbidden.
        "M_FORBIDDEN" if message.contains("already in the room") => ClientError::AlreadyMember,
        "M_INVALID_USERNAME" | "M_UNKNOWN_TOKEN" if message.contains("user") => {
            ClientError::UnknownUser
        }
        _ => ClientError::Rejected(format!("{errcode}: {message}")),
    }
}

/// Percent-encode one URL path segment.  Matrix room IDs and aliases carry
/// `!`, `#`, and `:`, none of which may appear raw in a path.
fn escape(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for b in segment.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(s: &str) -> RoomId {
        s.parse().unwrap()
    }

    #[test]
    fn escapes_matrix_sigils() {
        assert_eq!(escape("!room:ex.com"), "%21room%3Aex.com");
        assert_eq!(escape("#alias:ex.com"), "%23alias%3Aex.com");
        assert_eq!(escape("plain-segment_1.0~x"), "plain-segment_1.0~x");
    }

    #[test]
    fn member_join_translates_to_event() {
        let raw = RawEvent {
            kind: "m.room.member".into(),
            event_id: Some("$ev1".into()),
            sender: Some("@alice:ex.com".into()),
            state_key: Some("@alice:ex.com".into()),
            origin_server_ts: Some(1_000),
            content: json!({ "membership": "join" }),
        };
        match translate_event(&room("!r:ex.com"), raw) {
            Some(ChatEvent::MemberJoined { user, .. }) => {
                assert_eq!(user.as_str(), "@alice:ex.com");
            }
            other => panic!("unexpected translation: {other:?}"),
        }
    }

    #[test]
    fn ban_translates_to_member_left() {
        let raw = RawEvent {
            kind: "m.room.member".into(),
            event_id: Some("$ev2".into()),
            sender: Some("@mod:ex.com".into()),
            state_key: Some("@alice:ex.com".into()),
            origin_server_ts: Some(1_000),
            content: json!({ "membership": "ban" }),
        };
        assert!(matches!(
            translate_event(&room("!r:ex.com"), raw),
            Some(ChatEvent::MemberLeft { banned: true, .. })
        ));
    }

    #[test]
    fn unrelated_events_are_dropped() {
        let raw = RawEvent {
            kind: "m.room.topic".into(),
            event_id: Some("$ev3".into()),
            sender: Some("@alice:ex.com".into()),
            state_key: Some(String::new()),
            origin_server_ts: Some(1_000),
            content: json!({ "topic": "hello" }),
        };
        assert!(translate_event(&room("!r:ex.com"), raw).is_none());

        let knock = RawEvent {
            kind: "m.room.member".into(),
            event_id: Some("$ev4".into()),
            sender: Some("@bob:ex.com".into()),
            state_key: Some("@bob:ex.com".into()),
            origin_server_ts: Some(1_000),
            content: json!({ "membership": "knock" }),
        };
        assert!(translate_event(&room("!r:ex.com"), knock).is_none());
    }

    #[test]
    fn invite_translates_to_member_invited() {
        let raw = RawEvent {
            kind: "m.room.member".into(),
            event_id: Some("$ev6".into()),
            sender: Some("@admin:ex.com".into()),
            state_key: Some("@warden:ex.com".into()),
            origin_server_ts: Some(1_000),
            content: json!({ "membership": "invite" }),
        };
        match translate_event(&room("!r:ex.com"), raw) {
            Some(ChatEvent::MemberInvited { user, .. }) => {
                assert_eq!(user.as_str(), "@warden:ex.com");
            }
            other => panic!("unexpected translation: {other:?}"),
        }
    }

    #[test]
    fn message_translates_with_body() {
        let raw = RawEvent {
            kind: "m.room.message".into(),
            event_id: Some("$ev5".into()),
            sender: Some("@alice:ex.com".into()),
            state_key: None,
            origin_server_ts: Some(1_000),
            content: json!({ "msgtype": "m.text", "body": "!!help" }),
        };
        match translate_event(&room("!r:ex.com"), raw) {
            Some(ChatEvent::Message { body, .. }) => assert_eq!(body, "!!help"),
            other => panic!("unexpected translation: {other:?}"),
        }
    }
}
