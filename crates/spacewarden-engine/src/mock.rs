//! A scriptable in-memory homeserver for tests.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use spacewarden_shared::{RoomAlias, RoomId, UserId};
use tokio::sync::Mutex;

use crate::client::{ClientError, Homeserver};

#[derive(Default)]
pub struct MockHomeserver {
    members: Mutex<HashMap<RoomId, HashSet<UserId>>>,
    power_levels: Mutex<HashMap<(RoomId, UserId), i64>>,
    aliases: Mutex<HashMap<RoomAlias, RoomId>>,
    /// Scripted results for upcoming `invite` calls; `Ok(())` once empty.
    invite_results: Mutex<VecDeque<Result<(), ClientError>>>,
    invites: Mutex<Vec<(RoomId, UserId)>>,
    joins: Mutex<Vec<RoomId>>,
    notices: Mutex<Vec<(RoomId, String)>>,
}

impl MockHomeserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_members<'a, I>(&self, room: &RoomId, users: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let set = users
            .into_iter()
            .map(|u| u.parse().expect("valid test user id"))
            .collect();
        self.members.lock().await.insert(room.clone(), set);
    }

    pub async fn set_power_level(&self, room: &RoomId, user: &UserId, level: i64) {
        self.power_levels
            .lock()
            .await
            .insert((room.clone(), user.clone()), level);
    }

    pub async fn add_alias(&self, alias: &RoomAlias, room: &RoomId) {
        self.aliases
            .lock()
            .await
            .insert(alias.clone(), room.clone());
    }

    pub async fn push_invite_result(&self, result: Result<(), ClientError>) {
        self.invite_results.lock().await.push_back(result);
    }

    pub async fn invites(&self) -> Vec<(RoomId, UserId)> {
        self.invites.lock().await.clone()
    }

    pub async fn joins(&self) -> Vec<RoomId> {
        self.joins.lock().await.clone()
    }

    pub async fn notices(&self) -> Vec<(RoomId, String)> {
        self.notices.lock().await.clone()
    }
}

#[async_trait]
impl Homeserver for MockHomeserver {
    async fn joined_members(&self, room: &RoomId) -> Result<HashSet<UserId>, ClientError> {
        Ok(self
            .members
            .lock()
            .await
            .get(room)
            .cloned()
            .unwrap_or_default())
    }

    async fn invite(&self, room: &RoomId, user: &UserId) -> Result<(), ClientError> {
        self.invites
            .lock()
            .await
            .push((room.clone(), user.clone()));
        self.invite_results
            .lock()
            .await
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn power_level(
        &self,
        room: &RoomId,
        user: &UserId,
    ) -> Result<Option<i64>, ClientError> {
        Ok(self
            .power_levels
            .lock()
            .await
            .get(&(room.clone(), user.clone()))
            .copied())
    }

    async fn resolve_alias(&self, alias: &RoomAlias) -> Result<RoomId, ClientError> {
        self.aliases
            .lock()
            .await
            .get(alias)
            .cloned()
            .ok_or(ClientError::UnknownRoom)
    }

    async fn join_room(&self, room: &RoomId) -> Result<(), ClientError> {
        self.joins.lock().await.push(room.clone());
        Ok(())
    }

    async fn send_notice(&self, room: &RoomId, body: &str) -> Result<(), ClientError> {
        self.notices
            .lock()
            .await
            .push((room.clone(), body.to_owned()));
        Ok(())
    }
}
