//! CRUD operations for [`AutoinviteRule`] records.
//!
//! `add_rule` and `remove_rule` are idempotent: repeating either call is a
//! success, and the `UNIQUE(space_id, room_id)` constraint guarantees a
//! concurrent add/remove race still resolves to a single durable row (or
//! none).

use std::str::FromStr;

use chrono::Utc;
use rusqlite::params;
use spacewarden_shared::{RoomId, UserId};

use crate::database::Database;
use crate::error::Result;
use crate::models::AutoinviteRule;

impl Database {
    // ------------------------------------------------------------------
    // Create / delete
    // ------------------------------------------------------------------

    /// Add an autoinvite rule.  Returns `true` if a new rule was created,
    /// `false` if the pair already existed (which is also a success).
    pub fn add_rule(
        &self,
        space_id: &RoomId,
        room_id: &RoomId,
        added_by: Option<&UserId>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO autoinvite_rules (space_id, room_id, added_by, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                space_id.as_str(),
                room_id.as_str(),
                added_by.map(|u| u.as_str()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(affected > 0)
    }

    /// Remove an autoinvite rule.  Returns `true` if a rule was deleted;
    /// removing an absent rule is a no-op success.
    pub fn remove_rule(&self, space_id: &RoomId, room_id: &RoomId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM autoinvite_rules WHERE space_id = ?1 AND room_id = ?2",
            params![space_id.as_str(), room_id.as_str()],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// List all rules, ordered by space then target room so callers can
    /// group them by space.
    pub fn list_rules(&self) -> Result<Vec<AutoinviteRule>> {
        let mut stmt = self.conn().prepare(
            "SELECT space_id, room_id, added_by, created_at
             FROM autoinvite_rules
             ORDER BY space_id ASC, room_id ASC",
        )?;

        let rows = stmt.query_map([], row_to_rule)?;

        let mut rules = Vec::new();
        for row in rows {
            rules.push(row?);
        }
        Ok(rules)
    }

    /// Target room IDs configured for a specific space.
    pub fn target_rooms_for_space(&self, space_id: &RoomId) -> Result<Vec<RoomId>> {
        let mut stmt = self.conn().prepare(
            "SELECT room_id FROM autoinvite_rules WHERE space_id = ?1 ORDER BY room_id ASC",
        )?;

        let rows = stmt.query_map(params![space_id.as_str()], |row| {
            let raw: String = row.get(0)?;
            parse_room_id(0, raw)
        })?;

        let mut rooms = Vec::new();
        for row in rows {
            rooms.push(row?);
        }
        Ok(rooms)
    }

    /// All distinct configured space IDs.
    pub fn space_ids(&self) -> Result<Vec<RoomId>> {
        self.distinct_room_column("SELECT DISTINCT space_id FROM autoinvite_rules")
    }

    /// All distinct configured target room IDs.
    pub fn target_room_ids(&self) -> Result<Vec<RoomId>> {
        self.distinct_room_column("SELECT DISTINCT room_id FROM autoinvite_rules")
    }

    /// Whether a room is the target of at least one rule.
    pub fn is_target_room(&self, room_id: &RoomId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM autoinvite_rules WHERE room_id = ?1",
            params![room_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn distinct_room_column(&self, sql: &str) -> Result<Vec<RoomId>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map([], |row| {
            let raw: String = row.get(0)?;
            parse_room_id(0, raw)
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_room_id(idx: usize, raw: String) -> rusqlite::Result<RoomId> {
    RoomId::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Map a `rusqlite::Row` to an [`AutoinviteRule`].
fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<AutoinviteRule> {
    let space_raw: String = row.get(0)?;
    let room_raw: String = row.get(1)?;
    let added_by_raw: Option<String> = row.get(2)?;
    let created_raw: String = row.get(3)?;

    let space_id = parse_room_id(0, space_raw)?;
    let room_id = parse_room_id(1, room_raw)?;

    let added_by = added_by_raw
        .map(|s| UserId::from_str(&s))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;

    let created_at = chrono::DateTime::parse_from_rfc3339(&created_raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(AutoinviteRule {
        space_id,
        room_id,
        added_by,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn room(s: &str) -> RoomId {
        s.parse().unwrap()
    }

    #[test]
    fn add_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let space = room("!space:example.com");
        let target = room("!room:example.com");

        assert!(db.add_rule(&space, &target, None).unwrap());
        assert!(!db.add_rule(&space, &target, None).unwrap());

        let rules = db.list_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].space_id, space);
        assert_eq!(rules[0].room_id, target);
    }

    #[test]
    fn remove_missing_rule_is_noop_success() {
        let db = Database::open_in_memory().unwrap();
        let removed = db
            .remove_rule(&room("!space:example.com"), &room("!room:example.com"))
            .unwrap();
        assert!(!removed);
        assert!(db.list_rules().unwrap().is_empty());
    }

    #[test]
    fn lookups_by_space() {
        let db = Database::open_in_memory().unwrap();
        let space_a = room("!a:example.com");
        let space_b = room("!b:example.com");
        let r1 = room("!r1:example.com");
        let r2 = room("!r2:example.com");

        db.add_rule(&space_a, &r1, None).unwrap();
        db.add_rule(&space_a, &r2, None).unwrap();
        db.add_rule(&space_b, &r2, None).unwrap();

        assert_eq!(db.target_rooms_for_space(&space_a).unwrap(), vec![r1, r2.clone()]);
        assert_eq!(db.space_ids().unwrap().len(), 2);
        assert_eq!(db.target_room_ids().unwrap().len(), 2);
        assert!(db.is_target_room(&r2).unwrap());
        assert!(!db.is_target_room(&room("!other:example.com")).unwrap());
    }

    #[tokio::test]
    async fn concurrent_add_remove_never_duplicates() {
        let db = Database::open_in_memory().unwrap().into_shared();
        let space = room("!space:example.com");
        let target = room("!room:example.com");

        let adder = {
            let db = db.clone();
            let (space, target) = (space.clone(), target.clone());
            tokio::spawn(async move {
                for _ in 0..100 {
                    db.lock().await.add_rule(&space, &target, None).unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let remover = {
            let db = db.clone();
            let (space, target) = (space.clone(), target.clone());
            tokio::spawn(async move {
                for _ in 0..100 {
                    db.lock().await.remove_rule(&space, &target).unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let checker = {
            let db = db.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    // Never a duplicate row mid-race.
                    assert!(db.lock().await.list_rules().unwrap().len() <= 1);
                    tokio::task::yield_now().await;
                }
            })
        };

        adder.await.unwrap();
        remover.await.unwrap();
        checker.await.unwrap();

        // A valid linearization of the calls: the pair is present exactly
        // once or absent, nothing else.
        let rules = db.lock().await.list_rules().unwrap();
        assert!(rules.len() <= 1);
        if let Some(rule) = rules.first() {
            assert_eq!((&rule.space_id, &rule.room_id), (&space, &target));
        }
    }

    #[test]
    fn added_by_round_trips() {
        let db = Database::open_in_memory().unwrap();
        let sender: UserId = "@mod:example.com".parse().unwrap();
        db.add_rule(
            &room("!s:example.com"),
            &room("!r:example.com"),
            Some(&sender),
        )
        .unwrap();

        let rules = db.list_rules().unwrap();
        assert_eq!(rules[0].added_by.as_ref(), Some(&sender));
    }
}
