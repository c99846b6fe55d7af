use crate::Database;
use crate::models::{ChatRow, EnvelopeRow, IdentityOutcome, PreKeyRow, UserRow};
use anyhow::Result;
use rusqlite::Connection;

impl Database {
    // -- Users --

    /// Look up a user by phone number, creating the row on first contact.
    /// The caller supplies the id used if an insert happens.
    pub fn create_user_if_absent(&self, id: &str, phone_number: &str) -> Result<UserRow> {
        self.with_conn(|conn| {
            if let Some(existing) = query_user_by_phone(conn, phone_number)? {
                return Ok(existing);
            }
            conn.execute(
                "INSERT INTO users (id, phone_number) VALUES (?1, ?2)",
                (id, phone_number),
            )?;
            query_user_by_id(conn, id)?
                .ok_or_else(|| anyhow::anyhow!("User vanished after insert: {}", id))
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_id(conn, id))
    }

    /// Install the immutable identity key. Re-registering identical material
    /// is a no-op; different material is a conflict.
    pub fn register_identity(
        &self,
        user_id: &str,
        identity_key: &str,
        registration_id: i64,
    ) -> Result<IdentityOutcome> {
        self.with_conn(|conn| {
            let existing: Option<Option<String>> = conn
                .query_row(
                    "SELECT identity_key FROM users WHERE id = ?1",
                    [user_id],
                    |row| row.get(0),
                )
                .optional()?;

            match existing {
                None => Err(anyhow::anyhow!("Unknown user: {}", user_id)),
                Some(Some(current)) if current == identity_key => Ok(IdentityOutcome::Unchanged),
                Some(Some(_)) => Ok(IdentityOutcome::Conflict),
                Some(None) => {
                    conn.execute(
                        "UPDATE users SET identity_key = ?2, registration_id = ?3 WHERE id = ?1",
                        (user_id, identity_key, registration_id),
                    )?;
                    Ok(IdentityOutcome::Installed)
                }
            }
        })
    }

    // -- Prekeys --

    /// Append a batch of unconsumed prekeys. The batch is all-or-nothing:
    /// returns `Some(key_id)` of the first duplicate and inserts nothing.
    pub fn insert_prekeys(&self, user_id: &str, keys: &[PreKeyRow]) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            for key in keys {
                let exists: Option<i64> = tx
                    .query_row(
                        "SELECT key_id FROM prekeys WHERE user_id = ?1 AND key_id = ?2",
                        (user_id, key.key_id),
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_some() {
                    return Ok(Some(key.key_id));
                }
                tx.execute(
                    "INSERT INTO prekeys (user_id, key_id, public_key, signature)
                     VALUES (?1, ?2, ?3, ?4)",
                    (user_id, key.key_id, &key.public_key, &key.signature),
                )?;
            }
            tx.commit()?;
            Ok(None)
        })
    }

    /// Atomically claim the lowest unconsumed prekey for a user. The claim
    /// is a single UPDATE, so concurrent fetches can never both receive the
    /// same key. Returns `None` when the pool is exhausted.
    pub fn claim_lowest_prekey(&self, user_id: &str) -> Result<Option<PreKeyRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "UPDATE prekeys SET consumed = 1
                     WHERE user_id = ?1
                       AND consumed = 0
                       AND key_id = (SELECT MIN(key_id) FROM prekeys
                                     WHERE user_id = ?1 AND consumed = 0)
                     RETURNING key_id, public_key, signature",
                    [user_id],
                    |row| {
                        Ok(PreKeyRow {
                            key_id: row.get(0)?,
                            public_key: row.get(1)?,
                            signature: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn count_unconsumed_prekeys(&self, user_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM prekeys WHERE user_id = ?1 AND consumed = 0",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    // -- Chats --

    /// Resolve the private chat for a pair, creating it on first message.
    /// The pair is normalized so (a, b) and (b, a) map to the same chat.
    /// `new_id` is used only if an insert happens.
    pub fn find_or_create_chat(&self, new_id: &str, a: &str, b: &str) -> Result<ChatRow> {
        let (user_a, user_b) = if a <= b { (a, b) } else { (b, a) };
        self.with_conn(|conn| {
            if let Some(existing) = query_chat_by_pair(conn, user_a, user_b)? {
                return Ok(existing);
            }
            conn.execute(
                "INSERT INTO chats (id, kind, user_a, user_b) VALUES (?1, 'private', ?2, ?3)",
                (new_id, user_a, user_b),
            )?;
            query_chat_by_id(conn, new_id)?
                .ok_or_else(|| anyhow::anyhow!("Chat vanished after insert: {}", new_id))
        })
    }

    pub fn get_chat(&self, id: &str) -> Result<Option<ChatRow>> {
        self.with_conn(|conn| query_chat_by_id(conn, id))
    }

    /// Advance the per-chat sequence counter and return the new value.
    /// A single UPDATE … RETURNING, so the increment is atomic.
    pub fn next_chat_seq(&self, chat_id: &str) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let seq = conn
                .query_row(
                    "UPDATE chats SET last_seq = last_seq + 1 WHERE id = ?1 RETURNING last_seq",
                    [chat_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(seq)
        })
    }

    // -- Envelopes --

    /// Durable enqueue: envelope row plus its initial SENT receipt, in one
    /// transaction. The write commits before the sender is acknowledged.
    pub fn insert_envelope(&self, env: &EnvelopeRow) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO envelopes (chat_id, id, sender_id, recipient_id, ciphertext, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    env.chat_id,
                    env.id,
                    env.sender_id,
                    env.recipient_id,
                    env.ciphertext,
                    env.created_at,
                ],
            )?;
            tx.execute(
                "INSERT INTO receipts (chat_id, envelope_id, recipient_id, status, updated_at)
                 VALUES (?1, ?2, ?3, 0, ?4)",
                rusqlite::params![env.chat_id, env.id, env.recipient_id, env.created_at],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// All undelivered envelopes for a recipient, ascending (chat_id, id).
    /// This is the resync path after reconnect.
    pub fn drain_envelopes(&self, recipient_id: &str) -> Result<Vec<EnvelopeRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chat_id, id, sender_id, recipient_id, ciphertext, created_at
                 FROM envelopes
                 WHERE recipient_id = ?1
                 ORDER BY chat_id, id",
            )?;
            let rows = stmt
                .query_map([recipient_id], |row| {
                    Ok(EnvelopeRow {
                        chat_id: row.get(0)?,
                        id: row.get(1)?,
                        sender_id: row.get(2)?,
                        recipient_id: row.get(3)?,
                        ciphertext: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Remove an acked envelope. Idempotent: returns false if it was
    /// already purged.
    pub fn delete_envelope(&self, chat_id: &str, id: i64, recipient_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM envelopes WHERE chat_id = ?1 AND id = ?2 AND recipient_id = ?3",
                rusqlite::params![chat_id, id, recipient_id],
            )?;
            Ok(changed > 0)
        })
    }

    // -- Receipts --

    /// Forward-only status transition. Returns false if the stored status is
    /// already at or past the requested one (or the receipt is unknown).
    pub fn advance_receipt(
        &self,
        chat_id: &str,
        envelope_id: i64,
        recipient_id: &str,
        status: i64,
        updated_at: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE receipts SET status = ?4, updated_at = ?5
                 WHERE chat_id = ?1 AND envelope_id = ?2 AND recipient_id = ?3
                   AND status < ?4",
                rusqlite::params![chat_id, envelope_id, recipient_id, status, updated_at],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn get_receipt_status(
        &self,
        chat_id: &str,
        envelope_id: i64,
        recipient_id: &str,
    ) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let status = conn
                .query_row(
                    "SELECT status FROM receipts
                     WHERE chat_id = ?1 AND envelope_id = ?2 AND recipient_id = ?3",
                    rusqlite::params![chat_id, envelope_id, recipient_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(status)
        })
    }
}

fn query_user_by_phone(conn: &Connection, phone_number: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, phone_number, identity_key, registration_id, created_at
         FROM users WHERE phone_number = ?1",
    )?;
    let row = stmt.query_row([phone_number], map_user_row).optional()?;
    Ok(row)
}

fn query_user_by_id(conn: &Connection, id: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, phone_number, identity_key, registration_id, created_at
         FROM users WHERE id = ?1",
    )?;
    let row = stmt.query_row([id], map_user_row).optional()?;
    Ok(row)
}

fn map_user_row(row: &rusqlite::Row<'_>) -> std::result::Result<UserRow, rusqlite::Error> {
    Ok(UserRow {
        id: row.get(0)?,
        phone_number: row.get(1)?,
        identity_key: row.get(2)?,
        registration_id: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn query_chat_by_pair(conn: &Connection, user_a: &str, user_b: &str) -> Result<Option<ChatRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, user_a, user_b, last_seq FROM chats
         WHERE user_a = ?1 AND user_b = ?2",
    )?;
    let row = stmt.query_row([user_a, user_b], map_chat_row).optional()?;
    Ok(row)
}

fn query_chat_by_id(conn: &Connection, id: &str) -> Result<Option<ChatRow>> {
    let mut stmt =
        conn.prepare("SELECT id, kind, user_a, user_b, last_seq FROM chats WHERE id = ?1")?;
    let row = stmt.query_row([id], map_chat_row).optional()?;
    Ok(row)
}

fn map_chat_row(row: &rusqlite::Row<'_>) -> std::result::Result<ChatRow, rusqlite::Error> {
    Ok(ChatRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        user_a: row.get(2)?,
        user_b: row.get(3)?,
        last_seq: row.get(4)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_users(ids: &[&str]) -> Database {
        let db = Database::open_in_memory().unwrap();
        for id in ids {
            db.create_user_if_absent(id, &format!("+1555{}", id)).unwrap();
        }
        db
    }

    fn prekey(key_id: i64) -> PreKeyRow {
        PreKeyRow {
            key_id,
            public_key: format!("pk-{}", key_id),
            signature: format!("sig-{}", key_id),
        }
    }

    #[test]
    fn user_creation_is_idempotent_per_phone() {
        let db = Database::open_in_memory().unwrap();
        let first = db.create_user_if_absent("u1", "+15550101").unwrap();
        let second = db.create_user_if_absent("u2", "+15550101").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.id, "u1");
    }

    #[test]
    fn identity_key_is_immutable() {
        let db = db_with_users(&["u1"]);
        assert_eq!(
            db.register_identity("u1", "ik-a", 7).unwrap(),
            IdentityOutcome::Installed
        );
        assert_eq!(
            db.register_identity("u1", "ik-a", 7).unwrap(),
            IdentityOutcome::Unchanged
        );
        assert_eq!(
            db.register_identity("u1", "ik-b", 7).unwrap(),
            IdentityOutcome::Conflict
        );
        let user = db.get_user_by_id("u1").unwrap().unwrap();
        assert_eq!(user.identity_key.as_deref(), Some("ik-a"));
    }

    #[test]
    fn prekeys_claimed_lowest_first_until_exhausted() {
        let db = db_with_users(&["u1"]);
        db.insert_prekeys("u1", &[prekey(5), prekey(2), prekey(9)])
            .unwrap();

        let claimed: Vec<i64> = (0..3)
            .map(|_| db.claim_lowest_prekey("u1").unwrap().unwrap().key_id)
            .collect();
        assert_eq!(claimed, vec![2, 5, 9]);
        assert!(db.claim_lowest_prekey("u1").unwrap().is_none());
        assert_eq!(db.count_unconsumed_prekeys("u1").unwrap(), 0);
    }

    #[test]
    fn duplicate_prekey_id_rejects_whole_batch() {
        let db = db_with_users(&["u1"]);
        db.insert_prekeys("u1", &[prekey(1)]).unwrap();

        let dup = db
            .insert_prekeys("u1", &[prekey(2), prekey(1), prekey(3)])
            .unwrap();
        assert_eq!(dup, Some(1));
        // Nothing from the rejected batch landed.
        assert_eq!(db.count_unconsumed_prekeys("u1").unwrap(), 1);
    }

    #[test]
    fn chat_pair_is_normalized() {
        let db = db_with_users(&["ua", "ub"]);
        let c1 = db.find_or_create_chat("c1", "ua", "ub").unwrap();
        let c2 = db.find_or_create_chat("c2", "ub", "ua").unwrap();
        assert_eq!(c1.id, c2.id);
        assert_eq!(c1.kind, "private");
    }

    #[test]
    fn chat_seq_increments_from_one() {
        let db = db_with_users(&["ua", "ub"]);
        db.find_or_create_chat("c1", "ua", "ub").unwrap();
        assert_eq!(db.next_chat_seq("c1").unwrap(), Some(1));
        assert_eq!(db.next_chat_seq("c1").unwrap(), Some(2));
        assert_eq!(db.next_chat_seq("missing").unwrap(), None);
    }

    #[test]
    fn drain_returns_ascending_until_acked() {
        let db = db_with_users(&["ua", "ub"]);
        db.find_or_create_chat("c1", "ua", "ub").unwrap();
        for id in 1..=3 {
            db.insert_envelope(&EnvelopeRow {
                chat_id: "c1".into(),
                id,
                sender_id: "ua".into(),
                recipient_id: "ub".into(),
                ciphertext: vec![0xAB; 4],
                created_at: "2026-08-24T00:00:00Z".into(),
            })
            .unwrap();
        }

        let ids: Vec<i64> = db
            .drain_envelopes("ub")
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);

        assert!(db.delete_envelope("c1", 1, "ub").unwrap());
        assert!(db.delete_envelope("c1", 2, "ub").unwrap());
        // Ack is idempotent.
        assert!(!db.delete_envelope("c1", 2, "ub").unwrap());

        let ids: Vec<i64> = db
            .drain_envelopes("ub")
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn receipt_status_never_regresses() {
        let db = db_with_users(&["ua", "ub"]);
        db.find_or_create_chat("c1", "ua", "ub").unwrap();
        db.insert_envelope(&EnvelopeRow {
            chat_id: "c1".into(),
            id: 1,
            sender_id: "ua".into(),
            recipient_id: "ub".into(),
            ciphertext: vec![1],
            created_at: "2026-08-24T00:00:00Z".into(),
        })
        .unwrap();

        assert_eq!(db.get_receipt_status("c1", 1, "ub").unwrap(), Some(0));
        assert!(db.advance_receipt("c1", 1, "ub", 2, "t1").unwrap());
        // DELIVERED after READ is a regression and is refused.
        assert!(!db.advance_receipt("c1", 1, "ub", 1, "t2").unwrap());
        assert_eq!(db.get_receipt_status("c1", 1, "ub").unwrap(), Some(2));
    }
}
