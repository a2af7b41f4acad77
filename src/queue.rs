//! Durable FIFO queue of writes that could not reach the backend.
//!
//! Rows live in `sync_queue`; their order is the `AUTOINCREMENT` sequence, so
//! replay order never depends on clock skew. Payloads are sealed with the
//! device queue key, not the signed-in user's key, so a shift change never
//! strands writes queued by the previous cashier. An entry leaves the queue
//! only when [`SyncQueue::dequeue`] is called after the backend confirmed the
//! write (or, under the dead-letter policy, when an operator discards it).
//!
//! Each row also records the entity it writes (`orders:ord-1`). A write is
//! never replayed while an earlier write for the same entity sits in the dead
//! letter.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cipher::{Cipher, SessionKey};
use crate::db::DbState;
use crate::error::{Result, SyncError};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A mutation destined for the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteOperation {
    CreateOrder {
        order: Value,
    },
    UpdateOrderStatus {
        order_id: String,
        status: String,
    },
    InsertRow {
        table: String,
        row: Value,
    },
    UpdateRow {
        table: String,
        id: String,
        patch: Value,
    },
}

impl WriteOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            WriteOperation::CreateOrder { .. } => "create_order",
            WriteOperation::UpdateOrderStatus { .. } => "update_order_status",
            WriteOperation::InsertRow { .. } => "insert_row",
            WriteOperation::UpdateRow { .. } => "update_row",
        }
    }

    /// Backend table the operation targets.
    pub fn table(&self) -> &str {
        match self {
            WriteOperation::CreateOrder { .. } | WriteOperation::UpdateOrderStatus { .. } => {
                "orders"
            }
            WriteOperation::InsertRow { table, .. } | WriteOperation::UpdateRow { table, .. } => {
                table.as_str()
            }
        }
    }

    /// Id of the row being written, when the client knows it.
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            WriteOperation::CreateOrder { order } => order.get("id").and_then(Value::as_str),
            WriteOperation::UpdateOrderStatus { order_id, .. } => Some(order_id.as_str()),
            WriteOperation::InsertRow { row, .. } => row.get("id").and_then(Value::as_str),
            WriteOperation::UpdateRow { id, .. } => Some(id.as_str()),
        }
    }

    /// `table:id` key grouping writes to the same row.
    pub fn entity_key(&self) -> Option<String> {
        self.entity_id().map(|id| format!("{}:{id}", self.table()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Pending,
    InFlight,
    /// Last attempt was rejected; still live and still blocking the queue.
    Failed,
    /// Parked for manual review; skipped by replay.
    DeadLetter,
}

impl AttemptState {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptState::Pending => "pending",
            AttemptState::InFlight => "in_flight",
            AttemptState::Failed => "failed",
            AttemptState::DeadLetter => "dead_letter",
        }
    }

    fn parse(raw: &str) -> AttemptState {
        match raw {
            "in_flight" => AttemptState::InFlight,
            "failed" => AttemptState::Failed,
            "dead_letter" => AttemptState::DeadLetter,
            _ => AttemptState::Pending,
        }
    }
}

/// A queued write with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedWrite {
    pub id: Uuid,
    pub operation: WriteOperation,
    pub created_at: DateTime<Utc>,
    pub state: AttemptState,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Undecoded `sync_queue` row.
struct QueueRow {
    id: String,
    payload: Vec<u8>,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    created_at: String,
}

const ROW_COLUMNS: &str = "id, payload, status, attempts, last_error, created_at";

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueRow> {
    Ok(QueueRow {
        id: row.get(0)?,
        payload: row.get(1)?,
        status: row.get(2)?,
        attempts: row.get(3)?,
        last_error: row.get(4)?,
        created_at: row.get(5)?,
    })
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

pub struct SyncQueue {
    db: Arc<DbState>,
    cipher: Box<dyn Cipher>,
    key: SessionKey,
}

impl SyncQueue {
    /// `key` is the device queue key from
    /// [`credentials::device_queue_key`](crate::credentials::device_queue_key).
    pub fn new(db: Arc<DbState>, cipher: impl Cipher + 'static, key: SessionKey) -> Self {
        Self {
            db,
            cipher: Box::new(cipher),
            key,
        }
    }

    /// Append `operation` and return its id.
    pub fn enqueue(&self, operation: &WriteOperation) -> Result<Uuid> {
        let payload = self
            .cipher
            .encrypt(&self.key, &serde_json::to_vec(operation)?)?;
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sync_queue
                     (id, operation, entity_key, payload, status, attempts, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)",
                params![
                    id.to_string(),
                    operation.kind(),
                    operation.entity_key(),
                    payload,
                    now
                ],
            )?;
            Ok(())
        })?;

        info!(
            queue_id = %id,
            operation = operation.kind(),
            table = operation.table(),
            "write queued for later sync"
        );
        Ok(id)
    }

    /// Oldest live entry, if any.
    pub fn peek_next(&self) -> Result<Option<QueuedWrite>> {
        let row = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {ROW_COLUMNS} FROM sync_queue
                         WHERE status != 'dead_letter'
                         ORDER BY seq ASC LIMIT 1"
                    ),
                    [],
                    map_row,
                )
                .optional()?)
        })?;
        row.map(|r| self.decode(r)).transpose()
    }

    /// Earliest dead-lettered write for the same entity as `id` that was
    /// queued before it. Replaying `id` first would apply it out of order.
    pub fn blocking_dead_letter(&self, id: Uuid) -> Result<Option<Uuid>> {
        let blocker: Option<String> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT parked.id FROM sync_queue parked
                     JOIN sync_queue entry ON entry.id = ?1
                     WHERE parked.status = 'dead_letter'
                       AND parked.entity_key = entry.entity_key
                       AND parked.seq < entry.seq
                     ORDER BY parked.seq ASC LIMIT 1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        blocker.map(|raw| parse_id(&raw)).transpose()
    }

    /// Remove an entry. Returns `false` when it was already gone.
    pub fn dequeue(&self, id: Uuid) -> Result<bool> {
        let removed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM sync_queue WHERE id = ?1",
                params![id.to_string()],
            )?)
        })?;
        if removed == 0 {
            debug!(queue_id = %id, "dequeue: entry already removed");
        }
        Ok(removed > 0)
    }

    /// Number of live (not dead-lettered) entries.
    pub fn count(&self) -> Result<u64> {
        self.count_where("status != 'dead_letter'")
    }

    pub fn dead_letter_count(&self) -> Result<u64> {
        self.count_where("status = 'dead_letter'")
    }

    pub fn mark_in_flight(&self, id: Uuid) -> Result<()> {
        self.set_status(id, AttemptState::InFlight)
    }

    /// Put an in-flight entry back to pending without counting an attempt.
    pub fn release(&self, id: Uuid) -> Result<()> {
        self.set_status(id, AttemptState::Pending)
    }

    /// Record a rejected attempt. Returns the new attempt count.
    pub fn mark_failed(&self, id: Uuid, error: &str) -> Result<u32> {
        let now = Utc::now().to_rfc3339();
        let attempts: Option<i64> = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sync_queue
                 SET status = 'failed', attempts = attempts + 1, last_error = ?2, updated_at = ?3
                 WHERE id = ?1",
                params![id.to_string(), error, now],
            )?;
            Ok(conn
                .query_row(
                    "SELECT attempts FROM sync_queue WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        Ok(attempts.unwrap_or(0).max(0) as u32)
    }

    /// Park an entry so replay continues past it.
    pub fn dead_letter(&self, id: Uuid, error: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sync_queue SET status = 'dead_letter', last_error = ?2, updated_at = ?3
                 WHERE id = ?1",
                params![id.to_string(), error, now],
            )?;
            Ok(())
        })?;
        warn!(queue_id = %id, error, "queued write moved to dead letter");
        Ok(())
    }

    /// Dead-lettered entries in original order.
    pub fn dead_letters(&self) -> Result<Vec<QueuedWrite>> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ROW_COLUMNS} FROM sync_queue
                 WHERE status = 'dead_letter'
                 ORDER BY seq ASC"
            ))?;
            let rows = stmt
                .query_map([], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(|r| self.decode(r)).collect()
    }

    /// Return a dead-lettered entry to the live queue at its original
    /// position, together with the later dead-lettered writes for the same
    /// entity that were held behind it.
    ///
    /// Refused (`Ok(false)`) while an earlier write for that entity is still
    /// dead-lettered: requeue that one first.
    pub fn requeue_dead_letter(&self, id: Uuid) -> Result<bool> {
        if let Some(blocker) = self.blocking_dead_letter(id)? {
            warn!(
                queue_id = %id,
                blocked_by = %blocker,
                "requeue refused: an earlier write for the same entity is dead-lettered"
            );
            return Ok(false);
        }

        let now = Utc::now().to_rfc3339();
        let (head, followers) = self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let head = tx.execute(
                "UPDATE sync_queue
                 SET status = 'pending', attempts = 0, last_error = NULL, updated_at = ?2
                 WHERE id = ?1 AND status = 'dead_letter'",
                params![id.to_string(), now],
            )?;
            let followers = if head > 0 {
                tx.execute(
                    "UPDATE sync_queue
                     SET status = 'pending', attempts = 0, last_error = NULL, updated_at = ?2
                     WHERE status = 'dead_letter'
                       AND entity_key IS NOT NULL
                       AND entity_key = (SELECT entity_key FROM sync_queue WHERE id = ?1)
                       AND seq > (SELECT seq FROM sync_queue WHERE id = ?1)",
                    params![id.to_string(), now],
                )?
            } else {
                0
            };
            tx.commit()?;
            Ok((head, followers))
        })?;
        if head > 0 {
            info!(queue_id = %id, followers, "dead-lettered write requeued");
        }
        Ok(head > 0)
    }

    /// Drop a dead-lettered entry for good.
    pub fn discard_dead_letter(&self, id: Uuid) -> Result<bool> {
        let removed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM sync_queue WHERE id = ?1 AND status = 'dead_letter'",
                params![id.to_string()],
            )?)
        })?;
        if removed > 0 {
            warn!(queue_id = %id, "dead-lettered write discarded");
        }
        Ok(removed > 0)
    }

    /// Reset entries a previous process left in flight.
    pub fn recover_in_flight(&self) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let recovered = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE sync_queue SET status = 'pending', updated_at = ?1
                 WHERE status = 'in_flight'",
                params![now],
            )?)
        })?;
        if recovered > 0 {
            info!(recovered, "recovered in-flight queue entries from previous run");
        }
        Ok(recovered)
    }

    fn set_status(&self, id: Uuid, state: AttemptState) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sync_queue SET status = ?2, updated_at = ?3
                 WHERE id = ?1 AND status != 'dead_letter'",
                params![id.to_string(), state.as_str(), now],
            )?;
            Ok(())
        })
    }

    fn count_where(&self, where_clause: &str) -> Result<u64> {
        let query = format!("SELECT COUNT(*) FROM sync_queue WHERE {where_clause}");
        let n: i64 = self
            .db
            .with_conn(|conn| Ok(conn.query_row(&query, [], |row| row.get(0))?))?;
        Ok(n.max(0) as u64)
    }

    fn decode(&self, row: QueueRow) -> Result<QueuedWrite> {
        let id = parse_id(&row.id)?;
        let plaintext = self.cipher.decrypt(&self.key, &row.payload)?;
        let operation: WriteOperation = serde_json::from_slice(&plaintext)?;
        let created_at = match DateTime::parse_from_rfc3339(&row.created_at) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(e) => {
                // Only informational; ordering comes from seq.
                warn!(
                    queue_id = %id,
                    raw = %row.created_at,
                    error = %e,
                    "queue entry has an unreadable created_at; using current time"
                );
                Utc::now()
            }
        };
        Ok(QueuedWrite {
            id,
            operation,
            created_at,
            state: AttemptState::parse(&row.status),
            attempts: row.attempts.max(0) as u32,
            last_error: row.last_error,
        })
    }
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| SyncError::Config(format!("corrupt queue id {raw}: {e}")))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::AesGcmCipher;
    use crate::db;
    use crate::test_support::DEVICE_KEY;
    use serde_json::json;

    fn test_queue() -> SyncQueue {
        let db = Arc::new(db::init_in_memory().unwrap());
        SyncQueue::new(db, AesGcmCipher, SessionKey::from_bytes(DEVICE_KEY))
    }

    fn status_update(n: u32, status: &str) -> WriteOperation {
        WriteOperation::UpdateOrderStatus {
            order_id: format!("ord-{n}"),
            status: status.into(),
        }
    }

    fn order(n: u32) -> WriteOperation {
        WriteOperation::CreateOrder {
            order: json!({ "id": format!("ord-{n}"), "total_amount": n }),
        }
    }

    #[test]
    fn test_count_after_enqueues_and_fifo_peek() {
        let queue = test_queue();
        let mut ids = Vec::new();
        for n in 1..=5 {
            ids.push(queue.enqueue(&order(n)).unwrap());
            assert_eq!(queue.count().unwrap(), n as u64);
        }

        for (n, id) in ids.iter().enumerate() {
            let head = queue.peek_next().unwrap().expect("head");
            assert_eq!(head.id, *id);
            assert_eq!(head.operation, order(n as u32 + 1));
            assert!(queue.dequeue(*id).unwrap());
        }
        assert!(queue.peek_next().unwrap().is_none());
        assert_eq!(queue.count().unwrap(), 0);
    }

    #[test]
    fn test_dequeue_twice_is_noop() {
        let queue = test_queue();
        let first = queue.enqueue(&order(1)).unwrap();
        let second = queue.enqueue(&order(2)).unwrap();

        assert!(queue.dequeue(first).unwrap());
        assert!(!queue.dequeue(first).unwrap());
        assert_eq!(queue.count().unwrap(), 1);
        assert_eq!(queue.peek_next().unwrap().unwrap().id, second);
    }

    #[test]
    fn test_payload_is_sealed_with_the_device_key() {
        let db = Arc::new(db::init_in_memory().unwrap());
        let queue = SyncQueue::new(db.clone(), AesGcmCipher, SessionKey::from_bytes(DEVICE_KEY));
        queue.enqueue(&order(1)).unwrap();

        let payload: Vec<u8> = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT payload FROM sync_queue", [], |row| row.get(0))?)
            })
            .unwrap();
        assert!(!String::from_utf8_lossy(&payload).contains("ord-1"));

        let other = SyncQueue::new(db, AesGcmCipher, SessionKey::from_bytes([9; 32]));
        assert!(matches!(other.peek_next(), Err(SyncError::DecryptionFailed)));
        assert_eq!(other.count().unwrap(), 1);
    }

    #[test]
    fn test_mark_failed_counts_attempts_and_keeps_head() {
        let queue = test_queue();
        let id = queue.enqueue(&order(1)).unwrap();
        queue.enqueue(&order(2)).unwrap();

        queue.mark_in_flight(id).unwrap();
        assert_eq!(queue.mark_failed(id, "invalid table").unwrap(), 1);
        assert_eq!(queue.mark_failed(id, "invalid table").unwrap(), 2);

        let head = queue.peek_next().unwrap().unwrap();
        assert_eq!(head.id, id);
        assert_eq!(head.state, AttemptState::Failed);
        assert_eq!(head.attempts, 2);
        assert_eq!(head.last_error.as_deref(), Some("invalid table"));
    }

    #[test]
    fn test_dead_letter_skips_and_requeue_restores_position() {
        let queue = test_queue();
        let first = queue.enqueue(&order(1)).unwrap();
        let second = queue.enqueue(&order(2)).unwrap();

        queue.dead_letter(first, "stale reference").unwrap();
        assert_eq!(queue.count().unwrap(), 1);
        assert_eq!(queue.dead_letter_count().unwrap(), 1);
        assert_eq!(queue.peek_next().unwrap().unwrap().id, second);

        let parked = queue.dead_letters().unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].state, AttemptState::DeadLetter);

        assert!(queue.requeue_dead_letter(first).unwrap());
        assert!(!queue.requeue_dead_letter(first).unwrap());
        let head = queue.peek_next().unwrap().unwrap();
        assert_eq!(head.id, first);
        assert_eq!(head.attempts, 0);
    }

    #[test]
    fn test_discard_dead_letter_only_touches_parked_rows() {
        let queue = test_queue();
        let live = queue.enqueue(&order(1)).unwrap();
        let parked = queue.enqueue(&order(2)).unwrap();
        queue.dead_letter(parked, "rejected").unwrap();

        assert!(!queue.discard_dead_letter(live).unwrap());
        assert!(queue.discard_dead_letter(parked).unwrap());
        assert_eq!(queue.dead_letter_count().unwrap(), 0);
        assert_eq!(queue.count().unwrap(), 1);
    }

    #[test]
    fn test_recover_in_flight_resets_to_pending() {
        let queue = test_queue();
        let id = queue.enqueue(&order(1)).unwrap();
        queue.mark_in_flight(id).unwrap();
        assert_eq!(queue.peek_next().unwrap().unwrap().state, AttemptState::InFlight);

        assert_eq!(queue.recover_in_flight().unwrap(), 1);
        assert_eq!(queue.peek_next().unwrap().unwrap().state, AttemptState::Pending);
    }

    #[test]
    fn test_later_write_for_dead_lettered_entity_is_blocked() {
        let queue = test_queue();
        let create = queue.enqueue(&order(1)).unwrap();
        let update = queue.enqueue(&status_update(1, "served")).unwrap();
        let unrelated = queue.enqueue(&status_update(2, "served")).unwrap();

        queue.dead_letter(create, "rejected").unwrap();
        assert_eq!(queue.blocking_dead_letter(update).unwrap(), Some(create));
        assert_eq!(queue.blocking_dead_letter(unrelated).unwrap(), None);
        assert_eq!(queue.blocking_dead_letter(create).unwrap(), None);
    }

    #[test]
    fn test_requeue_brings_held_writes_back_in_order() {
        let queue = test_queue();
        let create = queue.enqueue(&order(1)).unwrap();
        let update = queue.enqueue(&status_update(1, "served")).unwrap();
        let other = queue.enqueue(&order(2)).unwrap();
        queue.dead_letter(create, "rejected").unwrap();
        queue.dead_letter(update, "held behind dead-lettered write").unwrap();
        queue.dead_letter(other, "rejected").unwrap();

        assert!(!queue.requeue_dead_letter(update).unwrap());
        assert_eq!(queue.dead_letter_count().unwrap(), 3);

        assert!(queue.requeue_dead_letter(create).unwrap());
        assert_eq!(queue.count().unwrap(), 2);
        assert_eq!(queue.dead_letters().unwrap()[0].id, other);

        let head = queue.peek_next().unwrap().unwrap();
        assert_eq!(head.id, create);
        queue.dequeue(create).unwrap();
        let next = queue.peek_next().unwrap().unwrap();
        assert_eq!(next.id, update);
        assert_eq!(next.attempts, 0);
        assert_eq!(next.last_error, None);
    }

    #[test]
    fn test_corrupt_created_at_still_decodes() {
        let db = Arc::new(db::init_in_memory().unwrap());
        let queue = SyncQueue::new(db.clone(), AesGcmCipher, SessionKey::from_bytes(DEVICE_KEY));
        let id = queue.enqueue(&order(1)).unwrap();
        db.with_conn(|conn| {
            conn.execute("UPDATE sync_queue SET created_at = 'yesterday-ish'", [])?;
            Ok(())
        })
        .unwrap();

        let before = Utc::now();
        let head = queue.peek_next().unwrap().unwrap();
        assert_eq!(head.id, id);
        assert_eq!(head.operation, order(1));
        assert!(head.created_at >= before);
    }

    #[test]
    fn test_operation_accessors() {
        let op = WriteOperation::UpdateOrderStatus {
            order_id: "ord-7".into(),
            status: "served".into(),
        };
        assert_eq!(op.kind(), "update_order_status");
        assert_eq!(op.table(), "orders");
        assert_eq!(op.entity_id(), Some("ord-7"));
        assert_eq!(op.entity_key().as_deref(), Some("orders:ord-7"));

        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "update_order_status");

        let row = WriteOperation::InsertRow {
            table: "reservations".into(),
            row: json!({ "guest": "Lee" }),
        };
        assert_eq!(row.table(), "reservations");
        assert_eq!(row.entity_id(), None);
        assert_eq!(row.entity_key(), None);
    }
}
