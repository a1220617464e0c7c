use std::path::Path;

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};

use crate::core::models::{IntentId, Item, MutationIntent, OwnerId, Scope};

/// Schema DDL run on open.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS items (
    owner TEXT NOT NULL,
    scope TEXT NOT NULL,
    key TEXT NOT NULL,
    position INTEGER NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (owner, scope, key)
);

CREATE TABLE IF NOT EXISTS outbox (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    seq INTEGER NOT NULL,
    state TEXT NOT NULL,
    body TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_outbox_owner
    ON outbox(owner, seq);
";

/// Rows restored for one cache partition.
pub type StoredPartition = (OwnerId, Scope, Vec<Item>);

// ---------------------------------------------------------------------------
// Commands sent from async world → background thread
// ---------------------------------------------------------------------------

enum StoreCmd {
    SavePartition {
        owner: OwnerId,
        scope: Scope,
        items: Vec<Item>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    LoadPartitions {
        reply: oneshot::Sender<Result<Vec<StoredPartition>, String>>,
    },
    DropOwner {
        owner: OwnerId,
        reply: oneshot::Sender<Result<(), String>>,
    },
    SaveIntent {
        intent: MutationIntent,
        reply: oneshot::Sender<Result<(), String>>,
    },
    DeleteIntent {
        id: IntentId,
        reply: oneshot::Sender<Result<(), String>>,
    },
    LoadIntents {
        reply: oneshot::Sender<Result<Vec<MutationIntent>, String>>,
    },
    Flush {
        reply: oneshot::Sender<Result<(), String>>,
    },
}

/// Receipt for a queued write.
pub struct StoreTicket(Result<oneshot::Receiver<Result<(), String>>, String>);

impl StoreTicket {
    /// A ticket for a write that needs no store (already settled).
    pub fn done() -> Self {
        let (reply, rx) = oneshot::channel();
        let _ = reply.send(Ok(()));
        StoreTicket(Ok(rx))
    }

    pub async fn wait(self) -> Result<(), String> {
        let rx = self.0?;
        rx.await.map_err(|_| "Store unavailable".to_string())?
    }
}

// ---------------------------------------------------------------------------
// StoreHandle — Clone + Send + Sync async facade
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<StoreCmd>,
}

impl StoreHandle {
    /// Open (or create) `cache.db` inside `dir` and spawn the background thread.
    pub fn open_at(dir: &Path) -> Result<Self, String> {
        std::fs::create_dir_all(dir).map_err(|e| format!("Failed to create store dir: {e}"))?;

        let db_file = dir.join("cache.db");
        let conn =
            Connection::open(&db_file).map_err(|e| format!("Failed to open store db: {e}"))?;
        log::debug!("Store opened at {}", db_file.display());
        Self::spawn(conn)
    }

    /// Non-durable store, for embedding and tests.
    pub fn open_in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory()
            .map_err(|e| format!("Failed to open in-memory store: {e}"))?;
        Self::spawn(conn)
    }

    fn spawn(conn: Connection) -> Result<Self, String> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| format!("Failed to init store schema: {e}"))?;

        let (tx, rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("shelflife-store".into())
            .spawn(move || Self::run_loop(conn, rx))
            .map_err(|e| format!("Failed to spawn store thread: {e}"))?;

        Ok(StoreHandle { tx })
    }

    fn submit<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, String>>) -> StoreCmd,
    ) -> Result<oneshot::Receiver<Result<T, String>>, String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| "Store unavailable".to_string())?;
        Ok(rx)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, String>>) -> StoreCmd,
    ) -> Result<T, String> {
        let rx = self.submit(make)?;
        rx.await.map_err(|_| "Store unavailable".to_string())?
    }

    // -- ordered writes ------------------------------------------------------
    //
    // Writes are queued synchronously so they reach the database in call
    // order; the returned ticket may be awaited or dropped.

    pub fn submit_partition(&self, owner: OwnerId, scope: Scope, items: Vec<Item>) -> StoreTicket {
        StoreTicket(self.submit(|reply| StoreCmd::SavePartition {
            owner,
            scope,
            items,
            reply,
        }))
    }

    pub fn submit_intent(&self, intent: MutationIntent) -> StoreTicket {
        StoreTicket(self.submit(|reply| StoreCmd::SaveIntent { intent, reply }))
    }

    pub fn submit_intent_delete(&self, id: IntentId) -> StoreTicket {
        StoreTicket(self.submit(|reply| StoreCmd::DeleteIntent { id, reply }))
    }

    pub fn submit_drop_owner(&self, owner: OwnerId) -> StoreTicket {
        StoreTicket(self.submit(|reply| StoreCmd::DropOwner { owner, reply }))
    }

    // -- async methods -------------------------------------------------------

    pub async fn load_partitions(&self) -> Result<Vec<StoredPartition>, String> {
        self.request(|reply| StoreCmd::LoadPartitions { reply }).await
    }

    pub async fn load_intents(&self) -> Result<Vec<MutationIntent>, String> {
        self.request(|reply| StoreCmd::LoadIntents { reply }).await
    }

    /// Resolves once every write queued before it has been applied.
    pub async fn flush(&self) -> Result<(), String> {
        self.request(|reply| StoreCmd::Flush { reply }).await
    }

    // -- background thread ---------------------------------------------------

    fn run_loop(conn: Connection, mut rx: mpsc::UnboundedReceiver<StoreCmd>) {
        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                StoreCmd::SavePartition {
                    owner,
                    scope,
                    items,
                    reply,
                } => {
                    Self::answer(reply, Self::do_save_partition(&conn, &owner, &scope, &items));
                }
                StoreCmd::LoadPartitions { reply } => {
                    let _ = reply.send(Self::do_load_partitions(&conn));
                }
                StoreCmd::DropOwner { owner, reply } => {
                    Self::answer(reply, Self::do_drop_owner(&conn, &owner));
                }
                StoreCmd::SaveIntent { intent, reply } => {
                    Self::answer(reply, Self::do_save_intent(&conn, &intent));
                }
                StoreCmd::DeleteIntent { id, reply } => {
                    Self::answer(reply, Self::do_delete_intent(&conn, id));
                }
                StoreCmd::LoadIntents { reply } => {
                    let _ = reply.send(Self::do_load_intents(&conn));
                }
                StoreCmd::Flush { reply } => {
                    let _ = reply.send(Ok(()));
                }
            }
        }
        log::debug!("Store thread exiting");
    }

    /// Reply to a write; failures nobody waits for are logged here.
    fn answer(reply: oneshot::Sender<Result<(), String>>, result: Result<(), String>) {
        if let Err(Err(e)) = reply.send(result) {
            log::warn!("Detached store write failed: {}", e);
        }
    }

    // -- synchronous DB operations -------------------------------------------

    fn do_save_partition(
        conn: &Connection,
        owner: &OwnerId,
        scope: &Scope,
        items: &[Item],
    ) -> Result<(), String> {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| format!("Store tx error: {e}"))?;

        // Write-through: replace the whole partition
        tx.execute(
            "DELETE FROM items WHERE owner = ?1 AND scope = ?2",
            rusqlite::params![owner.0, scope.0],
        )
        .map_err(|e| format!("Store delete error: {e}"))?;

        let mut stmt = tx
            .prepare(
                "INSERT INTO items (owner, scope, key, position, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .map_err(|e| format!("Store prepare error: {e}"))?;

        for (position, item) in items.iter().enumerate() {
            let key = serde_json::to_string(&item.key)
                .map_err(|e| format!("Store encode error: {e}"))?;
            let body =
                serde_json::to_string(item).map_err(|e| format!("Store encode error: {e}"))?;
            stmt.execute(rusqlite::params![owner.0, scope.0, key, position as i64, body])
                .map_err(|e| format!("Store insert error: {e}"))?;
        }
        drop(stmt);

        tx.commit().map_err(|e| format!("Store commit error: {e}"))?;
        Ok(())
    }

    fn do_load_partitions(conn: &Connection) -> Result<Vec<StoredPartition>, String> {
        let mut stmt = conn
            .prepare("SELECT owner, scope, body FROM items ORDER BY owner, scope, position")
            .map_err(|e| format!("Store prepare error: {e}"))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| format!("Store query error: {e}"))?;

        let mut partitions: Vec<StoredPartition> = Vec::new();
        for row in rows {
            let (owner, scope, body) = row.map_err(|e| format!("Store row error: {e}"))?;
            let item: Item = match serde_json::from_str(&body) {
                Ok(item) => item,
                Err(e) => {
                    log::warn!("Skipping undecodable item in {owner}/{scope}: {e}");
                    continue;
                }
            };
            let same_partition =
                matches!(partitions.last(), Some((o, s, _)) if o.0 == owner && s.0 == scope);
            match partitions.last_mut() {
                Some((_, _, items)) if same_partition => items.push(item),
                _ => partitions.push((OwnerId(owner), Scope(scope), vec![item])),
            }
        }
        Ok(partitions)
    }

    fn do_drop_owner(conn: &Connection, owner: &OwnerId) -> Result<(), String> {
        conn.execute("DELETE FROM items WHERE owner = ?1", [&owner.0])
            .map_err(|e| format!("Store delete error: {e}"))?;
        Ok(())
    }

    fn do_save_intent(conn: &Connection, intent: &MutationIntent) -> Result<(), String> {
        let body =
            serde_json::to_string(intent).map_err(|e| format!("Store encode error: {e}"))?;
        conn.execute(
            "INSERT INTO outbox (id, owner, seq, state, body) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET seq = ?3, state = ?4, body = ?5",
            rusqlite::params![
                intent.id.to_string(),
                intent.owner.0,
                intent.seq as i64,
                intent.state.label(),
                body,
            ],
        )
        .map_err(|e| format!("Store intent save error: {e}"))?;
        Ok(())
    }

    fn do_delete_intent(conn: &Connection, id: IntentId) -> Result<(), String> {
        conn.execute("DELETE FROM outbox WHERE id = ?1", [id.to_string()])
            .map_err(|e| format!("Store intent delete error: {e}"))?;
        Ok(())
    }

    fn do_load_intents(conn: &Connection) -> Result<Vec<MutationIntent>, String> {
        let mut stmt = conn
            .prepare("SELECT body FROM outbox ORDER BY seq")
            .map_err(|e| format!("Store prepare error: {e}"))?;

        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| format!("Store query error: {e}"))?;

        let mut intents = Vec::new();
        for row in rows {
            let body = row.map_err(|e| format!("Store row error: {e}"))?;
            let intent: MutationIntent = serde_json::from_str(&body)
                .map_err(|e| format!("Store intent decode error: {e}"))?;
            intents.push(intent);
        }
        Ok(intents)
    }
}
