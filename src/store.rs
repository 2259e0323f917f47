//! Durable SQLite store for proposals and avoidance rules.
//!
//! Proposals are upserted by id (the body is the card as JSON); avoidance
//! rules are appended by sequence number, so re-sending an already persisted
//! suffix is a no-op. All methods block; async callers go through
//! `spawn_blocking`.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::self_modify::memory::AvoidanceRule;
use crate::self_modify::planner::DecisionCard;
use crate::util::now_ms;

struct Migration {
    version: u32,
    name: &'static str,
    up: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        up: "CREATE TABLE proposals (
                 id             TEXT PRIMARY KEY,
                 target_module  TEXT NOT NULL,
                 body           TEXT NOT NULL,
                 recorded_at_ms INTEGER NOT NULL
             );
             CREATE TABLE avoidance_rules (
                 seq            INTEGER PRIMARY KEY,
                 target_module  TEXT NOT NULL,
                 description    TEXT NOT NULL,
                 learned_at_ms  INTEGER NOT NULL
             );",
    },
    Migration {
        version: 2,
        name: "rules_by_module",
        up: "CREATE INDEX idx_avoidance_rules_module ON avoidance_rules(target_module);",
    },
];

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version    INTEGER PRIMARY KEY,
            name       TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;
    let current: u32 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |r| r.get(0))?;

    for m in MIGRATIONS.iter().filter(|m| m.version > current) {
        tracing::info!(target: "kernel::store", version = m.version, name = m.name, "applying migration");
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(m.up)?;
        tx.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            params![m.version, m.name],
        )?;
        tx.commit()?;
    }
    Ok(())
}

pub struct KernelStore {
    conn: Mutex<Connection>,
}

impl KernelStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        run_migrations(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- Proposals --

    /// Insert or replace each card. Returns the number written.
    pub fn save_proposals(&self, cards: &[DecisionCard]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = now_ms() as i64;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO proposals (id, target_module, body, recorded_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET target_module = excluded.target_module,
                                               body = excluded.body",
            )?;
            for card in cards {
                let body = serde_json::to_string(card)?;
                stmt.execute(params![card.id, card.target_module, body, now])?;
            }
        }
        tx.commit()?;
        Ok(cards.len())
    }

    /// All proposals in first-recorded order.
    pub fn load_proposals(&self) -> Result<Vec<DecisionCard>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT body FROM proposals ORDER BY recorded_at_ms, rowid")?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(Into::into))
            .collect()
    }

    pub fn proposal(&self, id: &str) -> Result<Option<DecisionCard>> {
        let body: Option<String> = self
            .conn()
            .query_row("SELECT body FROM proposals WHERE id = ?1", params![id], |r| r.get(0))
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(Into::into)).transpose()
    }

    // -- Avoidance rules --

    pub fn rule_count(&self) -> Result<usize> {
        let n: i64 = self.conn().query_row("SELECT COUNT(*) FROM avoidance_rules", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    /// Append `rules` at sequence numbers `start_seq..`. Already present
    /// sequence numbers are left untouched. Returns the number inserted.
    pub fn append_rules(&self, start_seq: usize, rules: &[AvoidanceRule]) -> Result<usize> {
        if rules.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO avoidance_rules (seq, target_module, description, learned_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (i, rule) in rules.iter().enumerate() {
                inserted += stmt.execute(params![
                    (start_seq + i) as i64,
                    rule.target_module,
                    rule.description,
                    rule.learned_at_ms as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// All rules in sequence order.
    pub fn load_rules(&self) -> Result<Vec<AvoidanceRule>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT target_module, description, learned_at_ms FROM avoidance_rules ORDER BY seq",
        )?;
        let rules = stmt
            .query_map([], |row| {
                Ok(AvoidanceRule {
                    target_module: row.get(0)?,
                    description: row.get(1)?,
                    learned_at_ms: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rules)
    }
}
