use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;

use crate::bridge::ActiveBridge;
use crate::session::Session;
use crate::store::{BridgeStore, SessionStore};

/// SQLite-backed session and bridge store. Every write runs inside its own transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const BRIDGE_COLUMNS: &str = "id, user_id, quest_id, bridge_id, title, description, created_at, \
     deadline_at, reminder_at, completed, reminded, superseded, verification_response, completed_at";

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn db_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(raw: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn bridge_from_row(row: &Row<'_>) -> rusqlite::Result<ActiveBridge> {
    Ok(ActiveBridge {
        id: row.get(0)?,
        user_id: row.get(1)?,
        quest_id: row.get(2)?,
        bridge_id: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        created_at: parse_time(row.get(6)?, 6)?,
        deadline_at: parse_time(row.get(7)?, 7)?,
        reminder_at: parse_time(row.get(8)?, 8)?,
        completed: row.get(9)?,
        reminded: row.get(10)?,
        superseded: row.get(11)?,
        verification_response: row.get(12)?,
        completed_at: row
            .get::<_, Option<String>>(13)?
            .map(|raw| parse_time(raw, 13))
            .transpose()?,
    })
}

impl SqliteStore {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {:?}", path))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        tracing::info!("Opened session database at {:?}", path);
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS sessions (
                user_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS bridges (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                quest_id TEXT NOT NULL,
                bridge_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                created_at TEXT NOT NULL,
                deadline_at TEXT NOT NULL,
                reminder_at TEXT NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0,
                reminded INTEGER NOT NULL DEFAULT 0,
                superseded INTEGER NOT NULL DEFAULT 0,
                verification_response TEXT,
                completed_at TEXT
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_bridges_user_open ON bridges(user_id, completed, superseded)",
            [],
        )?;

        Ok(())
    }

    fn query_bridges(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<ActiveBridge>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let bridges = stmt
            .query_map(args, bridge_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(bridges)
    }

    pub fn list_user_ids(&self) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT user_id FROM sessions ORDER BY user_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }
}

impl SessionStore for SqliteStore {
    fn get(&self, user_id: &str) -> Result<Option<Session>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT snapshot FROM sessions WHERE user_id = ?1",
            [user_id],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(snapshot) => {
                let session = serde_json::from_str(&snapshot)
                    .with_context(|| format!("Corrupt session snapshot for user {}", user_id))?;
                Ok(Some(session))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn create(&self, session: &Session) -> Result<()> {
        let snapshot = serde_json::to_string(session).context("Failed to serialize session")?;
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO sessions (user_id, state, snapshot, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.user_id,
                session.state.as_db_str(),
                snapshot,
                db_time(session.started_at),
                db_time(session.last_activity),
            ],
        )
        .with_context(|| format!("Failed to create session for user {}", session.user_id))?;
        tx.commit()?;
        Ok(())
    }

    fn update(&self, session: &Session) -> Result<()> {
        let snapshot = serde_json::to_string(session).context("Failed to serialize session")?;
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE sessions SET state = ?2, snapshot = ?3, updated_at = ?4 WHERE user_id = ?1",
            params![
                session.user_id,
                session.state.as_db_str(),
                snapshot,
                db_time(session.last_activity),
            ],
        )?;
        if changed == 0 {
            bail!("No session for user {}", session.user_id);
        }
        tx.commit()?;
        Ok(())
    }

    fn delete(&self, user_id: &str) -> Result<bool> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM sessions WHERE user_id = ?1", [user_id])?;
        tx.commit()?;
        Ok(removed > 0)
    }
}

impl BridgeStore for SqliteStore {
    fn save_bridge(&self, bridge: &ActiveBridge) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO bridges ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                BRIDGE_COLUMNS
            ),
            params![
                bridge.id,
                bridge.user_id,
                bridge.quest_id,
                bridge.bridge_id,
                bridge.title,
                bridge.description,
                db_time(bridge.created_at),
                db_time(bridge.deadline_at),
                db_time(bridge.reminder_at),
                bridge.completed,
                bridge.reminded,
                bridge.superseded,
                bridge.verification_response,
                bridge.completed_at.map(db_time),
            ],
        )
        .with_context(|| format!("Failed to save bridge {}", bridge.id))?;
        tx.commit()?;
        Ok(())
    }

    fn get_bridge(&self, id: &str) -> Result<Option<ActiveBridge>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            &format!("SELECT {} FROM bridges WHERE id = ?1", BRIDGE_COLUMNS),
            [id],
            bridge_from_row,
        );

        match result {
            Ok(bridge) => Ok(Some(bridge)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn open_bridges_for(&self, user_id: &str) -> Result<Vec<ActiveBridge>> {
        self.query_bridges(
            &format!(
                "SELECT {} FROM bridges WHERE user_id = ?1 AND completed = 0 AND superseded = 0
                 ORDER BY created_at ASC, id ASC",
                BRIDGE_COLUMNS
            ),
            &[&user_id],
        )
    }

    fn open_bridges(&self) -> Result<Vec<ActiveBridge>> {
        self.query_bridges(
            &format!(
                "SELECT {} FROM bridges WHERE completed = 0 AND superseded = 0
                 ORDER BY created_at ASC, id ASC",
                BRIDGE_COLUMNS
            ),
            &[],
        )
    }

    fn all_bridges(&self) -> Result<Vec<ActiveBridge>> {
        self.query_bridges(
            &format!(
                "SELECT {} FROM bridges ORDER BY created_at ASC, id ASC",
                BRIDGE_COLUMNS
            ),
            &[],
        )
    }
}
