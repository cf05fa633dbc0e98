#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use elo_ladder_core::{
    format_rfc3339, now_utc, Event, EventLog, EventLogStore, EVENT_TYPE_ADD_PLAYER,
    EVENT_TYPE_LOG_MATCH,
};
use rusqlite::{params, Connection};
use serde_json::{json, Value};

const LADDER_MIGRATION_VERSION: i64 = 1;

const SCHEMA_LADDER_V1: &str = r"
CREATE TABLE IF NOT EXISTS ladder_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_type TEXT NOT NULL CHECK (event_type IN ('ADD_PLAYER', 'LOG_MATCH')),
  payload_json TEXT NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_ladder_events_no_update
BEFORE UPDATE ON ladder_events
BEGIN
  SELECT RAISE(FAIL, 'ladder_events is append-only');
END;
";

/// Event log persisted as one row per event, in `event_seq` order.
pub struct SqliteEventLogStore {
    conn: Connection,
}

impl SqliteEventLogStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_LADDER_V1)
            .context("failed to apply ladder schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LADDER_MIGRATION_VERSION, now],
            )
            .context("failed to register ladder schema migration")?;

        Ok(())
    }

    pub fn load_log(&self) -> Result<EventLog> {
        let mut stmt = self.conn.prepare(
            "SELECT event_seq, event_type, payload_json
             FROM ladder_events
             ORDER BY event_seq ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (event_seq, event_type, payload_json) = row?;
            events.push(
                parse_event_row(&event_type, &payload_json)
                    .with_context(|| format!("failed to decode ladder event {event_seq}"))?,
            );
        }

        Ok(EventLog::from_events(events))
    }

    /// Appends one event and returns its sequence number.
    pub fn append_event(&mut self, event: &Event) -> Result<i64> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start event transaction")?;
        insert_event(&tx, event)?;
        let event_seq = tx.last_insert_rowid();
        tx.commit().context("failed to commit event transaction")?;

        tracing::debug!(event_seq, event_type = event.type_name(), "event appended");
        Ok(event_seq)
    }

    /// Replaces every stored event with `log` in a single transaction.
    pub fn replace_log(&mut self, log: &EventLog) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start replace transaction")?;

        tx.execute("DELETE FROM ladder_events", [])
            .context("failed to clear ladder_events")?;
        for event in log {
            insert_event(&tx, event)?;
        }

        tx.commit().context("failed to commit replace transaction")?;
        tracing::debug!(events = log.len(), "event log replaced");
        Ok(())
    }

    pub fn clear_log(&mut self) -> Result<()> {
        self.replace_log(&EventLog::new())
    }

    pub fn event_count(&self) -> Result<usize> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM ladder_events", [], |row| {
                row.get::<_, i64>(0)
            })
            .context("failed to count ladder events")?;
        usize::try_from(count).context("event count out of range")
    }

    pub fn latest_event_seq(&self) -> Result<Option<i64>> {
        let value = self
            .conn
            .query_row("SELECT MAX(event_seq) FROM ladder_events", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .context("failed to query latest event_seq")?;
        Ok(value)
    }
}

impl EventLogStore for SqliteEventLogStore {
    type Error = anyhow::Error;

    fn load(&self) -> Result<EventLog> {
        self.load_log()
    }

    fn save(&mut self, log: &EventLog) -> Result<()> {
        self.replace_log(log)
    }

    fn append(&mut self, event: &Event, _log: &EventLog) -> Result<()> {
        self.append_event(event).map(|_| ())
    }

    fn clear(&mut self) -> Result<()> {
        self.clear_log()
    }
}

fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let encoded = serde_json::to_value(event).context("failed to encode ladder event")?;
    let payload = encoded.get("payload").cloned().unwrap_or(Value::Null);
    let payload_json =
        serde_json::to_string(&payload).context("failed to encode ladder event payload")?;
    let recorded_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

    conn.execute(
        "INSERT INTO ladder_events(event_type, payload_json, recorded_at) VALUES (?1, ?2, ?3)",
        params![event.type_name(), payload_json, recorded_at],
    )
    .context("failed to insert ladder event")?;

    Ok(())
}

fn parse_event_row(event_type: &str, payload_json: &str) -> Result<Event> {
    if event_type != EVENT_TYPE_ADD_PLAYER && event_type != EVENT_TYPE_LOG_MATCH {
        return Err(anyhow!("unknown event_type {event_type}"));
    }

    let payload: Value = serde_json::from_str(payload_json).context("invalid payload_json")?;
    let event = serde_json::from_value(json!({"type": event_type, "payload": payload}))
        .context("payload does not match event type")?;
    Ok(event)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use elo_ladder_core::{
        derive_state, AddPlayer, LadderConfig, LadderSession, LogMatch, StartingTier, DRAW,
    };
    use proptest::prelude::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteEventLogStore {
        let store = must(SqliteEventLogStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn add(name: &str, elo: Option<i64>) -> Event {
        Event::AddPlayer(AddPlayer {
            name: name.to_string(),
            elo,
            timestamp: None,
        })
    }

    fn play(player1: &str, player2: &str, winner: &str) -> Event {
        Event::LogMatch(LogMatch {
            player1_name: player1.to_string(),
            player2_name: player2.to_string(),
            winner: winner.to_string(),
            timestamp: None,
        })
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = fixture_store();
        must(store.migrate());
        assert_eq!(must(store.event_count()), 0);
        assert_eq!(must(store.latest_event_seq()), None);
    }

    #[test]
    fn appended_events_load_in_order() {
        let mut store = fixture_store();
        let events = vec![add("A", Some(1000)), add("B", None), play("A", "B", DRAW)];
        for event in &events {
            must(store.append_event(event));
        }

        assert_eq!(must(store.load_log()), EventLog::from_events(events));
        assert_eq!(must(store.latest_event_seq()), Some(3));
    }

    #[test]
    fn append_only_trigger_blocks_updates() {
        let mut store = fixture_store();
        let event_seq = must(store.append_event(&add("A", None)));

        let update_result = store.conn.execute(
            "UPDATE ladder_events SET payload_json = '{}' WHERE event_seq = ?1",
            params![event_seq],
        );

        assert!(update_result.is_err());
    }

    #[test]
    fn event_type_check_rejects_unknown_types() {
        let store = fixture_store();
        let insert_result = store.conn.execute(
            "INSERT INTO ladder_events(event_type, payload_json, recorded_at) VALUES ('REMOVE_PLAYER', '{}', 'now')",
            [],
        );
        assert!(insert_result.is_err());
    }

    #[test]
    fn replace_and_clear_rewrite_the_log() {
        let mut store = fixture_store();
        must(store.append_event(&add("Old", None)));

        let replacement = EventLog::from_events(vec![add("A", None), add("B", None)]);
        must(store.replace_log(&replacement));
        assert_eq!(must(store.load_log()), replacement);

        must(store.clear_log());
        assert!(must(store.load_log()).is_empty());
    }

    #[test]
    fn corrupt_payload_fails_load() {
        let store = fixture_store();
        must(
            store
                .conn
                .execute(
                    "INSERT INTO ladder_events(event_type, payload_json, recorded_at) VALUES ('ADD_PLAYER', 'not json', 'now')",
                    [],
                )
                .map_err(anyhow::Error::from),
        );
        assert!(store.load_log().is_err());
    }

    #[test]
    fn session_writes_survive_reopen() {
        let path = std::env::temp_dir().join(format!(
            "elo-ladder-store-{}.sqlite3",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        {
            let store = must(SqliteEventLogStore::open(&path));
            must(store.migrate());
            let mut session = must(LadderSession::open(store, LadderConfig::default()));
            must(session.add_player("Alice", Some(StartingTier::Advanced), None));
            must(session.add_player("Bob", None, None));
            must(session.log_match("Alice", "Bob", "Alice", None));
            assert!(session.log_match("Alice", "Carol", "Alice", None).is_err());
        }

        let store = must(SqliteEventLogStore::open(&path));
        must(store.migrate());
        let session = must(LadderSession::open(store, LadderConfig::default()));
        let view = session.view();
        assert_eq!(session.log().len(), 3);
        assert_eq!(view.players.len(), 2);
        assert_eq!(view.matches[0].player1.new_rating, 1019.0);

        let _ = std::fs::remove_file(&path);
    }

    fn event_from_code(code: u8) -> Event {
        match code {
            0 => add("A", None),
            1 => add("B", Some(600)),
            2 => add("C", Some(1000)),
            3 => play("A", "B", "A"),
            4 => play("B", "C", DRAW),
            _ => play("C", "A", "A"),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_stored_log_replays_identically(codes in prop::collection::vec(0u8..6, 0..60)) {
            let mut store = fixture_store();
            let log = EventLog::from_events(codes.into_iter().map(event_from_code).collect());
            must(store.replace_log(&log));

            let loaded = must(store.load_log());
            let config = LadderConfig::default();
            prop_assert_eq!(&loaded, &log);
            prop_assert_eq!(derive_state(&loaded, &config), derive_state(&log, &config));
        }
    }
}
