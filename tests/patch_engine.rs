use rusqlite::Connection;
use tally::dialect::Dialect;
use tally::error::{Result, TallyError};
use tally::patch::{
    column_exists, table_exists, DeduplicateUserServerPatch, DropLegacyVersionTablePatch, Patch,
    PatchEngine, RegisterDateSecondsPatch, SessionAfkColumnPatch,
};
use tally::schema;

fn fresh_database() -> Connection {
    let connection = Connection::open_in_memory().unwrap();
    for table in schema::all_tables() {
        let ddl = table.render(Dialect::Sqlite).unwrap();
        connection.execute_batch(&ddl).unwrap();
    }
    connection
}

#[test]
fn fresh_database_needs_no_patches() {
    let mut connection = fresh_database();
    let engine = PatchEngine::standard(Dialect::Sqlite);
    engine.apply_all(&mut connection).unwrap();
    // probes are exact: every shipped patch reports applied afterwards
    assert!(SessionAfkColumnPatch { dialect: Dialect::Sqlite }
        .has_been_applied(&connection)
        .unwrap());
    assert!(RegisterDateSecondsPatch.has_been_applied(&connection).unwrap());
    assert!(DeduplicateUserServerPatch.has_been_applied(&connection).unwrap());
}

#[test]
fn afk_column_patch_upgrades_an_old_sessions_table() {
    let mut connection = Connection::open_in_memory().unwrap();
    // a sessions table from before the AFK column existed
    connection
        .execute_batch(
            "CREATE TABLE tally_sessions (\
             id integer PRIMARY KEY, \
             user_id integer NOT NULL, \
             server_id integer NOT NULL, \
             session_start_ms bigint NOT NULL, \
             session_end_ms bigint)",
        )
        .unwrap();
    let patch = SessionAfkColumnPatch { dialect: Dialect::Sqlite };
    assert!(!patch.has_been_applied(&connection).unwrap());

    PatchEngine::new(vec![Box::new(SessionAfkColumnPatch { dialect: Dialect::Sqlite })])
        .apply_all(&mut connection)
        .unwrap();
    assert!(patch.has_been_applied(&connection).unwrap());
    assert!(column_exists(&connection, Dialect::Sqlite, "tally_sessions", "afk_ms").unwrap());

    // re-running the engine must be a no-op
    PatchEngine::new(vec![Box::new(SessionAfkColumnPatch { dialect: Dialect::Sqlite })])
        .apply_all(&mut connection)
        .unwrap();
}

#[test]
fn register_date_patch_scales_seconds_to_millis() {
    let mut connection = fresh_database();
    connection
        .execute(
            "INSERT INTO tally_users (uuid, name, registered_ms) VALUES ('u1', 'A', 1600000000)",
            [],
        )
        .unwrap();
    connection
        .execute(
            "INSERT INTO tally_users (uuid, name, registered_ms) VALUES ('u2', 'B', 1600000000000)",
            [],
        )
        .unwrap();
    let patch = RegisterDateSecondsPatch;
    assert!(!patch.has_been_applied(&connection).unwrap());

    PatchEngine::new(vec![Box::new(RegisterDateSecondsPatch)])
        .apply_all(&mut connection)
        .unwrap();
    assert!(patch.has_been_applied(&connection).unwrap());

    let scaled: i64 = connection
        .query_row(
            "SELECT registered_ms FROM tally_users WHERE uuid = 'u1'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(scaled, 1_600_000_000_000);
    // the already-millis row is untouched
    let untouched: i64 = connection
        .query_row(
            "SELECT registered_ms FROM tally_users WHERE uuid = 'u2'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(untouched, 1_600_000_000_000);

    // applying twice leaves the same observable state as applying once
    patch.apply(&connection).unwrap();
    let still: i64 = connection
        .query_row(
            "SELECT registered_ms FROM tally_users WHERE uuid = 'u1'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(still, 1_600_000_000_000);
}

#[test]
fn deduplication_keeps_the_lowest_id() {
    let mut connection = fresh_database();
    // two rows for the same (user, server) pair with ids 5 and 9,
    // plus an unrelated pair that must survive
    connection
        .execute_batch(
            "INSERT INTO tally_users (id, uuid, name, registered_ms) \
             VALUES (1, 'u1', 'A', 1000);\
             INSERT INTO tally_users (id, uuid, name, registered_ms) \
             VALUES (2, 'u2', 'B', 1000);\
             INSERT INTO tally_servers (id, uuid, name, installed) \
             VALUES (1, 's1', 'S', 1);\
             INSERT INTO tally_user_server (id, user_id, server_id, registered_ms, banned) \
             VALUES (5, 1, 1, 1000, 0);\
             INSERT INTO tally_user_server (id, user_id, server_id, registered_ms, banned) \
             VALUES (9, 1, 1, 2000, 0);\
             INSERT INTO tally_user_server (id, user_id, server_id, registered_ms, banned) \
             VALUES (12, 2, 1, 3000, 0);",
        )
        .unwrap();
    let patch = DeduplicateUserServerPatch;
    assert!(!patch.has_been_applied(&connection).unwrap());

    PatchEngine::new(vec![Box::new(DeduplicateUserServerPatch)])
        .apply_all(&mut connection)
        .unwrap();
    assert!(patch.has_been_applied(&connection).unwrap());

    let ids: Vec<i64> = connection
        .prepare("SELECT id FROM tally_user_server ORDER BY id")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(ids, vec![5, 12], "the lower duplicate id wins");

    // idempotency: a second apply changes nothing
    patch.apply(&connection).unwrap();
    let count: i64 = connection
        .query_row("SELECT COUNT(*) FROM tally_user_server", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 2);
}

#[test]
fn legacy_version_table_is_dropped() {
    let mut connection = fresh_database();
    connection
        .execute_batch("CREATE TABLE tally_schema_version (v integer)")
        .unwrap();
    let patch = DropLegacyVersionTablePatch { dialect: Dialect::Sqlite };
    assert!(!patch.has_been_applied(&connection).unwrap());

    PatchEngine::new(vec![Box::new(DropLegacyVersionTablePatch {
        dialect: Dialect::Sqlite,
    })])
    .apply_all(&mut connection)
    .unwrap();
    assert!(!table_exists(&connection, Dialect::Sqlite, "tally_schema_version").unwrap());
    assert!(patch.has_been_applied(&connection).unwrap());
}

/// A patch whose probe still fails after apply has silently failed; the
/// engine logs the anomaly and keeps going unless the patch is critical.
struct BrokenPatch {
    critical: bool,
}

impl Patch for BrokenPatch {
    fn name(&self) -> &'static str {
        "broken"
    }
    fn has_been_applied(&self, _connection: &Connection) -> Result<bool> {
        Ok(false)
    }
    fn apply(&self, _connection: &Connection) -> Result<()> {
        Ok(())
    }
    fn critical(&self) -> bool {
        self.critical
    }
}

#[test]
fn silent_patch_failure_is_an_anomaly_not_a_halt() {
    let mut connection = fresh_database();
    PatchEngine::new(vec![Box::new(BrokenPatch { critical: false })])
        .apply_all(&mut connection)
        .unwrap();
}

#[test]
fn critical_patch_failure_halts_startup() {
    let mut connection = fresh_database();
    let err = PatchEngine::new(vec![Box::new(BrokenPatch { critical: true })])
        .apply_all(&mut connection)
        .unwrap_err();
    assert!(matches!(err, TallyError::Fatal(_)), "got: {err}");
}

#[test]
fn later_patches_still_run_after_a_failed_one() {
    let mut connection = fresh_database();
    connection
        .execute_batch("CREATE TABLE tally_schema_version (v integer)")
        .unwrap();
    PatchEngine::new(vec![
        Box::new(BrokenPatch { critical: false }),
        Box::new(DropLegacyVersionTablePatch { dialect: Dialect::Sqlite }),
    ])
    .apply_all(&mut connection)
    .unwrap();
    assert!(!table_exists(&connection, Dialect::Sqlite, "tally_schema_version").unwrap());
}
