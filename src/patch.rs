//! Patch-based schema migration.
//!
//! Every [`Patch`] is self-describing: `has_been_applied` is a structural
//! probe against the live schema or data (a column exists, no rows match a
//! bad-data predicate), never a version counter, so the engine is safe to
//! re-run against a database migrated by an older release or a different
//! code path. Patches run once at boot, before any other traffic, in a
//! fixed declaration order that the author is responsible for.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::dialect::Dialect;
use crate::error::{Result, TallyError};
use crate::schema::{self, sessions, user_server, users};
use crate::statement::{Executable, Query};

/// A self-checking, idempotent schema or data correction.
pub trait Patch: Send {
    fn name(&self) -> &'static str;

    /// Cheap structural probe. Must be exact: when this returns true,
    /// `apply` would be a no-op.
    fn has_been_applied(&self, connection: &Connection) -> Result<bool>;

    /// Idempotent corrective logic. Runs inside its own transaction.
    fn apply(&self, connection: &Connection) -> Result<()>;

    /// Critical patches abort startup when they fail; the default is the
    /// forgiving mode, where a failed post-check is only an anomaly.
    fn critical(&self) -> bool {
        false
    }
}

// ------------- Structural probes -------------

pub fn table_exists(connection: &Connection, dialect: Dialect, table: &str) -> Result<bool> {
    let query = match dialect {
        Dialect::Sqlite => Query::exists(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
        )
        .bind(table.to_owned()),
        Dialect::MySql => Query::exists(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_name = ?1",
        )
        .bind(table.to_owned()),
    };
    query.execute(connection)
}

pub fn column_exists(
    connection: &Connection,
    dialect: Dialect,
    table: &str,
    column: &str,
) -> Result<bool> {
    let query = match dialect {
        Dialect::Sqlite => Query::exists(
            "SELECT name FROM pragma_table_info(?1) WHERE name = ?2",
        )
        .bind(table.to_owned())
        .bind(column.to_owned()),
        Dialect::MySql => Query::exists(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = DATABASE() AND table_name = ?1 AND column_name = ?2",
        )
        .bind(table.to_owned())
        .bind(column.to_owned()),
    };
    query.execute(connection)
}

// ------------- Engine -------------

/// Applies an ordered list of patches at boot, skipping the ones whose
/// probes pass and re-checking the rest after apply.
pub struct PatchEngine {
    patches: Vec<Box<dyn Patch>>,
}

impl PatchEngine {
    pub fn new(patches: Vec<Box<dyn Patch>>) -> Self {
        Self { patches }
    }

    /// The shipped patch list, in dependency order.
    pub fn standard(dialect: Dialect) -> Self {
        Self::new(vec![
            Box::new(SessionAfkColumnPatch { dialect }),
            Box::new(RegisterDateSecondsPatch),
            Box::new(DeduplicateUserServerPatch),
            Box::new(DropLegacyVersionTablePatch { dialect }),
        ])
    }

    pub fn apply_all(&self, connection: &mut Connection) -> Result<()> {
        for patch in &self.patches {
            if patch.has_been_applied(connection)? {
                debug!(patch = patch.name(), "already applied, skipping");
                continue;
            }
            info!(patch = patch.name(), "applying patch");
            if let Err(error) = Self::apply_one(patch.as_ref(), connection) {
                if patch.critical() {
                    return Err(TallyError::Fatal(format!(
                        "critical patch '{}' failed: {error}",
                        patch.name()
                    )));
                }
                warn!(patch = patch.name(), %error, "patch failed, continuing");
                continue;
            }
            // a patch that "succeeded" but whose probe still fails has
            // silently failed; anomalous but not fatal by default
            if !patch.has_been_applied(connection)? {
                if patch.critical() {
                    return Err(TallyError::Fatal(format!(
                        "critical patch '{}' did not take effect",
                        patch.name()
                    )));
                }
                warn!(patch = patch.name(), "patch did not take effect");
            }
        }
        Ok(())
    }

    fn apply_one(patch: &dyn Patch, connection: &mut Connection) -> Result<()> {
        let guard = connection.transaction()?;
        patch.apply(&guard)?;
        guard.commit()?;
        Ok(())
    }
}

// ------------- Shipped patches -------------

/// Sessions gained an AFK-time column; databases created before that
/// release lack it.
pub struct SessionAfkColumnPatch {
    pub dialect: Dialect,
}

impl Patch for SessionAfkColumnPatch {
    fn name(&self) -> &'static str {
        "session_afk_column"
    }
    fn has_been_applied(&self, connection: &Connection) -> Result<bool> {
        column_exists(connection, self.dialect, sessions::TABLE, sessions::AFK_MS)
    }
    fn apply(&self, connection: &Connection) -> Result<()> {
        Executable::new(format!(
            "ALTER TABLE {} ADD COLUMN {} bigint NOT NULL DEFAULT 0",
            sessions::TABLE,
            sessions::AFK_MS
        ))
        .execute(connection)?;
        Ok(())
    }
}

/// Early releases stored registration dates in epoch seconds. Any value
/// below the cutoff predates the year 2286 in millis and must be scaled.
pub struct RegisterDateSecondsPatch;

/// Epoch-seconds values are below this; epoch-millis values above it.
const SECONDS_CUTOFF_MS: i64 = 10_000_000_000;

impl Patch for RegisterDateSecondsPatch {
    fn name(&self) -> &'static str {
        "register_date_seconds"
    }
    fn has_been_applied(&self, connection: &Connection) -> Result<bool> {
        let bad_rows = Query::exists(format!(
            "SELECT {id} FROM {table} WHERE {col} > 0 AND {col} < ?1",
            id = users::ID,
            table = users::TABLE,
            col = users::REGISTERED_MS
        ))
        .bind(SECONDS_CUTOFF_MS)
        .execute(connection)?;
        Ok(!bad_rows)
    }
    fn apply(&self, connection: &Connection) -> Result<()> {
        // one batched statement: the correction set is never iterated
        // row by row, so patch time stays bounded over large tables
        Executable::new(format!(
            "UPDATE {table} SET {col} = {col} * 1000 WHERE {col} > 0 AND {col} < ?1",
            table = users::TABLE,
            col = users::REGISTERED_MS
        ))
        .bind(SECONDS_CUTOFF_MS)
        .execute(connection)?;
        Ok(())
    }
}

/// A join/quit race in old releases could register a player twice on the
/// same server. The earliest row (lowest id) wins.
pub struct DeduplicateUserServerPatch;

impl Patch for DeduplicateUserServerPatch {
    fn name(&self) -> &'static str {
        "deduplicate_user_server"
    }
    fn has_been_applied(&self, connection: &Connection) -> Result<bool> {
        let duplicates = Query::exists(format!(
            "SELECT {user} FROM {table} GROUP BY {user}, {server} HAVING COUNT(*) > 1",
            user = user_server::USER_ID,
            server = user_server::SERVER_ID,
            table = user_server::TABLE
        ))
        .execute(connection)?;
        Ok(!duplicates)
    }
    fn apply(&self, connection: &Connection) -> Result<()> {
        Executable::new(format!(
            "DELETE FROM {table} WHERE {id} NOT IN \
             (SELECT MIN({id}) FROM {table} GROUP BY {user}, {server})",
            table = user_server::TABLE,
            id = user_server::ID,
            user = user_server::USER_ID,
            server = user_server::SERVER_ID
        ))
        .execute(connection)?;
        Ok(())
    }
}

/// Drops the version-counter table that probes made obsolete.
pub struct DropLegacyVersionTablePatch {
    pub dialect: Dialect,
}

impl Patch for DropLegacyVersionTablePatch {
    fn name(&self) -> &'static str {
        "drop_legacy_version_table"
    }
    fn has_been_applied(&self, connection: &Connection) -> Result<bool> {
        Ok(!table_exists(
            connection,
            self.dialect,
            schema::LEGACY_VERSION_TABLE,
        )?)
    }
    fn apply(&self, connection: &Connection) -> Result<()> {
        Executable::new(format!(
            "DROP TABLE IF EXISTS {}",
            schema::LEGACY_VERSION_TABLE
        ))
        .execute(connection)?;
        Ok(())
    }
}
