//! The database system façade.
//!
//! [`DatabaseSystem`] owns the active connection, the three caches, and
//! the background threads. It is an explicit context object constructed
//! once at startup and passed to whatever needs storage access; there is
//! no global singleton. Enable order is strict: open, schema, patches,
//! then scheduling — background maintenance can never overlap with patch
//! execution.
//!
//! Collaborators never touch the raw connection: the event-glue layer
//! submits units of work through [`DatabaseSystem::submit`] and friends,
//! the web layer reads through the caches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, error, info, warn};

use crate::cache::{Clock, InspectionCache, ResponseCache, SessionCache, SystemClock};
use crate::config::StorageConfig;
use crate::dialect::Dialect;
use crate::error::{Result, TallyError};
use crate::patch::PatchEngine;
use crate::schema::{self, ping, servers, sessions, settings, tps, user_server, users};
use crate::statement::{Executable, Query};
use crate::transaction::Transaction;

const MS_PER_MINUTE: i64 = 60_000;
const MS_PER_DAY: i64 = 86_400_000;

/// Expensive-to-assemble per-player aggregate, held by the inspection
/// cache between recomputations.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerSnapshot {
    pub player_uuid: String,
    pub name: String,
    pub session_count: i64,
    pub playtime_ms: i64,
    pub afk_ms: i64,
    pub last_seen_ms: i64,
}

// ------------- Background worker -------------

enum Job {
    Run(Transaction, Option<Sender<bool>>),
    Shutdown,
}

/// Executes submitted units of work on its own thread, in submission
/// order. Callers either block on the completion signal or fire and
/// forget; between independently submitted units no ordering is promised.
struct Worker {
    sender: Sender<Job>,
    join: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(connection: Arc<Mutex<Connection>>) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let join = std::thread::spawn(move || {
            while let Ok(job) = receiver.recv() {
                match job {
                    Job::Run(mut unit, done) => {
                        let success = match run_unit(&connection, &mut unit) {
                            Ok(success) => success,
                            Err(err) => {
                                error!(unit = unit.label(), %err, "worker unit failed hard");
                                false
                            }
                        };
                        if let Some(done) = done {
                            let _ = done.send(success);
                        }
                    }
                    Job::Shutdown => break,
                }
            }
        });
        Self {
            sender,
            join: Some(join),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.sender.send(Job::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run_unit(connection: &Arc<Mutex<Connection>>, unit: &mut Transaction) -> Result<bool> {
    let mut guard = connection
        .lock()
        .map_err(|e| TallyError::Lock(e.to_string()))?;
    unit.execute(&mut guard)
}

// ------------- Maintenance scheduler -------------

struct MaintenanceContext {
    connection: Arc<Mutex<Connection>>,
    dialect: Dialect,
    config: StorageConfig,
    clock: Arc<dyn Clock>,
    session_cache: Arc<SessionCache>,
    inspection_cache: Arc<InspectionCache<PlayerSnapshot>>,
}

impl MaintenanceContext {
    /// One maintenance pass. Each step catches and logs its own failure
    /// so a broken step never unschedules the next run.
    fn run_cycle(&self, cycle: u64) {
        debug!(cycle, "maintenance cycle");
        if let Err(err) = self.delete_stale_samples() {
            warn!(%err, "stale sample cleanup failed");
        }
        if let Err(err) = self.flush_sessions() {
            warn!(%err, "session flush failed");
        }
        if let Err(err) = self.snapshot_config() {
            warn!(%err, "config snapshot failed");
        }
        match self.inspection_cache.sweep() {
            Ok(swept) if swept > 0 => debug!(swept, "inspection cache sweep"),
            Ok(_) => {}
            Err(err) => warn!(%err, "inspection sweep failed"),
        }
        // every Kth cycle: bound memory and reclaim file space
        let k = u64::from(self.config.maintenance.eviction_cycle.max(1));
        if cycle % k == 0 {
            let idle_ms =
                i64::from(self.config.maintenance.inactive_threshold_minutes) * MS_PER_MINUTE;
            match self.session_cache.evict_idle(idle_ms) {
                Ok(evicted) if evicted > 0 => info!(evicted, "evicted idle sessions"),
                Ok(_) => {}
                Err(err) => warn!(%err, "idle eviction failed"),
            }
            if let Err(err) = self.compact() {
                warn!(%err, "compaction failed");
            }
        }
    }

    fn delete_stale_samples(&self) -> Result<()> {
        let cutoff =
            self.clock.now_millis() - i64::from(self.config.maintenance.sample_retention_days) * MS_PER_DAY;
        let mut unit = Transaction::new("maintenance_cleanup")
            .mutate(
                Executable::new(format!(
                    "DELETE FROM {} WHERE {} < ?1",
                    tps::TABLE,
                    tps::DATE_MS
                ))
                .bind(cutoff),
            )
            .mutate(
                Executable::new(format!(
                    "DELETE FROM {} WHERE {} < ?1",
                    ping::TABLE,
                    ping::DATE_MS
                ))
                .bind(cutoff),
            );
        run_unit(&self.connection, &mut unit)?;
        Ok(())
    }

    fn flush_sessions(&self) -> Result<()> {
        let Some((mut unit, keys)) = self.session_cache.flush_transaction()? else {
            return Ok(());
        };
        if run_unit(&self.connection, &mut unit)? {
            self.session_cache.mark_flushed(&keys)?;
            debug!(flushed = keys.len(), "sessions flushed");
        }
        Ok(())
    }

    fn snapshot_config(&self) -> Result<()> {
        let serialized = serde_json::to_string(&self.config)
            .map_err(|e| TallyError::Operation(e.to_string()))?;
        let now = self.clock.now_millis();
        let mut unit = Transaction::new("config_snapshot")
            .mutate(
                Executable::new(format!(
                    "DELETE FROM {} WHERE {} = ?1",
                    settings::TABLE,
                    settings::KEY
                ))
                .bind("config_snapshot".to_owned()),
            )
            .mutate(
                Executable::new(format!(
                    "INSERT INTO {} ({}, {}, {}) VALUES (?1, ?2, ?3)",
                    settings::TABLE,
                    settings::KEY,
                    settings::VALUE,
                    settings::UPDATED_MS
                ))
                .bind("config_snapshot".to_owned())
                .bind(serialized)
                .bind(now),
            );
        run_unit(&self.connection, &mut unit)?;
        Ok(())
    }

    fn compact(&self) -> Result<()> {
        // VACUUM cannot run inside a transaction and only applies to the
        // embedded file engine
        if self.dialect != Dialect::Sqlite || self.config.database.path == ":memory:" {
            return Ok(());
        }
        let guard = self
            .connection
            .lock()
            .map_err(|e| TallyError::Lock(e.to_string()))?;
        guard
            .execute_batch("VACUUM")
            .map_err(TallyError::from)
    }
}

struct Maintenance {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl Maintenance {
    fn spawn(context: Arc<MaintenanceContext>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let join = std::thread::spawn(move || {
            let mut cycle: u64 = 0;
            loop {
                // sleep in short steps so disable() is not stuck waiting
                // out a whole interval
                let mut slept = Duration::ZERO;
                while slept < interval {
                    if stop_flag.load(Ordering::Relaxed) {
                        return;
                    }
                    let step = Duration::from_millis(250).min(interval - slept);
                    std::thread::sleep(step);
                    slept += step;
                }
                if stop_flag.load(Ordering::Relaxed) {
                    return;
                }
                cycle += 1;
                context.run_cycle(cycle);
            }
        });
        Self {
            stop,
            join: Some(join),
        }
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

// ------------- DatabaseSystem -------------

impl std::fmt::Debug for DatabaseSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSystem")
            .field("dialect", &self.dialect)
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

pub struct DatabaseSystem {
    dialect: Dialect,
    connection: Arc<Mutex<Connection>>,
    open: AtomicBool,
    response_cache: Arc<ResponseCache<String>>,
    inspection_cache: Arc<InspectionCache<PlayerSnapshot>>,
    session_cache: Arc<SessionCache>,
    maintenance_context: Arc<MaintenanceContext>,
    // serializes server-identity read-modify-write
    identity_lock: Mutex<()>,
    worker: Option<Worker>,
    maintenance: Option<Maintenance>,
}

impl DatabaseSystem {
    /// Open the configured engine, create the schema, run the patch
    /// engine, then start the worker and the maintenance scheduler.
    /// Any failure before scheduling aborts enable with a fatal error.
    pub fn enable(config: StorageConfig) -> Result<Self> {
        Self::enable_with_clock(config, Arc::new(SystemClock))
    }

    pub fn enable_with_clock(config: StorageConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let dialect = Dialect::from_engine(&config.database.engine)?;
        let mut connection = open_connection(dialect, &config.database.path)?;
        info!(engine = %config.database.engine, path = %config.database.path, "database opened");

        // schema creation is a critical unit: failure means the database
        // must be considered un-openable
        let mut schema_unit = Transaction::critical("create_schema");
        for table in schema::all_tables() {
            schema_unit = schema_unit.mutate(Executable::new(table.render(dialect)?));
        }
        schema_unit.execute(&mut connection)?;

        // patches strictly before any scheduling
        PatchEngine::standard(dialect).apply_all(&mut connection)?;

        let connection = Arc::new(Mutex::new(connection));
        let response_cache = Arc::new(ResponseCache::new(Arc::clone(&clock)));
        let inspection_lifetime_ms = config.cache.inspection_lifetime_seconds as i64 * 1000;
        let inspection_cache = Arc::new(InspectionCache::new(
            inspection_lifetime_ms,
            Arc::clone(&clock),
        ));
        let session_cache = Arc::new(SessionCache::new(Arc::clone(&clock)));

        let maintenance_context = Arc::new(MaintenanceContext {
            connection: Arc::clone(&connection),
            dialect,
            config: config.clone(),
            clock,
            session_cache: Arc::clone(&session_cache),
            inspection_cache: Arc::clone(&inspection_cache),
        });
        let worker = Worker::spawn(Arc::clone(&connection));
        // an interval of 0 would turn the scheduler into a busy loop
        let interval = Duration::from_secs(config.maintenance.interval_minutes.max(1) * 60);
        let maintenance = Maintenance::spawn(Arc::clone(&maintenance_context), interval);
        info!(
            interval_minutes = config.maintenance.interval_minutes,
            "storage enabled"
        );

        Ok(Self {
            dialect,
            connection,
            open: AtomicBool::new(true),
            response_cache,
            inspection_cache,
            session_cache,
            maintenance_context,
            identity_lock: Mutex::new(()),
            worker: Some(worker),
            maintenance: Some(maintenance),
        })
    }

    /// Flush pending write-back state, stop the background threads, and
    /// close. Safe to call twice.
    pub fn disable(&mut self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        // the worker drains its queue before the final flush runs
        drop(self.worker.take());
        drop(self.maintenance.take());
        if let Some((mut unit, keys)) = self.session_cache.flush_transaction()? {
            if run_unit(&self.connection, &mut unit)? {
                self.session_cache.mark_flushed(&keys)?;
            }
        }
        info!("storage disabled");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// The active connection handle, shared with the background threads.
    pub fn database(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.connection)
    }

    pub fn response_cache(&self) -> &ResponseCache<String> {
        &self.response_cache
    }

    pub fn inspection_cache(&self) -> &InspectionCache<PlayerSnapshot> {
        &self.inspection_cache
    }

    pub fn session_cache(&self) -> &SessionCache {
        &self.session_cache
    }

    // ------------- Execution -------------

    /// Execute a unit of work on the caller's thread, returning its
    /// success flag. Critical failures propagate as errors.
    pub fn execute_transaction(&self, unit: &mut Transaction) -> Result<bool> {
        self.check_open()?;
        run_unit(&self.connection, unit)
    }

    /// Run a read and decode its result.
    pub fn query<R>(&self, query: &Query<R>) -> Result<R> {
        self.check_open()?;
        let guard = self
            .connection
            .lock()
            .map_err(|e| TallyError::Lock(e.to_string()))?;
        query.execute(&guard)
    }

    /// Fire-and-forget submission to the background worker.
    pub fn submit(&self, unit: Transaction) {
        if !self.is_open() {
            warn!(unit = unit.label(), "submit after disable, dropped");
            return;
        }
        if let Some(worker) = &self.worker {
            if worker.sender.send(Job::Run(unit, None)).is_err() {
                warn!("worker gone, unit dropped");
            }
        }
    }

    /// Submit to the background worker and block until it completes.
    pub fn submit_and_wait(&self, unit: Transaction) -> Result<bool> {
        self.check_open()?;
        let worker = self
            .worker
            .as_ref()
            .ok_or_else(|| TallyError::Fatal("storage is disabled".into()))?;
        let (done, outcome) = mpsc::channel();
        worker
            .sender
            .send(Job::Run(unit, Some(done)))
            .map_err(|_| TallyError::Operation("worker gone".into()))?;
        outcome
            .recv()
            .map_err(|_| TallyError::Operation("worker gone before completion".into()))
    }

    /// Run one maintenance pass immediately (also used by tests).
    pub fn run_maintenance_now(&self) -> Result<()> {
        self.check_open()?;
        self.maintenance_context.run_cycle(0);
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TallyError::Fatal("storage is disabled".into()))
        }
    }

    // ------------- Collaborator operations -------------

    /// Claim or confirm this server's identity row. Guarded
    /// read-modify-write, serialized by the identity lock; returns true
    /// when the row was inserted, false when the identity already
    /// existed.
    pub fn register_server(&self, server_uuid: &str, name: &str) -> Result<bool> {
        let _guard = self
            .identity_lock
            .lock()
            .map_err(|e| TallyError::Lock(e.to_string()))?;
        let absent = Query::new(
            format!(
                "SELECT COUNT(*) FROM {} WHERE {} = ?1",
                servers::TABLE,
                servers::UUID
            ),
            |rows| match rows.next()? {
                Some(row) => Ok(row.get::<_, i64>(0)? == 0),
                None => Ok(true),
            },
        )
        .bind(server_uuid.to_owned());
        let mut unit = Transaction::new("register_server").guard(absent).mutate(
            Executable::new(format!(
                "INSERT INTO {} ({}, {}, {}) VALUES (?1, ?2, 1)",
                servers::TABLE,
                servers::UUID,
                servers::NAME,
                servers::INSTALLED
            ))
            .bind(server_uuid.to_owned())
            .bind(name.to_owned()),
        );
        self.execute_transaction(&mut unit)
    }

    /// First-time registration of a player; false when already known.
    pub fn register_player(&self, player_uuid: &str, name: &str) -> Result<bool> {
        let absent = Query::new(
            format!(
                "SELECT COUNT(*) FROM {} WHERE {} = ?1",
                users::TABLE,
                users::UUID
            ),
            |rows| match rows.next()? {
                Some(row) => Ok(row.get::<_, i64>(0)? == 0),
                None => Ok(true),
            },
        )
        .bind(player_uuid.to_owned());
        let now = self.maintenance_context.clock.now_millis();
        let mut unit = Transaction::new("register_player").guard(absent).mutate(
            Executable::new(format!(
                "INSERT INTO {} ({}, {}, {}) VALUES (?1, ?2, ?3)",
                users::TABLE,
                users::UUID,
                users::NAME,
                users::REGISTERED_MS
            ))
            .bind(player_uuid.to_owned())
            .bind(name.to_owned())
            .bind(now),
        );
        self.execute_transaction(&mut unit)
    }

    /// Per-server registration of an already known player; false when the
    /// pair already exists.
    pub fn register_on_server(&self, player_uuid: &str, server_uuid: &str) -> Result<bool> {
        let absent = Query::new(
            format!(
                "SELECT COUNT(*) FROM {t} WHERE {u} = \
                 (SELECT {uid} FROM {ut} WHERE {uu} = ?1) AND {s} = \
                 (SELECT {sid} FROM {st} WHERE {su} = ?2)",
                t = user_server::TABLE,
                u = user_server::USER_ID,
                s = user_server::SERVER_ID,
                uid = users::ID,
                ut = users::TABLE,
                uu = users::UUID,
                sid = servers::ID,
                st = servers::TABLE,
                su = servers::UUID
            ),
            |rows| match rows.next()? {
                Some(row) => Ok(row.get::<_, i64>(0)? == 0),
                None => Ok(true),
            },
        )
        .bind(player_uuid.to_owned())
        .bind(server_uuid.to_owned());
        let now = self.maintenance_context.clock.now_millis();
        let mut unit = Transaction::new("register_on_server").guard(absent).mutate(
            Executable::new(format!(
                "INSERT INTO {t} ({u}, {s}, {r}, {b}) VALUES (\
                 (SELECT {uid} FROM {ut} WHERE {uu} = ?1), \
                 (SELECT {sid} FROM {st} WHERE {su} = ?2), ?3, 0)",
                t = user_server::TABLE,
                u = user_server::USER_ID,
                s = user_server::SERVER_ID,
                r = user_server::REGISTERED_MS,
                b = user_server::BANNED,
                uid = users::ID,
                ut = users::TABLE,
                uu = users::UUID,
                sid = servers::ID,
                st = servers::TABLE,
                su = servers::UUID
            ))
            .bind(player_uuid.to_owned())
            .bind(server_uuid.to_owned())
            .bind(now),
        );
        self.execute_transaction(&mut unit)
    }

    /// Routine performance sample, fire-and-forget.
    pub fn record_tps(&self, server_uuid: &str, tps_value: f64, players_online: i64) {
        let now = self.maintenance_context.clock.now_millis();
        let unit = Transaction::new("record_tps").mutate(
            Executable::new(format!(
                "INSERT INTO {t} ({s}, {d}, {v}, {p}) VALUES (\
                 (SELECT {sid} FROM {st} WHERE {su} = ?1), ?2, ?3, ?4)",
                t = tps::TABLE,
                s = tps::SERVER_ID,
                d = tps::DATE_MS,
                v = tps::TPS,
                p = tps::PLAYERS_ONLINE,
                sid = servers::ID,
                st = servers::TABLE,
                su = servers::UUID
            ))
            .bind(server_uuid.to_owned())
            .bind(now)
            .bind(tps_value)
            .bind(players_online),
        );
        self.submit(unit);
    }

    /// Routine ping sample, fire-and-forget.
    pub fn record_ping(
        &self,
        player_uuid: &str,
        server_uuid: &str,
        min_ms: i64,
        max_ms: i64,
        avg_ms: f64,
    ) {
        let now = self.maintenance_context.clock.now_millis();
        let unit = Transaction::new("record_ping").mutate(
            Executable::new(format!(
                "INSERT INTO {t} ({u}, {s}, {d}, {min}, {max}, {avg}) VALUES (\
                 (SELECT {uid} FROM {ut} WHERE {uu} = ?1), \
                 (SELECT {sid} FROM {st} WHERE {su} = ?2), ?3, ?4, ?5, ?6)",
                t = ping::TABLE,
                u = ping::USER_ID,
                s = ping::SERVER_ID,
                d = ping::DATE_MS,
                min = ping::MIN_MS,
                max = ping::MAX_MS,
                avg = ping::AVG_MS,
                uid = users::ID,
                ut = users::TABLE,
                uu = users::UUID,
                sid = servers::ID,
                st = servers::TABLE,
                su = servers::UUID
            ))
            .bind(player_uuid.to_owned())
            .bind(server_uuid.to_owned())
            .bind(now)
            .bind(min_ms)
            .bind(max_ms)
            .bind(avg_ms),
        );
        self.submit(unit);
    }

    /// Full per-player aggregate, served from the inspection cache while
    /// pinned and reassembled from storage after expiry.
    pub fn inspect_player(&self, player_uuid: &str) -> Result<Option<Arc<PlayerSnapshot>>> {
        if let Some(snapshot) = self.inspection_cache.get(player_uuid)? {
            return Ok(Some(snapshot));
        }
        let assembled = self.assemble_player_snapshot(player_uuid)?;
        match assembled {
            Some(snapshot) => {
                self.inspection_cache.insert(player_uuid, snapshot)?;
                self.inspection_cache.get(player_uuid)
            }
            None => Ok(None),
        }
    }

    fn assemble_player_snapshot(&self, player_uuid: &str) -> Result<Option<PlayerSnapshot>> {
        let name = self.query(
            &Query::optional(
                format!(
                    "SELECT {} FROM {} WHERE {} = ?1",
                    users::NAME,
                    users::TABLE,
                    users::UUID
                ),
                |row| row.get::<_, String>(0),
            )
            .bind(player_uuid.to_owned()),
        )?;
        let Some(name) = name else { return Ok(None) };
        let aggregates = self.query(
            &Query::optional(
                format!(
                    "SELECT COUNT(*), \
                     COALESCE(SUM({end} - {start}), 0), \
                     COALESCE(SUM({afk}), 0), \
                     COALESCE(MAX({end}), 0) \
                     FROM {t} WHERE {u} = (SELECT {uid} FROM {ut} WHERE {uu} = ?1) \
                     AND {end} IS NOT NULL",
                    t = sessions::TABLE,
                    u = sessions::USER_ID,
                    start = sessions::START_MS,
                    end = sessions::END_MS,
                    afk = sessions::AFK_MS,
                    uid = users::ID,
                    ut = users::TABLE,
                    uu = users::UUID
                ),
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .bind(player_uuid.to_owned()),
        )?;
        let (session_count, playtime_ms, afk_ms, last_seen_ms) =
            aggregates.unwrap_or((0, 0, 0, 0));
        Ok(Some(PlayerSnapshot {
            player_uuid: player_uuid.to_owned(),
            name,
            session_count,
            playtime_ms,
            afk_ms,
            last_seen_ms,
        }))
    }
}

fn open_connection(dialect: Dialect, path: &str) -> Result<Connection> {
    match dialect {
        Dialect::Sqlite => {
            let connection = if path == ":memory:" {
                Connection::open_in_memory()
            } else {
                Connection::open(path)
            };
            connection.map_err(|e| TallyError::Fatal(format!("cannot open database: {e}")))
        }
        // DDL generation supports MySQL; this build bundles only the
        // embedded engine
        Dialect::MySql => Err(TallyError::Fatal(
            "the mysql engine is not bundled with this build".into(),
        )),
    }
}
