//! The three cooperating caches in front of the database.
//!
//! * [`ResponseCache`] – keyed, previously computed results with explicit
//!   and prefix-based invalidation, single-flight recomputation.
//! * [`InspectionCache`] – expensive per-entity aggregate snapshots pinned
//!   for a fixed lifetime, each entry expiring independently.
//! * [`SessionCache`] – write-back accumulator of in-memory session
//!   mutations, flushed to storage on a periodic schedule.
//!
//! All three are independent and safe for concurrent access; none holds a
//! lock across a database call, so a slow query can never block a live hit
//! on an unrelated key. Time is injected through [`Clock`] so that expiry
//! is testable without real delays.

use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use seahash::SeaHasher;

use crate::error::{Result, TallyError};
use crate::schema::{servers, sessions, users};
use crate::statement::Executable;
use crate::transaction::Transaction;

pub type CacheHasher = BuildHasherDefault<SeaHasher>;

fn lock<'a, T>(mutex: &'a Mutex<T>) -> Result<MutexGuard<'a, T>> {
    mutex.lock().map_err(|e| TallyError::Lock(e.to_string()))
}

// ------------- Clock -------------

/// Injected time source. Production uses [`SystemClock`]; tests substitute
/// a manual clock to drive expiry deterministically.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

// ------------- Cache keys -------------

/// Keys are globally unique strings: `<Kind>` for server-wide results,
/// `<Kind>-<EntityID>` for per-entity ones.
pub fn response_key(kind: &str) -> String {
    kind.to_owned()
}

pub fn response_key_for(kind: &str, entity_id: &str) -> String {
    format!("{kind}-{entity_id}")
}

// ------------- Response cache -------------

struct StoredValue<V> {
    value: Arc<V>,
    created_ms: i64,
}

/// Per-key cell: the cell mutex serializes computation for one key only,
/// so concurrent misses run at most one supplier to completion while hits
/// on other keys proceed unblocked.
struct CacheCell<V> {
    slot: Mutex<Option<StoredValue<V>>>,
}

impl<V> CacheCell<V> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

/// Keyed store of previously computed results.
pub struct ResponseCache<V> {
    cells: Mutex<HashMap<String, Arc<CacheCell<V>>, CacheHasher>>,
    clock: Arc<dyn Clock>,
}

impl<V> ResponseCache<V> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            cells: Mutex::new(HashMap::default()),
            clock,
        }
    }

    /// Return the cached value for `key`, computing and storing it on a
    /// miss. A failing supplier leaves the cache unpopulated: the error
    /// propagates and the next caller recomputes, so a failure can never
    /// poison the key.
    pub fn get_or_compute<F>(&self, key: &str, supplier: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Result<V>,
    {
        let cell = {
            let mut cells = lock(&self.cells)?;
            cells
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(CacheCell::new()))
                .clone()
            // the map lock drops here; only the per-key cell stays held
        };
        let mut slot = lock(&cell.slot)?;
        if let Some(stored) = slot.as_ref() {
            return Ok(Arc::clone(&stored.value));
        }
        let value = Arc::new(supplier()?);
        *slot = Some(StoredValue {
            value: Arc::clone(&value),
            created_ms: self.clock.now_millis(),
        });
        Ok(value)
    }

    /// The cached value without computing, if present.
    pub fn get(&self, key: &str) -> Result<Option<Arc<V>>> {
        let cell = match lock(&self.cells)?.get(key) {
            Some(cell) => Arc::clone(cell),
            None => return Ok(None),
        };
        let slot = lock(&cell.slot)?;
        Ok(slot.as_ref().map(|stored| Arc::clone(&stored.value)))
    }

    /// Creation timestamp of the cached value, if present.
    pub fn created_ms(&self, key: &str) -> Result<Option<i64>> {
        let cell = match lock(&self.cells)?.get(key) {
            Some(cell) => Arc::clone(cell),
            None => return Ok(None),
        };
        let slot = lock(&cell.slot)?;
        Ok(slot.as_ref().map(|stored| stored.created_ms))
    }

    pub fn invalidate(&self, key: &str) -> Result<()> {
        lock(&self.cells)?.remove(key);
        Ok(())
    }

    pub fn invalidate_entity(&self, kind: &str, entity_id: &str) -> Result<()> {
        self.invalidate(&response_key_for(kind, entity_id))
    }

    /// Remove every key starting with any of the given prefixes.
    pub fn invalidate_matching(&self, prefixes: &[&str]) -> Result<()> {
        lock(&self.cells)?
            .retain(|key, _| !prefixes.iter().any(|prefix| key.starts_with(prefix)));
        Ok(())
    }

    pub fn invalidate_all(&self) -> Result<()> {
        lock(&self.cells)?.clear();
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(lock(&self.cells)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(lock(&self.cells)?.is_empty())
    }
}

// ------------- Inspection cache -------------

struct Pinned<V> {
    value: Arc<V>,
    expires_ms: i64,
}

/// Per-entity aggregate snapshots pinned for a fixed lifetime from
/// insertion. Expiry is lazy on read plus a periodic [`sweep`], and an
/// expired entry is never returned; each entry expires on its own
/// schedule, independent of the others.
///
/// [`sweep`]: InspectionCache::sweep
pub struct InspectionCache<V> {
    entries: Mutex<HashMap<String, Pinned<V>, CacheHasher>>,
    lifetime_ms: i64,
    clock: Arc<dyn Clock>,
}

impl<V> InspectionCache<V> {
    pub fn new(lifetime_ms: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::default()),
            lifetime_ms,
            clock,
        }
    }

    pub fn insert(&self, entity_id: &str, value: V) -> Result<()> {
        let pinned = Pinned {
            value: Arc::new(value),
            expires_ms: self.clock.now_millis() + self.lifetime_ms,
        };
        lock(&self.entries)?.insert(entity_id.to_owned(), pinned);
        Ok(())
    }

    pub fn get(&self, entity_id: &str) -> Result<Option<Arc<V>>> {
        let now = self.clock.now_millis();
        let mut entries = lock(&self.entries)?;
        match entries.get(entity_id) {
            Some(pinned) if pinned.expires_ms > now => Ok(Some(Arc::clone(&pinned.value))),
            Some(_) => {
                entries.remove(entity_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn sweep(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        let mut entries = lock(&self.entries)?;
        let before = entries.len();
        entries.retain(|_, pinned| pinned.expires_ms > now);
        Ok(before - entries.len())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(lock(&self.entries)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(lock(&self.entries)?.is_empty())
    }
}

// ------------- Write-back session cache -------------

#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub server_uuid: String,
    pub start_ms: i64,
    pub afk_ms: i64,
    pub ended_ms: Option<i64>,
    pub last_seen_ms: i64,
    dirty: bool,
    // bumped on every mutation so a flush acknowledgement cannot clean
    // state mutated after the snapshot was taken
    generation: u64,
}

/// Handle to a flushed snapshot entry, handed back through
/// [`SessionCache::mark_flushed`] once the flush commits. The generation
/// lets the acknowledgement skip entries mutated after the snapshot.
#[derive(Debug, Clone)]
pub struct FlushKey {
    pub player_uuid: String,
    pub generation: u64,
}

/// In-memory accumulator of session mutations for active players, keyed by
/// player UUID. A periodic flush writes all dirty state to storage in one
/// unit of work; ended sessions leave memory once their flush commits, and
/// [`evict_idle`] bounds growth from entries nobody ended.
///
/// [`evict_idle`]: SessionCache::evict_idle
pub struct SessionCache {
    entries: Mutex<HashMap<String, ActiveSession, CacheHasher>>,
    clock: Arc<dyn Clock>,
}

impl SessionCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::default()),
            clock,
        }
    }

    /// Begin accumulating a session for a player. Replaces any session the
    /// player already had; the replaced state is lost, matching a server
    /// that never observed the quit.
    pub fn start_session(&self, player_uuid: &str, server_uuid: &str) -> Result<()> {
        let now = self.clock.now_millis();
        let mut entries = lock(&self.entries)?;
        // the generation must advance past the replaced entry's, or a
        // flush snapshotted before the replacement would acknowledge the
        // new session as flushed
        let generation = entries
            .get(player_uuid)
            .map(|prior| prior.generation + 1)
            .unwrap_or(0);
        entries.insert(
            player_uuid.to_owned(),
            ActiveSession {
                server_uuid: server_uuid.to_owned(),
                start_ms: now,
                afk_ms: 0,
                ended_ms: None,
                last_seen_ms: now,
                dirty: true,
                generation,
            },
        );
        Ok(())
    }

    /// Record player activity without changing session state.
    pub fn touch(&self, player_uuid: &str) -> Result<()> {
        let now = self.clock.now_millis();
        if let Some(session) = lock(&self.entries)?.get_mut(player_uuid) {
            session.last_seen_ms = now;
        }
        Ok(())
    }

    pub fn add_afk(&self, player_uuid: &str, afk_ms: i64) -> Result<()> {
        let now = self.clock.now_millis();
        if let Some(session) = lock(&self.entries)?.get_mut(player_uuid) {
            session.afk_ms += afk_ms;
            session.last_seen_ms = now;
            session.dirty = true;
            session.generation += 1;
        }
        Ok(())
    }

    pub fn end_session(&self, player_uuid: &str) -> Result<()> {
        let now = self.clock.now_millis();
        if let Some(session) = lock(&self.entries)?.get_mut(player_uuid) {
            session.ended_ms = Some(now);
            session.last_seen_ms = now;
            session.dirty = true;
            session.generation += 1;
        }
        Ok(())
    }

    pub fn get(&self, player_uuid: &str) -> Result<Option<ActiveSession>> {
        Ok(lock(&self.entries)?.get(player_uuid).cloned())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(lock(&self.entries)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(lock(&self.entries)?.is_empty())
    }

    /// Snapshot all dirty sessions into one upsert unit of work. The lock
    /// is released before the caller executes the transaction; on success
    /// the caller hands the keys back through [`mark_flushed`].
    ///
    /// [`mark_flushed`]: SessionCache::mark_flushed
    pub fn flush_transaction(&self) -> Result<Option<(Transaction, Vec<FlushKey>)>> {
        let snapshot: Vec<(String, ActiveSession)> = lock(&self.entries)?
            .iter()
            .filter(|(_, session)| session.dirty)
            .map(|(uuid, session)| (uuid.clone(), session.clone()))
            .collect();
        if snapshot.is_empty() {
            return Ok(None);
        }
        let mut unit = Transaction::new("session_flush");
        let mut keys = Vec::with_capacity(snapshot.len());
        for (player_uuid, session) in snapshot {
            unit = unit
                .mutate(
                    Executable::new(format!(
                        "DELETE FROM {table} WHERE {user} = \
                         (SELECT {uid} FROM {utable} WHERE {uuuid} = ?1) \
                         AND {start} = ?2",
                        table = sessions::TABLE,
                        user = sessions::USER_ID,
                        uid = users::ID,
                        utable = users::TABLE,
                        uuuid = users::UUID,
                        start = sessions::START_MS
                    ))
                    .bind(player_uuid.clone())
                    .bind(session.start_ms),
                )
                .mutate(
                    Executable::new(format!(
                        "INSERT INTO {table} ({user}, {server}, {start}, {end}, {afk}) VALUES (\
                         (SELECT {uid} FROM {utable} WHERE {uuuid} = ?1), \
                         (SELECT {sid} FROM {stable} WHERE {suuid} = ?2), \
                         ?3, ?4, ?5)",
                        table = sessions::TABLE,
                        user = sessions::USER_ID,
                        server = sessions::SERVER_ID,
                        start = sessions::START_MS,
                        end = sessions::END_MS,
                        afk = sessions::AFK_MS,
                        uid = users::ID,
                        utable = users::TABLE,
                        uuuid = users::UUID,
                        sid = servers::ID,
                        stable = servers::TABLE,
                        suuid = servers::UUID
                    ))
                    .bind(player_uuid.clone())
                    .bind(session.server_uuid.clone())
                    .bind(session.start_ms)
                    .bind(session.ended_ms)
                    .bind(session.afk_ms),
                );
            keys.push(FlushKey {
                player_uuid,
                generation: session.generation,
            });
        }
        Ok(Some((unit, keys)))
    }

    /// Acknowledge a committed flush: flushed entries are clean again and
    /// ended sessions leave memory. Entries mutated since the snapshot
    /// stay dirty for the next cycle.
    pub fn mark_flushed(&self, keys: &[FlushKey]) -> Result<()> {
        let mut entries = lock(&self.entries)?;
        for key in keys {
            let remove = match entries.get_mut(&key.player_uuid) {
                Some(session) if session.generation == key.generation => {
                    session.dirty = false;
                    session.ended_ms.is_some()
                }
                _ => false,
            };
            if remove {
                entries.remove(&key.player_uuid);
            }
        }
        Ok(())
    }

    /// Drop clean entries idle beyond the threshold, bounding memory over
    /// long uptimes. Dirty entries survive until flushed.
    pub fn evict_idle(&self, idle_threshold_ms: i64) -> Result<usize> {
        let now = self.clock.now_millis();
        let mut entries = lock(&self.entries)?;
        let before = entries.len();
        entries.retain(|_, session| {
            session.dirty || now - session.last_seen_ms < idle_threshold_ms
        });
        Ok(before - entries.len())
    }
}
