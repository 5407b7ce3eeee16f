//! Durable, subscribable key-value map.
//!
//! The in-memory map is authoritative. The backing file is a debounced
//! projection of it: writes land in memory and notify subscribers at once,
//! and a flush scheduled one debounce window after the first unflushed
//! write serializes the whole map with an atomic replace.
//!
//! Other processes may rewrite the file. Once the file exists it is watched;
//! a change that is not our own write is reloaded and diffed against the
//! last snapshot we persisted or loaded, and only keys whose value differs
//! are applied and announced. Our own writes are recognized twice over: the
//! loopback flag is raised for the duration of the synchronous flush, and
//! the digest of the bytes last written is compared on reload, which also
//! catches notifications that arrive after the flag dropped.

use crate::config::{StoreConfig, StoreFormat};
use crate::error::StoreError;
use crate::watch::{FileWatch, SETTLE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub data: Value,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
}

impl Entry {
    fn new(data: Value) -> Self {
        Self {
            data,
            expires: None,
        }
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires.is_some_and(|at| at <= now_ms)
    }
}

const MIN_RETRY_DELAY: Duration = Duration::from_millis(10);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

type Snapshot = HashMap<String, Entry>;
type KeyCallback = Arc<dyn Fn(Option<&Value>) + Send + Sync>;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn digest(bytes: &[u8]) -> Vec<u8> {
    Sha256::digest(bytes).to_vec()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn parse_snapshot(bytes: &[u8], format: StoreFormat) -> Result<Snapshot, serde_json::Error> {
    match format {
        StoreFormat::Raw => {
            let raw: HashMap<String, Value> = serde_json::from_slice(bytes)?;
            Ok(raw
                .into_iter()
                .map(|(key, data)| (key, Entry::new(data)))
                .collect())
        }
        StoreFormat::Expiring => serde_json::from_slice(bytes),
    }
}

fn encode_snapshot(snapshot: &Snapshot, format: StoreFormat) -> Result<Vec<u8>, serde_json::Error> {
    let ordered = snapshot
        .iter()
        .map(|(key, entry)| {
            let value = match format {
                StoreFormat::Raw => Ok(entry.data.clone()),
                StoreFormat::Expiring => serde_json::to_value(entry),
            };
            value.map(|value| (key.as_str(), value))
        })
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    let mut bytes = serde_json::to_vec_pretty(&ordered)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Delay before retry number `attempt` of a failed flush.
fn retry_delay(debounce: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    debounce
        .max(MIN_RETRY_DELAY)
        .saturating_mul(factor)
        .min(MAX_RETRY_DELAY)
}

fn write_atomic(path: &Path, payload: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| StoreError::io(parent, err))?;
    }

    let temp_path = match path.file_name() {
        Some(name) => path.with_file_name(format!("{}.tmp", name.to_string_lossy())),
        None => path.with_extension("tmp"),
    };

    fs::write(&temp_path, payload).map_err(|err| StoreError::io(&temp_path, err))?;
    fs::rename(&temp_path, path).map_err(|err| StoreError::io(path, err))?;
    Ok(())
}

enum Loaded {
    Missing,
    Parsed { snapshot: Snapshot, digest: Vec<u8> },
    Malformed(String),
    Unreadable(String),
}

fn load(path: &Path, format: StoreFormat) -> Loaded {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Loaded::Missing,
        Err(err) => return Loaded::Unreadable(err.to_string()),
    };
    match parse_snapshot(&bytes, format) {
        Ok(snapshot) => Loaded::Parsed {
            snapshot,
            digest: digest(&bytes),
        },
        Err(err) => Loaded::Malformed(err.to_string()),
    }
}

/// Tells our own file writes apart from everyone else's.
#[derive(Default)]
struct Loopback {
    writing: AtomicBool,
    last_digest: Mutex<Option<Vec<u8>>>,
}

impl Loopback {
    fn is_writing(&self) -> bool {
        self.writing.load(Ordering::SeqCst)
    }

    fn is_own(&self, digest: Option<&[u8]>) -> bool {
        digest.is_some() && lock(&self.last_digest).as_deref() == digest
    }

    fn remember(&self, digest: Option<Vec<u8>>) {
        *lock(&self.last_digest) = digest;
    }
}

#[derive(Default)]
struct State {
    entries: Snapshot,
    /// What the file held after our last flush or reload.
    persisted: Snapshot,
    dirty: bool,
    flush_scheduled: bool,
    closed: bool,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    by_key: HashMap<String, Vec<(u64, KeyCallback)>>,
}

pub struct KvStore {
    me: Weak<KvStore>,
    config: StoreConfig,
    runtime: Handle,
    state: Mutex<State>,
    subscribers: Mutex<Subscribers>,
    flush_lock: Mutex<()>,
    loopback: Arc<Loopback>,
    watch: Mutex<Option<FileWatch>>,
}

impl KvStore {
    /// Opens the store at `config.path`. Never fails: a missing, unreadable
    /// or malformed file yields an empty store.
    pub async fn open(config: StoreConfig) -> Arc<Self> {
        let path = config.path.clone();
        let format = config.format;
        let loaded = tokio::task::spawn_blocking(move || load(&path, format))
            .await
            .unwrap_or_else(|err| Loaded::Unreadable(err.to_string()));

        let store = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            runtime: Handle::current(),
            state: Mutex::new(State::default()),
            subscribers: Mutex::new(Subscribers::default()),
            flush_lock: Mutex::new(()),
            loopback: Arc::new(Loopback::default()),
            watch: Mutex::new(None),
        });
        store.install(loaded);
        store.arm_watch();
        store
    }

    fn install(&self, loaded: Loaded) {
        let path = self.config.path.display().to_string();
        let mut state = self.state();
        match loaded {
            Loaded::Missing => {
                debug!(event = "store_file_missing", prefix = %self.config.prefix, path = %path);
            }
            Loaded::Parsed { snapshot, digest } => {
                let now = now_ms();
                let mut entries = snapshot.clone();
                entries.retain(|_, entry| !entry.is_expired(now));
                let swept = snapshot.len() - entries.len();
                info!(
                    event = "store_loaded",
                    prefix = %self.config.prefix,
                    entries = entries.len(),
                    expired = swept
                );
                state.entries = entries;
                state.persisted = snapshot;
                self.loopback.remember(Some(digest));
                if swept > 0 {
                    self.schedule_flush(&mut state);
                }
            }
            Loaded::Malformed(err) => {
                warn!(
                    event = "store_file_malformed",
                    prefix = %self.config.prefix,
                    path = %path,
                    error = %err
                );
                self.schedule_flush(&mut state);
            }
            Loaded::Unreadable(err) => {
                warn!(
                    event = "store_file_unreadable",
                    prefix = %self.config.prefix,
                    path = %path,
                    error = %err
                );
            }
        }
    }

    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Current value of `key`. An expired entry is removed and reported as
    /// absent.
    pub fn read(&self, key: &str) -> Option<Value> {
        let mut state = self.state();
        match state.entries.get(key) {
            None => return None,
            Some(entry) if !entry.is_expired(now_ms()) => return Some(entry.data.clone()),
            Some(_) => {}
        }
        state.entries.remove(key);
        self.schedule_flush(&mut state);
        drop(state);
        debug!(event = "store_entry_expired", prefix = %self.config.prefix, key);
        self.notify(key, None);
        None
    }

    /// Current value of `key` without expiring it or notifying anyone.
    pub(crate) fn peek(&self, key: &str) -> Option<Value> {
        let now = now_ms();
        self.state()
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.data.clone())
    }

    pub fn write(&self, key: &str, value: Value) {
        self.put(key, Entry::new(value));
    }

    /// Writes `value` so that it reads as absent once `ttl` has elapsed.
    pub fn write_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> Result<(), StoreError> {
        if self.config.format != StoreFormat::Expiring {
            return Err(StoreError::TtlUnsupported(self.config.prefix.clone()));
        }
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.put(
            key,
            Entry {
                data: value,
                expires: Some(now_ms().saturating_add(ttl_ms)),
            },
        );
        Ok(())
    }

    fn put(&self, key: &str, entry: Entry) {
        let value = entry.data.clone();
        {
            let mut state = self.state();
            state.entries.insert(key.to_string(), entry);
            self.schedule_flush(&mut state);
        }
        self.notify(key, Some(&value));
    }

    /// Removes `key`; returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        let existed = {
            let mut state = self.state();
            let existed = state.entries.remove(key).is_some();
            if existed {
                self.schedule_flush(&mut state);
            }
            existed
        };
        if existed {
            self.notify(key, None);
        }
        existed
    }

    pub fn keys(&self) -> Vec<String> {
        let now = now_ms();
        let mut keys = self
            .state()
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// Calls `on_change` with the new value (or `None` once removed) every
    /// time `key` changes, until the returned handle is stopped or dropped.
    pub fn subscribe<F>(&self, key: &str, on_change: F) -> KeySubscription
    where
        F: Fn(Option<&Value>) + Send + Sync + 'static,
    {
        let mut subscribers = lock(&self.subscribers);
        subscribers.next_id += 1;
        let id = subscribers.next_id;
        subscribers
            .by_key
            .entry(key.to_string())
            .or_default()
            .push((id, Arc::new(on_change)));
        KeySubscription {
            store: self.me.clone(),
            key: key.to_string(),
            id,
            stopped: AtomicBool::new(false),
        }
    }

    fn unsubscribe(&self, key: &str, id: u64) {
        let mut subscribers = lock(&self.subscribers);
        if let Some(callbacks) = subscribers.by_key.get_mut(key) {
            callbacks.retain(|(callback_id, _)| *callback_id != id);
            if callbacks.is_empty() {
                subscribers.by_key.remove(key);
            }
        }
    }

    fn notify(&self, key: &str, value: Option<&Value>) {
        let callbacks = lock(&self.subscribers)
            .by_key
            .get(key)
            .map(|callbacks| {
                callbacks
                    .iter()
                    .map(|(_, callback)| Arc::clone(callback))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        for callback in callbacks {
            callback(value);
        }
    }

    fn schedule_flush(&self, state: &mut State) {
        state.dirty = true;
        self.spawn_flush(state, self.config.flush_debounce, 0);
    }

    /// Runs a flush after `delay`. A failed flush is retried with a growing
    /// delay for as long as changes stay pending.
    fn spawn_flush(&self, state: &mut State, delay: Duration, attempt: u32) {
        if state.flush_scheduled || state.closed {
            return;
        }
        state.flush_scheduled = true;
        let me = self.me.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(store) = me.upgrade() else {
                return;
            };
            store.state().flush_scheduled = false;
            let prefix = store.config.prefix.clone();
            let flusher = Arc::clone(&store);
            let failed = match tokio::task::spawn_blocking(move || flusher.flush()).await {
                Ok(Ok(())) => false,
                Ok(Err(err)) => {
                    warn!(
                        event = "store_flush_failed",
                        prefix = %prefix,
                        attempt,
                        error = %err
                    );
                    true
                }
                Err(err) => {
                    warn!(event = "store_flush_aborted", prefix = %prefix, error = %err);
                    true
                }
            };
            if failed {
                let mut state = store.state();
                if state.dirty {
                    let retry = retry_delay(store.config.flush_debounce, attempt + 1);
                    store.spawn_flush(&mut state, retry, attempt + 1);
                }
            }
        });
    }

    /// Writes pending changes now. A no-op when nothing changed since the
    /// last flush.
    pub fn flush(&self) -> Result<(), StoreError> {
        let flushing = lock(&self.flush_lock);
        let snapshot = {
            let mut state = self.state();
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            state.entries.clone()
        };
        let bytes = match encode_snapshot(&snapshot, self.config.format) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.state().dirty = true;
                return Err(err.into());
            }
        };

        self.loopback.remember(Some(digest(&bytes)));
        self.loopback.writing.store(true, Ordering::SeqCst);
        let written = write_atomic(&self.config.path, &bytes);
        self.loopback.writing.store(false, Ordering::SeqCst);

        match written {
            Ok(()) => {
                self.state().persisted = snapshot;
                debug!(
                    event = "store_flushed",
                    prefix = %self.config.prefix,
                    bytes = bytes.len()
                );
                drop(flushing);
                self.arm_watch();
                Ok(())
            }
            Err(err) => {
                self.state().dirty = true;
                Err(err)
            }
        }
    }

    fn arm_watch(&self) {
        if !self.config.watch_external || !self.config.path.exists() {
            return;
        }
        let mut watch = lock(&self.watch);
        if watch.is_some() || self.state().closed {
            return;
        }
        let loopback = Arc::clone(&self.loopback);
        let me = self.me.clone();
        match FileWatch::spawn(
            &self.config.path,
            &self.runtime,
            SETTLE,
            move || loopback.is_writing(),
            move || {
                if let Some(store) = me.upgrade() {
                    store.reload_external();
                }
            },
        ) {
            Ok(armed) => {
                debug!(event = "store_watch_armed", prefix = %self.config.prefix);
                *watch = Some(armed);
            }
            Err(err) => {
                warn!(event = "store_watch_failed", prefix = %self.config.prefix, error = %err);
            }
        }
    }

    /// Applies an external rewrite of the backing file.
    fn reload_external(&self) {
        let changed = {
            let _flushing = lock(&self.flush_lock);
            let bytes = match fs::read(&self.config.path) {
                Ok(bytes) => Some(bytes),
                Err(err) if err.kind() == ErrorKind::NotFound => None,
                Err(err) => {
                    warn!(event = "store_reload_failed", prefix = %self.config.prefix, error = %err);
                    return;
                }
            };
            let file_digest = bytes.as_deref().map(digest);
            if self.loopback.is_own(file_digest.as_deref()) {
                debug!(event = "store_loopback_ignored", prefix = %self.config.prefix);
                return;
            }
            let external = match bytes.as_deref().map(|bytes| parse_snapshot(bytes, self.config.format)) {
                None => Snapshot::new(),
                Some(Ok(snapshot)) => snapshot,
                Some(Err(err)) => {
                    warn!(
                        event = "store_external_malformed",
                        prefix = %self.config.prefix,
                        error = %err
                    );
                    return;
                }
            };
            self.loopback.remember(file_digest);
            self.apply_external(external)
        };

        if !changed.is_empty() {
            info!(
                event = "store_external_change",
                prefix = %self.config.prefix,
                keys = changed.len()
            );
        }
        for (key, value) in changed {
            self.notify(&key, value.as_ref());
        }
    }

    /// Merges keys that differ between the last persisted snapshot and
    /// `external` into memory. Returns the keys whose in-memory value moved.
    fn apply_external(&self, external: Snapshot) -> Vec<(String, Option<Value>)> {
        let mut state = self.state();
        let keys = state
            .persisted
            .keys()
            .chain(external.keys())
            .cloned()
            .collect::<HashSet<_>>();
        let mut changed = Vec::new();
        for key in keys {
            let incoming = external.get(&key);
            if state.persisted.get(&key) == incoming {
                continue;
            }
            let before = state.entries.get(&key).map(|entry| entry.data.clone());
            match incoming {
                Some(entry) => {
                    state.entries.insert(key.clone(), entry.clone());
                }
                None => {
                    state.entries.remove(&key);
                }
            }
            let after = state.entries.get(&key).map(|entry| entry.data.clone());
            if before != after {
                changed.push((key, after));
            }
        }
        state.persisted = external;
        changed.sort_by(|a, b| a.0.cmp(&b.0));
        changed
    }

    /// Flushes pending changes and stops watching the file.
    pub fn close(&self) -> Result<(), StoreError> {
        self.state().closed = true;
        lock(&self.watch).take();
        self.flush()
    }
}

impl Drop for KvStore {
    fn drop(&mut self) {
        self.state().closed = true;
        if let Err(err) = self.flush() {
            warn!(event = "store_final_flush_failed", prefix = %self.config.prefix, error = %err);
        }
    }
}

/// Handle returned by [`KvStore::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping a KeySubscription unsubscribes"]
pub struct KeySubscription {
    store: Weak<KvStore>,
    key: String,
    id: u64,
    stopped: AtomicBool,
}

impl KeySubscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(store) = self.store.upgrade() {
            store.unsubscribe(&self.key, self.id);
        }
    }
}

impl Drop for KeySubscription {
    fn drop(&mut self) {
        self.stop();
    }
}
