//! Process-wide LRU of successful runs, keyed by question fingerprint.

use crate::pipeline::chart::ChartSpec;
use crate::pipeline::executor::TabularResult;
use crate::pipeline::generator::CandidateSql;
use crate::schema::SchemaVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Whether answers are shared between conversations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheScope {
    #[default]
    Global,
    Conversation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn new(question: &str, version: SchemaVersion, conversation: Option<&str>) -> Self {
        let mut hasher = DefaultHasher::new();
        normalize_question(question).hash(&mut hasher);
        version.hash(&mut hasher);
        conversation.hash(&mut hasher);
        Fingerprint(hasher.finish())
    }
}

/// Lower-cases and collapses whitespace.
pub fn normalize_question(question: &str) -> String {
    question.split_whitespace().map(str::to_lowercase).collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub candidate: CandidateSql,
    pub result: TabularResult,
    pub chart: ChartSpec,
    /// One-line summary, when summaries are enabled
    pub answer: Option<String>,
    pub schema_version: SchemaVersion,
    pub created_at: DateTime<Utc>,
}

/// Statistics about cache performance
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub evictions: usize,
    pub invalidations: usize,
    pub size: usize,
    pub capacity: usize,
    pub hit_rate: f64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Fingerprint, CacheEntry>,
    // Front is least recently used
    recency: VecDeque<Fingerprint>,
    version: Option<SchemaVersion>,
    generation: u64,
}

impl Inner {
    fn touch(&mut self, fingerprint: Fingerprint) {
        if let Some(pos) = self.recency.iter().position(|f| *f == fingerprint) {
            self.recency.remove(pos);
        }
        self.recency.push_back(fingerprint);
    }
}

pub struct QueryCache {
    inner: Mutex<Inner>,
    capacity: usize,
    scope: CacheScope,
    hits: AtomicUsize,
    misses: AtomicUsize,
    evictions: AtomicUsize,
    invalidations: AtomicUsize,
}

impl QueryCache {
    pub fn new(capacity: usize, scope: CacheScope) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            scope,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            evictions: AtomicUsize::new(0),
            invalidations: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fingerprint for a question under this cache's scope. The conversation id only
    /// takes part when answers are kept per conversation.
    pub fn fingerprint(&self, question: &str, version: SchemaVersion, conversation: Option<&str>) -> Fingerprint {
        let conversation = match self.scope {
            CacheScope::Global => None,
            CacheScope::Conversation => conversation,
        };
        Fingerprint::new(question, version, conversation)
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let mut inner = self.lock();
        match inner.entries.get(fingerprint).cloned() {
            Some(entry) => {
                inner.touch(*fingerprint);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores or replaces an entry. Returns false when the entry was built against a
    /// schema version the cache has already moved past.
    pub fn put(&self, fingerprint: Fingerprint, entry: CacheEntry) -> bool {
        let mut inner = self.lock();
        match inner.version {
            Some(current) if current != entry.schema_version => {
                debug!(
                    "Discarding cache entry for schema {} (current is {})",
                    entry.schema_version, current
                );
                return false;
            }
            Some(_) => {}
            None => inner.version = Some(entry.schema_version),
        }

        inner.entries.insert(fingerprint, entry);
        inner.touch(fingerprint);

        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.recency.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// Records the schema version queries are about to run against, dropping every
    /// entry if it differs from the one the cache holds. Returns true if entries were dropped.
    ///
    /// The cache only moves forward: a snapshot from an older generation than the one
    /// already seen is ignored, and entries built on it are refused by `put`.
    pub fn observe_schema(&self, version: SchemaVersion, generation: u64) -> bool {
        let mut inner = self.lock();
        if generation < inner.generation {
            debug!(
                "Ignoring schema {} from generation {} (current is {})",
                version, generation, inner.generation
            );
            return false;
        }
        inner.generation = generation;
        match inner.version {
            Some(current) if current == version => false,
            Some(_) => {
                Self::clear_locked(&mut inner, version);
                self.invalidations.fetch_add(1, Ordering::Relaxed);
                info!("Schema changed to {}; query cache invalidated", version);
                true
            }
            None => {
                inner.version = Some(version);
                false
            }
        }
    }

    /// Drops every entry and pins the cache to `version`, unless a later generation
    /// has already been seen.
    pub fn invalidate(&self, version: SchemaVersion, generation: u64) {
        let mut inner = self.lock();
        if generation < inner.generation {
            return;
        }
        inner.generation = generation;
        Self::clear_locked(&mut inner, version);
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        info!("Query cache invalidated for schema {}", version);
    }

    fn clear_locked(inner: &mut Inner, version: SchemaVersion) {
        inner.entries.clear();
        inner.recency.clear();
        inner.version = Some(version);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let size = self.len();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 { hits as f64 / total as f64 } else { 0.0 };

        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            size,
            capacity: self.capacity,
            hit_rate,
        }
    }
}
