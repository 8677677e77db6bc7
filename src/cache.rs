//! Shared response cache.
//!
//! Entries live in memory behind a single lock and are handed out as
//! `Arc<CacheEntry>`, so a reader always sees a whole entry even while another
//! connection replaces it. When a disk directory is configured every stored
//! entry is also written there as JSON and reloaded on startup.

use crate::config::CacheConfig;
use crate::error::ProxyError;
use crate::request::ParsedRequest;
use crate::response::ResponseHead;
use base64::{Engine as _, engine::general_purpose};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl CacheKey {
    /// CONNECT tunnels carry opaque bytes and are never keyed.
    pub fn from_request(request: &ParsedRequest) -> Option<Self> {
        if request.method.is_connect() {
            return None;
        }
        Some(Self {
            method: request.method.as_str().to_string(),
            host: request.host.to_ascii_lowercase(),
            port: request.port,
            path: request.path.clone(),
        })
    }

    /// Disk file name: a blake3 digest of the length-prefixed key fields, stable across builds.
    fn file_name(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for field in [
            self.method.as_bytes(),
            self.host.as_bytes(),
            &self.port.to_be_bytes()[..],
            self.path.as_bytes(),
        ] {
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        format!("{}.json", hasher.finalize().to_hex())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}{}", self.method, self.host, self.port, self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// Upstream head as received; replayed verbatim on a hit.
    pub head: ResponseHead,
    pub body: Bytes,
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn status(&self) -> u16 {
        self.head.status
    }

    /// The stored response in wire form, byte-identical to what upstream sent.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.head.raw.len() + self.body.len());
        out.extend_from_slice(&self.head.raw);
        out.extend_from_slice(&self.body);
        out.freeze()
    }

    fn is_expired(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        match ttl {
            Some(ttl) => (now - self.stored_at).to_std().is_ok_and(|age| age >= ttl),
            None => false,
        }
    }
}

/// Status 200 without `no-cache`/`private` in Cache-Control or `no-cache` in Pragma.
pub fn is_cacheable(head: &ResponseHead) -> bool {
    head.status == 200
        && !head.has_directive("Cache-Control", "no-cache")
        && !head.has_directive("Cache-Control", "private")
        && !head.has_directive("Pragma", "no-cache")
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    key: CacheKey,
    /// base64 of the raw response head
    head: String,
    /// base64 of the body
    body: String,
    stored_at: DateTime<Utc>,
}

impl From<&CacheEntry> for PersistedEntry {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            key: entry.key.clone(),
            head: general_purpose::STANDARD.encode(&entry.head.raw),
            body: general_purpose::STANDARD.encode(&entry.body),
            stored_at: entry.stored_at,
        }
    }
}

impl TryFrom<PersistedEntry> for CacheEntry {
    type Error = ProxyError;

    fn try_from(persisted: PersistedEntry) -> Result<Self, Self::Error> {
        let decode = |field: &str, value: &str| {
            general_purpose::STANDARD
                .decode(value.as_bytes())
                .map_err(|e| ProxyError::Config(format!("Invalid cached {} encoding: {}", field, e)))
        };
        let raw_head = decode("head", &persisted.head)?;
        let body = decode("body", &persisted.body)?;
        let (head, end) = ResponseHead::parse(&raw_head)?;
        if end != raw_head.len() {
            return Err(ProxyError::Config("Cached head has trailing bytes".to_string()));
        }
        Ok(Self {
            key: persisted.key,
            head,
            body: Bytes::from(body),
            stored_at: persisted.stored_at,
        })
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<CacheKey, (u64, Arc<CacheEntry>)>,
    // insertion sequence -> key, oldest first
    order: BTreeMap<u64, CacheKey>,
    next_seq: u64,
}

impl CacheInner {
    /// Inserts `entry`, returning its sequence number and the keys evicted to make room.
    fn insert(&mut self, entry: Arc<CacheEntry>, max_entries: Option<usize>) -> (u64, Vec<CacheKey>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let key = entry.key.clone();
        if let Some((old_seq, _)) = self.entries.insert(key.clone(), (seq, entry)) {
            self.order.remove(&old_seq);
        }
        self.order.insert(seq, key);

        let mut evicted = Vec::new();
        if let Some(max) = max_entries {
            while self.entries.len() > max {
                let Some((_, oldest)) = self.order.pop_first() else { break };
                self.entries.remove(&oldest);
                evicted.push(oldest);
            }
        }
        (seq, evicted)
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some((seq, _)) = self.entries.remove(key) {
            self.order.remove(&seq);
        }
    }

    fn seq_of(&self, key: &CacheKey) -> Option<u64> {
        self.entries.get(key).map(|(seq, _)| *seq)
    }
}

pub struct ResponseCache {
    inner: RwLock<CacheInner>,
    // held across every disk write and delete so the mirror follows memory order
    disk_lock: tokio::sync::Mutex<()>,
    enabled: bool,
    ttl: Option<Duration>,
    max_entries: Option<usize>,
    disk_dir: Option<PathBuf>,
}

impl ResponseCache {
    /// Builds the cache, reloading any entries persisted in `disk_dir`.
    pub fn new(config: &CacheConfig) -> Result<Self, ProxyError> {
        let cache = Self {
            inner: RwLock::new(CacheInner::default()),
            disk_lock: tokio::sync::Mutex::new(()),
            enabled: config.enabled,
            ttl: config.ttl_secs.map(Duration::from_secs),
            max_entries: config.max_entries,
            disk_dir: config.disk_dir.clone(),
        };

        if let (true, Some(dir)) = (cache.enabled, &cache.disk_dir) {
            std::fs::create_dir_all(dir)
                .map_err(|e| ProxyError::Config(format!("Failed to create cache directory {}: {}", dir.display(), e)))?;
            let loaded = cache.load_from_disk(dir)?;
            info!("Loaded {} cached responses from {}", loaded, dir.display());
        }

        Ok(cache)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        if !self.enabled {
            return None;
        }

        let entry = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            inner.entries.get(key).map(|(_, entry)| entry.clone())?
        };

        if entry.is_expired(self.ttl, Utc::now()) {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            // only drop it if nobody replaced it in between
            if inner.entries.get(key).is_some_and(|(_, current)| Arc::ptr_eq(current, &entry)) {
                inner.remove(key);
                debug!("Expired cache entry for {}", key);
            }
            return None;
        }

        Some(entry)
    }

    /// Stores the response if it is cache-eligible, replacing any prior entry for `key`.
    ///
    /// Returns whether the response was stored.
    pub async fn maybe_store(&self, key: CacheKey, head: &ResponseHead, body: Bytes) -> bool {
        if !self.enabled || !is_cacheable(head) {
            return false;
        }

        let entry = Arc::new(CacheEntry {
            key,
            head: head.clone(),
            body,
            stored_at: Utc::now(),
        });

        let (seq, evicted) = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.clone(), self.max_entries);
        debug!("Cached response for {} ({} body bytes)", entry.key, entry.body.len());

        if let Some(dir) = &self.disk_dir {
            self.persist(dir, seq, &entry, evicted).await;
        }

        true
    }

    fn seq_of(&self, key: &CacheKey) -> Option<u64> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).seq_of(key)
    }

    /// Mirrors one store to disk. A write is skipped once a newer store for
    /// the same key exists; that store writes the file itself.
    async fn persist(&self, dir: &Path, seq: u64, entry: &CacheEntry, evicted: Vec<CacheKey>) {
        let _guard = self.disk_lock.lock().await;

        if self.seq_of(&entry.key) == Some(seq) {
            if let Err(e) = write_entry(dir, seq, entry).await {
                warn!("Failed to persist cache entry for {}: {}", entry.key, e);
            }
        } else {
            debug!("Skipping superseded disk write for {}", entry.key);
        }

        for key in evicted {
            // re-stored since eviction: the file is current again
            if self.seq_of(&key).is_none() {
                let _ = tokio::fs::remove_file(dir.join(key.file_name())).await;
            }
        }
    }

    fn load_from_disk(&self, dir: &Path) -> Result<usize, ProxyError> {
        let now = Utc::now();
        let mut loaded: Vec<CacheEntry> = Vec::new();

        for dir_entry in std::fs::read_dir(dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match read_entry(&path) {
                Ok(entry) if is_cacheable(&entry.head) && !entry.is_expired(self.ttl, now) => {
                    loaded.push(entry)
                }
                Ok(entry) => {
                    debug!("Dropping ineligible cache file for {}", entry.key);
                    let _ = std::fs::remove_file(&path);
                }
                Err(e) => warn!("Skipping unreadable cache file {}: {}", path.display(), e),
            }
        }

        loaded.sort_by_key(|entry| entry.stored_at);
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        for entry in loaded {
            let (_, evicted) = inner.insert(Arc::new(entry), self.max_entries);
            for key in evicted {
                let _ = std::fs::remove_file(dir.join(key.file_name()));
            }
        }
        Ok(inner.entries.len())
    }
}

fn read_entry(path: &Path) -> Result<CacheEntry, ProxyError> {
    let content = std::fs::read_to_string(path)?;
    let persisted: PersistedEntry = serde_json::from_str(&content)?;
    CacheEntry::try_from(persisted)
}

async fn write_entry(dir: &Path, seq: u64, entry: &CacheEntry) -> Result<(), ProxyError> {
    let content = serde_json::to_vec(&PersistedEntry::from(entry))?;
    let path = dir.join(entry.key.file_name());
    let tmp = path.with_extension(format!("{}.tmp", seq));
    tokio::fs::write(&tmp, content).await?;
    if let Err(e) = tokio::fs::rename(&tmp, &path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestParser;

    fn key(path: &str) -> CacheKey {
        CacheKey {
            method: "GET".to_string(),
            host: "example.com".to_string(),
            port: 80,
            path: path.to_string(),
        }
    }

    fn head(raw: &str) -> ResponseHead {
        ResponseHead::parse(raw.as_bytes()).unwrap().0
    }

    fn memory_cache() -> ResponseCache {
        ResponseCache::new(&CacheConfig::default()).unwrap()
    }

    #[test]
    fn test_key_from_request() {
        let parser = RequestParser::new();
        let req = parser.parse(b"GET http://Example.COM/a.png?v=2 HTTP/1.1\r\n\r\n").unwrap();
        let key = CacheKey::from_request(&req).unwrap();
        assert_eq!(key.method, "GET");
        assert_eq!(key.host, "example.com");
        assert_eq!(key.port, 80);
        assert_eq!(key.path, "/a.png?v=2");

        let connect = parser.parse(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n").unwrap();
        assert!(CacheKey::from_request(&connect).is_none());
    }

    #[test]
    fn test_cacheability_rules() {
        assert!(is_cacheable(&head("HTTP/1.1 200 OK\r\n\r\n")));
        assert!(is_cacheable(&head("HTTP/1.1 200 OK\r\nCache-Control: public, max-age=60\r\n\r\n")));
        assert!(!is_cacheable(&head("HTTP/1.1 404 Not Found\r\n\r\n")));
        assert!(!is_cacheable(&head("HTTP/1.1 301 Moved Permanently\r\n\r\n")));
        assert!(!is_cacheable(&head("HTTP/1.1 200 OK\r\nCache-Control: no-cache\r\n\r\n")));
        assert!(!is_cacheable(&head("HTTP/1.1 200 OK\r\ncache-control: Private\r\n\r\n")));
        assert!(!is_cacheable(&head("HTTP/1.1 200 OK\r\nPRAGMA: NO-CACHE\r\n\r\n")));
    }

    #[tokio::test]
    async fn test_store_and_lookup_round_trip() {
        let cache = memory_cache();
        let head = head("HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: 4\r\n\r\n");
        assert!(cache.maybe_store(key("/a.png"), &head, Bytes::from_static(b"PNG!")).await);

        let entry = cache.lookup(&key("/a.png")).unwrap();
        assert_eq!(entry.status(), 200);
        assert_eq!(entry.head, head);
        assert_eq!(&entry.body[..], b"PNG!");
        assert_eq!(
            &entry.to_bytes()[..],
            b"HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: 4\r\n\r\nPNG!"
        );
        assert!(cache.lookup(&key("/b.png")).is_none());
    }

    #[tokio::test]
    async fn test_ineligible_responses_are_not_stored() {
        let cache = memory_cache();
        for raw in [
            "HTTP/1.1 404 Not Found\r\n\r\n",
            "HTTP/1.1 200 OK\r\nCache-Control: no-cache\r\n\r\n",
            "HTTP/1.1 200 OK\r\nCache-Control: private\r\n\r\n",
            "HTTP/1.1 200 OK\r\nPragma: no-cache\r\n\r\n",
        ] {
            assert!(!cache.maybe_store(key("/x"), &head(raw), Bytes::new()).await);
            assert!(cache.lookup(&key("/x")).is_none(), "stored {:?}", raw);
        }
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let cache = memory_cache();
        let ok = head("HTTP/1.1 200 OK\r\n\r\n");
        cache.maybe_store(key("/a"), &ok, Bytes::from_static(b"first")).await;
        cache.maybe_store(key("/a"), &ok, Bytes::from_static(b"second")).await;

        assert_eq!(cache.len(), 1);
        assert_eq!(&cache.lookup(&key("/a")).unwrap().body[..], b"second");
    }

    #[tokio::test]
    async fn test_ineligible_store_keeps_previous_entry() {
        let cache = memory_cache();
        cache.maybe_store(key("/a"), &head("HTTP/1.1 200 OK\r\n\r\n"), Bytes::from_static(b"good")).await;
        cache.maybe_store(key("/a"), &head("HTTP/1.1 500 Internal Server Error\r\n\r\n"), Bytes::new()).await;
        assert_eq!(&cache.lookup(&key("/a")).unwrap().body[..], b"good");
    }

    #[tokio::test]
    async fn test_oldest_entry_evicted_at_capacity() {
        let config = CacheConfig { max_entries: Some(2), ..CacheConfig::default() };
        let cache = ResponseCache::new(&config).unwrap();
        let ok = head("HTTP/1.1 200 OK\r\n\r\n");
        cache.maybe_store(key("/1"), &ok, Bytes::new()).await;
        cache.maybe_store(key("/2"), &ok, Bytes::new()).await;
        cache.maybe_store(key("/1"), &ok, Bytes::new()).await;
        cache.maybe_store(key("/3"), &ok, Bytes::new()).await;

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(&key("/2")).is_none());
        assert!(cache.lookup(&key("/1")).is_some());
        assert!(cache.lookup(&key("/3")).is_some());
    }

    #[tokio::test]
    async fn test_expired_entries_are_absent() {
        let config = CacheConfig { ttl_secs: Some(0), ..CacheConfig::default() };
        let cache = ResponseCache::new(&config).unwrap();
        cache.maybe_store(key("/a"), &head("HTTP/1.1 200 OK\r\n\r\n"), Bytes::new()).await;
        assert!(cache.lookup(&key("/a")).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_cache_stores_nothing() {
        let config = CacheConfig { enabled: false, ..CacheConfig::default() };
        let cache = ResponseCache::new(&config).unwrap();
        assert!(!cache.maybe_store(key("/a"), &head("HTTP/1.1 200 OK\r\n\r\n"), Bytes::new()).await);
        assert!(cache.lookup(&key("/a")).is_none());
    }

    #[tokio::test]
    async fn test_disk_entries_survive_restart() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = CacheConfig {
            disk_dir: Some(temp_dir.path().to_path_buf()),
            ..CacheConfig::default()
        };

        {
            let cache = ResponseCache::new(&config).unwrap();
            let ok = head("HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n");
            cache.maybe_store(key("/persisted"), &ok, Bytes::from_static(b"\x00binary\xff")).await;
        }

        std::fs::write(temp_dir.path().join("garbage.json"), "not json").unwrap();

        let reopened = ResponseCache::new(&config).unwrap();
        let entry = reopened.lookup(&key("/persisted")).unwrap();
        assert_eq!(&entry.body[..], b"\x00binary\xff");
        assert_eq!(entry.head.headers.len(), 1);
        assert_eq!(reopened.len(), 1);
    }

    #[tokio::test]
    async fn test_replay_is_byte_identical() {
        let cache = memory_cache();
        let raw = "HTTP/1.1 200 OK\r\nContent-Length:4\r\nX-Tag:  v\r\nodd line\r\n\r\n";
        cache.maybe_store(key("/odd"), &head(raw), Bytes::from_static(b"PNG!")).await;

        let mut expected = raw.as_bytes().to_vec();
        expected.extend_from_slice(b"PNG!");
        assert_eq!(&cache.lookup(&key("/odd")).unwrap().to_bytes()[..], &expected[..]);
    }

    #[tokio::test]
    async fn test_raw_head_survives_restart() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = CacheConfig {
            disk_dir: Some(temp_dir.path().to_path_buf()),
            ..CacheConfig::default()
        };
        let mut raw = b"HTTP/1.1 200 OK\r\nX-Bin: \xfe\xff\r\nContent-Length:2\r\n\r\n".to_vec();
        let (parsed, _) = ResponseHead::parse(&raw).unwrap();

        let first = {
            let cache = ResponseCache::new(&config).unwrap();
            cache.maybe_store(key("/bin"), &parsed, Bytes::from_static(b"ok")).await;
            cache.lookup(&key("/bin")).unwrap().to_bytes()
        };

        let reopened = ResponseCache::new(&config).unwrap();
        raw.extend_from_slice(b"ok");
        assert_eq!(first, raw);
        assert_eq!(reopened.lookup(&key("/bin")).unwrap().to_bytes(), first);
    }

    #[tokio::test]
    async fn test_reload_skips_ineligible_documents() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = CacheConfig {
            disk_dir: Some(temp_dir.path().to_path_buf()),
            ..CacheConfig::default()
        };

        // written by hand: maybe_store would refuse these heads
        for (path, raw) in [
            ("/no-cache", "HTTP/1.1 200 OK\r\nCache-Control: no-cache\r\n\r\n"),
            ("/private", "HTTP/1.1 200 OK\r\nCache-Control: max-age=5, private\r\n\r\n"),
            ("/pragma", "HTTP/1.1 200 OK\r\nPragma: no-cache\r\n\r\n"),
            ("/missing", "HTTP/1.1 404 Not Found\r\n\r\n"),
        ] {
            let entry = CacheEntry {
                key: key(path),
                head: head(raw),
                body: Bytes::new(),
                stored_at: Utc::now(),
            };
            write_entry(temp_dir.path(), 0, &entry).await.unwrap();
        }

        let cache = ResponseCache::new(&config).unwrap();
        assert!(cache.is_empty());
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_disk_mirror_keeps_latest_of_concurrent_stores() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = CacheConfig {
            disk_dir: Some(temp_dir.path().to_path_buf()),
            ..CacheConfig::default()
        };
        let cache = Arc::new(ResponseCache::new(&config).unwrap());
        let ok = head("HTTP/1.1 200 OK\r\n\r\n");

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let cache = cache.clone();
                let ok = ok.clone();
                tokio::spawn(async move {
                    cache.maybe_store(key("/race"), &ok, Bytes::from(format!("version {}", i))).await
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap());
        }

        let in_memory = cache.lookup(&key("/race")).unwrap();
        let files: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(files, vec![key("/race").file_name()]);

        let reopened = ResponseCache::new(&config).unwrap();
        assert_eq!(reopened.lookup(&key("/race")).unwrap().body, in_memory.body);
    }

    #[tokio::test]
    async fn test_evicted_entries_leave_disk() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = CacheConfig {
            max_entries: Some(1),
            disk_dir: Some(temp_dir.path().to_path_buf()),
            ..CacheConfig::default()
        };
        let cache = ResponseCache::new(&config).unwrap();
        let ok = head("HTTP/1.1 200 OK\r\n\r\n");
        cache.maybe_store(key("/old"), &ok, Bytes::new()).await;
        cache.maybe_store(key("/new"), &ok, Bytes::new()).await;

        assert!(!temp_dir.path().join(key("/old").file_name()).exists());
        assert!(temp_dir.path().join(key("/new").file_name()).exists());
    }

    #[test]
    fn test_file_name_is_a_digest_of_the_key() {
        let name = key("/a").file_name();
        assert_eq!(name.len(), 64 + ".json".len());
        assert!(name.strip_suffix(".json").unwrap().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(name, key("/a").file_name());
        assert_ne!(name, key("/b").file_name());

        // field boundaries are part of the digest
        let shifted = CacheKey { host: "example.co".to_string(), path: "m/a".to_string(), ..key("/a") };
        assert_ne!(name, shifted.file_name());
    }
}
