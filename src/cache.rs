/// Byte-bounded LRU response cache
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use log::debug;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;

/// Cache status for responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }

    /// Tag a response with `X-Cache`
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert("x-cache", HeaderValue::from_static(self.as_str()));
    }
}

/// Cached response entry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    size_bytes: usize,
}

impl CacheEntry {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        let header_bytes: usize = headers
            .iter()
            .map(|(name, value)| name.as_str().len() + value.len())
            .sum();
        Self {
            size_bytes: body.len() + header_bytes,
            status,
            headers,
            body,
        }
    }

    /// Bytes charged against the cache capacity
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }
}

/// Cache key from method, path, query and the negotiation headers
pub fn fingerprint(method: &Method, uri: &Uri, headers: &HeaderMap) -> String {
    let mut key = format!("{}:{}", method.as_str(), uri.path());

    if let Some(query) = uri.query() {
        key.push('?');
        key.push_str(query);
    }

    if let Some(accept) = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) {
        key.push_str("__accept:");
        key.push_str(accept);
    }

    if let Some(encoding) = headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
    {
        key.push_str("__ae:");
        key.push_str(encoding);
    }

    key
}

/// Whether a request may be answered from, or stored into, the cache
pub fn is_cacheable_request(method: &Method, headers: &HeaderMap) -> bool {
    if method != Method::GET && method != Method::HEAD {
        return false;
    }
    !cache_control_contains(headers, &["no-store"])
}

/// Whether a backend response may be stored
pub fn is_cacheable_response(status: StatusCode, headers: &HeaderMap) -> bool {
    if !status.is_success() {
        return false;
    }

    if cache_control_contains(headers, &["no-store", "no-cache", "private"]) {
        return false;
    }

    // Don't cache responses with Set-Cookie headers
    !headers.contains_key(header::SET_COOKIE)
}

fn cache_control_contains(headers: &HeaderMap, directives: &[&str]) -> bool {
    headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|directive| directive.trim())
        .any(|directive| {
            directives
                .iter()
                .any(|wanted| directive.eq_ignore_ascii_case(wanted))
        })
}

/// One arena slot in the recency list
#[derive(Debug)]
struct Node {
    key: String,
    entry: CacheEntry,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Index plus arena-backed doubly linked recency list
///
/// `head` is the most recently used slot, `tail` the least.
#[derive(Debug, Default)]
struct LruState {
    index: HashMap<String, usize, ahash::RandomState>,
    slots: Vec<Node>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    used: usize,
}

impl LruState {
    fn node(&self, idx: usize) -> &Node {
        &self.slots[idx]
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        &mut self.slots[idx]
    }

    fn allocate(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = node;
                idx
            }
            None => {
                self.slots.push(node);
                self.slots.len() - 1
            }
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.node_mut(idx);
            node.prev = None;
            node.next = old_head;
        }
        if let Some(head) = old_head {
            self.node_mut(head).prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(idx);
        node.prev = None;
        node.next = None;
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    /// Unlink the least recently used slot and release its payload
    fn evict_tail(&mut self) -> Option<String> {
        let idx = self.tail?;
        self.unlink(idx);
        let node = &mut self.slots[idx];
        let key = std::mem::take(&mut node.key);
        let size = node.entry.size_bytes();
        node.entry = CacheEntry::new(StatusCode::OK, HeaderMap::new(), Bytes::new());
        self.free.push(idx);
        self.index.remove(&key);
        self.used -= size;
        Some(key)
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    /// Walk the list and compare it against the index and byte count
    fn is_consistent(&self) -> bool {
        let mut count = 0;
        let mut bytes = 0;
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let node = &self.slots[idx];
            if node.prev != prev || self.index.get(&node.key) != Some(&idx) {
                return false;
            }
            count += 1;
            bytes += node.entry.size_bytes();
            prev = Some(idx);
            cursor = node.next;
        }
        prev == self.tail && count == self.index.len() && bytes == self.used
    }
}

/// Response cache bounded by total entry size
///
/// A capacity of zero disables the cache entirely: `get` always misses and
/// `put` does nothing.
pub struct ResponseCache {
    capacity_bytes: usize,
    state: Option<Mutex<LruState>>,
}

impl ResponseCache {
    /// Create a new response cache holding at most `capacity_bytes`
    pub fn new(capacity_bytes: usize) -> Self {
        let state = if capacity_bytes == 0 {
            None
        } else {
            Some(Mutex::new(LruState::default()))
        };
        Self {
            capacity_bytes,
            state,
        }
    }

    /// A cache that never stores anything
    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_some()
    }

    /// Get cached response and mark it most recently used
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut state = self.state.as_ref()?.lock();
        let idx = *state.index.get(key)?;
        state.move_to_front(idx);
        Some(state.node(idx).entry.clone())
    }

    /// Store response in cache, evicting least recently used entries
    ///
    /// An entry larger than the whole capacity is still stored; it pushes out
    /// everything else but is never evicted by its own insertion.
    pub fn put(&self, key: String, entry: CacheEntry) {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        let mut state = state.lock();

        let new_size = entry.size_bytes();
        if let Some(&idx) = state.index.get(&key) {
            let old_size = state.node(idx).entry.size_bytes();
            state.node_mut(idx).entry = entry;
            state.used = state.used - old_size + new_size;
            state.move_to_front(idx);
        } else {
            let idx = state.allocate(Node {
                key: key.clone(),
                entry,
                prev: None,
                next: None,
            });
            state.index.insert(key.clone(), idx);
            state.push_front(idx);
            state.used += new_size;
        }

        while state.used > self.capacity_bytes && state.head != state.tail {
            if let Some(evicted) = state.evict_tail() {
                debug!("Evicted cache entry {}", evicted);
            }
        }

        debug_assert!(state.is_consistent(), "LRU cache accounting corrupted");
        debug!(
            "Cached response with key: {} ({} bytes, {} / {} used)",
            key, new_size, state.used, self.capacity_bytes
        );
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.state.as_ref().map(|s| s.lock().len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently charged against the capacity
    pub fn used_bytes(&self) -> usize {
        self.state.as_ref().map(|s| s.lock().used).unwrap_or(0)
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// Get cache statistics (for monitoring)
    pub fn stats(&self) -> CacheStats {
        let (entries, used_bytes) = match &self.state {
            Some(state) => {
                let state = state.lock();
                (state.len(), state.used)
            }
            None => (0, 0),
        };
        CacheStats {
            capacity_bytes: self.capacity_bytes,
            used_bytes,
            entries,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub capacity_bytes: usize,
    pub used_bytes: usize,
    pub entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(body: &'static str) -> CacheEntry {
        CacheEntry::new(StatusCode::OK, HeaderMap::new(), Bytes::from_static(body.as_bytes()))
    }

    #[test]
    fn test_entry_size_counts_headers_and_body() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        let entry = CacheEntry::new(StatusCode::OK, headers, Bytes::from_static(b"hello"));
        assert_eq!(entry.size_bytes(), "content-type".len() + "text/plain".len() + 5);
    }

    #[test]
    fn test_cache_put_get() {
        let cache = ResponseCache::new(1024);
        cache.put("GET:/test".to_string(), entry("test response"));

        let cached = cache.get("GET:/test").unwrap();
        assert_eq!(cached.status, StatusCode::OK);
        assert_eq!(cached.body, Bytes::from_static(b"test response"));
        assert!(cache.get("GET:/other").is_none());
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = ResponseCache::new(2);
        cache.put("A".to_string(), entry("a"));
        cache.put("B".to_string(), entry("b"));
        cache.put("C".to_string(), entry("c"));

        assert!(cache.get("A").is_none());
        assert!(cache.get("B").is_some());
        assert!(cache.get("C").is_some());

        // B was touched after C, so C is now the eviction candidate
        let cache = ResponseCache::new(2);
        cache.put("A".to_string(), entry("a"));
        cache.put("B".to_string(), entry("b"));
        cache.put("C".to_string(), entry("c"));
        cache.get("B");
        cache.put("D".to_string(), entry("d"));

        assert!(cache.get("C").is_none());
        assert!(cache.get("B").is_some());
        assert!(cache.get("D").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_disabled_cache_always_misses() {
        let cache = ResponseCache::new(0);
        assert!(!cache.is_enabled());
        cache.put("key".to_string(), entry("value"));
        assert!(cache.get("key").is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.used_bytes(), 0);
    }

    #[test]
    fn test_replace_updates_accounting() {
        let cache = ResponseCache::new(100);
        cache.put("k".to_string(), entry("12345"));
        assert_eq!(cache.used_bytes(), 5);

        cache.put("k".to_string(), entry("12"));
        assert_eq!(cache.used_bytes(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("k").unwrap().body, Bytes::from_static(b"12"));
    }

    #[test]
    fn test_replace_promotes_entry() {
        let cache = ResponseCache::new(2);
        cache.put("A".to_string(), entry("a"));
        cache.put("B".to_string(), entry("b"));
        cache.put("A".to_string(), entry("x"));
        cache.put("C".to_string(), entry("c"));

        assert!(cache.get("B").is_none());
        assert_eq!(cache.get("A").unwrap().body, Bytes::from_static(b"x"));
    }

    #[test]
    fn test_oversized_entry_survives_its_own_insertion() {
        let cache = ResponseCache::new(4);
        cache.put("small".to_string(), entry("ab"));
        cache.put("huge".to_string(), entry("0123456789"));

        assert!(cache.get("small").is_none());
        assert!(cache.get("huge").is_some());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.used_bytes(), 10);

        // The next insertion pushes the oversized entry out
        cache.put("next".to_string(), entry("z"));
        assert!(cache.get("huge").is_none());
        assert_eq!(cache.used_bytes(), 1);
    }

    #[test]
    fn test_slots_are_reused_after_eviction() {
        let cache = ResponseCache::new(3);
        for i in 0..50 {
            cache.put(format!("k{}", i), entry("x"));
        }
        let state = cache.state.as_ref().unwrap().lock();
        assert_eq!(state.len(), 3);
        assert!(state.slots.len() <= 4);
        assert!(state.is_consistent());
    }

    #[test]
    fn test_single_entry_get_keeps_links() {
        let cache = ResponseCache::new(10);
        cache.put("only".to_string(), entry("1"));
        for _ in 0..3 {
            assert!(cache.get("only").is_some());
        }
        let state = cache.state.as_ref().unwrap().lock();
        assert_eq!(state.head, state.tail);
        assert!(state.is_consistent());
    }

    #[test]
    fn test_concurrent_access_keeps_accounting() {
        let cache = std::sync::Arc::new(ResponseCache::new(64));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let key = format!("{}-{}", t, i % 40);
                        cache.put(key.clone(), entry("abcd"));
                        cache.get(&key);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.used_bytes() <= 64);
        assert!(cache.state.as_ref().unwrap().lock().is_consistent());
    }

    #[test]
    fn test_fingerprint() {
        let uri: Uri = "/test?page=2".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(fingerprint(&Method::GET, &uri, &headers), "GET:/test?page=2");

        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        assert_eq!(
            fingerprint(&Method::GET, &uri, &headers),
            "GET:/test?page=2__ae:gzip"
        );

        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        assert_eq!(
            fingerprint(&Method::HEAD, &"/x".parse().unwrap(), &headers),
            "HEAD:/x__accept:application/json__ae:gzip"
        );
    }

    #[test]
    fn test_cacheable_requests() {
        let headers = HeaderMap::new();
        assert!(is_cacheable_request(&Method::GET, &headers));
        assert!(is_cacheable_request(&Method::HEAD, &headers));
        assert!(!is_cacheable_request(&Method::POST, &headers));

        let mut no_store = HeaderMap::new();
        no_store.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        assert!(!is_cacheable_request(&Method::GET, &no_store));
    }

    #[test]
    fn test_cacheable_responses() {
        let headers = HeaderMap::new();
        assert!(is_cacheable_response(StatusCode::OK, &headers));
        assert!(!is_cacheable_response(StatusCode::NOT_FOUND, &headers));
        assert!(!is_cacheable_response(StatusCode::INTERNAL_SERVER_ERROR, &headers));

        let mut private = HeaderMap::new();
        private.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("private, max-age=60"),
        );
        assert!(!is_cacheable_response(StatusCode::OK, &private));

        let mut public = HeaderMap::new();
        public.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("public, max-age=60"),
        );
        assert!(is_cacheable_response(StatusCode::OK, &public));

        let mut cookie = HeaderMap::new();
        cookie.insert(header::SET_COOKIE, HeaderValue::from_static("id=1"));
        assert!(!is_cacheable_response(StatusCode::OK, &cookie));
    }

    #[test]
    fn test_stats() {
        let cache = ResponseCache::new(100);
        cache.put("a".to_string(), entry("abc"));
        assert_eq!(
            cache.stats(),
            CacheStats {
                capacity_bytes: 100,
                used_bytes: 3,
                entries: 1,
            }
        );
        assert_eq!(ResponseCache::disabled().stats().entries, 0);
    }
}
