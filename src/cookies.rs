//! Per-session cookie jars.
//!
//! The store is the only state shared between concurrent forwards. Each jar
//! sits behind its own lock so that two sessions never contend, while `get`
//! and `absorb` on the same session are serialised.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;

/// Storage contract the forwarder relies on. A durable backend can stand in
/// for [`MemoryCookieStore`] as long as it keeps these semantics.
pub trait CookieStore: Send + Sync {
    /// `Cookie` header value for `session`, or an empty string.
    fn get(&self, session: &str) -> String;

    /// Upsert the `name=value` pair of each raw `Set-Cookie` value.
    fn absorb(&self, session: &str, set_cookies: &[String]);

    /// Session keys that currently own a jar.
    fn sessions(&self) -> Vec<String>;

    /// Drop the jar for `session`. Returns false if there was none.
    fn clear(&self, session: &str) -> bool;
}

/// Cookie name → the raw `name=value` pair last seen for it.
type Jar = BTreeMap<String, String>;

/// Process-lifetime, in-memory store. Jars are never expired.
#[derive(Default)]
pub struct MemoryCookieStore {
    jars: DashMap<String, Arc<Mutex<Jar>>>,
}

impl MemoryCookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    // The map guard is released before the jar is locked, so a slow jar
    // never holds up other sessions sharing the same shard.
    fn jar(&self, session: &str) -> Option<Arc<Mutex<Jar>>> {
        self.jars.get(session).map(|entry| Arc::clone(entry.value()))
    }

    fn jar_or_create(&self, session: &str) -> Arc<Mutex<Jar>> {
        if let Some(jar) = self.jar(session) {
            return jar;
        }
        Arc::clone(self.jars.entry(session.to_string()).or_default().value())
    }
}

impl CookieStore for MemoryCookieStore {
    fn get(&self, session: &str) -> String {
        let Some(jar) = self.jar(session) else {
            return String::new();
        };
        let jar = jar.lock();
        jar.values().map(String::as_str).collect::<Vec<_>>().join("; ")
    }

    fn absorb(&self, session: &str, set_cookies: &[String]) {
        let pairs: Vec<(String, String)> = set_cookies
            .iter()
            .filter_map(|raw| {
                let parsed = parse_set_cookie(raw);
                if parsed.is_none() {
                    debug!("[{session}] ignoring malformed Set-Cookie: {raw}");
                }
                parsed
            })
            .collect();
        if pairs.is_empty() {
            return;
        }

        let jar = self.jar_or_create(session);
        let mut jar = jar.lock();
        for (name, pair) in pairs {
            jar.insert(name, pair);
        }
    }

    fn sessions(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.jars.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    fn clear(&self, session: &str) -> bool {
        self.jars.remove(session).is_some()
    }
}

/// Split a raw `Set-Cookie` value into `(name, "name=value")`.
/// Returns `None` when the part before the first `;` has no `=` or no name.
pub fn parse_set_cookie(raw: &str) -> Option<(String, String)> {
    let pair = raw.split(';').next().unwrap_or_default().trim();
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), format!("{name}={}", value.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn empty_or_missing_jar_yields_empty_header() {
        let store = MemoryCookieStore::new();
        assert_eq!(store.get("nobody"), "");
        store.absorb("nobody", &raw(&["no-equals-sign; Path=/"]));
        assert_eq!(store.get("nobody"), "");
    }

    #[test]
    fn last_value_for_a_name_wins() {
        let store = MemoryCookieStore::new();
        store.absorb("s", &raw(&["a=1; Path=/", "b=2"]));
        store.absorb("s", &raw(&["a=3"]));

        let header = store.get("s");
        let mut pairs: Vec<&str> = header.split("; ").collect();
        pairs.sort();
        assert_eq!(pairs, vec!["a=3", "b=2"]);
    }

    #[test]
    fn sessions_are_isolated() {
        let store = MemoryCookieStore::new();
        store.absorb("s1", &raw(&["token=xyz; HttpOnly"]));
        assert_eq!(store.get("s1"), "token=xyz");
        assert_eq!(store.get("s2"), "");
    }

    #[test]
    fn malformed_entries_skipped_without_losing_others() {
        let store = MemoryCookieStore::new();
        store.absorb("s", &raw(&["", "; a=1", "=orphan", "ok=1; Secure"]));
        assert_eq!(store.get("s"), "ok=1");
    }

    #[test]
    fn value_may_contain_equals_signs() {
        assert_eq!(
            parse_set_cookie("data=a=b=c; Path=/"),
            Some(("data".to_string(), "data=a=b=c".to_string()))
        );
        assert_eq!(
            parse_set_cookie("empty=; Max-Age=0"),
            Some(("empty".to_string(), "empty=".to_string()))
        );
    }

    #[test]
    fn sessions_can_be_listed_and_cleared() {
        let store = MemoryCookieStore::new();
        store.absorb("b", &raw(&["x=1"]));
        store.absorb("a", &raw(&["y=2"]));
        assert_eq!(store.sessions(), vec!["a".to_string(), "b".to_string()]);

        assert!(store.clear("a"));
        assert!(!store.clear("a"));
        assert_eq!(store.get("a"), "");
        assert_eq!(store.sessions(), vec!["b".to_string()]);
    }

    #[test]
    fn concurrent_absorbs_on_one_session_lose_nothing() {
        let store = Arc::new(MemoryCookieStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for j in 0..50 {
                        store.absorb("shared", &[format!("c{i}_{j}=v")]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get("shared").split("; ").count(), 8 * 50);
    }
}
