//! Session-identifier to conversation-id mapping.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use uuid::Uuid;

const SESSION_CAP: usize = 500;

/// Stable conversation ids per caller-supplied session identifier (the
/// OpenAI `user` field or Anthropic `metadata.user_id`). Anonymous requests
/// get a fresh id each time.
pub struct SessionMap {
    inner: Mutex<LruCache<String, String>>,
}

impl Default for SessionMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(SESSION_CAP).expect("session cap"),
            )),
        }
    }

    pub fn conversation_for(&self, session: Option<&str>) -> String {
        let Some(session) = session.map(str::trim).filter(|s| !s.is_empty()) else {
            return Uuid::new_v4().to_string();
        };
        let mut map = match self.inner.lock() {
            Ok(map) => map,
            Err(_) => return Uuid::new_v4().to_string(),
        };
        if let Some(existing) = map.get(session) {
            return existing.clone();
        }
        let fresh = Uuid::new_v4().to_string();
        map.put(session.to_string(), fresh.clone());
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_session_same_conversation() {
        let map = SessionMap::new();
        let a = map.conversation_for(Some("alice"));
        let b = map.conversation_for(Some("alice"));
        assert_eq!(a, b);
    }

    #[test]
    fn different_sessions_differ() {
        let map = SessionMap::new();
        assert_ne!(
            map.conversation_for(Some("alice")),
            map.conversation_for(Some("bob"))
        );
    }

    #[test]
    fn anonymous_is_always_fresh() {
        let map = SessionMap::new();
        assert_ne!(map.conversation_for(None), map.conversation_for(None));
    }
}
