//! Conversation id → chat key cache

use shc_core::ChatId;
use shc_crypto::{unwrap_key, RsaPrivateKey, SymmetricKey};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::protocol::ChatSummary;

/// Result of one [`ChatKeyRegistry::ingest`] pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub added: Vec<ChatId>,
    pub already_cached: usize,
    /// Conversations whose key could not be unwrapped; they stay unreadable
    pub failed: Vec<ChatId>,
}

/// Chat keys for one session. A key, once cached, is never re-derived or
/// replaced.
#[derive(Default)]
pub struct ChatKeyRegistry {
    keys: RwLock<HashMap<ChatId, SymmetricKey>>,
}

impl std::fmt::Debug for ChatKeyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatKeyRegistry")
            .field("chats", &self.len())
            .finish()
    }
}

impl ChatKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unwrap and cache the key of every listed conversation not seen yet.
    /// A key that fails to unwrap is logged and skipped.
    pub fn ingest(&self, chats: &[ChatSummary], private_key: &RsaPrivateKey) -> IngestReport {
        let mut report = IngestReport::default();
        for chat in chats {
            if self.contains(chat.chat_id) {
                report.already_cached += 1;
                continue;
            }
            match unwrap_key(&chat.key, private_key) {
                Some(key) => {
                    if self.insert_if_absent(chat.chat_id, key) {
                        report.added.push(chat.chat_id);
                    } else {
                        report.already_cached += 1;
                    }
                }
                None => {
                    warn!(chat_id = chat.chat_id, "failed to decrypt chat key");
                    report.failed.push(chat.chat_id);
                }
            }
        }
        debug!(
            added = report.added.len(),
            cached = report.already_cached,
            failed = report.failed.len(),
            "chat keys ingested"
        );
        report
    }

    pub fn get(&self, chat_id: ChatId) -> Option<SymmetricKey> {
        self.read().get(&chat_id).cloned()
    }

    pub fn contains(&self, chat_id: ChatId) -> bool {
        self.read().contains_key(&chat_id)
    }

    /// Cache `key` unless the conversation already has one. Returns whether
    /// it was inserted.
    pub fn insert_if_absent(&self, chat_id: ChatId, key: SymmetricKey) -> bool {
        let mut keys = self.write();
        if keys.contains_key(&chat_id) {
            return false;
        }
        keys.insert(chat_id, key);
        true
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ChatId, SymmetricKey>> {
        self.keys.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ChatId, SymmetricKey>> {
        self.keys.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shc_crypto::{generate_chat_key, generate_identity_key_pair, wrap_key_for_recipient};

    fn summary(chat_id: ChatId, key: String) -> ChatSummary {
        ChatSummary {
            chat_id,
            name: None,
            is_private: true,
            key,
            unread_count: None,
            do_not_disturb: false,
        }
    }

    #[test]
    fn test_ingest_caches_once_and_skips_bad_keys() {
        let me = generate_identity_key_pair(1024).unwrap();
        let k1 = generate_chat_key();
        let k2 = generate_chat_key();
        let chats = vec![
            summary(1, wrap_key_for_recipient(&k1, &me.public).unwrap()),
            summary(2, "bm90IGEga2V5".into()),
            summary(3, wrap_key_for_recipient(&k2, &me.public).unwrap()),
        ];

        let registry = ChatKeyRegistry::new();
        let report = registry.ingest(&chats, &me.private);
        assert_eq!(report.added, vec![1, 3]);
        assert_eq!(report.failed, vec![2]);
        assert_eq!(registry.get(1).unwrap(), k1);
        assert!(registry.get(2).is_none());

        let again = registry.ingest(&chats, &me.private);
        assert!(again.added.is_empty());
        assert_eq!(again.already_cached, 2);
    }

    #[test]
    fn test_existing_key_is_never_replaced() {
        let registry = ChatKeyRegistry::new();
        let first = generate_chat_key();
        assert!(registry.insert_if_absent(9, first.clone()));
        assert!(!registry.insert_if_absent(9, generate_chat_key()));
        assert_eq!(registry.get(9).unwrap(), first);
        registry.clear();
        assert!(registry.is_empty());
    }
}
