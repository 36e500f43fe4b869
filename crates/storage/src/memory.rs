use std::collections::HashMap;
use std::sync::Mutex;

use super::KeyValueStore;
use super::error::{PoisonedLockSnafu, StorageResult};

/// Process-local store, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.lock().map_or(0, |values| values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| PoisonedLockSnafu { stage: "memory-get" }.build())?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| PoisonedLockSnafu { stage: "memory-set" }.build())?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| PoisonedLockSnafu {
                stage: "memory-remove",
            }
            .build())?;
        values.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove_cycle() {
        let store = MemoryStore::new();
        assert_eq!(store.get("chatSessions").unwrap(), None);

        store.set("chatSessions", "[]").unwrap();
        store.set("chatSessions", "[1]").unwrap();
        assert_eq!(store.get("chatSessions").unwrap().as_deref(), Some("[1]"));
        assert_eq!(store.len(), 1);

        store.remove("chatSessions").unwrap();
        store.remove("chatSessions").unwrap();
        assert!(store.is_empty());
    }
}
