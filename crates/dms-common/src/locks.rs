//! Verrous asynchrones par clé.
//!
//! Sérialise les traitements portant sur une même clé (un hôte, une identité)
//! tout en laissant les clés différentes progresser en parallèle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

#[derive(Default)]
pub struct KeyedLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attend puis retourne le verrou exclusif associé à `key`
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            // Les slots que plus personne ne détient sont libérés au passage
            map.retain(|k, slot| k == key || Arc::strong_count(slot) > 1);
            Arc::clone(map.entry(key.to_string()).or_default())
        };
        slot.lock_owned().await
    }
}
