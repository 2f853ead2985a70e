use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::models::WorldId;

/// Per-world state keyed by `WorldId`.
///
/// One registry per component per process; worlds never share an entry, so
/// callers only ever lock the map briefly to fetch their world's `Arc<T>`.
pub struct WorldRegistry<T> {
    worlds: RwLock<HashMap<WorldId, Arc<T>>>,
}

impl<T> Default for WorldRegistry<T> {
    fn default() -> Self {
        Self { worlds: RwLock::new(HashMap::new()) }
    }
}

impl<T> WorldRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, world: &WorldId) -> Option<Arc<T>> {
        self.worlds.read().get(world).cloned()
    }

    pub fn get_or_insert_with<F: FnOnce() -> T>(&self, world: &WorldId, make: F) -> Arc<T> {
        if let Some(v) = self.get(world) { return v; }
        let mut w = self.worlds.write();
        w.entry(world.clone()).or_insert_with(|| Arc::new(make())).clone()
    }

    pub fn remove(&self, world: &WorldId) -> Option<Arc<T>> {
        self.worlds.write().remove(world)
    }

    pub fn worlds(&self) -> Vec<WorldId> {
        let mut v: Vec<WorldId> = self.worlds.read().keys().cloned().collect();
        v.sort();
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn creates_once_per_world() {
        let reg: WorldRegistry<AtomicUsize> = WorldRegistry::new();
        let a = WorldId::new("a");
        reg.get_or_insert_with(&a, || AtomicUsize::new(0)).fetch_add(1, Ordering::SeqCst);
        reg.get_or_insert_with(&a, || AtomicUsize::new(100)).fetch_add(1, Ordering::SeqCst);
        assert_eq!(reg.get(&a).unwrap().load(Ordering::SeqCst), 2);
        assert!(reg.get(&WorldId::new("b")).is_none());
        assert_eq!(reg.worlds(), vec![a.clone()]);
        assert!(reg.remove(&a).is_some());
        assert!(reg.get(&a).is_none());
    }
}
