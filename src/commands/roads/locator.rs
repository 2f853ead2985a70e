use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::BufReader;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use super::models::{Coordinate, Poi, WorldId};
use super::registry::WorldRegistry;
use super::storage::PoiRegistry;

/// Nearest-structure query. Only ever called from the world thread.
pub trait StructureSearch: Send + Sync {
    fn locate_nearest(&self, world: &WorldId, center: Coordinate, radius: i32) -> Option<Poi>;
}

/// Read access to where things are in a running world.
pub trait WorldView: Send + Sync {
    fn spawn(&self, world: &WorldId) -> Option<Coordinate>;
    fn player_positions(&self, world: &WorldId) -> Vec<Coordinate>;
}

#[derive(Default)]
pub struct FixedWorldView {
    spawns: RwLock<HashMap<WorldId, Coordinate>>,
    players: RwLock<HashMap<WorldId, Vec<Coordinate>>>,
}

impl FixedWorldView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_spawn(self, world: &WorldId, spawn: Coordinate) -> Self {
        self.spawns.write().insert(world.clone(), spawn);
        self
    }

    pub fn set_players(&self, world: &WorldId, players: Vec<Coordinate>) {
        self.players.write().insert(world.clone(), players);
    }
}

impl WorldView for FixedWorldView {
    fn spawn(&self, world: &WorldId) -> Option<Coordinate> {
        self.spawns.read().get(world).copied()
    }

    fn player_positions(&self, world: &WorldId) -> Vec<Coordinate> {
        self.players.read().get(world).cloned().unwrap_or_default()
    }
}

/// Known structure positions per world, loaded from JSON:
/// `{"worlds": {"overworld": [{"pos": {"x": 0, "y": 64, "z": 0}, "kind": "village"}]}}`
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PoiCatalog {
    #[serde(default)]
    pub worlds: HashMap<String, Vec<Poi>>,
}

impl PoiCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open POI catalog {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file)).with_context(|| format!("parse POI catalog {}", path.display()))
    }

    pub fn insert(&mut self, world: &WorldId, poi: Poi) {
        self.worlds.entry(world.as_str().to_string()).or_default().push(poi);
    }
}

impl StructureSearch for PoiCatalog {
    fn locate_nearest(&self, world: &WorldId, center: Coordinate, radius: i32) -> Option<Poi> {
        let r2 = (radius as i64) * (radius as i64);
        self.worlds
            .get(world.as_str())?
            .iter()
            .map(|p| (p.pos.horizontal_dist_sq(center), p))
            .filter(|(d, _)| *d <= r2)
            .min_by_key(|(d, p)| (*d, p.pos))
            .map(|(_, p)| p.clone())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LocatorConfig {
    /// Requests served per tick.
    pub per_tick: usize,
    pub search_radius: i32,
    pub ring_radius: i32,
    pub ring_multiples: i32,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self { per_tick: 1, search_radius: 1600, ring_radius: 512, ring_multiples: 2 }
    }
}

pub type LocateCallback = Box<dyn FnOnce(Vec<Poi>) + Send + 'static>;

struct LocateRequest {
    count: usize,
    around_players: bool,
    callback: LocateCallback,
}

/// Spreads expensive structure searches across ticks.
pub struct Locator {
    requests: WorldRegistry<Mutex<VecDeque<LocateRequest>>>,
    search: Arc<dyn StructureSearch>,
    view: Arc<dyn WorldView>,
    pois: Arc<dyn PoiRegistry>,
    cfg: LocatorConfig,
}

impl Locator {
    pub fn new(
        search: Arc<dyn StructureSearch>,
        view: Arc<dyn WorldView>,
        pois: Arc<dyn PoiRegistry>,
        cfg: LocatorConfig,
    ) -> Self {
        Self { requests: WorldRegistry::new(), search, view, pois, cfg }
    }

    /// Queues a search; nothing runs until `tick`.
    pub fn locate_async<F>(&self, world: &WorldId, count: usize, around_players: bool, callback: F)
    where
        F: FnOnce(Vec<Poi>) + Send + 'static,
    {
        let q = self.requests.get_or_insert_with(world, || Mutex::new(VecDeque::new()));
        q.lock().push_back(LocateRequest { count, around_players, callback: Box::new(callback) });
    }

    pub fn pending(&self, world: &WorldId) -> usize {
        let Some(q) = self.requests.get(world) else { return 0; };
        let n = q.lock().len();
        n
    }

    /// Drops queued requests without running their callbacks.
    pub fn clear_world(&self, world: &WorldId) -> usize {
        let Some(q) = self.requests.remove(world) else { return 0; };
        let n = q.lock().len();
        n
    }

    /// Serves up to `per_tick` queued requests and returns how many ran.
    pub fn tick(&self, world: &WorldId) -> usize {
        let Some(q) = self.requests.get(world) else { return 0; };
        let mut served = 0;
        while served < self.cfg.per_tick {
            // release the queue before searching so callbacks may enqueue more
            let Some(req) = q.lock().pop_front() else { break; };
            let found = self.serve(world, req.count, req.around_players);
            log::debug!("[locator] world {} request for {} served with {} new POIs", world, req.count, found.len());
            let cb = req.callback;
            if catch_unwind(AssertUnwindSafe(move || cb(found))).is_err() {
                log::error!("[locator] completion callback for world {} panicked", world);
            }
            served += 1;
        }
        served
    }

    fn serve(&self, world: &WorldId, count: usize, around_players: bool) -> Vec<Poi> {
        let mut known: HashSet<Coordinate> = match self.pois.pois(world) {
            Ok(v) => v.into_iter().map(|p| p.pos).collect(),
            Err(e) => {
                log::error!("[locator] reading POIs of world {} failed: {:#}", world, e);
                return Vec::new();
            }
        };
        let mut found = Vec::new();
        for center in self.centers(world, around_players) {
            if found.len() >= count { break; }
            let Some(poi) = self.search.locate_nearest(world, center, self.cfg.search_radius) else { continue; };
            if !known.insert(poi.pos) { continue; }
            match self.pois.append_poi(world, poi.clone()) {
                Ok(_) => found.push(poi),
                Err(e) => log::error!("[locator] storing POI {} in world {} failed: {:#}", poi.pos, world, e),
            }
        }
        found
    }

    /// Players, or spawn followed by rings of eight probes around it.
    pub fn centers(&self, world: &WorldId, around_players: bool) -> Vec<Coordinate> {
        if around_players {
            return self.view.player_positions(world);
        }
        let Some(spawn) = self.view.spawn(world) else {
            log::warn!("[locator] world {} has no spawn; nothing to search around", world);
            return Vec::new();
        };
        let mut out = vec![spawn];
        for m in 1..=self.cfg.ring_multiples.max(0) {
            let r = self.cfg.ring_radius * m;
            for (dx, dz) in [(r, 0), (-r, 0), (0, r), (0, -r), (r, r), (r, -r), (-r, r), (-r, -r)] {
                out.push(Coordinate::new(spawn.x + dx, spawn.y, spawn.z + dz));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::roads::storage::MemoryStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn world() -> WorldId {
        WorldId::new("overworld")
    }

    fn catalog() -> PoiCatalog {
        let mut c = PoiCatalog::default();
        c.insert(&world(), Poi::new(Coordinate::new(30, 70, 10), "village"));
        c.insert(&world(), Poi::new(Coordinate::new(520, 66, 0), "village"));
        c.insert(&world(), Poi::new(Coordinate::new(-500, 64, -510), "outpost"));
        c
    }

    fn locator(store: Arc<MemoryStorage>, per_tick: usize) -> (Locator, Arc<FixedWorldView>) {
        let view = Arc::new(FixedWorldView::new().with_spawn(&world(), Coordinate::new(0, 64, 0)));
        let cfg = LocatorConfig { per_tick, search_radius: 200, ring_radius: 512, ring_multiples: 1 };
        (Locator::new(Arc::new(catalog()), view.clone(), store, cfg), view)
    }

    #[test]
    fn catalog_returns_nearest_within_radius() {
        let c = catalog();
        let near = c.locate_nearest(&world(), Coordinate::new(500, 64, 0), 100);
        assert_eq!(near.map(|p| p.pos), Some(Coordinate::new(520, 66, 0)));
        assert!(c.locate_nearest(&world(), Coordinate::new(2000, 64, 0), 100).is_none());
        assert!(c.locate_nearest(&WorldId::new("end"), Coordinate::new(0, 64, 0), 100).is_none());
    }

    #[test]
    fn ring_has_spawn_plus_eight_per_multiple() {
        let (loc, _) = locator(Arc::new(MemoryStorage::new()), 1);
        let centers = loc.centers(&world(), false);
        assert_eq!(centers.len(), 9);
        assert_eq!(centers[0], Coordinate::new(0, 64, 0));
        assert!(centers.contains(&Coordinate::new(-512, 64, -512)));
    }

    #[test]
    fn requests_wait_for_tick_and_drain_per_tick_limit() {
        let store = Arc::new(MemoryStorage::new());
        let (loc, _) = locator(store.clone(), 1);
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let c = calls.clone();
            loc.locate_async(&world(), 5, false, move |_| { c.fetch_add(1, Ordering::SeqCst); });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(loc.pending(&world()), 3);
        assert_eq!(loc.tick(&world()), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(loc.tick(&world()), 1);
        assert_eq!(loc.tick(&world()), 1);
        assert_eq!(loc.tick(&world()), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn new_pois_are_recorded_once() -> Result<()> {
        let store = Arc::new(MemoryStorage::new());
        let (loc, _) = locator(store.clone(), 4);
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        let f = first.clone();
        loc.locate_async(&world(), 10, false, move |p| *f.lock() = p);
        let s = second.clone();
        loc.locate_async(&world(), 10, false, move |p| *s.lock() = p);
        assert_eq!(loc.tick(&world()), 2);

        let got: Vec<Coordinate> = first.lock().iter().map(|p| p.pos).collect();
        assert_eq!(
            got,
            vec![Coordinate::new(30, 70, 10), Coordinate::new(520, 66, 0), Coordinate::new(-500, 64, -510)]
        );
        // everything was already known by the second request
        assert!(second.lock().is_empty());
        assert_eq!(store.pois(&world())?.len(), 3);
        Ok(())
    }

    #[test]
    fn count_caps_results_and_players_are_centers() {
        let store = Arc::new(MemoryStorage::new());
        let (loc, view) = locator(store, 1);
        let got = Arc::new(Mutex::new(Vec::new()));
        let g = got.clone();
        loc.locate_async(&world(), 1, false, move |p| *g.lock() = p);
        loc.tick(&world());
        assert_eq!(got.lock().len(), 1);

        view.set_players(&world(), vec![Coordinate::new(-450, 64, -450)]);
        let g = got.clone();
        loc.locate_async(&world(), 3, true, move |p| *g.lock() = p);
        loc.tick(&world());
        let got: Vec<Coordinate> = got.lock().iter().map(|p| p.pos).collect();
        assert_eq!(got, vec![Coordinate::new(-500, 64, -510)]);
    }

    #[test]
    fn catalog_loads_from_json() -> Result<()> {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new()?;
        write!(f, r#"{{"worlds": {{"overworld": [{{"pos": {{"x": 1, "y": 2, "z": 3}}, "kind": "village"}}]}}}}"#)?;
        let c = PoiCatalog::load(f.path())?;
        assert_eq!(c.worlds["overworld"][0], Poi::new(Coordinate::new(1, 2, 3), "village"));
        Ok(())
    }
}
