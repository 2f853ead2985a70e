use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::models::{Coordinate, WorldId};
use super::terrain::TerrainProvider;

pub const DEFAULT_HEIGHT_CACHE_LIMIT: usize = 200_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
struct CacheKey {
    world: u64,
    xz: i64,
}

fn pack_xz(x: i32, z: i32) -> i64 {
    ((x as i64) << 32) | (z as u32 as i64)
}

/// Process-wide memo of sampled heights, shared by every world's sampler.
///
/// Cleared wholesale once it grows past `limit`.
#[derive(Debug)]
pub struct HeightCache {
    map: RwLock<HashMap<CacheKey, i32>>,
    limit: usize,
}

impl Default for HeightCache {
    fn default() -> Self {
        Self::new(DEFAULT_HEIGHT_CACHE_LIMIT)
    }
}

impl HeightCache {
    pub fn new(limit: usize) -> Self {
        Self { map: RwLock::new(HashMap::new()), limit: limit.max(1) }
    }

    fn get(&self, key: CacheKey) -> Option<i32> {
        self.map.read().get(&key).copied()
    }

    fn insert(&self, key: CacheKey, h: i32) {
        let mut map = self.map.write();
        if map.len() >= self.limit {
            log::debug!("[sampler] height cache reached {} entries; clearing", map.len());
            map.clear();
        }
        map.insert(key, h);
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BiomeCost {
    pub is_water: bool,
}

/// Height and biome lookups for one world, memoized through a shared `HeightCache`.
pub struct HeightSampler {
    terrain: Arc<dyn TerrainProvider>,
    cache: Arc<HeightCache>,
    world_key: u64,
}

impl HeightSampler {
    pub fn new(world: &WorldId, terrain: Arc<dyn TerrainProvider>, cache: Arc<HeightCache>) -> Self {
        let mut h = DefaultHasher::new();
        world.hash(&mut h);
        Self { terrain, cache, world_key: h.finish() }
    }

    pub fn sea_level(&self) -> i32 {
        self.terrain.sea_level()
    }

    pub fn height_at(&self, x: i32, z: i32) -> i32 {
        let key = CacheKey { world: self.world_key, xz: pack_xz(x, z) };
        if let Some(h) = self.cache.get(key) { return h; }
        let h = self.probe(x, z);
        self.cache.insert(key, h);
        h
    }

    fn probe(&self, x: i32, z: i32) -> i32 {
        let sea = self.terrain.sea_level();
        let floor = self.terrain.ocean_floor_height(x, z);
        let surface = self.terrain.surface_height(x, z);
        // shallow water reads as flat sea level
        if surface <= sea && floor < sea { sea } else { surface }
    }

    pub fn ground(&self, x: i32, z: i32) -> Coordinate {
        Coordinate::new(x, self.height_at(x, z), z)
    }

    pub fn biome_cost_at(&self, pos: Coordinate) -> BiomeCost {
        BiomeCost { is_water: self.terrain.biome_at(pos).is_water() }
    }
}
