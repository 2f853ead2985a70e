use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use super::models::{Coordinate, WorldId};

#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Biome {
    Plains,
    Forest,
    Desert,
    Mountains,
    Swamp,
    Beach,
    River,
    Ocean,
    DeepOcean,
    Other(String),
}

impl Biome {
    /// River, ocean and deep ocean count as water for routing.
    pub fn is_water(&self) -> bool {
        matches!(self, Biome::River | Biome::Ocean | Biome::DeepOcean)
    }
}

/// Height and biome source of a world.
///
/// Height probes must be safe to call from planner worker threads.
pub trait TerrainProvider: Send + Sync {
    /// Highest non-air block, water surfaces included.
    fn surface_height(&self, x: i32, z: i32) -> i32;
    /// Highest solid block below any water column.
    fn ocean_floor_height(&self, x: i32, z: i32) -> i32;
    fn biome_at(&self, pos: Coordinate) -> Biome;
    fn sea_level(&self) -> i32;
}

/// Resolves the terrain of a world when its planner is first needed.
pub trait TerrainSource: Send + Sync {
    fn terrain(&self, world: &WorldId) -> Arc<dyn TerrainProvider>;
}

impl<F> TerrainSource for F
where
    F: Fn(&WorldId) -> Arc<dyn TerrainProvider> + Send + Sync,
{
    fn terrain(&self, world: &WorldId) -> Arc<dyn TerrainProvider> {
        self(world)
    }
}

/// Same terrain for every world.
pub struct UniformTerrain(pub Arc<dyn TerrainProvider>);

impl TerrainSource for UniformTerrain {
    fn terrain(&self, _world: &WorldId) -> Arc<dyn TerrainProvider> {
        self.0.clone()
    }
}

#[derive(Clone, Debug)]
pub struct FlatTerrain {
    pub height: i32,
    pub sea_level: i32,
}

impl FlatTerrain {
    pub fn new(height: i32) -> Self {
        Self { height, sea_level: 63 }
    }
}

impl TerrainProvider for FlatTerrain {
    fn surface_height(&self, _x: i32, _z: i32) -> i32 { self.height }
    fn ocean_floor_height(&self, _x: i32, _z: i32) -> i32 { self.height }
    fn biome_at(&self, _pos: Coordinate) -> Biome { Biome::Plains }
    fn sea_level(&self) -> i32 { self.sea_level }
}

/// Dense heightmap loaded from JSON, used by the CLI.
///
/// Cells outside the grid report `default_height` and plains.
#[derive(Clone, Debug, Deserialize)]
pub struct HeightmapTerrain {
    #[serde(default)]
    pub origin_x: i32,
    #[serde(default)]
    pub origin_z: i32,
    pub size_x: usize,
    pub size_z: usize,
    #[serde(default = "default_sea_level")]
    pub sea_level: i32,
    #[serde(default = "default_height")]
    pub default_height: i32,
    /// Row-major by z then x.
    pub surface: Vec<i32>,
    #[serde(default)]
    pub ocean_floor: Option<Vec<i32>>,
    #[serde(default)]
    pub water: Option<Vec<bool>>,
}

fn default_sea_level() -> i32 { 63 }
fn default_height() -> i32 { 64 }

impl HeightmapTerrain {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open heightmap {}", path.display()))?;
        let map: HeightmapTerrain = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parse heightmap {}", path.display()))?;
        map.validate()?;
        Ok(map)
    }

    fn validate(&self) -> Result<()> {
        let cells = self.size_x * self.size_z;
        if self.surface.len() != cells {
            bail!("heightmap surface has {} cells, expected {}", self.surface.len(), cells);
        }
        if let Some(f) = &self.ocean_floor {
            if f.len() != cells { bail!("heightmap ocean_floor has {} cells, expected {}", f.len(), cells); }
        }
        if let Some(w) = &self.water {
            if w.len() != cells { bail!("heightmap water mask has {} cells, expected {}", w.len(), cells); }
        }
        Ok(())
    }

    fn index(&self, x: i32, z: i32) -> Option<usize> {
        let lx = x - self.origin_x;
        let lz = z - self.origin_z;
        if lx < 0 || lz < 0 { return None; }
        let (lx, lz) = (lx as usize, lz as usize);
        if lx >= self.size_x || lz >= self.size_z { return None; }
        Some(lz * self.size_x + lx)
    }
}

impl TerrainProvider for HeightmapTerrain {
    fn surface_height(&self, x: i32, z: i32) -> i32 {
        self.index(x, z).map(|i| self.surface[i]).unwrap_or(self.default_height)
    }

    fn ocean_floor_height(&self, x: i32, z: i32) -> i32 {
        match (self.index(x, z), &self.ocean_floor) {
            (Some(i), Some(f)) => f[i],
            (Some(i), None) => self.surface[i],
            (None, _) => self.default_height,
        }
    }

    fn biome_at(&self, pos: Coordinate) -> Biome {
        match (self.index(pos.x, pos.z), &self.water) {
            (Some(i), Some(w)) if w[i] => Biome::River,
            _ => Biome::Plains,
        }
    }

    fn sea_level(&self) -> i32 {
        self.sea_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn water_biomes() {
        assert!(Biome::River.is_water());
        assert!(Biome::DeepOcean.is_water());
        assert!(!Biome::Swamp.is_water());
        assert!(!Biome::Other("lush_caves".into()).is_water());
    }

    #[test]
    fn heightmap_loads_and_falls_back_outside_grid() -> Result<()> {
        let mut f = NamedTempFile::new()?;
        write!(
            f,
            r#"{{"origin_x": -1, "origin_z": 0, "size_x": 2, "size_z": 2,
                "surface": [60, 61, 70, 71], "water": [true, false, false, false]}}"#
        )?;
        let map = HeightmapTerrain::load(f.path())?;
        assert_eq!(map.surface_height(-1, 0), 60);
        assert_eq!(map.surface_height(0, 1), 71);
        assert_eq!(map.surface_height(5, 5), 64);
        assert_eq!(map.ocean_floor_height(0, 0), 61);
        assert!(map.biome_at(Coordinate::new(-1, 60, 0)).is_water());
        assert!(!map.biome_at(Coordinate::new(0, 61, 0)).is_water());
        Ok(())
    }

    #[test]
    fn heightmap_rejects_wrong_cell_count() -> Result<()> {
        let mut f = NamedTempFile::new()?;
        write!(f, r#"{{"size_x": 2, "size_z": 2, "surface": [1, 2, 3]}}"#)?;
        assert!(HeightmapTerrain::load(f.path()).is_err());
        Ok(())
    }
}
