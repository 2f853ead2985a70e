use std::sync::atomic::{AtomicBool, Ordering};

use super::models::{MaterialPalette, WorldId};

/// Block placement engine as seen by the scheduler.
pub trait PlacementSource: Send + Sync {
    /// False while the engine cannot accept new road work for `world`.
    fn is_ready(&self, world: &WorldId) -> bool;
    fn materials(&self, world: &WorldId) -> Vec<MaterialPalette>;
}

/// Fixed palette with a toggleable readiness flag.
pub struct StaticPlacement {
    ready: AtomicBool,
    materials: Vec<MaterialPalette>,
}

impl Default for StaticPlacement {
    fn default() -> Self {
        Self::new(default_palettes())
    }
}

impl StaticPlacement {
    pub fn new(materials: Vec<MaterialPalette>) -> Self {
        Self { ready: AtomicBool::new(true), materials }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

impl PlacementSource for StaticPlacement {
    fn is_ready(&self, _world: &WorldId) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn materials(&self, _world: &WorldId) -> Vec<MaterialPalette> {
        self.materials.clone()
    }
}

pub fn default_palettes() -> Vec<MaterialPalette> {
    vec![
        MaterialPalette {
            name: "surface".into(),
            blocks: vec!["minecraft:dirt_path".into(), "minecraft:gravel".into(), "minecraft:coarse_dirt".into()],
        },
        MaterialPalette {
            name: "bridge".into(),
            blocks: vec!["minecraft:oak_planks".into(), "minecraft:spruce_planks".into()],
        },
    ]
}
