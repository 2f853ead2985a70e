use anyhow::Result;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::chunk_gate::{ChunkReleaseGate, SweepStats};
use super::locator::Locator;
use super::models::WorldId;
use super::scheduler::{ConnectionScheduler, TickReport};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkTick {
    pub located: usize,
    pub scheduler: TickReport,
    pub sweep: SweepStats,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: usize,
    pub located: usize,
    pub completed: usize,
    pub failed: usize,
    /// False when the tick budget ran out first.
    pub idle: bool,
}

/// Per-tick driver tying discovery, scheduling and chunk release together.
pub struct RoadNetwork {
    scheduler: Arc<ConnectionScheduler>,
    locator: Locator,
    gate: Arc<ChunkReleaseGate>,
}

impl RoadNetwork {
    pub fn new(scheduler: Arc<ConnectionScheduler>, locator: Locator, gate: Arc<ChunkReleaseGate>) -> Self {
        Self { scheduler, locator, gate }
    }

    pub fn scheduler(&self) -> &Arc<ConnectionScheduler> {
        &self.scheduler
    }

    pub fn gate(&self) -> &Arc<ChunkReleaseGate> {
        &self.gate
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn on_world_load(&self, world: &WorldId) -> Result<usize> {
        self.scheduler.on_world_load(world)
    }

    pub fn on_world_unload(&self, world: &WorldId) {
        let dropped = self.locator.clear_world(world);
        if dropped > 0 {
            log::debug!("[network] world {}: dropped {} locate requests", world, dropped);
        }
        self.scheduler.on_world_unload(world);
    }

    /// Queues a POI search; every POI it finds is connected to its nearest neighbour.
    pub fn discover(&self, world: &WorldId, count: usize, around_players: bool) {
        let scheduler = self.scheduler.clone();
        let w = world.clone();
        self.locator.locate_async(world, count, around_players, move |found| {
            for poi in &found {
                match scheduler.connect_new_poi(&w, poi) {
                    Ok(Some(c)) => log::debug!("[network] world {}: {} {} -> {}", w, poi.kind, c.from, c.to),
                    Ok(None) => {}
                    Err(e) => log::error!("[network] world {}: connecting {} failed: {:#}", w, poi.pos, e),
                }
            }
        });
    }

    /// Locator drain, then scheduler admission, then gate sweep.
    pub fn tick(&self, world: &WorldId) -> NetworkTick {
        let located = self.locator.tick(world);
        let scheduler = self.scheduler.tick(world);
        let sweep = self.gate.sweep(world);
        NetworkTick { located, scheduler, sweep }
    }

    pub fn is_idle(&self, world: &WorldId) -> bool {
        self.locator.pending(world) == 0 && self.scheduler.is_idle(world)
    }

    /// Ticks until nothing is pending or `max_ticks` is reached.
    pub fn run_until_idle(&self, world: &WorldId, max_ticks: usize, pause: Duration) -> RunSummary {
        let mut summary = RunSummary::default();
        while summary.ticks < max_ticks {
            if self.is_idle(world) {
                summary.idle = true;
                break;
            }
            let t = self.tick(world);
            summary.ticks += 1;
            summary.located += t.located;
            summary.completed += t.scheduler.completed;
            summary.failed += t.scheduler.failed;
            if t.scheduler.admitted.is_none() && t.located == 0 {
                thread::sleep(pause);
            }
        }
        if !summary.idle && self.is_idle(world) {
            summary.idle = true;
        }
        log::info!(
            "[network] world {}: {} ticks, {} located, {} completed, {} failed{}",
            world, summary.ticks, summary.located, summary.completed, summary.failed,
            if summary.idle { "" } else { " (tick budget exhausted)" }
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::roads::locator::{FixedWorldView, LocatorConfig, PoiCatalog};
    use crate::commands::roads::models::{Coordinate, Poi, Status};
    use crate::commands::roads::placement::StaticPlacement;
    use crate::commands::roads::sampler::HeightCache;
    use crate::commands::roads::scheduler::SchedulerConfig;
    use crate::commands::roads::storage::{MemoryStorage, RoadStorage};
    use crate::commands::roads::terrain::{FlatTerrain, UniformTerrain};

    fn world() -> WorldId {
        WorldId::new("overworld")
    }

    fn network(store: Arc<MemoryStorage>) -> RoadNetwork {
        let mut catalog = PoiCatalog::default();
        catalog.insert(&world(), Poi::new(Coordinate::new(8, 64, 8), "village"));
        catalog.insert(&world(), Poi::new(Coordinate::new(60, 64, 20), "village"));
        let view = Arc::new(FixedWorldView::new().with_spawn(&world(), Coordinate::new(0, 64, 0)));
        let gate = Arc::new(ChunkReleaseGate::default());
        let scheduler = Arc::new(ConnectionScheduler::new(
            store.clone(),
            store.clone(),
            Arc::new(StaticPlacement::default()),
            Arc::new(UniformTerrain(Arc::new(FlatTerrain::new(64)))),
            Arc::new(HeightCache::default()),
            gate.clone(),
            SchedulerConfig::default(),
        ));
        let locator = Locator::new(
            Arc::new(catalog),
            view,
            store,
            LocatorConfig { per_tick: 1, search_radius: 100, ring_radius: 64, ring_multiples: 1 },
        );
        RoadNetwork::new(scheduler, locator, gate)
    }

    #[test]
    fn discovery_flows_into_completed_roads() -> Result<()> {
        let store = Arc::new(MemoryStorage::new());
        let net = network(store.clone());
        net.on_world_load(&world())?;
        net.discover(&world(), 4, false);
        assert!(!net.is_idle(&world()));

        let summary = net.run_until_idle(&world(), 10_000, Duration::from_millis(1));
        assert!(summary.idle);
        assert_eq!(summary.located, 1);
        assert_eq!(summary.completed, 1);

        let conns = store.connections(&world())?;
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].status, Status::Completed);
        assert_eq!(store.road_data(&world())?.len(), 1);
        assert!(net.gate().pending_chunks(&world()).is_empty());
        Ok(())
    }

    #[test]
    fn unload_drops_pending_discovery() {
        let net = network(Arc::new(MemoryStorage::new()));
        net.discover(&world(), 1, false);
        net.on_world_unload(&world());
        assert!(net.is_idle(&world()));
        assert_eq!(net.tick(&world()).located, 0);
    }
}
