use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use super::chunk_gate::{extract_affected_chunks, ChunkReleaseGate};
use super::models::{ChunkCoord, Connection, Coordinate, Poi, RoadData, RoadSegmentPlacement, Status, WorldId, CHUNK_SIZE};
use super::neighbor_policy::GridPolicy;
use super::path_planner::{CostWeights, PathPlanner, PlanLimits};
use super::placement::PlacementSource;
use super::registry::WorldRegistry;
use super::sampler::{HeightCache, HeightSampler};
use super::storage::{PoiRegistry, RoadStorage};
use super::terrain::TerrainSource;
use super::worker_pool::{TaskHandle, TaskOutcome, WorkerPool};

#[derive(Copy, Clone, Debug)]
pub struct SchedulerConfig {
    /// Planner tasks allowed in flight per world.
    pub max_concurrency: usize,
    pub threads: usize,
    pub width: i32,
    pub road_type: i32,
    pub limits: PlanLimits,
    /// Limits for operator-requested connections.
    pub manual_limits: PlanLimits,
    /// New POIs farther than this from every known POI stay unconnected.
    pub max_pair_distance: Option<i32>,
    pub grid: GridPolicy,
    pub weights: CostWeights,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            threads: 2,
            width: 3,
            road_type: 0,
            limits: PlanLimits::default(),
            manual_limits: PlanLimits::relaxed(),
            max_pair_distance: None,
            grid: GridPolicy::default(),
            weights: CostWeights::default(),
        }
    }
}

/// Why `tick` admitted nothing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Blocked {
    QueueEmpty,
    AtCapacity,
    PlacementNotReady,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub completed: usize,
    pub failed: usize,
    pub admitted: Option<Connection>,
    pub blocked: Option<Blocked>,
}

type PlanResult = Vec<RoadSegmentPlacement>;

struct InFlight {
    connection: Connection,
    corridor: BTreeSet<ChunkCoord>,
    handle: TaskHandle<PlanResult>,
}

struct WorldQueue {
    queue: Mutex<VecDeque<Connection>>,
    in_flight: Mutex<Vec<InFlight>>,
    pool: WorkerPool,
    /// Serializes read-modify-write of this world's persisted lists.
    storage_lock: Mutex<()>,
}

/// Per-world FIFO of connections feeding a bounded planner pool.
///
/// `tick` is driven from the world thread; workers only plan and hand their
/// result back, all persistence happens inside `tick`.
pub struct ConnectionScheduler {
    worlds: WorldRegistry<WorldQueue>,
    planners: WorldRegistry<PathPlanner>,
    storage: Arc<dyn RoadStorage>,
    pois: Arc<dyn PoiRegistry>,
    placement: Arc<dyn PlacementSource>,
    terrain: Arc<dyn TerrainSource>,
    heights: Arc<HeightCache>,
    gate: Arc<ChunkReleaseGate>,
    cfg: SchedulerConfig,
}

impl ConnectionScheduler {
    pub fn new(
        storage: Arc<dyn RoadStorage>,
        pois: Arc<dyn PoiRegistry>,
        placement: Arc<dyn PlacementSource>,
        terrain: Arc<dyn TerrainSource>,
        heights: Arc<HeightCache>,
        gate: Arc<ChunkReleaseGate>,
        cfg: SchedulerConfig,
    ) -> Self {
        Self {
            worlds: WorldRegistry::new(),
            planners: WorldRegistry::new(),
            storage,
            pois,
            placement,
            terrain,
            heights,
            gate,
            cfg,
        }
    }

    fn world(&self, world: &WorldId) -> Arc<WorldQueue> {
        self.worlds.get_or_insert_with(world, || WorldQueue {
            queue: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(Vec::new()),
            pool: WorkerPool::new(format!("roads-{}", world), self.cfg.threads),
            storage_lock: Mutex::new(()),
        })
    }

    fn planner(&self, world: &WorldId) -> Arc<PathPlanner> {
        self.planners.get_or_insert_with(world, || {
            let sampler = HeightSampler::new(world, self.terrain.terrain(world), self.heights.clone());
            PathPlanner::new(Arc::new(sampler), self.cfg.grid, self.cfg.weights)
        })
    }

    /// Persists `connection` as PLANNED and queues it. Returns false when the
    /// unordered pair is already known or both ends coincide.
    pub fn enqueue(&self, world: &WorldId, connection: Connection) -> Result<bool> {
        let wq = self.world(world);
        let _guard = wq.storage_lock.lock();
        self.enqueue_locked(world, &wq, connection)
    }

    fn enqueue_locked(&self, world: &WorldId, wq: &WorldQueue, connection: Connection) -> Result<bool> {
        if connection.from == connection.to {
            return Ok(false);
        }
        let mut conns = self.storage.connections(world)?;
        if conns.iter().any(|c| c.same_pair(&connection)) {
            log::debug!("[scheduler] world {}: {} <-> {} already known", world, connection.from, connection.to);
            return Ok(false);
        }
        let connection = Connection { status: Status::Planned, ..connection };
        conns.push(connection.clone());
        self.storage.set_connections(world, conns)?;
        log::info!(
            "[scheduler] world {}: planned {} -> {}{}",
            world, connection.from, connection.to, if connection.manual { " (manual)" } else { "" }
        );
        wq.queue.lock().push_back(connection);
        Ok(true)
    }

    /// Pairs `poi` with its nearest other known POI and enqueues the pair.
    pub fn connect_new_poi(&self, world: &WorldId, poi: &Poi) -> Result<Option<Connection>> {
        let nearest = self
            .pois
            .pois(world)?
            .into_iter()
            .filter(|p| p.pos != poi.pos)
            .min_by_key(|p| (p.pos.horizontal_dist_sq(poi.pos), p.pos));
        let Some(nearest) = nearest else {
            log::debug!("[scheduler] world {}: {} at {} has no neighbour yet", world, poi.kind, poi.pos);
            return Ok(None);
        };
        if let Some(max) = self.cfg.max_pair_distance {
            let max = max as i64;
            if nearest.pos.horizontal_dist_sq(poi.pos) > max * max {
                log::debug!("[scheduler] world {}: nearest POI to {} is beyond {} blocks", world, poi.pos, max);
                return Ok(None);
            }
        }
        let connection = Connection::planned(poi.pos, nearest.pos);
        Ok(if self.enqueue(world, connection.clone())? { Some(connection) } else { None })
    }

    /// Replaces a FAILED connection with a manual one and queues it.
    pub fn requeue_manual(&self, world: &WorldId, from: Coordinate, to: Coordinate) -> Result<bool> {
        let wq = self.world(world);
        let _guard = wq.storage_lock.lock();
        let manual = Connection::manual(from, to);
        let mut conns = self.storage.connections(world)?;
        if let Some(idx) = conns.iter().position(|c| c.same_pair(&manual)) {
            let status = conns[idx].status;
            if status != Status::Failed {
                bail!("connection {} -> {} is {}; only FAILED connections can be requeued", from, to, status);
            }
            conns.remove(idx);
            self.storage.set_connections(world, conns)?;
        }
        self.enqueue_locked(world, &wq, manual)
    }

    /// One scheduling step for `world`: apply finished work, then admit at most one connection.
    pub fn tick(&self, world: &WorldId) -> TickReport {
        let mut report = TickReport::default();
        let wq = self.world(world);

        for (job, outcome) in Self::reap(&wq) {
            match self.apply_outcome(world, &wq, job, outcome) {
                Status::Completed => report.completed += 1,
                _ => report.failed += 1,
            }
        }

        if wq.in_flight.lock().len() >= self.cfg.max_concurrency {
            report.blocked = Some(Blocked::AtCapacity);
            return report;
        }

        let head = wq.queue.lock().front().cloned();
        let Some(head) = head else {
            report.blocked = Some(Blocked::QueueEmpty);
            return report;
        };
        if !self.placement.is_ready(world) {
            log::debug!("[scheduler] world {}: placement not ready; {} -> {} waits", world, head.from, head.to);
            report.blocked = Some(Blocked::PlacementNotReady);
            return report;
        }
        let Some(connection) = wq.queue.lock().pop_front() else {
            report.blocked = Some(Blocked::QueueEmpty);
            return report;
        };

        match self.claim(world, &wq, &connection) {
            Ok(true) => {}
            Ok(false) => return report,
            Err(e) => {
                log::error!("[scheduler] world {}: claiming {} -> {} failed: {:#}", world, connection.from, connection.to, e);
                return report;
            }
        }

        let corridor = corridor_chunks(connection.from, connection.to);
        for c in &corridor {
            self.gate.mark_pending(world, *c);
        }

        let planner = self.planner(world);
        let limits = if connection.manual { self.cfg.manual_limits } else { self.cfg.limits };
        let (from, to, width) = (connection.from, connection.to, self.cfg.width);
        match wq.pool.spawn(move || planner.plan(from, to, width, limits)) {
            Ok(handle) => {
                log::info!("[scheduler] world {}: generating {} -> {}", world, from, to);
                wq.in_flight.lock().push(InFlight { connection: connection.clone(), corridor, handle });
                report.admitted = Some(connection);
            }
            Err(e) => {
                log::error!("[scheduler] world {}: could not start planner: {:#}", world, e);
                self.finish(world, &wq, &connection, Status::Failed);
                self.release(world, corridor);
                report.failed += 1;
            }
        }
        report
    }

    fn reap(wq: &WorldQueue) -> Vec<(InFlight, TaskOutcome<PlanResult>)> {
        let mut done = Vec::new();
        let mut in_flight = wq.in_flight.lock();
        let mut i = 0;
        while i < in_flight.len() {
            match in_flight[i].handle.poll() {
                Some(outcome) => done.push((in_flight.remove(i), outcome)),
                None => i += 1,
            }
        }
        done
    }

    /// PLANNED -> GENERATING for the persisted copy. False when the stored
    /// connection is gone or no longer PLANNED.
    fn claim(&self, world: &WorldId, wq: &WorldQueue, connection: &Connection) -> Result<bool> {
        let _guard = wq.storage_lock.lock();
        let mut conns = self.storage.connections(world)?;
        let Some(stored) = conns.iter_mut().find(|c| c.same_pair(connection)) else {
            log::debug!("[scheduler] world {}: {} -> {} was removed; skipping", world, connection.from, connection.to);
            return Ok(false);
        };
        if !stored.status.can_transition_to(Status::Generating) {
            log::debug!("[scheduler] world {}: {} -> {} is {}; skipping", world, connection.from, connection.to, stored.status);
            return Ok(false);
        }
        stored.status = Status::Generating;
        self.storage.set_connections(world, conns)?;
        Ok(true)
    }

    fn apply_outcome(&self, world: &WorldId, wq: &WorldQueue, job: InFlight, outcome: TaskOutcome<PlanResult>) -> Status {
        let InFlight { connection, corridor, .. } = job;
        let status = match outcome {
            TaskOutcome::Done(segments) if !segments.is_empty() => {
                let outside = extract_affected_chunks(&segments).difference(&corridor).count();
                if outside > 0 {
                    log::debug!(
                        "[scheduler] world {}: road {} -> {} touches {} chunks outside its corridor",
                        world, connection.from, connection.to, outside
                    );
                }
                match self.store_road(world, wq, &connection, segments) {
                    Ok(()) => Status::Completed,
                    Err(e) => {
                        log::error!("[scheduler] world {}: storing road {} -> {} failed: {:#}", world, connection.from, connection.to, e);
                        Status::Failed
                    }
                }
            }
            TaskOutcome::Done(_) => {
                log::warn!("[scheduler] world {}: no path {} -> {}", world, connection.from, connection.to);
                Status::Failed
            }
            TaskOutcome::Panicked(msg) => {
                log::error!("[scheduler] world {}: planner for {} -> {} panicked: {}", world, connection.from, connection.to, msg);
                Status::Failed
            }
            TaskOutcome::Cancelled => Status::Failed,
        };
        self.finish(world, wq, &connection, status);
        self.release(world, corridor);
        status
    }

    fn store_road(&self, world: &WorldId, wq: &WorldQueue, connection: &Connection, segments: PlanResult) -> Result<()> {
        let road = RoadData {
            from: connection.from,
            to: connection.to,
            width: self.cfg.width,
            road_type: self.cfg.road_type,
            materials: self.placement.materials(world),
            segments,
        };
        let _guard = wq.storage_lock.lock();
        let mut roads = self.storage.road_data(world)?;
        roads.push(road);
        self.storage.set_road_data(world, roads)
    }

    fn finish(&self, world: &WorldId, wq: &WorldQueue, connection: &Connection, status: Status) {
        let res = (|| -> Result<bool> {
            let _guard = wq.storage_lock.lock();
            let mut conns = self.storage.connections(world)?;
            let Some(stored) = conns.iter_mut().find(|c| c.same_pair(connection)) else { return Ok(false); };
            if !stored.status.can_transition_to(status) {
                log::warn!(
                    "[scheduler] world {}: refusing {} -> {} for {} -> {}",
                    world, stored.status, status, connection.from, connection.to
                );
                return Ok(false);
            }
            stored.status = status;
            self.storage.set_connections(world, conns)?;
            Ok(true)
        })();
        match res {
            Ok(true) => log::info!("[scheduler] world {}: {} -> {} {}", world, connection.from, connection.to, status),
            Ok(false) => {}
            Err(e) => log::error!(
                "[scheduler] world {}: recording {} for {} -> {} failed: {:#}",
                world, status, connection.from, connection.to, e
            ),
        }
    }

    /// Drops this task's hold on each chunk it marked pending at admission.
    fn release(&self, world: &WorldId, chunks: BTreeSet<ChunkCoord>) {
        for c in chunks {
            self.gate.mark_processed(world, c);
        }
    }

    /// Resets interrupted work and re-queues every PLANNED connection.
    pub fn on_world_load(&self, world: &WorldId) -> Result<usize> {
        let wq = self.world(world);
        let _guard = wq.storage_lock.lock();
        let mut conns = self.storage.connections(world)?;
        let mut reset = 0;
        for c in conns.iter_mut() {
            if c.reset_after_restart() { reset += 1; }
        }
        if reset > 0 {
            self.storage.set_connections(world, conns.clone())?;
        }
        let pending: VecDeque<Connection> = conns.into_iter().filter(|c| c.status == Status::Planned).collect();
        let n = pending.len();
        *wq.queue.lock() = pending;
        log::info!("[scheduler] world {} loaded: {} queued ({} interrupted)", world, n, reset);
        Ok(n)
    }

    /// Cancels in-flight work, drops the queue and the pool, and frees the world's chunks.
    pub fn on_world_unload(&self, world: &WorldId) {
        if let Some(wq) = self.worlds.remove(world) {
            let cancelled: Vec<InFlight> = wq.in_flight.lock().drain(..).collect();
            for job in &cancelled {
                job.handle.cancel();
            }
            let dropped = {
                let mut q = wq.queue.lock();
                let n = q.len();
                q.clear();
                n
            };
            wq.pool.shutdown();
            log::info!("[scheduler] world {} unloaded: {} cancelled, {} dequeued", world, cancelled.len(), dropped);
        }
        self.planners.remove(world);
        self.gate.release_world(world);
    }

    /// Tasks admitted and not yet reaped, finished or not.
    pub fn active_workers(&self, world: &WorldId) -> usize {
        let Some(wq) = self.worlds.get(world) else { return 0; };
        let n = wq.in_flight.lock().len();
        n
    }

    pub fn queued(&self, world: &WorldId) -> usize {
        let Some(wq) = self.worlds.get(world) else { return 0; };
        let n = wq.queue.lock().len();
        n
    }

    pub fn queue_snapshot(&self, world: &WorldId) -> Vec<Connection> {
        let Some(wq) = self.worlds.get(world) else { return Vec::new(); };
        let snapshot = wq.queue.lock().iter().cloned().collect();
        snapshot
    }

    pub fn is_idle(&self, world: &WorldId) -> bool {
        self.queued(world) == 0 && self.active_workers(world) == 0
    }
}

/// Chunks under the straight line between the endpoints, widened by one
/// chunk on each side.
pub fn corridor_chunks(from: Coordinate, to: Coordinate) -> BTreeSet<ChunkCoord> {
    let mut out = BTreeSet::new();
    let (dx, dz) = ((to.x - from.x) as i64, (to.z - from.z) as i64);
    let samples = (dx.abs().max(dz.abs()) / (CHUNK_SIZE as i64 / 2)).max(1);
    for i in 0..=samples {
        let x = from.x as i64 + dx * i / samples;
        let z = from.z as i64 + dz * i / samples;
        let c = ChunkCoord::from_block(x as i32, z as i32);
        for ox in -1..=1 {
            for oz in -1..=1 {
                out.insert(ChunkCoord { x: c.x + ox, z: c.z + oz });
            }
        }
    }
    out
}
