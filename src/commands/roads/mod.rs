use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub mod config;
pub mod logging;
pub mod db;
pub mod models;
pub mod neighbor_policy;
pub mod terrain;
pub mod sampler;
pub mod path_planner;
pub mod registry;
pub mod chunk_gate;
pub mod worker_pool;
pub mod storage;
pub mod placement;
pub mod locator;
pub mod scheduler;
pub mod network;

use chunk_gate::{extract_affected_chunks, ChunkReleaseGate};
use locator::{FixedWorldView, Locator, PoiCatalog, StructureSearch, WorldView};
use models::{Coordinate, Status, WorldId};
use network::RoadNetwork;
use path_planner::PathPlanner;
use placement::StaticPlacement;
use sampler::{HeightCache, HeightSampler};
use scheduler::ConnectionScheduler;
use storage::{MemoryStorage, PoiRegistry, RoadStorage, SqliteStorage};
use terrain::{FlatTerrain, HeightmapTerrain, TerrainProvider, UniformTerrain};

#[derive(Args, Debug, Clone, Default)]
pub struct CommonOpts {
    /// SQLite DB holding POIs, connections and roads (default: repo_root/roads.db or ROADS_DB)
    #[arg(long = "db")]
    pub db: Option<PathBuf>,
    /// World name (default: overworld or ROADS_WORLD)
    #[arg(long = "world")]
    pub world: Option<String>,
    /// Heightmap JSON; flat terrain at y=64 when omitted
    #[arg(long = "heightmap")]
    pub heightmap: Option<PathBuf>,
    /// Planner threads per world
    #[arg(long = "threads")]
    pub threads: Option<usize>,
    /// Planner tasks in flight per world
    #[arg(long = "max-concurrency")]
    pub max_concurrency: Option<usize>,
    /// Road width in blocks
    #[arg(long = "width")]
    pub width: Option<i32>,
    /// Search grid step in blocks
    #[arg(long = "grid-step")]
    pub grid_step: Option<i32>,
    /// Planner expansion budget
    #[arg(long = "max-steps")]
    pub max_steps: Option<usize>,
    /// Route straight through water
    #[arg(long = "ignore-water")]
    pub ignore_water: bool,
    /// Dry run: plan in memory, no DB reads or writes
    #[arg(long = "dry-run")]
    pub dry_run: bool,
    /// Log level (trace|debug|info|warn|error)
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum RoadsCommand {
    /// Plan a single route and print its shape
    #[command(name = "plan")]
    Plan {
        #[arg(long, value_parser = coord_arg)]
        from: Coordinate,
        #[arg(long, value_parser = coord_arg)]
        to: Coordinate,
    },
    /// Discover POIs from a catalog and build roads until idle
    #[command(name = "exec")]
    Exec {
        /// POI catalog JSON searched by the locator
        #[arg(long)]
        catalog: PathBuf,
        /// World spawn as x,y,z
        #[arg(long, value_parser = coord_arg, default_value = "0,64,0")]
        spawn: Coordinate,
        /// POIs requested per discovery round
        #[arg(long, default_value_t = 8)]
        discover: usize,
        /// Discovery rounds queued before running
        #[arg(long, default_value_t = 1)]
        rounds: usize,
        /// Give up after this many ticks
        #[arg(long, default_value_t = 200_000)]
        max_ticks: usize,
    },
    /// Print connection and road counts
    #[command(name = "status")]
    Status,
    /// Re-enqueue a FAILED connection as manual
    #[command(name = "requeue")]
    Requeue {
        #[arg(long, value_parser = coord_arg)]
        from: Coordinate,
        #[arg(long, value_parser = coord_arg)]
        to: Coordinate,
    },
}

fn coord_arg(s: &str) -> std::result::Result<Coordinate, String> {
    config::parse_coord(s).ok_or_else(|| format!("expected x,y,z or x,z, got {:?}", s))
}

pub fn resolve_config(common: &CommonOpts) -> config::Config {
    // Start with CLI, then overlay env (env > CLI precedence)
    let mut cfg = config::Config {
        db: common.db.clone(),
        world: common.world.clone(),
        threads: common.threads,
        max_concurrency: common.max_concurrency,
        width: common.width,
        grid_step: common.grid_step,
        max_steps: common.max_steps,
        ignore_water: common.ignore_water,
        dry_run: common.dry_run,
        log_level: common.log_level.clone(),
        ..config::Config::default()
    };
    cfg.overlay(config::Config::from_env_defaults());
    cfg
}

pub fn cmd_roads(common: CommonOpts, sub: RoadsCommand) -> Result<()> {
    let cfg = resolve_config(&common);
    logging::init(cfg.log_level.as_deref());

    let world = WorldId::new(cfg.world_name());
    let db_path = cfg.db.clone().unwrap_or_else(crate::util::default_db_path);
    let terrain: Arc<dyn TerrainProvider> = match &common.heightmap {
        Some(p) => Arc::new(HeightmapTerrain::load(p)?),
        None => Arc::new(FlatTerrain::new(64)),
    };

    match sub {
        RoadsCommand::Plan { from, to } => {
            let cache = Arc::new(HeightCache::new(cfg.height_cache_limit()));
            let sampler = Arc::new(HeightSampler::new(&world, terrain, cache));
            let sched = cfg.scheduler_config();
            let planner = PathPlanner::new(sampler, sched.grid, sched.weights);
            let segments = planner.plan(from, to, sched.width, sched.limits);
            if segments.is_empty() {
                println!("No path from {} to {} within {} steps", from, to, sched.limits.max_steps);
                return Ok(());
            }
            let cells: usize = segments.iter().map(|s| s.width_positions.len()).sum();
            let chunks = extract_affected_chunks(&segments);
            println!("Path {} -> {}", from, to);
            println!("  segments : {}", segments.len());
            println!("  cells    : {}", cells);
            println!("  chunks   : {}", chunks.len());
            if let (Some(first), Some(last)) = (segments.first(), segments.last()) {
                println!("  centers  : {} .. {}", first.center, last.center);
            }
            Ok(())
        }
        RoadsCommand::Exec { catalog, spawn, discover, rounds, max_ticks } => {
            let catalog = Arc::new(PoiCatalog::load(&catalog)?);
            let view = Arc::new(FixedWorldView::new().with_spawn(&world, spawn));
            let summary = if cfg.dry_run {
                let store = Arc::new(MemoryStorage::new());
                let net = build_network(&cfg, store.clone(), terrain, catalog, view);
                let s = drive(&net, &world, discover, rounds, max_ticks)?;
                print_status(&world, store.as_ref())?;
                s
            } else {
                let store = Arc::new(
                    SqliteStorage::open(&db_path).with_context(|| format!("open roads DB {}", db_path.display()))?,
                );
                let net = build_network(&cfg, store.clone(), terrain, catalog, view);
                let s = drive(&net, &world, discover, rounds, max_ticks)?;
                print_status(&world, store.as_ref())?;
                s
            };
            if !summary.idle {
                log::warn!("[roads] stopped after {} ticks with work still pending", summary.ticks);
            }
            Ok(())
        }
        RoadsCommand::Status => {
            let store = SqliteStorage::open(&db_path)?;
            let worlds = match &cfg.world {
                Some(_) => vec![world],
                None => store.worlds()?,
            };
            for w in worlds {
                print_status(&w, &store)?;
            }
            Ok(())
        }
        RoadsCommand::Requeue { from, to } => {
            let store = Arc::new(SqliteStorage::open(&db_path)?);
            let sched = ConnectionScheduler::new(
                store.clone(),
                store,
                Arc::new(StaticPlacement::default()),
                Arc::new(UniformTerrain(terrain)),
                Arc::new(HeightCache::new(cfg.height_cache_limit())),
                Arc::new(ChunkReleaseGate::new(cfg.gate_timings())),
                cfg.scheduler_config(),
            );
            if sched.requeue_manual(&world, from, to)? {
                println!("Requeued {} -> {} as manual; it runs on the next exec", from, to);
            } else {
                println!("Nothing to requeue for {} -> {}", from, to);
            }
            Ok(())
        }
    }
}

/// Wires a `RoadNetwork` over one store acting as both POI registry and road storage.
pub fn build_network<S>(
    cfg: &config::Config,
    store: Arc<S>,
    terrain: Arc<dyn TerrainProvider>,
    search: Arc<dyn StructureSearch>,
    view: Arc<dyn WorldView>,
) -> RoadNetwork
where
    S: PoiRegistry + RoadStorage + 'static,
{
    let gate = Arc::new(ChunkReleaseGate::new(cfg.gate_timings()));
    let scheduler = Arc::new(ConnectionScheduler::new(
        store.clone(),
        store.clone(),
        Arc::new(StaticPlacement::default()),
        Arc::new(UniformTerrain(terrain)),
        Arc::new(HeightCache::new(cfg.height_cache_limit())),
        gate.clone(),
        cfg.scheduler_config(),
    ));
    let locator = Locator::new(search, view, store, cfg.locator_config());
    RoadNetwork::new(scheduler, locator, gate)
}

fn drive(net: &RoadNetwork, world: &WorldId, discover: usize, rounds: usize, max_ticks: usize) -> Result<network::RunSummary> {
    let resumed = net.on_world_load(world)?;
    if resumed > 0 {
        println!("Resuming {} planned connections in {}", resumed, world);
    }
    for _ in 0..rounds {
        net.discover(world, discover, false);
    }
    let summary = net.run_until_idle(world, max_ticks, Duration::from_millis(2));
    net.on_world_unload(world);
    Ok(summary)
}

fn print_status<S: RoadStorage>(world: &WorldId, store: &S) -> Result<()> {
    let conns = store.connections(world)?;
    let roads = store.road_data(world)?;
    let mut by_status: BTreeMap<&'static str, usize> = BTreeMap::new();
    for c in &conns {
        *by_status.entry(c.status.key()).or_default() += 1;
    }
    println!("World {}", world);
    for s in [Status::Planned, Status::Generating, Status::Completed, Status::Failed] {
        println!("  {:<10}: {}", s.key(), by_status.get(s.key()).copied().unwrap_or(0));
    }
    println!("  roads     : {}", roads.len());
    for c in conns.iter().filter(|c| c.status == Status::Failed) {
        println!("  failed    : {} -> {}{}", c.from, c.to, if c.manual { " (manual)" } else { "" });
    }
    Ok(())
}
