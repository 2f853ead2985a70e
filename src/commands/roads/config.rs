use std::{env, path::PathBuf, str::FromStr, time::Duration};

use super::chunk_gate::GateTimings;
use super::locator::LocatorConfig;
use super::models::Coordinate;
use super::neighbor_policy::GridPolicy;
use super::path_planner::{CostWeights, PlanLimits};
use super::sampler::DEFAULT_HEIGHT_CACHE_LIMIT;
use super::scheduler::SchedulerConfig;

#[derive(Clone, Debug, Default)]
pub struct Config {
    pub db: Option<PathBuf>,
    pub world: Option<String>,
    pub threads: Option<usize>,
    pub max_concurrency: Option<usize>,
    pub width: Option<i32>,
    pub road_type: Option<i32>,
    pub grid_step: Option<i32>,
    pub max_steps: Option<usize>,
    pub max_height_delta: Option<i32>,
    pub max_stability: Option<i32>,
    pub ignore_water: bool,
    pub locate_per_tick: Option<usize>,
    pub ring_radius: Option<i32>,
    pub ring_multiples: Option<i32>,
    pub search_radius: Option<i32>,
    pub max_pair_distance: Option<i32>,
    pub height_cache_limit: Option<usize>,
    pub chunk_timeout_secs: Option<u64>,
    pub chunk_grace_secs: Option<u64>,
    pub dry_run: bool,
    pub log_level: Option<String>,
}

impl Config {
    pub fn from_env_defaults() -> Self {
        Self {
            db: env::var("ROADS_DB").ok().map(PathBuf::from),
            world: env::var("ROADS_WORLD").ok().filter(|s| !s.trim().is_empty()),
            threads: env_num("ROADS_THREADS"),
            max_concurrency: env_num("ROADS_MAX_CONCURRENCY"),
            width: env_num("ROADS_WIDTH"),
            road_type: env_num("ROADS_ROAD_TYPE"),
            grid_step: env_num("ROADS_GRID_STEP"),
            max_steps: env_num("ROADS_MAX_STEPS"),
            max_height_delta: env_num("ROADS_MAX_HEIGHT_DELTA"),
            max_stability: env_num("ROADS_MAX_STABILITY"),
            ignore_water: env_flag("ROADS_IGNORE_WATER"),
            locate_per_tick: env_num("ROADS_LOCATE_PER_TICK"),
            ring_radius: env_num("ROADS_RING_RADIUS"),
            ring_multiples: env_num("ROADS_RING_MULTIPLES"),
            search_radius: env_num("ROADS_SEARCH_RADIUS"),
            max_pair_distance: env_num("ROADS_MAX_PAIR_DISTANCE"),
            height_cache_limit: env_num("ROADS_HEIGHT_CACHE_LIMIT"),
            chunk_timeout_secs: env_num("ROADS_CHUNK_TIMEOUT_SECS"),
            chunk_grace_secs: env_num("ROADS_CHUNK_GRACE_SECS"),
            dry_run: env_flag("ROADS_DRY_RUN"),
            log_level: env::var("ROADS_LOG_LEVEL").ok(),
        }
    }

    /// Fields set in `other` win; flags are OR-ed.
    pub fn overlay(&mut self, other: Config) {
        macro_rules! take {
            ($($f:ident),*) => { $( if other.$f.is_some() { self.$f = other.$f; } )* };
        }
        take!(
            db, world, threads, max_concurrency, width, road_type, grid_step, max_steps, max_height_delta,
            max_stability, locate_per_tick, ring_radius, ring_multiples, search_radius, max_pair_distance,
            height_cache_limit, chunk_timeout_secs, chunk_grace_secs, log_level
        );
        self.ignore_water |= other.ignore_water;
        self.dry_run |= other.dry_run;
    }

    pub fn world_name(&self) -> &str {
        self.world.as_deref().unwrap_or("overworld")
    }

    pub fn plan_limits(&self) -> PlanLimits {
        let d = PlanLimits::default();
        PlanLimits {
            max_steps: self.max_steps.unwrap_or(d.max_steps),
            max_height_delta: self.max_height_delta.unwrap_or(d.max_height_delta),
            max_stability: self.max_stability.unwrap_or(d.max_stability),
            ignore_water: self.ignore_water || d.ignore_water,
        }
    }

    pub fn grid(&self) -> GridPolicy {
        self.grid_step.map(GridPolicy::new).unwrap_or_default()
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let d = SchedulerConfig::default();
        SchedulerConfig {
            max_concurrency: self.max_concurrency.unwrap_or(d.max_concurrency).max(1),
            threads: self.threads.unwrap_or(d.threads).max(1),
            width: self.width.unwrap_or(d.width).max(1),
            road_type: self.road_type.unwrap_or(d.road_type),
            limits: self.plan_limits(),
            manual_limits: d.manual_limits,
            max_pair_distance: self.max_pair_distance.or(d.max_pair_distance),
            grid: self.grid(),
            weights: CostWeights::default(),
        }
    }

    pub fn locator_config(&self) -> LocatorConfig {
        let d = LocatorConfig::default();
        LocatorConfig {
            per_tick: self.locate_per_tick.unwrap_or(d.per_tick).max(1),
            search_radius: self.search_radius.unwrap_or(d.search_radius),
            ring_radius: self.ring_radius.unwrap_or(d.ring_radius),
            ring_multiples: self.ring_multiples.unwrap_or(d.ring_multiples),
        }
    }

    pub fn gate_timings(&self) -> GateTimings {
        let d = GateTimings::default();
        GateTimings {
            release_timeout: self.chunk_timeout_secs.map(Duration::from_secs).unwrap_or(d.release_timeout),
            removal_grace: self.chunk_grace_secs.map(Duration::from_secs).unwrap_or(d.removal_grace),
        }
    }

    pub fn height_cache_limit(&self) -> usize {
        self.height_cache_limit.unwrap_or(DEFAULT_HEIGHT_CACHE_LIMIT)
    }
}

fn env_num<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn env_flag(key: &str) -> bool {
    env::var(key).ok().map(|v| parse_flag(&v)).unwrap_or(false)
}

fn parse_flag(v: &str) -> bool {
    let v = v.trim();
    v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes")
}

/// `x,y,z` or `x,z` (y defaults to 64).
pub fn parse_coord(input: &str) -> Option<Coordinate> {
    let parts = input
        .split(',')
        .map(|p| p.trim().parse::<i32>().ok())
        .collect::<Option<Vec<_>>>()?;
    match parts.as_slice() {
        [x, y, z] => Some(Coordinate::new(*x, *y, *z)),
        [x, z] => Some(Coordinate::new(*x, 64, *z)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_coord_and_flag() {
        assert_eq!(parse_coord("1, 70,-3"), Some(Coordinate::new(1, 70, -3)));
        assert_eq!(parse_coord("5,-9"), Some(Coordinate::new(5, 64, -9)));
        assert_eq!(parse_coord("bad"), None);
        assert_eq!(parse_coord("1,2,3,4"), None);
        assert!(parse_flag("TRUE"));
        assert!(!parse_flag("0"));
    }

    #[test]
    fn test_overlay_and_derived_configs() {
        let mut cfg = Config { width: Some(5), max_steps: Some(10), ..Config::default() };
        cfg.overlay(Config { width: Some(7), dry_run: true, ..Config::default() });
        assert_eq!(cfg.width, Some(7));
        assert_eq!(cfg.max_steps, Some(10));
        assert!(cfg.dry_run);

        let s = cfg.scheduler_config();
        assert_eq!(s.width, 7);
        assert_eq!(s.limits.max_steps, 10);
        assert_eq!(s.limits.max_height_delta, PlanLimits::default().max_height_delta);
        assert_eq!(cfg.gate_timings(), GateTimings::default());
        assert_eq!(cfg.world_name(), "overworld");
    }

    #[test]
    fn test_width_below_one_is_clamped() {
        for w in [0, -3] {
            let cfg = Config { width: Some(w), ..Config::default() };
            assert_eq!(cfg.scheduler_config().width, 1);
        }
    }

    #[test]
    fn test_from_env_defaults_reads_values() {
        std::env::set_var("ROADS_DB", "/tmp/roads.db");
        std::env::set_var("ROADS_WORLD", "nether");
        std::env::set_var("ROADS_THREADS", "8");
        std::env::set_var("ROADS_MAX_CONCURRENCY", "3");
        std::env::set_var("ROADS_GRID_STEP", "8");
        std::env::set_var("ROADS_IGNORE_WATER", "1");
        std::env::set_var("ROADS_CHUNK_TIMEOUT_SECS", "12");
        std::env::set_var("ROADS_DRY_RUN", "true");
        std::env::set_var("ROADS_LOG_LEVEL", "debug");

        let cfg = Config::from_env_defaults();
        assert_eq!(cfg.db.as_ref().unwrap().to_string_lossy(), "/tmp/roads.db");
        assert_eq!(cfg.world_name(), "nether");
        assert_eq!(cfg.threads, Some(8));
        assert_eq!(cfg.scheduler_config().max_concurrency, 3);
        assert_eq!(cfg.grid().step, 8);
        assert!(cfg.plan_limits().ignore_water);
        assert_eq!(cfg.gate_timings().release_timeout, Duration::from_secs(12));
        assert!(cfg.dry_run);
        assert_eq!(cfg.log_level.as_deref(), Some("debug"));

        // cleanup
        for k in [
            "ROADS_DB",
            "ROADS_WORLD",
            "ROADS_THREADS",
            "ROADS_MAX_CONCURRENCY",
            "ROADS_GRID_STEP",
            "ROADS_IGNORE_WATER",
            "ROADS_CHUNK_TIMEOUT_SECS",
            "ROADS_DRY_RUN",
            "ROADS_LOG_LEVEL",
        ] {
            std::env::remove_var(k);
        }
    }
}
