use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use super::models::{Coordinate, RoadSegmentPlacement};
use super::neighbor_policy::{GridPolicy, Offset, TravelDirection};
use super::sampler::HeightSampler;

/// Tunable edge-cost constants. The defaults are empirical and have no derivation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CostWeights {
    pub straight_step: f64,
    pub diagonal_step: f64,
    pub elevation: f64,
    pub water_penalty: f64,
    pub water: f64,
    pub sea_level_penalty: f64,
    pub sea_level: f64,
    pub stability: f64,
    pub heuristic_scale: f64,
}

impl Default for CostWeights {
    fn default() -> Self {
        Self {
            straight_step: 1.0,
            diagonal_step: 1.5,
            elevation: 40.0,
            water_penalty: 50.0,
            water: 8.0,
            sea_level_penalty: 20.0,
            sea_level: 8.0,
            stability: 16.0,
            heuristic_scale: 30.0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PlanLimits {
    /// Node expansions allowed before giving up.
    pub max_steps: usize,
    pub max_height_delta: i32,
    pub max_stability: i32,
    pub ignore_water: bool,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self { max_steps: 20_000, max_height_delta: 3, max_stability: 10, ignore_water: false }
    }
}

impl PlanLimits {
    /// Looser tolerances for operator-created connections.
    pub fn relaxed() -> Self {
        Self { max_steps: 100_000, max_height_delta: 6, max_stability: 24, ignore_water: true }
    }
}

#[derive(Clone, Debug)]
struct PathNode {
    pos: Coordinate,
    parent: Option<usize>,
    g_score: f64,
    f_score: f64,
}

#[derive(Copy, Clone, Debug)]
struct OpenEntry {
    f: f64,
    g: f64,
    x: i32,
    z: i32,
    idx: usize,
}

impl PartialEq for OpenEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OpenEntry {}

impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpenEntry {
    // BinaryHeap is a max-heap: reverse every key so the smallest (f, g, x, z) pops first
    fn cmp(&self, other: &Self) -> Ordering {
        other.f.total_cmp(&self.f)
            .then_with(|| other.g.total_cmp(&self.g))
            .then_with(|| other.x.cmp(&self.x))
            .then_with(|| other.z.cmp(&self.z))
    }
}

pub struct PathPlanner {
    sampler: Arc<HeightSampler>,
    policy: GridPolicy,
    weights: CostWeights,
}

impl PathPlanner {
    pub fn new(sampler: Arc<HeightSampler>, policy: GridPolicy, weights: CostWeights) -> Self {
        Self { sampler, policy, weights }
    }

    /// Plans a road corridor from `start` toward `end`.
    ///
    /// Returns an empty list when no path is found within `limits.max_steps`
    /// expansions; that is the only failure signal.
    pub fn plan(&self, start: Coordinate, end: Coordinate, width: i32, limits: PlanLimits) -> Vec<RoadSegmentPlacement> {
        let start = self.sampler.ground(self.policy.snap(start.x), self.policy.snap(start.z));
        let goal = self.sampler.ground(self.policy.snap(end.x), self.policy.snap(end.z));
        let goal_zone = 2 * self.policy.step;
        let offsets = self.policy.neighbor_offsets();

        let mut nodes: Vec<PathNode> = Vec::new();
        let mut open: BinaryHeap<OpenEntry> = BinaryHeap::new();
        let mut best_g: HashMap<(i32, i32), f64> = HashMap::new();
        let mut closed: HashSet<(i32, i32)> = HashSet::new();

        let h0 = self.heuristic(start, goal);
        nodes.push(PathNode { pos: start, parent: None, g_score: 0.0, f_score: h0 });
        best_g.insert((start.x, start.z), 0.0);
        open.push(OpenEntry { f: h0, g: 0.0, x: start.x, z: start.z, idx: 0 });

        let mut steps = 0usize;
        while let Some(entry) = open.pop() {
            let key = (entry.x, entry.z);
            if closed.contains(&key) { continue; }
            if steps >= limits.max_steps {
                log::debug!("[planner] {} -> {}: step budget {} exhausted", start, goal, limits.max_steps);
                return Vec::new();
            }
            steps += 1;
            closed.insert(key);

            let (cur_pos, cur_g, cur_f) = {
                let n = &nodes[entry.idx];
                (n.pos, n.g_score, n.f_score)
            };
            if cur_pos.manhattan_xz(goal) < goal_zone {
                log::debug!(
                    "[planner] {} -> {}: reached goal zone after {} expansions (g={:.1} f={:.1})",
                    start, goal, steps, cur_g, cur_f
                );
                return self.reconstruct(&nodes, entry.idx, goal, width);
            }

            for &off in offsets.iter() {
                let Offset(dx, dz) = off;
                let (nx, nz) = (cur_pos.x + dx, cur_pos.z + dz);
                if closed.contains(&(nx, nz)) { continue; }
                let Some((cost, ny)) = self.edge_cost(cur_pos, nx, nz, off.is_diagonal(), &limits) else { continue; };
                let g = cur_g + cost;
                if best_g.get(&(nx, nz)).map_or(false, |&old| old <= g) { continue; }
                best_g.insert((nx, nz), g);
                let pos = Coordinate::new(nx, ny, nz);
                let f = g + self.heuristic(pos, goal);
                nodes.push(PathNode { pos, parent: Some(entry.idx), g_score: g, f_score: f });
                open.push(OpenEntry { f, g, x: nx, z: nz, idx: nodes.len() - 1 });
            }
        }

        log::debug!("[planner] {} -> {}: open set exhausted after {} expansions", start, goal, steps);
        Vec::new()
    }

    fn heuristic(&self, a: Coordinate, b: Coordinate) -> f64 {
        let dx = (a.x - b.x).abs() as f64;
        let dz = (a.z - b.z).abs() as f64;
        (dx + dz - 0.6 * dx.min(dz)) * self.weights.heuristic_scale
    }

    /// Cost of stepping from `from` to grid cell (nx, nz), or None when the move is infeasible.
    fn edge_cost(&self, from: Coordinate, nx: i32, nz: i32, diagonal: bool, limits: &PlanLimits) -> Option<(f64, i32)> {
        let w = &self.weights;
        let h = self.sampler.height_at(nx, nz);
        let delta = (h - from.y).abs();
        if delta > limits.max_height_delta { return None; }
        let stability = self.stability_at(nx, nz, h);
        if stability > limits.max_stability { return None; }

        let water = if !limits.ignore_water && self.sampler.biome_cost_at(Coordinate::new(nx, h, nz)).is_water {
            w.water_penalty
        } else {
            0.0
        };
        let sea = if h == self.sampler.sea_level() { w.sea_level_penalty } else { 0.0 };
        let step = if diagonal { w.diagonal_step } else { w.straight_step };

        let cost = step
            + delta as f64 * w.elevation
            + water * w.water
            + sea * w.sea_level
            + stability as f64 * w.stability;
        Some((cost, h))
    }

    fn stability_at(&self, x: i32, z: i32, h: i32) -> i32 {
        [(1, 0), (-1, 0), (0, 1), (0, -1)]
            .iter()
            .map(|&(dx, dz)| (self.sampler.height_at(x + dx, z + dz) - h).abs())
            .sum()
    }

    fn reconstruct(&self, nodes: &[PathNode], last: usize, goal: Coordinate, width: i32) -> Vec<RoadSegmentPlacement> {
        let mut waypoints: Vec<Coordinate> = Vec::new();
        let mut cur = Some(last);
        while let Some(i) = cur {
            waypoints.push(nodes[i].pos);
            cur = nodes[i].parent;
        }
        waypoints.reverse();

        // (x, z, direction) for every cell on the center line
        let mut cells: Vec<(i32, i32, TravelDirection)> = Vec::with_capacity(waypoints.len() * self.policy.step as usize);
        let mut last_dir = match waypoints.first() {
            Some(&p) => TravelDirection::classify(goal.x - p.x, goal.z - p.z),
            None => return Vec::new(),
        };
        for pair in waypoints.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let (dx, dz) = (b.x - a.x, b.z - a.z);
            let dir = TravelDirection::classify(dx, dz);
            let (ux, uz) = (dx.signum(), dz.signum());
            let n = dx.abs().max(dz.abs());
            for i in 0..n {
                cells.push((a.x + ux * i, a.z + uz * i, dir));
            }
            last_dir = dir;
        }
        if let Some(&end) = waypoints.last() {
            cells.push((end.x, end.z, last_dir));
        }

        let radius = width.max(1) / 2;
        let mut claimed: HashSet<(i32, i32)> = HashSet::new();
        let mut segments: Vec<RoadSegmentPlacement> = Vec::with_capacity(cells.len());
        for (x, z, dir) in cells {
            let mut width_positions: BTreeSet<Coordinate> = BTreeSet::new();
            for (fx, fz) in footprint(x, z, dir, radius) {
                if claimed.insert((fx, fz)) {
                    width_positions.insert(self.sampler.ground(fx, fz));
                }
            }
            segments.push(RoadSegmentPlacement { center: self.sampler.ground(x, z), width_positions });
        }
        segments
    }
}

/// Cross-section cells around (x, z) for a road travelling in `dir`.
fn footprint(x: i32, z: i32, dir: TravelDirection, radius: i32) -> Vec<(i32, i32)> {
    let Offset(px, pz) = dir.perpendicular();
    let mut out = Vec::with_capacity((radius as usize) * 4 + 1);
    for k in -radius..=radius {
        out.push((x + k * px, z + k * pz));
    }
    if dir.is_diagonal() {
        // diagonal cross-sections leave a checkerboard gap; fill it on the +x side
        for k in -radius..radius {
            out.push((x + k * px + 1, z + k * pz));
        }
    }
    out
}
