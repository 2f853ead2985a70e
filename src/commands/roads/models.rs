use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Horizontal size of a world chunk in blocks.
pub const CHUNK_SIZE: i32 = 16;
const CHUNK_SHIFT: i32 = 4;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Coordinate {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn chunk(self) -> ChunkCoord {
        ChunkCoord::from_block(self.x, self.z)
    }

    /// Squared distance in the horizontal plane.
    pub fn horizontal_dist_sq(self, other: Coordinate) -> i64 {
        let dx = (self.x - other.x) as i64;
        let dz = (self.z - other.z) as i64;
        dx * dx + dz * dz
    }

    pub fn manhattan_xz(self, other: Coordinate) -> i32 {
        (self.x - other.x).abs() + (self.z - other.z).abs()
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub x: i32,
    pub z: i32,
}

impl ChunkCoord {
    pub fn from_block(x: i32, z: i32) -> Self {
        // arithmetic shift floors toward negative infinity
        Self { x: x >> CHUNK_SHIFT, z: z >> CHUNK_SHIFT }
    }
}

/// Opaque handle identifying one loaded world.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct WorldId(pub String);

impl WorldId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Poi {
    pub pos: Coordinate,
    pub kind: String,
}

impl Poi {
    pub fn new(pos: Coordinate, kind: impl Into<String>) -> Self {
        Self { pos, kind: kind.into() }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Status {
    Planned,
    Generating,
    Completed,
    Failed,
}

impl Status {
    pub fn key(self) -> &'static str {
        match self {
            Status::Planned => "PLANNED",
            Status::Generating => "GENERATING",
            Status::Completed => "COMPLETED",
            Status::Failed => "FAILED",
        }
    }

    pub fn from_key(s: &str) -> Option<Status> {
        match s {
            "PLANNED" => Some(Status::Planned),
            "GENERATING" => Some(Status::Generating),
            "COMPLETED" => Some(Status::Completed),
            "FAILED" => Some(Status::Failed),
            _ => None,
        }
    }

    /// Forward edges of the lifecycle. The load-time reset of GENERATING back
    /// to PLANNED is not an edge; it goes through `Connection::reset_after_restart`.
    pub fn can_transition_to(self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Planned, Status::Generating)
                | (Status::Generating, Status::Completed)
                | (Status::Generating, Status::Failed)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub from: Coordinate,
    pub to: Coordinate,
    pub status: Status,
    pub manual: bool,
}

impl Connection {
    pub fn planned(from: Coordinate, to: Coordinate) -> Self {
        Self { from, to, status: Status::Planned, manual: false }
    }

    pub fn manual(from: Coordinate, to: Coordinate) -> Self {
        Self { from, to, status: Status::Planned, manual: true }
    }

    /// Unordered pair identity: (a,b) and (b,a) share a key.
    pub fn pair_key(&self) -> PairKey {
        PairKey::new(self.from, self.to)
    }

    pub fn same_pair(&self, other: &Connection) -> bool {
        self.pair_key() == other.pair_key()
    }

    pub fn reset_after_restart(&mut self) -> bool {
        if self.status == Status::Generating {
            self.status = Status::Planned;
            true
        } else {
            false
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PairKey(pub Coordinate, pub Coordinate);

impl PairKey {
    pub fn new(a: Coordinate, b: Coordinate) -> Self {
        if a <= b { PairKey(a, b) } else { PairKey(b, a) }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RoadSegmentPlacement {
    pub center: Coordinate,
    pub width_positions: BTreeSet<Coordinate>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MaterialPalette {
    pub name: String,
    pub blocks: Vec<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RoadData {
    pub from: Coordinate,
    pub to: Coordinate,
    pub width: i32,
    pub road_type: i32,
    pub materials: Vec<MaterialPalette>,
    pub segments: Vec<RoadSegmentPlacement>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_coord_floors_negative_blocks() {
        assert_eq!(ChunkCoord::from_block(0, 15), ChunkCoord { x: 0, z: 0 });
        assert_eq!(ChunkCoord::from_block(16, -1), ChunkCoord { x: 1, z: -1 });
        assert_eq!(ChunkCoord::from_block(-16, -17), ChunkCoord { x: -1, z: -2 });
    }

    #[test]
    fn pair_key_is_unordered() {
        let a = Coordinate::new(0, 64, 0);
        let b = Coordinate::new(100, 70, -20);
        assert_eq!(PairKey::new(a, b), PairKey::new(b, a));
        assert!(Connection::planned(a, b).same_pair(&Connection::manual(b, a)));
    }

    #[test]
    fn lifecycle_edges() {
        assert!(Status::Planned.can_transition_to(Status::Generating));
        assert!(Status::Generating.can_transition_to(Status::Completed));
        assert!(Status::Generating.can_transition_to(Status::Failed));
        assert!(!Status::Planned.can_transition_to(Status::Completed));
        assert!(!Status::Completed.can_transition_to(Status::Failed));
        assert!(!Status::Failed.can_transition_to(Status::Planned));
        for s in [Status::Planned, Status::Generating, Status::Completed, Status::Failed] {
            assert_eq!(Status::from_key(s.key()), Some(s));
        }
    }

    #[test]
    fn restart_reset_only_touches_generating() {
        let mut c = Connection::planned(Coordinate::new(0, 0, 0), Coordinate::new(1, 0, 1));
        c.status = Status::Generating;
        assert!(c.reset_after_restart());
        assert_eq!(c.status, Status::Planned);
        c.status = Status::Failed;
        assert!(!c.reset_after_restart());
        assert_eq!(c.status, Status::Failed);
    }
}
