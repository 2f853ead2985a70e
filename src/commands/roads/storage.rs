use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection as SqlConnection, Row};
use std::path::Path;

use super::db;
use super::models::{Connection, Coordinate, MaterialPalette, Poi, RoadData, RoadSegmentPlacement, Status, WorldId};
use super::registry::WorldRegistry;

/// World-scoped list of discovered POIs.
pub trait PoiRegistry: Send + Sync {
    fn pois(&self, world: &WorldId) -> Result<Vec<Poi>>;
    /// Returns false when a POI already sits at the same position.
    fn append_poi(&self, world: &WorldId, poi: Poi) -> Result<bool>;
}

/// World-scoped connection and road lists.
///
/// Getters hand out copies; callers mutate the copy and write the whole list back.
pub trait RoadStorage: Send + Sync {
    fn connections(&self, world: &WorldId) -> Result<Vec<Connection>>;
    fn set_connections(&self, world: &WorldId, connections: Vec<Connection>) -> Result<()>;
    fn road_data(&self, world: &WorldId) -> Result<Vec<RoadData>>;
    fn set_road_data(&self, world: &WorldId, roads: Vec<RoadData>) -> Result<()>;
}

#[derive(Default)]
struct WorldData {
    pois: Vec<Poi>,
    connections: Vec<Connection>,
    roads: Vec<RoadData>,
}

/// In-process storage, lost on exit.
#[derive(Default)]
pub struct MemoryStorage {
    worlds: WorldRegistry<Mutex<WorldData>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn world(&self, world: &WorldId) -> std::sync::Arc<Mutex<WorldData>> {
        self.worlds.get_or_insert_with(world, || Mutex::new(WorldData::default()))
    }
}

impl PoiRegistry for MemoryStorage {
    fn pois(&self, world: &WorldId) -> Result<Vec<Poi>> {
        Ok(self.world(world).lock().pois.clone())
    }

    fn append_poi(&self, world: &WorldId, poi: Poi) -> Result<bool> {
        let w = self.world(world);
        let mut data = w.lock();
        if data.pois.iter().any(|p| p.pos == poi.pos) {
            return Ok(false);
        }
        data.pois.push(poi);
        Ok(true)
    }
}

impl RoadStorage for MemoryStorage {
    fn connections(&self, world: &WorldId) -> Result<Vec<Connection>> {
        Ok(self.world(world).lock().connections.clone())
    }

    fn set_connections(&self, world: &WorldId, connections: Vec<Connection>) -> Result<()> {
        self.world(world).lock().connections = connections;
        Ok(())
    }

    fn road_data(&self, world: &WorldId) -> Result<Vec<RoadData>> {
        Ok(self.world(world).lock().roads.clone())
    }

    fn set_road_data(&self, world: &WorldId, roads: Vec<RoadData>) -> Result<()> {
        self.world(world).lock().roads = roads;
        Ok(())
    }
}

/// SQLite-backed storage; one connection serialized behind a mutex.
pub struct SqliteStorage {
    conn: Mutex<SqlConnection>,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> Result<Self> {
        let mut conn = db::open_rw(path)?;
        db::ensure_schema(&mut conn).with_context(|| format!("prepare schema in {}", path.display()))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn from_connection(mut conn: SqlConnection) -> Result<Self> {
        db::ensure_schema(&mut conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Worlds that have any persisted state.
    pub fn worlds(&self) -> Result<Vec<WorldId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT world FROM pois UNION SELECT world FROM connections UNION SELECT world FROM road_data ORDER BY 1",
        )?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(WorldId::new(r?));
        }
        Ok(out)
    }
}

fn coord_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Coordinate> {
    Ok(Coordinate::new(row.get(idx)?, row.get(idx + 1)?, row.get(idx + 2)?))
}

impl PoiRegistry for SqliteStorage {
    fn pois(&self, world: &WorldId) -> Result<Vec<Poi>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT x, y, z, kind FROM pois WHERE world=?1 ORDER BY seq")?;
        let rows = stmt.query_map([world.as_str()], |r| Ok(Poi::new(coord_at(r, 0)?, r.get::<_, String>(3)?)))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    fn append_poi(&self, world: &WorldId, poi: Poi) -> Result<bool> {
        let mut conn = self.conn.lock();
        db::with_tx(&mut conn, |tx| {
            let n = tx.execute(
                "INSERT OR IGNORE INTO pois(world, x, y, z, kind, seq)
                 VALUES (?1, ?2, ?3, ?4, ?5, (SELECT COALESCE(MAX(seq), -1) + 1 FROM pois WHERE world=?1))",
                params![world.as_str(), poi.pos.x, poi.pos.y, poi.pos.z, poi.kind],
            )?;
            Ok(n > 0)
        })
    }
}

impl RoadStorage for SqliteStorage {
    fn connections(&self, world: &WorldId) -> Result<Vec<Connection>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT from_x, from_y, from_z, to_x, to_y, to_z, status, manual
             FROM connections WHERE world=?1 ORDER BY seq",
        )?;
        let mut rows = stmt.query([world.as_str()])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            let status: String = r.get(6)?;
            let status = Status::from_key(&status)
                .with_context(|| format!("unknown connection status {:?} in world {}", status, world))?;
            out.push(Connection {
                from: coord_at(r, 0)?,
                to: coord_at(r, 3)?,
                status,
                manual: r.get::<_, i64>(7)? != 0,
            });
        }
        Ok(out)
    }

    fn set_connections(&self, world: &WorldId, connections: Vec<Connection>) -> Result<()> {
        let mut conn = self.conn.lock();
        db::with_tx(&mut conn, |tx| {
            tx.execute("DELETE FROM connections WHERE world=?1", [world.as_str()])?;
            let mut stmt = tx.prepare(
                "INSERT INTO connections(world, seq, from_x, from_y, from_z, to_x, to_y, to_z, status, manual)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for (seq, c) in connections.iter().enumerate() {
                stmt.execute(params![
                    world.as_str(),
                    seq as i64,
                    c.from.x,
                    c.from.y,
                    c.from.z,
                    c.to.x,
                    c.to.y,
                    c.to.z,
                    c.status.key(),
                    c.manual as i64,
                ])?;
            }
            Ok(())
        })
    }

    fn road_data(&self, world: &WorldId) -> Result<Vec<RoadData>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT from_x, from_y, from_z, to_x, to_y, to_z, width, road_type, materials, segments
             FROM road_data WHERE world=?1 ORDER BY seq",
        )?;
        let mut rows = stmt.query([world.as_str()])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            let materials: String = r.get(8)?;
            let segments: String = r.get(9)?;
            let materials: Vec<MaterialPalette> =
                serde_json::from_str(&materials).context("decode road materials")?;
            let segments: Vec<RoadSegmentPlacement> =
                serde_json::from_str(&segments).context("decode road segments")?;
            out.push(RoadData {
                from: coord_at(r, 0)?,
                to: coord_at(r, 3)?,
                width: r.get(6)?,
                road_type: r.get(7)?,
                materials,
                segments,
            });
        }
        Ok(out)
    }

    fn set_road_data(&self, world: &WorldId, roads: Vec<RoadData>) -> Result<()> {
        let mut conn = self.conn.lock();
        db::with_tx(&mut conn, |tx| {
            tx.execute("DELETE FROM road_data WHERE world=?1", [world.as_str()])?;
            let mut stmt = tx.prepare(
                "INSERT INTO road_data(world, seq, from_x, from_y, from_z, to_x, to_y, to_z, width, road_type, materials, segments)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for (seq, road) in roads.iter().enumerate() {
                let materials = serde_json::to_string(&road.materials)?;
                let segments = serde_json::to_string(&road.segments)?;
                stmt.execute(params![
                    world.as_str(),
                    seq as i64,
                    road.from.x,
                    road.from.y,
                    road.from.z,
                    road.to.x,
                    road.to.y,
                    road.to.z,
                    road.width,
                    road.road_type,
                    materials,
                    segments,
                ])?;
            }
            Ok(())
        })
    }
}
