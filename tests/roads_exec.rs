use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

use roadnet::commands::roads::build_network;
use roadnet::commands::roads::config::Config;
use roadnet::commands::roads::locator::{FixedWorldView, PoiCatalog};
use roadnet::commands::roads::models::{Connection, Coordinate, Poi, Status, WorldId};
use roadnet::commands::roads::storage::{PoiRegistry, RoadStorage, SqliteStorage};
use roadnet::commands::roads::terrain::FlatTerrain;

fn world() -> WorldId {
    WorldId::new("overworld")
}

fn catalog() -> PoiCatalog {
    let mut c = PoiCatalog::default();
    c.insert(&world(), Poi::new(Coordinate::new(10, 64, 10), "village"));
    c.insert(&world(), Poi::new(Coordinate::new(180, 64, 30), "village"));
    c.insert(&world(), Poi::new(Coordinate::new(-170, 64, -20), "outpost"));
    c
}

fn config() -> Config {
    Config { ring_radius: Some(160), ring_multiples: Some(1), search_radius: Some(120), ..Config::default() }
}

#[test]
fn discovered_pois_become_persisted_roads() -> Result<()> {
    let dbf = NamedTempFile::new()?;
    let store = Arc::new(SqliteStorage::open(dbf.path())?);
    let view = Arc::new(FixedWorldView::new().with_spawn(&world(), Coordinate::new(0, 64, 0)));
    let net = build_network(&config(), store.clone(), Arc::new(FlatTerrain::new(64)), Arc::new(catalog()), view);

    net.on_world_load(&world())?;
    net.discover(&world(), 5, false);
    let summary = net.run_until_idle(&world(), 50_000, Duration::from_millis(1));
    assert!(summary.idle);
    net.on_world_unload(&world());

    // reopen to read what actually hit disk
    drop(net);
    drop(store);
    let store = SqliteStorage::open(dbf.path())?;
    assert_eq!(store.pois(&world())?.len(), 3);
    let conns = store.connections(&world())?;
    assert_eq!(conns.len(), 2);
    assert!(conns.iter().all(|c| c.status == Status::Completed));
    let roads = store.road_data(&world())?;
    assert_eq!(roads.len(), 2);
    for r in &roads {
        assert!(conns.iter().any(|c| c.same_pair(&Connection::planned(r.from, r.to))));
        assert!(!r.segments.is_empty());
    }
    Ok(())
}

#[test]
fn interrupted_generation_resumes_after_reload() -> Result<()> {
    let dbf = NamedTempFile::new()?;
    let a = Coordinate::new(0, 64, 0);
    let b = Coordinate::new(60, 64, 12);
    {
        let store = SqliteStorage::open(dbf.path())?;
        let mut c = Connection::planned(a, b);
        c.status = Status::Generating;
        store.set_connections(&world(), vec![c])?;
    }

    let store = Arc::new(SqliteStorage::open(dbf.path())?);
    let view = Arc::new(FixedWorldView::new());
    let net = build_network(&config(), store.clone(), Arc::new(FlatTerrain::new(64)), Arc::new(PoiCatalog::default()), view);
    assert_eq!(net.on_world_load(&world())?, 1);
    assert_eq!(store.connections(&world())?[0].status, Status::Planned);

    let summary = net.run_until_idle(&world(), 50_000, Duration::from_millis(1));
    assert_eq!(summary.completed, 1);
    assert_eq!(store.connections(&world())?[0].status, Status::Completed);
    assert_eq!(store.road_data(&world())?.len(), 1);
    Ok(())
}
