use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Deserialize;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use rayon::prelude::*;

#[derive(Deserialize, Debug)]
struct FileRoot {
    #[serde(default = "default_world")]
    world: String,
    #[serde(default)]
    pois: Vec<PoiEntry>,
}

fn default_world() -> String {
    "overworld".to_string()
}

#[derive(Deserialize, Debug)]
struct PoiEntry {
    x: i32,
    #[serde(default = "default_y")]
    y: i32,
    z: i32,
    kind: String,
}

fn default_y() -> i32 {
    64
}

type PoiRow = (
    String, // world
    i32,    // x
    i32,    // y
    i32,    // z
    String, // kind
);

struct FileBatch {
    rows: Vec<PoiRow>,
}

pub fn cmd_load_pois(json_folder: &Path, db_path: &Path) -> Result<usize> {
    println!("Using JSON folder: {}", json_folder.display());
    println!("Using DB file    : {}", db_path.display());

    let mut conn = crate::commands::roads::db::open_rw(db_path)
        .with_context(|| format!("Failed to open DB at {}", db_path.display()))?;
    crate::db::create_tables(&mut conn)?;
    let inserted = load_json_files(json_folder, &mut conn)?;

    println!("{} POIs loaded into {}", inserted, db_path.display());
    Ok(inserted)
}

fn load_json_files(folder: &Path, conn: &mut Connection) -> Result<usize> {
    if !folder.exists() {
        anyhow::bail!("JSON folder not found: {}", folder.display());
    }

    let mut file_entries: Vec<_> = fs::read_dir(folder)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
        .collect();
    file_entries.sort();

    // Parsed batches stream to a single DB writer
    let (tx_msg, rx_msg) = mpsc::channel::<FileBatch>();
    let producer = {
        let tx_msg = tx_msg.clone();
        thread::spawn(move || {
            file_entries
                .into_par_iter()
                .for_each_with(tx_msg, |s, path| {
                    if let Err(e) = parse_file_and_stream(&path, s) {
                        log::error!("[load_pois] {}: {:#}", path.display(), e);
                    }
                });
        })
    };
    drop(tx_msg);

    let txw = conn.transaction()?;
    let mut inserted = 0usize;
    {
        let mut stmt = txw.prepare(
            "INSERT OR IGNORE INTO pois(world, x, y, z, kind, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, (SELECT COALESCE(MAX(seq), -1) + 1 FROM pois WHERE world=?1))",
        )?;
        for batch in rx_msg {
            for (world, x, y, z, kind) in batch.rows {
                inserted += stmt.execute(rusqlite::params![world, x, y, z, kind])?;
            }
        }
    }
    txw.commit()?;

    let _ = producer.join();
    Ok(inserted)
}

fn parse_file_and_stream(path: &Path, sender: &mpsc::Sender<FileBatch>) -> Result<()> {
    log::debug!("[load_pois] loading {}", path.display());
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let data: FileRoot = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parse JSON {}", path.display()))?;
    if data.pois.is_empty() {
        return Ok(());
    }
    let world = data.world;
    let rows = data
        .pois
        .into_iter()
        .map(|p| (world.clone(), p.x, p.y, p.z, p.kind))
        .collect();
    sender.send(FileBatch { rows }).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    Ok(())
}
