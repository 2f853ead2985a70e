use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use roadnet::commands;
use roadnet::commands::roads::{CommonOpts, RoadsCommand};
use roadnet::util;

#[derive(Parser, Debug)]
#[command(name = "roadnet", version, about = "Road network generation between points of interest")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load POI JSON files into the roads DB
    LoadPois {
        /// Path to JSON folder (defaults to repo_root/out/pois)
        #[arg(long)]
        json_dir: Option<PathBuf>,
        /// Path to SQLite DB (defaults to repo_root/roads.db)
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Plan, build and inspect roads
    Roads {
        #[command(flatten)]
        common: CommonOpts,
        #[command(subcommand)]
        sub: RoadsCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::LoadPois { json_dir, db } => {
            commands::roads::logging::init(None);
            let (def_json, def_db) = util::default_paths();
            let json_folder = json_dir.unwrap_or(def_json);
            let db_path = db.unwrap_or(def_db);
            commands::load_pois::cmd_load_pois(&json_folder, &db_path).map(|_| ())
        }
        Commands::Roads { common, sub } => commands::roads::cmd_roads(common, sub),
    }
}
