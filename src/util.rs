use std::path::PathBuf;

pub const DB_FILE: &str = "roads.db";
pub const POI_JSON_REL_PATH: &str = "out/pois";

pub fn repo_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

pub fn default_db_path() -> PathBuf {
    repo_root().join(DB_FILE)
}

pub fn default_paths() -> (PathBuf, PathBuf) {
    let root = repo_root();
    (root.join(POI_JSON_REL_PATH), root.join(DB_FILE))
}
