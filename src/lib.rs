pub mod util;
pub mod db;
pub mod commands;
