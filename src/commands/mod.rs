pub mod load_pois;
pub mod roads;
