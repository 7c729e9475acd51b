//! 位置模块 - 位置采样、历史和 ETA

pub mod geo;
pub mod tracker;

pub use geo::{eta_minutes, haversine_km};
pub use tracker::{HISTORY_CAPACITY, LocationTracker};
