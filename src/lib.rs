//! An incremental build graph engine with a content-addressable action
//! cache.

pub mod bundle;
pub mod cache;
pub mod db;
pub mod exit;
pub mod fs;
pub mod future;
pub mod graph;
pub mod hash;
pub mod pool;
pub mod serial;
pub mod units;
pub mod work;
