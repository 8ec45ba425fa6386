pub mod cache_syncer;
pub mod endpoints;
pub mod kv;
