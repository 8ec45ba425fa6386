pub mod api;
pub mod cli;
pub mod database_ops;
pub mod edge;
pub mod ingest;
pub mod jobs;
pub mod normalization;
pub mod provider;
pub mod ratelimit;
pub mod scheduler;
pub mod tracing;

pub mod util {
    pub mod env;
}
