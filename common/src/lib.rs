// Common library for the function job engine, shared by the scheduler and worker binaries

pub mod bootstrap;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod invocation;
pub mod models;
pub mod queue;
pub mod reconcile;
pub mod schedule;
pub mod store;
pub mod telemetry;
