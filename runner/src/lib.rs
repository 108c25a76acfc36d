pub mod arguments;
pub mod binding;
pub mod broadcast;
pub mod cli;
pub mod coercion;
pub mod collector;
pub mod config;
pub mod definition;
pub mod dispatch;
pub mod fabric;
pub mod job;
pub mod jobs;
pub mod pipeline;
pub mod polling;
pub mod registry;
pub mod resources;
pub mod scheduler;
