pub mod app;
pub mod config;
pub mod error;
pub mod events;
pub mod middleware;
pub mod pipeline;
pub mod services;
pub mod state;
