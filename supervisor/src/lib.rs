//! A development-time supervisor that keeps a long-running child program up
//! to date as its source changes: live patch first, full restart otherwise.

pub mod bootstrap;
pub mod child;
pub mod commands;
pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod orchestrator;
pub mod service;
pub mod signals;
pub mod terminal;
pub mod watcher;

pub use config::ReloadConfig;
pub use error::SupervisorError;
pub use orchestrator::{Orchestrator, SupervisorState};
