//! Compute usage accounting CLI library.
//!
//! This crate provides the CLI interface over the accounting engine and its
//! `SQLite` record store.

mod cli;
pub mod commands;
mod config;

pub use cli::{Cli, Commands, ImportKind};
pub use config::Config;
