//! pairchat messaging server library.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod config;
pub mod db;
pub mod dm;
pub mod friends;
pub mod routes;
pub mod state;
pub mod ws;
