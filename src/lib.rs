//! Activity tracking client for creative software. Turns edit signals from a host application
//! into heartbeats, keeps them in a crash safe local queue and delivers them to a WakaTime
//! compatible service whenever it is reachable.
//!

pub mod cli;
pub mod config;
pub mod error;
pub mod fs;
pub mod tracker;
pub mod utils;
