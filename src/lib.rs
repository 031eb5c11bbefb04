//! Centralized backup controller.
//!
//! Orchestrates versioned file backups from a fleet of remote hosts: agents
//! are deployed once over SSH, dial back over WebSocket, and stream file
//! uploads into timestamped snapshot directories with hard-link
//! deduplication against the previous version. Progress fans out live to
//! browser clients.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod shutdown;
pub mod storage;
pub mod ws;
