#![deny(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! Remote-access server for interactive CLI agent sessions.
//!
//! A browser drives long-lived `claude` subprocesses attached to
//! pseudo-terminals over a single full-duplex WebSocket, and a scheduler
//! runs the same CLI headlessly on cron presets.

pub mod common;
pub mod detection;
pub mod domain;
pub mod infra;
pub mod scheduler;
pub mod server;
pub mod session;
