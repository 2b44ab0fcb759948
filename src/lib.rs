//! smartmarks: a single-session bookmark manager kept in sync with a hosted
//! auth/database/realtime platform.
//!
//! This library crate exposes all modules for use by the binary and integration tests.

pub mod app;
pub mod database;
pub mod managers;
pub mod rpc_handler;
pub mod services;
pub mod types;
