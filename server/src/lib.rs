//! Lobby Server - Real-time chat and board hub.
//!
//! This crate provides:
//! - Password accounts with ticket-gated registration
//! - Cookie sessions resolved through a durable store and an in-memory registry
//! - A chat hub that replays recent history to new connections
//! - A shared game board whose state is broadcast after every move
//!
//! # Architecture
//!
//! Each hub is a single task that owns its set of live connections and
//! receives commands over a channel. Connections get frames through their own
//! bounded outbox; a connection that cannot keep up is dropped instead of
//! slowing the hub. Persistence is optional: without a database everything
//! lives in memory.

pub mod config;
pub mod credentials;
pub mod error;
pub mod hub;
pub mod middleware;
pub mod pages;
pub mod password;
pub mod routes;
pub mod session;
pub mod store;
pub mod tickets;
pub mod token;
pub mod types;
