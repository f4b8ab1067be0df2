//! melodyd - music playback control daemon
//!
//! A line-oriented TCP/Unix-socket daemon speaking the MPD control protocol.
//! This crate owns the client session layer: accepting connections, framing
//! the textual request stream, batching command lists, serializing replies
//! over slow sockets without blocking the daemon, enforcing per-connection
//! and global resource limits, and the idle/notify subscription mechanism
//! that lets clients block awaiting change events from other subsystems.
//!
//! The command subsystems themselves (player, playlist, database) sit behind
//! the [`command::CommandExecutor`] seam; a small built-in dispatcher covers
//! the session-level verbs.

pub mod client;
pub mod command;
pub mod config;
pub mod deferred;
pub mod idle;
pub mod listener;
pub mod permission;
pub mod server;

/// Protocol version reported in the connection greeting.
pub const PROTOCOL_VERSION: &str = "0.15.0";
