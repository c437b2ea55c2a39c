//! Session Sync - Real-time Collaborative Session Service
//!
//! A small server that keeps a bounded set of shared session records in memory
//! and synchronizes them between clients over REST and a WebSocket push channel.

pub mod core;
