//! Core of the session synchronization service

pub mod collab;
pub mod config;
