//! # hikesense-server
//!
//! HTTP daemon for the HikeSense hiking companion.
//!
//! This library provides the API handlers and state management; the
//! `hikesense-server` binary wires them to the configured sensor transport.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;
