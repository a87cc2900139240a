//! Dictionary Backend Library
//!
//! The request gate for the dictionary content service: signed access and
//! refresh tokens, role checks, and per-client rate limiting, plus the router
//! and configuration the binary wires together.

pub mod api;
pub mod auth;
pub mod config;
pub mod directory;
pub mod middleware;
