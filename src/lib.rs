//! gatekeeper - Authentication and request-screening core
//!
//! This crate provides password hashing, signed bearer tokens, TOTP second
//! factors, rate limiting, login throttling, session management and crawler
//! detection over a pluggable security store and durable database.

pub mod auth;
pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod otel;
pub mod store;
