//! Core domain + application logic for securitybot.
//!
//! This crate is framework-agnostic. Slack / Duo / MySQL live behind ports
//! (traits) implemented in adapter crates.

pub mod auth;
pub mod bot;
pub mod chat;
pub mod commands;
pub mod config;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod logging;
pub mod messages;
pub mod security;
pub mod store;
pub mod tasker;
pub mod user;
pub mod utils;

pub use errors::{Error, Result};
