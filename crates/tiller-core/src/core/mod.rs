//! Core module: UI-agnostic loop runtime.
//!
//! This module contains:
//! - `events`: Agent event types for streaming
//! - `config`: Run configuration and hook contracts
//! - `moderation`: Per-chunk stream moderation
//! - `agent`: Turn driver, tool dispatch and event channels

pub mod agent;
pub mod config;
pub mod events;
pub mod moderation;
