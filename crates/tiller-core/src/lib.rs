//! Core tiller library (turn driver, messages, transport and tool contracts).

pub mod core;
pub mod messages;
pub mod tools;
pub mod transport;
