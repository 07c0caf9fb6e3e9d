//! Structured-logging conventions shared by every task in the crate.

pub mod events;
