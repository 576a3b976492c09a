//! Structured activity logging: a channel-fed logger thread writing JSONL.

pub mod activity;
pub mod jsonl;
