//! Append-only JSONL activity log with rotation and graceful degradation.

pub mod jsonl;
