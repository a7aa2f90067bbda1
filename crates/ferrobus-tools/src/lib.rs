//! Shared plumbing for the ferrobus command-line tools.

pub mod common;
