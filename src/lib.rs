//! patchbay library crate
//!
//! Runs an external coding agent against many repository tasks in parallel.
//! Each repository is cloned and has its dependencies installed once; every
//! attempt then works in its own throwaway worktree of that clone.

pub mod agent;
pub mod attempt;
pub mod cache;
pub mod config;
pub mod error;
pub mod git;
pub mod install;
pub mod patch;
pub mod records;
pub mod scheduler;
pub mod sweeper;
pub mod task;
pub mod util;
pub mod winner;
pub mod worktree;
