//! Sandboxed judging worker
//!
//! Takes a submission and a problem, compiles and runs the submission in a
//! throwaway sandbox against every test case, and produces a verdict.
//!
//! - `monitor`: the resource-limited parent process running inside the sandbox
//! - `sandbox`: filesystem/resource isolation and command execution
//! - `languages`: how to compile and run each language
//! - `differs`: how to decide whether an output is correct
//! - `data`: local cache of problem test data
//! - `judger`: the pipeline tying it all together

pub mod config;
pub mod core;
pub mod data;
pub mod differs;
pub mod judger;
pub mod languages;
pub mod monitor;
pub mod redis_manager;
pub mod runner;
pub mod sandbox;
pub mod storage;
