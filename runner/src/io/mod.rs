//! Side-effecting helpers: config files, discovery, process execution.

pub mod config;
pub mod discovery;
pub mod invoker;
pub mod process;
