//! Side-effecting adapters: persistence, child processes, scaffolding.

pub mod build_check;
pub mod config;
pub mod dispatch;
pub mod init;
pub mod process;
pub mod report;
pub mod scout;
pub mod status_store;
