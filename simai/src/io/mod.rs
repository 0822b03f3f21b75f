//! I/O helpers: filesystem probing, child processes, sandboxes, and artifacts.

pub mod config;
pub mod libtorch;
pub mod patcher;
pub mod process;
pub mod resolver;
pub mod sandbox;
pub mod shim;
pub mod topology_store;
