/// Filesystem helpers shared by config and state handling
pub mod common;
