//! notesync-cli library: exposes the CLI components for integration tests.

pub mod commands;
pub mod identity;
pub mod native_fs;

pub use commands::{Cli, Command, Engine, open_engine, run};
pub use native_fs::NativeFs;
