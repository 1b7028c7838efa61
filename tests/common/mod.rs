//! Common test utilities for magents integration tests.
//!
//! Provides `TestEnv` for isolated test environments that don't touch
//! the user's `~/.magents/` directory.

#![allow(dead_code)]

use assert_cmd::Command;
use std::path::PathBuf;
pub use tempfile::TempDir;

/// A test environment with an isolated store file.
///
/// The `magents()` method returns a `Command` that sets `MAGENTS_DB`
/// per-invocation, making tests parallel-safe.
pub struct TestEnv {
    pub dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    /// Create a test environment with the store already migrated.
    pub fn init() -> Self {
        let env = Self::new();
        env.magents().arg("migrate").assert().success();
        env
    }

    /// Get a Command for the magents binary with an isolated store.
    pub fn magents(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_magents"));
        cmd.current_dir(self.dir.path());
        cmd.env("MAGENTS_DB", self.db_path());
        cmd
    }

    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("magents.db")
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
