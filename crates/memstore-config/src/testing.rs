//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - Isolated socket paths
//! - Isolated operation log files
//! - A ready-made `Config` pointing at both
//!
//! # Usage
//!
//! ```ignore
//! use memstore_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let config = env.config();
//!     // config.server.socket_path and config.log.file are unique to this test
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Root of the temporary directory
    pub root: PathBuf,
    /// Unique socket path for this test
    pub socket_path: PathBuf,
    /// Operation log path for this test
    pub log_path: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().to_path_buf();

        let socket_path = root.join(format!("memstore-test-{}.sock", test_id));
        let log_path = root.join(format!("memstore-test-{}.log", test_id));

        Ok(Self {
            _temp_dir: temp_dir,
            root,
            socket_path,
            log_path,
            test_id,
        })
    }

    /// Small, fast-polling configuration bound to this environment's paths
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.server.socket_path = self.socket_path.clone();
        config.server.workers = 2;
        config.server.max_connections = 16;
        config.server.poll_timeout_ms = 20;
        config.server.client_timeout_secs = 30;
        config.storage.capacity_bytes = 1024 * 1024;
        config.storage.max_files = 32;
        config.log.file = self.log_path.clone();
        config
    }

    /// Write a config file into the environment and return its path
    pub fn write_config(&self, name: &str, contents: &str) -> anyhow::Result<PathBuf> {
        let path = self.root.join(name);
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    /// Contents of the operation log, empty if nothing was written yet
    pub fn read_log(&self) -> String {
        std::fs::read_to_string(&self.log_path).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_isolation() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();

        assert_ne!(env1.socket_path, env2.socket_path);
        assert_ne!(env1.log_path, env2.log_path);
        assert_ne!(env1.test_id, env2.test_id);
    }

    #[test]
    fn test_environment_config_is_valid() {
        let env = TestEnvironment::new().unwrap();
        let config = env.config();
        assert_eq!(config.server.socket_path, env.socket_path);
        assert_eq!(config.log.file, env.log_path);
        assert!(config.validate().is_ok());
        assert!(env.read_log().is_empty());
    }
}
