//! Data directory layout for batchflow.

use std::path::{Path, PathBuf};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "BATCHFLOW_DATA_DIR";

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `BATCHFLOW_DATA_DIR` environment variable
/// 2. `~/.batchflow`
/// 3. `.batchflow` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    data_dir_from(std::env::var(DATA_DIR_ENV).ok(), dirs::home_dir())
}

fn data_dir_from(env: Option<String>, home: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = env.filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }

    if let Some(home) = home {
        return home.join(".batchflow");
    }

    PathBuf::from(".batchflow")
}

/// Create the data directory if it does not exist yet.
pub async fn ensure_data_dir(data_dir: &Path) -> Result<(), std::io::Error> {
    tokio::fs::create_dir_all(data_dir).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn env_override_wins() {
        let dir = data_dir_from(Some("/data/bf".to_string()), Some(PathBuf::from("/home/ops")));
        assert_eq!(dir, PathBuf::from("/data/bf"));
    }

    #[test]
    fn empty_env_falls_back_to_home() {
        let dir = data_dir_from(Some(String::new()), Some(PathBuf::from("/home/ops")));
        assert_eq!(dir, PathBuf::from("/home/ops/.batchflow"));
    }

    #[test]
    fn no_home_uses_current_directory() {
        assert_eq!(data_dir_from(None, None), PathBuf::from(".batchflow"));
    }

    #[tokio::test]
    async fn ensure_creates_nested_dirs() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_data_dir(&nested).await.unwrap();
        assert!(tokio::fs::try_exists(&nested).await.unwrap());
        ensure_data_dir(&nested).await.unwrap();
    }
}
