use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

/// Load `.env.{env}` when an environment is named, otherwise `.env` if one
/// exists in the current directory.
pub fn load_env(env: Option<&str>) -> Result<()> {
    match env {
        Some(name) => {
            let path = PathBuf::from(format!(".env.{name}"));
            dotenvy::from_path(&path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            debug!(path = %path.display(), "loaded environment");
        }
        None => {
            if let Ok(path) = dotenvy::dotenv() {
                debug!(path = %path.display(), "loaded environment");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn test_load_named_env() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(".env.staging"), "ROWTIDE_TEST_ENV=staging").unwrap();

        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(temp_dir.path()).unwrap();
        std::env::remove_var("ROWTIDE_TEST_ENV");

        load_env(Some("staging")).unwrap();
        assert_eq!(std::env::var("ROWTIDE_TEST_ENV").unwrap(), "staging");
        assert!(load_env(Some("missing")).is_err());

        std::env::set_current_dir(original_dir).unwrap();
        std::env::remove_var("ROWTIDE_TEST_ENV");
    }

    #[test]
    #[serial]
    fn test_missing_default_env_is_fine() {
        let temp_dir = TempDir::new().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(temp_dir.path()).unwrap();

        assert!(load_env(None).is_ok());

        std::env::set_current_dir(original_dir).unwrap();
    }
}
