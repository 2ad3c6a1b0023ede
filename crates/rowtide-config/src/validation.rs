use crate::canal::CanalConfig;
use crate::error::{ConfigError, ConfigResult};

/// Validate an engine configuration.
///
/// Every check runs; a single failure is returned as is, several are
/// reported together as [`ConfigError::Invalid`].
pub fn validate_config(config: &CanalConfig) -> ConfigResult<()> {
    let checks = [
        config.host_port().map(|_| ()),
        validate_server_id(config),
        validate_timeouts(config),
        config.table_filter().map(|_| ()),
        validate_dump(config),
    ];

    let mut errors: Vec<ConfigError> = checks.into_iter().filter_map(Result::err).collect();
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(ConfigError::Invalid(errors)),
    }
}

fn validate_server_id(config: &CanalConfig) -> ConfigResult<()> {
    if config.server_id == 0 {
        return Err(ConfigError::InvalidServerId);
    }
    Ok(())
}

fn validate_timeouts(config: &CanalConfig) -> ConfigResult<()> {
    if config.read_timeout_ms > 0
        && config.heartbeat_period_ms > 0
        && config.read_timeout_ms <= config.heartbeat_period_ms
    {
        return Err(ConfigError::TimeoutTooShort {
            read_timeout_ms: config.read_timeout_ms,
            heartbeat_period_ms: config.heartbeat_period_ms,
        });
    }
    Ok(())
}

fn validate_dump(config: &CanalConfig) -> ConfigResult<()> {
    let dump = &config.dump;
    if !dump.is_enabled() {
        return Ok(());
    }

    if !dump.tables.is_empty() && !dump.databases.is_empty() {
        return Err(ConfigError::ConflictingDumpSelection);
    }

    if !dump.tables.is_empty() && dump.table_db.is_empty() {
        return Err(ConfigError::MissingField {
            field: "dump.table_db".to_string(),
        });
    }

    for ignore in &dump.ignore_tables {
        match ignore.split_once('.') {
            Some((db, table)) if !db.is_empty() && !table.is_empty() => {}
            _ => return Err(ConfigError::InvalidIgnoreTable(ignore.clone())),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&CanalConfig::default()).is_ok());
    }

    #[test]
    fn test_timeout_must_exceed_heartbeat() {
        let mut config = CanalConfig::default();
        config.heartbeat_period_ms = 500;
        config.read_timeout_ms = 500;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::TimeoutTooShort { .. })
        ));

        config.read_timeout_ms = 0;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_tables_require_table_db() {
        let mut config = CanalConfig::default();
        config.dump.tables = vec!["t".to_string()];
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::MissingField { ref field }) if field == "dump.table_db"
        ));

        config.dump.table_db = "test".to_string();
        assert!(validate_config(&config).is_ok());

        config.dump.databases = vec!["other".to_string()];
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::ConflictingDumpSelection)
        ));
    }

    #[test]
    fn test_disabled_dump_skips_dump_checks() {
        let mut config = CanalConfig::default();
        config.dump.execution_path = String::new();
        config.dump.tables = vec!["t".to_string()];
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_invalid_pattern() {
        let mut config = CanalConfig::default();
        config.exclude_table_regex = vec!["[".to_string()];
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_invalid_ignore_table_and_server_id() {
        let mut config = CanalConfig::default();
        config.dump.ignore_tables = vec!["justatable".to_string()];
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::InvalidIgnoreTable(_))
        ));

        let mut config = CanalConfig::default();
        config.server_id = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::InvalidServerId)
        ));
    }

    #[test]
    fn test_reports_every_problem() {
        let mut config = CanalConfig::default();
        config.server_id = 0;
        config.exclude_table_regex = vec!["[".to_string()];
        config.dump.tables = vec!["t".to_string()];

        let err = validate_config(&config).unwrap_err();
        match &err {
            ConfigError::Invalid(errors) => {
                assert_eq!(errors.len(), 3);
                assert!(matches!(errors[0], ConfigError::InvalidServerId));
                assert!(matches!(errors[1], ConfigError::InvalidPattern(_)));
                assert!(matches!(errors[2], ConfigError::MissingField { .. }));
            }
            other => panic!("expected every error, got {other:?}"),
        }
        let message = err.to_string();
        assert!(message.starts_with("3 configuration errors: "));
        assert!(message.contains("server_id must be non-zero"));
        assert!(message.contains("dump.table_db"));
    }
}
