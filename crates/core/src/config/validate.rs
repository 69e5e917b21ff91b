use std::collections::HashSet;

use super::{types::Config, ConfigError, StorageBackendKind};

/// Validate configuration
///
/// Checks the invariants serde cannot express: port, backend parameters,
/// intake channel uniqueness, and the desk limits.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(ConfigError::ValidationError(
            "server.port cannot be 0".to_string(),
        ));
    }

    if config.storage.backend == StorageBackendKind::NetworkedSql {
        let mysql = config.storage.mysql.as_ref().ok_or_else(|| {
            ConfigError::ValidationError(
                "storage.mysql must be set when backend = \"networked_sql\"".to_string(),
            )
        })?;
        if mysql.host.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.mysql.host cannot be empty".to_string(),
            ));
        }
        if mysql.database.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.mysql.database cannot be empty".to_string(),
            ));
        }
    }

    if config.desk.max_tickets == 0 {
        return Err(ConfigError::ValidationError(
            "desk.max_tickets must be at least 1".to_string(),
        ));
    }

    if config.desk.bus_timeout_ms == 0 {
        return Err(ConfigError::ValidationError(
            "desk.bus_timeout_ms cannot be 0".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for intake in &config.desk.intake {
        if intake.channel_id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "desk.intake channel_id cannot be empty".to_string(),
            ));
        }
        if intake.ticket_type.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "desk.intake ticket_type for channel {} cannot be empty",
                intake.channel_id
            )));
        }
        if !seen.insert(intake.channel_id.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "desk.intake channel {} is listed more than once",
                intake.channel_id
            )));
        }
    }

    if reqwest::Url::parse(&config.chat.relay_url).is_err() {
        return Err(ConfigError::ValidationError(format!(
            "chat.relay_url is not a valid URL: {}",
            config.chat.relay_url
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IntakeChannel, MySqlConfig};

    fn intake(channel_id: &str, ticket_type: &str) -> IntakeChannel {
        IntakeChannel {
            channel_id: channel_id.to_string(),
            ticket_type: ticket_type.to_string(),
        }
    }

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_port_zero_fails() {
        let mut config = Config::default();
        config.server.port = 0;
        let result = validate_config(&config);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validate_networked_without_mysql_section() {
        let mut config = Config::default();
        config.storage.backend = StorageBackendKind::NetworkedSql;
        assert!(validate_config(&config).is_err());

        config.storage.mysql = Some(MySqlConfig {
            host: "db".to_string(),
            port: 3306,
            user: "desk".to_string(),
            password: String::new(),
            database: " ".to_string(),
            connect_timeout_secs: 10,
        });
        assert!(validate_config(&config).is_err());

        config.storage.mysql.as_mut().unwrap().database = "tickets".to_string();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_duplicate_intake_channel() {
        let mut config = Config::default();
        config.desk.intake = vec![intake("1", "Pomoc"), intake("1", "Pytanie")];
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_validate_empty_ticket_type() {
        let mut config = Config::default();
        config.desk.intake = vec![intake("1", "")];
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_zero_cap() {
        let mut config = Config::default();
        config.desk.max_tickets = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_bad_relay_url() {
        let mut config = Config::default();
        config.chat.relay_url = "not a url".to_string();
        assert!(validate_config(&config).is_err());
    }
}
