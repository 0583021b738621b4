use palisade_sync::SyncError;

const ENV_URL: &str = "REDIS_URL";
const ENV_HOST: &str = "REDIS_HOST";
const ENV_PORT: &str = "REDIS_PORT";
const ENV_DB: &str = "REDIS_DB";
const ENV_PASSWORD: &str = "REDIS_PASSWORD";

const FIELD_VARS: [&str; 4] = [ENV_HOST, ENV_PORT, ENV_DB, ENV_PASSWORD];

/// Connection settings for the Redis lock backend.
///
/// Built either from an explicit URL or from the `REDIS_*` environment
/// variables: `REDIS_URL` on its own, or the complete tuple
/// `REDIS_HOST`/`REDIS_PORT`/`REDIS_DB`/`REDIS_PASSWORD`. Mixing the two
/// modes is rejected.
#[derive(Debug, Clone)]
pub struct RedisSettings {
    /// Redis connection URL (`redis://` or `rediss://`).
    pub url: String,
    /// Prefix prepended to every lock key, empty by default.
    pub key_prefix: String,
}

impl RedisSettings {
    /// Create settings from an explicit URL.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SettingsValidation`] for a non-Redis scheme.
    pub fn new(url: impl Into<String>) -> Result<Self, SyncError> {
        let url = url.into();
        validate_scheme(&url, "url")?;
        Ok(Self {
            url,
            key_prefix: String::new(),
        })
    }

    /// Prefix every lock key, e.g. to share a database between services.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Load settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SettingsValidation`] listing every offending
    /// variable.
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary variable lookup.
    ///
    /// This is the testable core of [`from_env`](Self::from_env).
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SettingsValidation`] listing every offending
    /// variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SyncError> {
        let url = lookup(ENV_URL);
        let present: Vec<&str> = FIELD_VARS
            .iter()
            .copied()
            .filter(|var| lookup(var).is_some())
            .collect();

        if let Some(url) = url {
            if !present.is_empty() {
                let mut keys: Vec<String> = vec![ENV_URL.to_owned()];
                keys.extend(present.iter().map(|&s| s.to_owned()));
                return Err(SyncError::SettingsValidation {
                    reason: format!("{ENV_URL} and host settings are mutually exclusive"),
                    keys,
                });
            }
            validate_scheme(&url, ENV_URL)?;
            return Ok(Self {
                url,
                key_prefix: String::new(),
            });
        }

        if present.is_empty() {
            return Err(SyncError::SettingsValidation {
                reason: "no Redis settings found".into(),
                keys: vec![ENV_URL.to_owned()],
            });
        }

        let missing: Vec<String> = FIELD_VARS
            .iter()
            .filter(|var| lookup(var).is_none())
            .map(|&s| s.to_owned())
            .collect();
        if !missing.is_empty() {
            return Err(SyncError::SettingsValidation {
                reason: "incomplete host settings, missing required variables".into(),
                keys: missing,
            });
        }

        let host = lookup(ENV_HOST).unwrap_or_default();
        let password = lookup(ENV_PASSWORD).unwrap_or_default();
        let port: u16 = parse_var(&lookup, ENV_PORT)?;
        let db: u32 = parse_var(&lookup, ENV_DB)?;

        Ok(Self {
            url: format!("redis://:{password}@{host}:{port}/{db}"),
            key_prefix: String::new(),
        })
    }
}

fn validate_scheme(url: &str, key: &str) -> Result<(), SyncError> {
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        Ok(())
    } else {
        Err(SyncError::SettingsValidation {
            reason: "URL scheme must be redis or rediss".into(),
            keys: vec![key.to_owned()],
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<T, SyncError> {
    lookup(key)
        .unwrap_or_default()
        .parse()
        .map_err(|_| SyncError::SettingsValidation {
            reason: format!("{key} is not a valid number"),
            keys: vec![key.to_owned()],
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const URL: &str = "redis://:test_password@test_host:1234/0";

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn url_mode() {
        let settings = RedisSettings::from_lookup(lookup(&[("REDIS_URL", URL)])).unwrap();
        assert_eq!(settings.url, URL);
    }

    #[test]
    fn field_mode_builds_url() {
        let settings = RedisSettings::from_lookup(lookup(&[
            ("REDIS_PASSWORD", "test_password"),
            ("REDIS_HOST", "test_host"),
            ("REDIS_PORT", "1234"),
            ("REDIS_DB", "0"),
        ]))
        .unwrap();
        assert_eq!(settings.url, URL);
    }

    #[test]
    fn mixed_modes_rejected() {
        let err = RedisSettings::from_lookup(lookup(&[
            ("REDIS_URL", URL),
            ("REDIS_PASSWORD", "test_password"),
            ("REDIS_HOST", "test_host"),
            ("REDIS_PORT", "1234"),
            ("REDIS_DB", "0"),
        ]))
        .expect_err("mixing URL and host settings should fail");
        let message = err.to_string();
        assert!(message.contains("REDIS_URL"));
        assert!(message.contains("REDIS_HOST"));
    }

    #[test]
    fn incomplete_fields_listed() {
        let err = RedisSettings::from_lookup(lookup(&[("REDIS_PASSWORD", "test_password")]))
            .expect_err("incomplete host settings should fail");
        let message = err.to_string();
        assert!(message.contains("REDIS_HOST"));
        assert!(message.contains("REDIS_PORT"));
        assert!(message.contains("REDIS_DB"));
        assert!(!message.contains("REDIS_PASSWORD"));
    }

    #[test]
    fn foreign_scheme_rejected() {
        let err = RedisSettings::from_lookup(lookup(&[(
            "REDIS_URL",
            "test://:test_password@test_host:1234/0",
        )]))
        .expect_err("non-redis scheme should fail");
        assert!(matches!(err, SyncError::SettingsValidation { .. }));
    }

    #[test]
    fn tls_scheme_accepted() {
        let settings = RedisSettings::from_lookup(lookup(&[(
            "REDIS_URL",
            "rediss://:test_password@test_host:1234/0",
        )]))
        .unwrap();
        assert!(settings.url.starts_with("rediss://"));
    }

    #[test]
    fn unparseable_port_rejected() {
        let err = RedisSettings::from_lookup(lookup(&[
            ("REDIS_PASSWORD", "p"),
            ("REDIS_HOST", "h"),
            ("REDIS_PORT", "not-a-port"),
            ("REDIS_DB", "0"),
        ]))
        .expect_err("bad port should fail");
        assert!(err.to_string().contains("REDIS_PORT"));
    }

    #[test]
    fn nothing_set_rejected() {
        let err =
            RedisSettings::from_lookup(lookup(&[])).expect_err("empty environment should fail");
        assert!(err.to_string().contains("REDIS_URL"));
    }

    #[test]
    fn explicit_url_validated() {
        assert!(RedisSettings::new("redis://127.0.0.1:6379").is_ok());
        assert!(RedisSettings::new("http://127.0.0.1:6379").is_err());
    }
}
