use std::path::PathBuf;

use thiserror::Error;

use crate::model::TimeRange;

/// Server settings, read once from `VENUEBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// Journal appends between compactions.
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    /// User ids registered as admins at start-up.
    pub admins: Vec<String>,
    pub seed_venues: bool,
    /// Operating hours for availability queries.
    pub window: TimeRange,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("VENUEBOOK_OPEN/VENUEBOOK_CLOSE: {0}")]
    Window(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let open = get("VENUEBOOK_OPEN").unwrap_or_else(|| "08:00".into());
        let close = get("VENUEBOOK_CLOSE").unwrap_or_else(|| "22:00".into());
        let window = TimeRange::parse(&open, &close).map_err(|e| ConfigError::Window(e.to_string()))?;

        Ok(Self {
            port: parsed(&get, "VENUEBOOK_PORT")?.unwrap_or(5433),
            bind: get("VENUEBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: get("VENUEBOOK_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            password: get("VENUEBOOK_PASSWORD").unwrap_or_else(|| "venuebook".into()),
            max_connections: parsed(&get, "VENUEBOOK_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&get, "VENUEBOOK_COMPACT_THRESHOLD")?.unwrap_or(1000),
            tls_cert: get("VENUEBOOK_TLS_CERT"),
            tls_key: get("VENUEBOOK_TLS_KEY"),
            metrics_port: parsed(&get, "VENUEBOOK_METRICS_PORT")?,
            admins: get("VENUEBOOK_ADMINS")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|id| !id.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            seed_venues: get("VENUEBOOK_SEED_VENUES")
                .map(|v| parse_flag(&v).ok_or(ConfigError::Invalid {
                    var: "VENUEBOOK_SEED_VENUES",
                    value: v,
                }))
                .transpose()?
                .unwrap_or(false),
            window,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("venuebook.wal")
    }
}

fn parsed<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    get(var)
        .map(|value| value.parse().map_err(|_| ConfigError::Invalid { var, value }))
        .transpose()
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|var| map.get(var).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:5433");
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
        assert_eq!(cfg.password, "venuebook");
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.metrics_port, None);
        assert!(cfg.admins.is_empty());
        assert!(!cfg.seed_venues);
        assert_eq!(cfg.window, TimeRange::parse("08:00", "22:00").unwrap());
        assert_eq!(cfg.journal_path(), PathBuf::from("./data/venuebook.wal"));
    }

    #[test]
    fn overrides() {
        let cfg = config(&[
            ("VENUEBOOK_PORT", "6000"),
            ("VENUEBOOK_BIND", "127.0.0.1"),
            ("VENUEBOOK_ADMINS", " alice, ,bob "),
            ("VENUEBOOK_SEED_VENUES", "yes"),
            ("VENUEBOOK_OPEN", "07:30"),
            ("VENUEBOOK_CLOSE", "20:00"),
            ("VENUEBOOK_METRICS_PORT", "9100"),
        ])
        .unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:6000");
        assert_eq!(cfg.admins, vec!["alice".to_string(), "bob".to_string()]);
        assert!(cfg.seed_venues);
        assert_eq!(cfg.window.duration_minutes(), 12 * 60 + 30);
        assert_eq!(cfg.metrics_port, Some(9100));
    }

    #[test]
    fn bad_values_are_reported() {
        let err = config(&[("VENUEBOOK_PORT", "http")]).unwrap_err();
        assert!(err.to_string().contains("VENUEBOOK_PORT"));
        assert!(config(&[("VENUEBOOK_SEED_VENUES", "maybe")]).is_err());
        assert!(matches!(
            config(&[("VENUEBOOK_OPEN", "20:00"), ("VENUEBOOK_CLOSE", "08:00")]),
            Err(ConfigError::Window(_))
        ));
    }
}
