use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub bind_addr: SocketAddr,
    pub db_url: String,
    pub db_max_connections: u32,
    pub workers: usize,
    pub resync_interval_ms: u64,
    pub feedback_poll_interval_ms: u64,
    pub order_create_webhook_url: Option<String>,
    pub order_delete_webhook_url: Option<String>,
    pub webhook_min_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl ControllerConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("FOUNDRY_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("FOUNDRY_CONTROLLER_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8001),
            "FOUNDRY_CONTROLLER_BIND_ADDR",
        )?;

        let db_url = require_nonempty(kv, "FOUNDRY_DB_URL")?;
        let db_max_connections = parse_u32(kv.get("FOUNDRY_DB_MAX_CONNECTIONS"), 4)?;
        let workers = parse_u32(kv.get("FOUNDRY_CONTROLLER_WORKERS"), 4)? as usize;
        let resync_interval_ms = parse_u64(kv.get("FOUNDRY_RESYNC_INTERVAL_MS"), 60_000)?;
        let feedback_poll_interval_ms =
            parse_u64(kv.get("FOUNDRY_FEEDBACK_POLL_INTERVAL_MS"), 15_000)?;
        let webhook_min_interval_ms =
            parse_u64(kv.get("FOUNDRY_WEBHOOK_MIN_INTERVAL_MS"), 30_000)?;

        let order_create_webhook_url = optional(kv.get("FOUNDRY_ORDER_CREATE_WEBHOOK_URL"));
        let order_delete_webhook_url = optional(kv.get("FOUNDRY_ORDER_DELETE_WEBHOOK_URL"));

        if workers == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "FOUNDRY_CONTROLLER_WORKERS must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            bind_addr,
            db_url,
            db_max_connections,
            workers,
            resync_interval_ms,
            feedback_poll_interval_ms,
            order_create_webhook_url,
            order_delete_webhook_url,
            webhook_min_interval_ms,
        })
    }
}

fn optional(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), value.trim().to_string());
    }

    Ok(kv)
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    let Some(value) = kv.get(key) else {
        return Err(StartupError {
            code: "ERR_MISSING_CONFIG",
            message: format!("missing required config key {}", key),
        });
    };

    let value = value.trim();
    if value.is_empty() {
        return Err(StartupError {
            code: "ERR_MISSING_CONFIG",
            message: format!("missing required config key {}", key),
        });
    }

    Ok(value.to_string())
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) => v.parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_u32(value: Option<&String>, default: u32) -> Result<u32, StartupError> {
    match value.map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(v) => v.parse::<u32>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("`{}` is not a valid unsigned integer", v),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64) -> Result<u64, StartupError> {
    match value.map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(v) => v.parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("`{}` is not a valid unsigned integer", v),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_ok_env() -> HashMap<String, String> {
        HashMap::from([(
            "FOUNDRY_DB_URL".to_string(),
            "postgres://localhost/foundry".to_string(),
        )])
    }

    #[test]
    fn minimal_config_loads_with_defaults() {
        let config = ControllerConfig::from_kv(&minimal_ok_env()).expect("config should load");
        assert_eq!(config.bind_addr.port(), 8001);
        assert_eq!(config.workers, 4);
        assert!(config.order_create_webhook_url.is_none());
        assert_eq!(config.webhook_min_interval_ms, 30_000);
    }

    #[test]
    fn missing_db_url_fails() {
        let err = ControllerConfig::from_kv(&HashMap::new()).unwrap_err();
        assert_eq!(err.code, "ERR_MISSING_CONFIG");
    }

    #[test]
    fn zero_workers_fails() {
        let mut env = minimal_ok_env();
        env.insert("FOUNDRY_CONTROLLER_WORKERS".to_string(), "0".to_string());
        let err = ControllerConfig::from_kv(&env).unwrap_err();
        assert_eq!(err.code, "ERR_INVALID_CONFIG");
    }

    #[test]
    fn webhook_urls_are_optional_and_trimmed() {
        let mut env = minimal_ok_env();
        env.insert(
            "FOUNDRY_ORDER_CREATE_WEBHOOK_URL".to_string(),
            " http://orders.internal/create ".to_string(),
        );
        let config = ControllerConfig::from_kv(&env).expect("config should load");
        assert_eq!(
            config.order_create_webhook_url.as_deref(),
            Some("http://orders.internal/create")
        );
    }
}
