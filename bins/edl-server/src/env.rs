//! Process environment: server settings and database credential enrichment.

use edl_core::config::LayerConfig;

/// Server settings read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct Env {
    pub port: String,
    pub config_location: String,
    pub service_name: String,
    pub profile: String,
    pub authorization_middleware: String,
    pub refresh_interval_secs: u64,
}

impl Env {
    pub fn load() -> Env {
        Env {
            port: var_or("SERVER_PORT", "8080"),
            config_location: var_or("CONFIG_LOCATION", ""),
            service_name: var_or("SERVICE_NAME", "edl-server"),
            profile: var_or("PROFILE", "local"),
            authorization_middleware: var_or("AUTHORIZATION_MIDDLEWARE", "noop"),
            refresh_interval_secs: var_or("CONFIG_REFRESH_INTERVAL", "120")
                .parse()
                .unwrap_or(120),
        }
    }
}

fn var_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

/// Overrides connection settings from the environment, so deployments can
/// keep credentials out of the configuration document.
pub fn enrich(config: &mut LayerConfig) {
    for (var, field) in [
        ("PGSQL_USER", &mut config.user as &mut String),
        ("PGSQL_PASSWORD", &mut config.password),
        ("PGSQL_DATABASE", &mut config.database),
        ("PGSQL_HOST", &mut config.host),
        ("PGSQL_PORT", &mut config.port),
    ] {
        if let Ok(v) = std::env::var(var) {
            if !v.is_empty() {
                *field = v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrich_overrides_only_set_variables() {
        std::env::set_var("PGSQL_USER", "enriched");
        std::env::remove_var("PGSQL_HOST");

        let mut config = LayerConfig {
            user: "original".to_string(),
            host: "localhost".to_string(),
            ..Default::default()
        };
        enrich(&mut config);
        assert_eq!(config.user, "enriched");
        assert_eq!(config.host, "localhost");

        std::env::remove_var("PGSQL_USER");
    }

    #[test]
    fn env_defaults_apply() {
        std::env::remove_var("SERVER_PORT");
        let env = Env::load();
        assert_eq!(env.port, "8080");
        assert_eq!(env.authorization_middleware, "noop");
    }
}
