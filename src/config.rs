//! Application configuration, loaded from the environment.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the game API, including the version prefix.
    pub upstream_base_url: String,
    pub upstream_user_agent: String,
    /// Global outbound request budget per second.
    pub rate_limit_rps: u32,
    /// Upstream errors tolerated per sliding minute before failing fast.
    pub error_budget: u32,
    /// Redis address for the remote cache tier. Local-only when unset.
    pub cache_remote_addr: Option<String>,
    /// Path of the market snapshot database.
    pub db_dsn: String,
    /// Path of the read-only static catalog database.
    pub catalog_path: String,
    pub listen_addr: String,
    /// Orders older than this are swept from the snapshot store.
    pub staleness_horizon: Duration,
    /// Soft deadline for a full-region route calculation.
    pub route_calc_deadline: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let upstream_base_url = std::env::var("UPSTREAM_BASE_URL")
            .unwrap_or_else(|_| "https://esi.evetech.net/latest".to_string());

        let upstream_user_agent = std::env::var("UPSTREAM_USER_AGENT")
            .unwrap_or_else(|_| "evetrade-backend/0.1".to_string());

        let rate_limit_rps = std::env::var("RATE_LIMIT_RPS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&v| v > 0)
            .unwrap_or(20);

        let error_budget = std::env::var("ERROR_BUDGET")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&v| v > 0)
            .unwrap_or(10);

        let cache_remote_addr = std::env::var("CACHE_REMOTE_ADDR").ok().filter(|v| !v.is_empty());

        let db_dsn = std::env::var("DB_DSN").unwrap_or_else(|_| "./evetrade.db".to_string());

        let catalog_path = std::env::var("CATALOG_PATH").unwrap_or_else(|_| "./sde.db".to_string());

        let listen_addr =
            std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let staleness_hours = std::env::var("STALENESS_HORIZON_HOURS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(24);

        let route_calc_secs = std::env::var("ROUTE_CALC_DEADLINE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(30);

        Ok(Self {
            upstream_base_url,
            upstream_user_agent,
            rate_limit_rps,
            error_budget,
            cache_remote_addr,
            db_dsn,
            catalog_path,
            listen_addr,
            staleness_horizon: Duration::from_secs(staleness_hours * 3600),
            route_calc_deadline: Duration::from_secs(route_calc_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_env() {
        let config = Config::from_env().unwrap();
        assert!(config.rate_limit_rps > 0);
        assert!(config.error_budget > 0);
        assert_eq!(config.staleness_horizon, Duration::from_secs(24 * 3600));
        assert_eq!(config.route_calc_deadline, Duration::from_secs(30));
    }
}
