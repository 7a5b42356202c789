//! Service configuration.

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub sweep_enabled: bool,
    pub sweep_interval_secs: u64,
    pub seed_demo_catalog: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./alphavest.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let sweep_enabled = std::env::var("SWEEP_ENABLED")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(true);

        let sweep_interval_secs = std::env::var("SWEEP_INTERVAL_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);

        let seed_demo_catalog = std::env::var("SEED_DEMO_CATALOG")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(false);

        Ok(Self {
            database_path,
            port,
            sweep_enabled,
            sweep_interval_secs,
            seed_demo_catalog,
        })
    }
}
