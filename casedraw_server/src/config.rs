use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use casedraw_core::{DrawTable, EngineConfig, TableError, WeightTable};
use casedraw_shared::AdminUpsertTableRequest;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub bind: String,
    pub api_key: String,
    pub commitment_ttl_secs: i64,
    pub sweep_interval_secs: u64,
    pub tables_path: Option<PathBuf>,
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("parsing {key}={raw}")),
        Err(_) => Ok(default),
    }
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let cfg = Self {
            database_url: env_or("DATABASE_URL", "sqlite://casedraw.db?mode=rwc".to_string())?,
            bind: env_or("BIND", "127.0.0.1:8080".to_string())?,
            api_key: env_or("API_KEY", "dev-key".to_string())?,
            commitment_ttl_secs: env_or("COMMITMENT_TTL_SECS", 300)?,
            sweep_interval_secs: env_or("SWEEP_INTERVAL_SECS", 30)?,
            tables_path: std::env::var("TABLES_PATH").ok().map(PathBuf::from),
        };
        anyhow::ensure!(cfg.commitment_ttl_secs > 0, "COMMITMENT_TTL_SECS must be positive");
        anyhow::ensure!(cfg.sweep_interval_secs > 0, "SWEEP_INTERVAL_SECS must be positive");
        Ok(cfg)
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            commitment_ttl: chrono::Duration::seconds(self.commitment_ttl_secs),
        }
    }

    /// Tables from `TABLES_PATH` (a JSON array of table definitions), or the
    /// built-in cases.
    pub fn load_tables(&self) -> anyhow::Result<Vec<DrawTable>> {
        let Some(path) = &self.tables_path else {
            return Ok(DrawTable::defaults()?);
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let defs: Vec<AdminUpsertTableRequest> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        defs.into_iter()
            .map(|d| table_from_request(d).map_err(anyhow::Error::from))
            .collect()
    }
}

pub fn table_from_request(req: AdminUpsertTableRequest) -> Result<DrawTable, TableError> {
    let weights = WeightTable::normalize(req.entries.into_iter().map(|e| (e.outcome_id, e.weight)))?;
    DrawTable::new(req.id, req.price, weights, req.payouts)
}
