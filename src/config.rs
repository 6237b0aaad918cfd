use crate::errors::{AppError, AppResult};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn parse(s: &str) -> AppResult<Self> {
        match s {
            "development" => Ok(Environment::Development),
            "production" => Ok(Environment::Production),
            "test" => Ok(Environment::Test),
            other => Err(AppError::Config(format!("ENVIRONMENT: unknown value {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub enum WalletKeySource {
    File(PathBuf),
    Base64(String),
}

/// Process-wide configuration, loaded once at startup. Missing or invalid
/// keys exit the process before anything else spins up.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub environment: Environment,

    pub chain_network: String,
    pub chain_rpc_url: String,
    pub safe_wallet_program_id: String,

    pub access_token_secret: String,
    pub access_token_issuer: String,
    pub access_token_ttl: String,
    pub refresh_token_ttl: String,

    pub log_level: String,
    pub database_path: PathBuf,
    pub cors_origins: Vec<String>,

    pub pool_api_url: String,
    pub predictor_url: String,
    pub predictor_api_key: Option<String>,

    pub wallet_key_source: Option<WalletKeySource>,
}

impl AppConfig {
    pub fn from_env() -> AppResult<Self> {
        dotenvy::dotenv().ok();

        let environment = Environment::parse(&env_var_or("ENVIRONMENT", "development"))?;

        let port = env_var_or("PORT", "8080")
            .parse::<u16>()
            .map_err(|e| AppError::Config(format!("PORT: {e}")))?;

        let access_token_secret = env_var("ACCESS_TOKEN_SECRET")?;
        if access_token_secret.len() < 32 {
            return Err(AppError::Config("ACCESS_TOKEN_SECRET must be at least 32 characters".into()));
        }

        let cors_origins: Vec<String> = match environment {
            Environment::Production => {
                let raw = env_var("CORS_ORIGINS")?;
                raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
            }
            _ => env_var_or("CORS_ORIGINS", "*")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        };

        let wallet_key_source = match (std::env::var("WALLET_KEY_PATH"), std::env::var("WALLET_KEY_BASE64")) {
            (Ok(p), _) => Some(WalletKeySource::File(PathBuf::from(p))),
            (_, Ok(b)) => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(&b)
                    .map_err(|e| AppError::Config(format!("WALLET_KEY_BASE64: {e}")))?;
                Some(WalletKeySource::Base64(b))
            }
            _ => None,
        };

        Ok(Self {
            port,
            environment,
            chain_network: env_var_or("CHAIN_NETWORK", "mainnet-beta"),
            chain_rpc_url: env_var("CHAIN_RPC_URL")?,
            safe_wallet_program_id: env_var_or("SAFE_WALLET_PROGRAM_ID", ""),
            access_token_secret,
            access_token_issuer: env_var_or("ACCESS_TOKEN_ISSUER", "dlmm-bot-orchestrator"),
            access_token_ttl: env_var_or("ACCESS_TOKEN_TTL", "15m"),
            refresh_token_ttl: env_var_or("REFRESH_TOKEN_TTL", "30d"),
            log_level: env_var_or("LOG_LEVEL", "info"),
            database_path: PathBuf::from(env_var_or("DATABASE_PATH", "data/bots.db")),
            cors_origins,
            pool_api_url: env_var_or("POOL_API_URL", "https://dlmm-api.example.com"),
            predictor_url: env_var_or("PREDICTOR_URL", "http://127.0.0.1:9100"),
            predictor_api_key: std::env::var("PREDICTOR_API_KEY").ok(),
            wallet_key_source,
        })
    }
}

fn env_var(key: &str) -> AppResult<String> {
    std::env::var(key).map_err(|_| AppError::Config(format!("missing env var: {key}")))
}

fn env_var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parse() {
        assert_eq!(Environment::parse("production").unwrap(), Environment::Production);
        assert!(Environment::parse("bogus").is_err());
    }
}
