//! Env-driven configuration for the library and the CLI binary.
//!
//! Values are read from the process environment; `dotenv` is loaded on demand
//! by the binary. Defaults are provided for convenience during development.
//! The subscription fields are only a fallback for when the account endpoint
//! cannot be reached.
use std::env;

pub struct Config {
    pub api_url: String,
    pub token: String,
    pub output_path: String,
    pub subscription_tier: i64,
    pub subscription_active: bool,
}

impl Config {
    pub fn dotenv_load() {
        dotenv::dotenv().ok();
    }

    pub fn new() -> Result<Self, env::VarError> {
        Ok(Config {
            api_url: env::var("NOVELAI_API_URL")
                .unwrap_or_else(|_| "https://api.novelai.net".to_string()),
            token: env::var("NOVELAI_TOKEN").unwrap_or_default(),
            output_path: env::var("OUTPUT_PATH").unwrap_or_else(|_| "./output".to_string()),
            subscription_tier: env::var("SUBSCRIPTION_TIER")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            subscription_active: env::var("SUBSCRIPTION_ACTIVE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        })
    }

    pub fn print_env_vars() {
        println!(
            "NOVELAI_API_URL: {}",
            env::var("NOVELAI_API_URL").unwrap_or_else(|_| "<unset>".to_string())
        );
        // Never echo the credential itself.
        println!(
            "NOVELAI_TOKEN: {}",
            if env::var("NOVELAI_TOKEN").is_ok() { "<set>" } else { "<unset>" }
        );
        println!(
            "OUTPUT_PATH: {}",
            env::var("OUTPUT_PATH").unwrap_or_else(|_| "<unset>".to_string())
        );
        println!(
            "SUBSCRIPTION_TIER: {}",
            env::var("SUBSCRIPTION_TIER").unwrap_or_else(|_| "<unset>".to_string())
        );
        println!(
            "SUBSCRIPTION_ACTIVE: {}",
            env::var("SUBSCRIPTION_ACTIVE").unwrap_or_else(|_| "<unset>".to_string())
        );
    }
}
