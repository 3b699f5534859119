//! NovelAI batch generation library
//!
//! Modules:
//! - `template`: The generation template, cost estimation, and expansion
//!   into concrete per-request tasks.
//! - `metadata`: Recovery of generation parameters from produced PNG files,
//!   including the hidden pixel-bit fallback.
//! - `novelai`: Thin client for the NovelAI image generation REST endpoints.
//! - `runner`: Sequential execution engine with the cost-aware retry policy.
//! - `output`: Templated output path resolution.
//! - `config`: Env-driven configuration loader.
//! - `error`: Common error type and alias.
//!
//! Re-exports are provided for common types: `Config`, `NovelAiClient`,
//! `GenerationTemplate`, `GenerationTask`, and `Runner`.
pub mod config;
pub mod error;
pub mod metadata;
pub mod novelai;
pub mod output;
pub mod runner;
pub mod template;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use novelai::client::{NovelAiClient, SubscriptionInfo};
pub use runner::{ImageBackend, RunReport, RunState, Runner};
pub use template::expansion::GenerationTask;
pub use template::GenerationTemplate;
