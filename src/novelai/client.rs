//! Thin HTTP client for the NovelAI image generation endpoints.
//!
//! - `generate_image` posts one concrete task to `/ai/generate-image` and
//!   returns the response archive bytes.
//! - `user_subscription` fetches the account tier used by the retry policy.
//!
//! Requests carry the caller's bearer credential and a fixed two-minute
//! timeout; the engine treats anything slower as a failed attempt.
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::template::expansion::GenerationTask;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct NovelAiClient {
    client: Client,
    base_url: String,
    token: String,
}

/// Account standing, as far as the retry policy cares.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriptionInfo {
    pub tier: i64,
    pub active: bool,
}

/// Structured error body the service returns alongside non-success statuses.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(rename = "statusCode")]
    status_code: Option<u16>,
    message: Option<String>,
}

impl NovelAiClient {
    pub fn new(base_url: String, token: String) -> Self {
        let base = base_url.trim_end_matches('/').to_string();
        NovelAiClient {
            client: Client::new(),
            base_url: base,
            token,
        }
    }

    /// Submit one concrete task and return the multi-file archive the service
    /// answers with.
    pub async fn generate_image(&self, task: &GenerationTask) -> AppResult<Vec<u8>> {
        let url = format!("{}/ai/generate-image", self.base_url);
        let body = request_body(task);
        tracing::info!("Submitting generation request to {}", url);
        tracing::debug!(seed = task.template.seed, "Prompt: {}", task.template.prompt);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(AppError::HttpClient)?;

        if response.status().is_success() {
            response
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(AppError::HttpClient)
        } else {
            Err(api_error(response).await)
        }
    }

    /// Fetch the account's subscription tier and active flag.
    pub async fn user_subscription(&self) -> AppResult<SubscriptionInfo> {
        let url = format!("{}/user/subscription", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(AppError::HttpClient)?;

        if response.status().is_success() {
            let body: Value = response.json().await.map_err(AppError::HttpClient)?;
            Ok(SubscriptionInfo {
                tier: body.get("tier").and_then(Value::as_i64).unwrap_or(0),
                active: body.get("active").and_then(Value::as_bool).unwrap_or(false),
            })
        } else {
            Err(api_error(response).await)
        }
    }
}

/// Parse a failure response into `AppError::Api`, keeping the structured
/// `{statusCode, message}` body when the content type says it carries one.
async fn api_error(response: reqwest::Response) -> AppError {
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unable to read error body".to_string());

    if content_type.contains("json") || content_type.contains("text") {
        if let Ok(parsed) = serde_json::from_str::<ApiErrorBody>(&body) {
            return AppError::Api {
                status: parsed.status_code.unwrap_or(status),
                message: parsed.message.unwrap_or(body),
            };
        }
    }
    AppError::Api {
        status,
        message: body,
    }
}

/// Assemble the wire body for one task: snake_case keys, with the parameter
/// block switching between text-to-image and image-to-image by base image
/// presence.
pub fn request_body(task: &GenerationTask) -> Value {
    let t = &task.template;
    let action = if t.base_image.is_some() {
        "img2img"
    } else {
        "generate"
    };

    let mut parameters = json!({
        "width": t.width,
        "height": t.height,
        "scale": t.scale,
        "sampler": t.sampler,
        "steps": t.steps,
        "n_samples": 1,
        "seed": t.seed,
        "sm": t.smea,
        "sm_dyn": t.smea_dyn,
        "cfg_rescale": t.cfg_rescale,
        "uncond_scale": t.uncond_scale,
        "noise_schedule": t.noise_schedule,
        "negative_prompt": t.negative_prompt,
        "legacy_v3_extend": t.legacy_v3_extend,
    });

    if let Some(params) = parameters.as_object_mut() {
        if let Some(base) = &t.base_image {
            params.insert("image".to_string(), Value::String(BASE64.encode(base)));
            if let Some(strength) = t.strength {
                params.insert("strength".to_string(), json!(strength));
            }
            if let Some(noise) = t.noise {
                params.insert("noise".to_string(), json!(noise));
            }
            // The noise stream of an img2img request is pinned to the task
            // seed so retries redraw the same image.
            params.insert("extra_noise_seed".to_string(), json!(t.seed));
        }
        if !t.reference_images.is_empty() {
            let images: Vec<Value> = t
                .reference_images
                .iter()
                .map(|bytes| Value::String(BASE64.encode(bytes)))
                .collect();
            let strengths =
                vec![json!(t.reference_strength.unwrap_or(0.6)); t.reference_images.len()];
            params.insert("reference_image_multiple".to_string(), Value::Array(images));
            params.insert(
                "reference_strength_multiple".to_string(),
                Value::Array(strengths),
            );
        }
    }

    json!({
        "input": t.prompt,
        "model": t.model,
        "action": action,
        "parameters": parameters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::GenerationTemplate;

    fn task() -> GenerationTask {
        GenerationTask {
            template: GenerationTemplate {
                prompt: "1girl, red dress".to_string(),
                negative_prompt: "lowres".to_string(),
                seed: Some(42),
                ..Default::default()
            },
            current_replace: "red".to_string(),
        }
    }

    #[test]
    fn wire_body_uses_snake_case_keys() {
        let body = request_body(&task());
        assert_eq!(body["input"], "1girl, red dress");
        assert_eq!(body["model"], "nai-diffusion-3");
        assert_eq!(body["action"], "generate");
        let params = &body["parameters"];
        assert_eq!(params["sampler"], "k_euler_ancestral");
        assert_eq!(params["noise_schedule"], "native");
        assert_eq!(params["negative_prompt"], "lowres");
        assert_eq!(params["n_samples"], 1);
        assert_eq!(params["seed"], 42);
        assert!(params.get("image").is_none());
        assert!(params.get("strength").is_none());
    }

    #[test]
    fn base_image_switches_the_action_and_pins_the_noise_seed() {
        let mut task = task();
        task.template.base_image = Some(vec![1, 2, 3]);
        task.template.strength = Some(0.7);
        task.template.noise = Some(0.1);
        let body = request_body(&task);
        assert_eq!(body["action"], "img2img");
        let params = &body["parameters"];
        assert_eq!(params["image"], BASE64.encode([1, 2, 3]));
        assert_eq!(params["strength"], 0.7);
        assert_eq!(params["extra_noise_seed"], 42);
    }

    #[test]
    fn reference_images_ride_as_parallel_arrays() {
        let mut task = task();
        task.template.reference_images = vec![vec![1], vec![2]];
        task.template.reference_strength = Some(0.8);
        let body = request_body(&task);
        let params = &body["parameters"];
        assert_eq!(params["reference_image_multiple"].as_array().unwrap().len(), 2);
        assert_eq!(params["reference_strength_multiple"][1], 0.8);
    }
}
