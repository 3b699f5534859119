//! The generation request template and its value types.
//!
//! A [`GenerationTemplate`] is the single editable request: prompt text,
//! sampler parameters, batching and seeding controls, the wildcard/keyword
//! replacement spec, and the output path templates. It is expanded into
//! concrete per-request tasks by [`expansion`] and priced by [`cost`].
//!
//! The template has two independent JSON forms that must not be conflated:
//! the human-readable save/load form produced by [`GenerationTemplate::save`]
//! (field names as declared here), and the per-request wire parameter block
//! assembled by the API client. Image byte payloads are never part of the
//! saved form.
use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::output::DEFAULT_FILENAME_TEMPLATE;

pub mod cost;
pub mod expansion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ImageModel {
    #[default]
    #[serde(rename = "nai-diffusion-3")]
    NaiDiffusion3,
    #[serde(rename = "nai-diffusion-furry-3")]
    NaiDiffusionFurry3,
    #[serde(rename = "nai-diffusion-2")]
    NaiDiffusion2,
    #[serde(rename = "nai-diffusion")]
    NaiDiffusion,
    #[serde(rename = "safe-diffusion")]
    SafeDiffusion,
}

impl ImageModel {
    /// The current flagship is the only model priced through the size/steps
    /// curve; everything older bills the flat floor.
    pub fn is_flagship(self) -> bool {
        matches!(self, ImageModel::NaiDiffusion3)
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            ImageModel::NaiDiffusion3 => "nai-diffusion-3",
            ImageModel::NaiDiffusionFurry3 => "nai-diffusion-furry-3",
            ImageModel::NaiDiffusion2 => "nai-diffusion-2",
            ImageModel::NaiDiffusion => "nai-diffusion",
            ImageModel::SafeDiffusion => "safe-diffusion",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Sampler {
    #[serde(rename = "k_euler")]
    KEuler,
    #[default]
    #[serde(rename = "k_euler_ancestral")]
    KEulerAncestral,
    #[serde(rename = "k_dpmpp_2s_ancestral")]
    KDpmpp2sAncestral,
    #[serde(rename = "k_dpmpp_2m")]
    KDpmpp2m,
    #[serde(rename = "k_dpmpp_sde")]
    KDpmppSde,
    #[serde(rename = "ddim_v3")]
    DdimV3,
}

impl Sampler {
    /// DDIM is the one sampler the service rejects SMEA for.
    pub fn supports_smea(self) -> bool {
        !matches!(self, Sampler::DdimV3)
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            Sampler::KEuler => "k_euler",
            Sampler::KEulerAncestral => "k_euler_ancestral",
            Sampler::KDpmpp2sAncestral => "k_dpmpp_2s_ancestral",
            Sampler::KDpmpp2m => "k_dpmpp_2m",
            Sampler::KDpmppSde => "k_dpmpp_sde",
            Sampler::DdimV3 => "ddim_v3",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NoiseSchedule {
    #[default]
    #[serde(rename = "native")]
    Native,
    #[serde(rename = "karras")]
    Karras,
    #[serde(rename = "exponential")]
    Exponential,
    #[serde(rename = "polyexponential")]
    Polyexponential,
}

/// The single editable generation request, before expansion.
///
/// Invariants maintained by expansion rather than by construction:
/// `smea_dyn` implies `smea`, concrete tasks always carry a resolved seed,
/// and `strength`/`noise` are cleared whenever no base image is attached
/// (their presence is what switches the service into image-to-image mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationTemplate {
    pub prompt: String,
    pub negative_prompt: String,
    pub model: ImageModel,
    pub sampler: Sampler,
    pub noise_schedule: NoiseSchedule,
    pub steps: u8,
    pub scale: f64,
    pub cfg_rescale: f64,
    pub uncond_scale: f64,
    pub width: u32,
    pub height: u32,
    pub smea: bool,
    pub smea_dyn: bool,
    /// Assigned once at expansion time when absent.
    pub seed: Option<i64>,
    pub batch_size: u32,
    /// Reseed every batch member except the first.
    pub all_random: bool,
    /// Retry failed tasks even when they would bill.
    pub retry_all: bool,
    /// Write a JPEG sibling next to every saved image.
    pub save_jpeg: bool,
    /// Row-oriented wildcard spec: `find,alternative1,alternative2,...` per line.
    pub replace_spec: String,
    /// Flat keyword table applied to every expanded prompt.
    pub replacements: BTreeMap<String, String>,
    pub output_path: String,
    pub output_filename: String,
    pub legacy_v3_extend: bool,
    pub strength: Option<f64>,
    pub noise: Option<f64>,
    pub reference_strength: Option<f64>,
    #[serde(skip)]
    pub base_image: Option<Vec<u8>>,
    #[serde(skip)]
    pub reference_images: Vec<Vec<u8>>,
}

impl Default for GenerationTemplate {
    fn default() -> Self {
        GenerationTemplate {
            prompt: String::new(),
            negative_prompt: String::new(),
            model: ImageModel::default(),
            sampler: Sampler::default(),
            noise_schedule: NoiseSchedule::default(),
            steps: 28,
            scale: 5.0,
            cfg_rescale: 0.0,
            uncond_scale: 1.0,
            width: 832,
            height: 1216,
            smea: false,
            smea_dyn: false,
            seed: None,
            batch_size: 1,
            all_random: false,
            retry_all: false,
            save_jpeg: false,
            replace_spec: String::new(),
            replacements: BTreeMap::new(),
            output_path: "output".to_string(),
            output_filename: DEFAULT_FILENAME_TEMPLATE.to_string(),
            legacy_v3_extend: true,
            strength: None,
            noise: None,
            reference_strength: None,
            base_image: None,
            reference_images: Vec::new(),
        }
    }
}

impl GenerationTemplate {
    /// Load the human-readable save form from a file.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write the human-readable save form to a file. Byte payloads are not
    /// persisted.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_form_uses_declared_field_names() {
        let template = GenerationTemplate {
            prompt: "1girl".to_string(),
            smea: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&template).unwrap();
        assert!(json.contains("\"negative_prompt\""));
        assert!(json.contains("\"nai-diffusion-3\""));
        assert!(json.contains("\"k_euler_ancestral\""));
        // payload bytes never round through the save form
        assert!(!json.contains("base_image"));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let template: GenerationTemplate =
            serde_json::from_str(r#"{"prompt":"castle","steps":20}"#).unwrap();
        assert_eq!(template.prompt, "castle");
        assert_eq!(template.steps, 20);
        assert_eq!(template.batch_size, 1);
        assert!(template.legacy_v3_extend);
        assert_eq!(template.output_filename, DEFAULT_FILENAME_TEMPLATE);
    }
}
