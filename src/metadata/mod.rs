//! Recovery of generation parameters from produced PNG files.
//!
//! Generated images carry their request parameters either in a plain `tEXt`
//! chunk (`Comment` holds the parameter JSON, `Source` names the model build)
//! or, when the file was laundered through a metadata-stripping host, hidden
//! in the low bits of the pixel data (see [`stealth`]). Either way the result
//! is rebuilt into a [`GenerationTemplate`] ready for re-expansion.
use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::template::{GenerationTemplate, ImageModel, NoiseSchedule, Sampler};

pub mod stealth;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Longest key a `tEXt` chunk may carry per the container spec.
const TEXT_KEY_MAX: usize = 79;

/// Read a template back from a generated image file.
pub fn read_template_from_file(path: &Path) -> AppResult<GenerationTemplate> {
    let bytes = std::fs::read(path)?;
    read_template(&bytes)
}

/// Read a template back from raw container bytes.
///
/// Prefers the plain `Comment` text chunk; falls back to steganographic
/// extraction when the text chunks were stripped.
pub fn read_template(bytes: &[u8]) -> AppResult<GenerationTemplate> {
    let text = text_chunks(bytes)?;

    let (comment, source) = match text.get("Comment") {
        Some(comment) => (comment.clone(), text.get("Source").cloned()),
        None => {
            let img = image::load_from_memory(bytes)?;
            let hidden = stealth::extract_text(&img)?;
            if hidden.is_empty() {
                return Err(AppError::Format("no generation metadata found".to_string()));
            }
            // The hidden payload mirrors the text-chunk map as one JSON
            // object; the parameter block may sit one level down under
            // "Comment".
            let value: Value = serde_json::from_str(&hidden)?;
            match value.get("Comment").and_then(Value::as_str) {
                Some(comment) => (
                    comment.to_string(),
                    value
                        .get("Source")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                ),
                None => (hidden, None),
            }
        }
    };

    template_from_comment(&comment, source.as_deref())
}

/// Walk the chunk stream and collect `tEXt` entries up to the first image
/// data chunk. Chunk CRCs are skipped, not validated.
fn text_chunks(bytes: &[u8]) -> AppResult<HashMap<String, String>> {
    if bytes.len() < PNG_SIGNATURE.len() || bytes[..PNG_SIGNATURE.len()] != PNG_SIGNATURE {
        return Err(AppError::Format("missing PNG signature".to_string()));
    }

    let mut map = HashMap::new();
    let mut pos = PNG_SIGNATURE.len();
    while pos + 8 <= bytes.len() {
        let length =
            u32::from_be_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
                as usize;
        let chunk_type = &bytes[pos + 4..pos + 8];
        let data_start = pos + 8;
        let Some(data_end) = data_start.checked_add(length) else {
            break;
        };
        if data_end + 4 > bytes.len() {
            break;
        }
        if chunk_type == b"IDAT" {
            break;
        }
        if chunk_type == b"tEXt" {
            let data = &bytes[data_start..data_end];
            if let Some(nul) = data.iter().position(|&b| b == 0) {
                if (1..=TEXT_KEY_MAX).contains(&nul) {
                    let key = String::from_utf8_lossy(&data[..nul]).into_owned();
                    let value = String::from_utf8_lossy(&data[nul + 1..]).into_owned();
                    map.insert(key, value);
                }
            }
        }
        pos = data_end + 4;
    }
    Ok(map)
}

/// `Source` text values name the model build by family plus a short hash.
fn model_from_source(source: &str) -> Option<ImageModel> {
    match source {
        "Stable Diffusion XL C1E1DE52" | "Stable Diffusion XL 8BA2AF87" => {
            Some(ImageModel::NaiDiffusion3)
        }
        "Stable Diffusion XL 9CC2F394" | "Stable Diffusion XL 37C2B166" => {
            Some(ImageModel::NaiDiffusionFurry3)
        }
        "Stable Diffusion F1022D28" | "Stable Diffusion 81274D13" => {
            Some(ImageModel::NaiDiffusion2)
        }
        "Stable Diffusion 3B3287AF" | "Stable Diffusion 1D44365E" => {
            Some(ImageModel::NaiDiffusion)
        }
        _ => None,
    }
}

/// Typed slice of the parameter JSON. `prompt` and `uc` are not part of this
/// block; they ride at the top level of the raw object.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawParams {
    steps: u8,
    width: u32,
    height: u32,
    scale: f64,
    cfg_rescale: f64,
    uncond_scale: f64,
    seed: Option<i64>,
    n_samples: u32,
    sampler: Option<Sampler>,
    noise_schedule: Option<NoiseSchedule>,
    sm: bool,
    sm_dyn: bool,
    legacy_v3_extend: bool,
    reference_strength: Option<f64>,
    strength: Option<f64>,
    noise: Option<f64>,
}

impl Default for RawParams {
    fn default() -> Self {
        let defaults = GenerationTemplate::default();
        RawParams {
            steps: defaults.steps,
            width: defaults.width,
            height: defaults.height,
            scale: defaults.scale,
            cfg_rescale: defaults.cfg_rescale,
            uncond_scale: defaults.uncond_scale,
            seed: None,
            n_samples: 1,
            sampler: None,
            noise_schedule: None,
            sm: false,
            sm_dyn: false,
            legacy_v3_extend: true,
            reference_strength: None,
            strength: None,
            noise: None,
        }
    }
}

fn template_from_comment(comment: &str, source: Option<&str>) -> AppResult<GenerationTemplate> {
    let value: Value = serde_json::from_str(comment)?;
    let params: RawParams = serde_json::from_value(value.clone())?;

    let mut template = GenerationTemplate {
        prompt: value
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        negative_prompt: value
            .get("uc")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        steps: params.steps,
        width: params.width,
        height: params.height,
        scale: params.scale,
        cfg_rescale: params.cfg_rescale,
        uncond_scale: params.uncond_scale,
        seed: params.seed,
        batch_size: params.n_samples.max(1),
        smea: params.sm,
        smea_dyn: params.sm_dyn && params.sm,
        legacy_v3_extend: params.legacy_v3_extend,
        // The service reports 0 when no reference image was attached; treat
        // anything below the noise floor as unset.
        reference_strength: params.reference_strength.filter(|s| *s >= 0.01),
        strength: params.strength,
        noise: params.noise,
        ..Default::default()
    };
    if let Some(sampler) = params.sampler {
        template.sampler = sampler;
    }
    if let Some(schedule) = params.noise_schedule {
        template.noise_schedule = schedule;
    }
    if let Some(model) = source.and_then(model_from_source) {
        template.model = model;
    }
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(chunk_type: &[u8; 4], data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 12);
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(chunk_type);
        out.extend_from_slice(data);
        out.extend_from_slice(&[0, 0, 0, 0]); // CRC is never validated
        out
    }

    fn text_chunk(key: &str, value: &str) -> Vec<u8> {
        let mut data = key.as_bytes().to_vec();
        data.push(0);
        data.extend_from_slice(value.as_bytes());
        chunk(b"tEXt", &data)
    }

    fn container(chunks: &[Vec<u8>]) -> Vec<u8> {
        let mut bytes = PNG_SIGNATURE.to_vec();
        for c in chunks {
            bytes.extend_from_slice(c);
        }
        bytes
    }

    const COMMENT: &str = r#"{
        "prompt": "1girl, red dress",
        "uc": "lowres, bad anatomy",
        "steps": 23,
        "width": 640,
        "height": 640,
        "scale": 7.5,
        "cfg_rescale": 0.1,
        "uncond_scale": 1.0,
        "seed": 42,
        "n_samples": 1,
        "sampler": "k_euler",
        "noise_schedule": "karras",
        "sm": true,
        "sm_dyn": false,
        "reference_strength": 0.0
    }"#;

    #[test]
    fn rejects_a_missing_signature() {
        let err = read_template(b"GIF89a...").unwrap_err();
        assert!(matches!(err, AppError::Format(_)));
    }

    #[test]
    fn recovers_a_template_from_the_comment_chunk() {
        let bytes = container(&[
            chunk(b"IHDR", &[0; 13]),
            text_chunk("Software", "NovelAI"),
            text_chunk("Source", "Stable Diffusion F1022D28"),
            text_chunk("Comment", COMMENT),
            chunk(b"IDAT", &[0; 8]),
        ]);
        let template = read_template(&bytes).unwrap();
        assert_eq!(template.prompt, "1girl, red dress");
        assert_eq!(template.negative_prompt, "lowres, bad anatomy");
        assert_eq!(template.steps, 23);
        assert_eq!((template.width, template.height), (640, 640));
        assert_eq!(template.seed, Some(42));
        assert_eq!(template.sampler, Sampler::KEuler);
        assert_eq!(template.noise_schedule, NoiseSchedule::Karras);
        assert_eq!(template.model, ImageModel::NaiDiffusion2);
        assert!(template.smea);
        assert!(!template.smea_dyn);
        assert!(template.legacy_v3_extend, "absent field defaults to true");
        assert_eq!(template.reference_strength, None, "0.0 reads as unset");
    }

    #[test]
    fn chunks_after_the_image_data_are_ignored() {
        let bytes = container(&[
            chunk(b"IHDR", &[0; 13]),
            chunk(b"IDAT", &[0; 8]),
            text_chunk("Comment", COMMENT),
        ]);
        let err = read_template(&bytes).unwrap_err();
        // No text chunk before IDAT and no hidden payload in an unparseable
        // image body.
        assert!(matches!(
            err,
            AppError::Format(_) | AppError::Image(_)
        ));
    }

    #[test]
    fn text_keys_longer_than_the_limit_are_skipped() {
        let long_key = "k".repeat(TEXT_KEY_MAX + 1);
        let bytes = container(&[
            chunk(b"IHDR", &[0; 13]),
            text_chunk(&long_key, "value"),
            chunk(b"IDAT", &[0; 8]),
        ]);
        let map = text_chunks(&bytes).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn unknown_source_hashes_keep_the_default_model() {
        let template = template_from_comment(COMMENT, Some("Stable Diffusion DEADBEEF")).unwrap();
        assert_eq!(template.model, ImageModel::default());
    }

    #[test]
    fn garbage_comment_payload_is_a_json_error() {
        let err = template_from_comment("not json at all", None).unwrap_err();
        assert!(matches!(err, AppError::Json(_)));
    }
}
