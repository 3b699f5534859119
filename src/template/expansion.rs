//! Template expansion: one template in, an ordered list of concrete tasks out.
//!
//! Expansion multiplies a template along two axes: the Cartesian product of
//! the wildcard replacement rows that apply to the prompt, and the batch
//! size. Enumeration is combination-major (all batch members of the first
//! combination, then the second, ...), and the seed source is drawn in
//! exactly that order, so callers that need reproducible seeds inject a
//! seeded generator.
use rand::Rng;

use crate::error::AppResult;
use crate::template::GenerationTemplate;

/// One fully-resolved request instance produced by expansion.
///
/// Owns a deep copy of the template with `prompt` and `seed` concrete;
/// `current_replace` only feeds the `{replace}` output-path placeholder.
#[derive(Debug, Clone)]
pub struct GenerationTask {
    pub template: GenerationTemplate,
    pub current_replace: String,
}

struct ReplaceRow {
    target: String,
    alternatives: Vec<String>,
}

/// Split on commas, trim each segment, rejoin. Collapses the incidental
/// whitespace users type around tag separators so downstream matching sees a
/// canonical prompt.
pub fn normalize_prompt(prompt: &str) -> String {
    prompt
        .split(',')
        .map(str::trim)
        .collect::<Vec<_>>()
        .join(",")
}

fn boundary_before(prompt: &str, idx: usize) -> bool {
    let before = prompt[..idx].trim_end_matches(['{', '[']);
    match before.chars().last() {
        None => true,
        Some(c) => c == ',' || c.is_whitespace(),
    }
}

fn boundary_after(prompt: &str, idx: usize) -> bool {
    let after = prompt[idx..].trim_start_matches(['}', ']']);
    match after.chars().next() {
        None => true,
        Some(c) => c == ',' || c.is_whitespace(),
    }
}

/// Whether `target` occurs in `prompt` as a whole tag: bounded by the prompt
/// edges, commas, or whitespace, with any number of emphasis brackets
/// (`{`/`[` and their closers) allowed around the occurrence. `red` is a
/// whole tag inside `a red,dress` but not inside `reddish,dress`.
fn is_whole_tag(prompt: &str, target: &str) -> bool {
    if target.is_empty() {
        return false;
    }
    let mut from = 0;
    while let Some(pos) = prompt[from..].find(target) {
        let begin = from + pos;
        let end = begin + target.len();
        if boundary_before(prompt, begin) && boundary_after(prompt, end) {
            return true;
        }
        from = begin + prompt[begin..].chars().next().map_or(1, char::len_utf8);
    }
    false
}

/// Parse the row-oriented replacement spec against an already-normalized
/// prompt. Rows whose target is not present as a whole tag, and rows without
/// at least one alternative column, contribute nothing.
fn parse_replace_rows(spec: &str, normalized_prompt: &str) -> Vec<ReplaceRow> {
    let mut rows = Vec::new();
    for line in spec.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<String> = line.split(',').map(|f| f.trim().to_string()).collect();
        let target = &fields[0];
        if !is_whole_tag(normalized_prompt, target) {
            continue;
        }
        if fields.len() < 2 {
            continue;
        }
        rows.push(ReplaceRow {
            target: target.clone(),
            alternatives: fields[1..].to_vec(),
        });
    }
    rows
}

/// Apply the flat keyword table word by word. A word matches its key either
/// verbatim or with surrounding emphasis brackets stripped; the brackets stay
/// around the substituted value.
fn apply_keyword_table(
    prompt: &str,
    table: &std::collections::BTreeMap<String, String>,
) -> String {
    if table.is_empty() {
        return prompt.to_string();
    }
    let mut out = String::with_capacity(prompt.len());
    let mut word = String::new();
    for c in prompt.chars() {
        if c == ',' || c.is_whitespace() {
            push_word(&mut out, &word, table);
            word.clear();
            out.push(c);
        } else {
            word.push(c);
        }
    }
    push_word(&mut out, &word, table);
    out
}

fn push_word(out: &mut String, word: &str, table: &std::collections::BTreeMap<String, String>) {
    if word.is_empty() {
        return;
    }
    if let Some(value) = table.get(word) {
        out.push_str(value);
        return;
    }
    let opened = word.trim_start_matches(['{', '[']);
    let core = opened.trim_end_matches(['}', ']']);
    if core.len() != word.len() {
        if let Some(value) = table.get(core) {
            out.push_str(&word[..word.len() - opened.len()]);
            out.push_str(value);
            out.push_str(&opened[core.len()..]);
            return;
        }
    }
    out.push_str(word);
}

fn draw_seed<R: Rng>(rng: &mut R) -> i64 {
    rng.gen::<u32>() as i64
}

fn prepare_base_image(bytes: &[u8], width: u32, height: u32) -> AppResult<Vec<u8>> {
    let img = image::load_from_memory(bytes)?;
    let resized = img.resize_exact(width, height, image::imageops::FilterType::Lanczos3);
    let mut out = std::io::Cursor::new(Vec::new());
    resized.write_to(&mut out, image::ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// Expand one template into its ordered task list.
pub fn expand<R: Rng>(
    template: &GenerationTemplate,
    rng: &mut R,
) -> AppResult<Vec<GenerationTask>> {
    let normalized = normalize_prompt(&template.prompt);
    let rows = parse_replace_rows(&template.replace_spec, &normalized);

    // One draw for the whole expansion; every combination shares it at batch
    // index 0.
    let base_seed = match template.seed {
        Some(seed) => seed,
        None => draw_seed(rng),
    };

    let base_image = match &template.base_image {
        Some(bytes) => Some(prepare_base_image(bytes, template.width, template.height)?),
        None => None,
    };

    let mut prompts: Vec<(String, Option<String>)> = Vec::new();
    if rows.is_empty() {
        prompts.push((normalized, None));
    } else {
        let total: usize = rows.iter().map(|r| r.alternatives.len()).product();
        for index in 0..total {
            let mut remainder = index;
            let mut picks = vec![0usize; rows.len()];
            for (i, row) in rows.iter().enumerate().rev() {
                picks[i] = remainder % row.alternatives.len();
                remainder /= row.alternatives.len();
            }
            let mut prompt = normalized.clone();
            let mut chosen = Vec::with_capacity(rows.len());
            for (row, &pick) in rows.iter().zip(&picks) {
                let alternative = &row.alternatives[pick];
                prompt = prompt.replace(&row.target, alternative);
                chosen.push(alternative.clone());
            }
            prompts.push((prompt, Some(chosen.join(","))));
        }
    }

    let mut tasks = Vec::with_capacity(prompts.len() * template.batch_size as usize);
    for (prompt, label) in &prompts {
        for j in 0..template.batch_size {
            let seed = if j == 0 {
                base_seed
            } else if template.all_random {
                draw_seed(rng)
            } else {
                base_seed + j as i64
            };
            tasks.push(build_task(
                template,
                prompt,
                label.as_deref(),
                seed,
                base_image.as_ref(),
            ));
        }
    }
    Ok(tasks)
}

fn build_task(
    template: &GenerationTemplate,
    prompt: &str,
    label: Option<&str>,
    seed: i64,
    base_image: Option<&Vec<u8>>,
) -> GenerationTask {
    let mut resolved = template.clone();
    resolved.prompt = apply_keyword_table(prompt, &template.replacements);
    resolved.seed = Some(seed);

    if !resolved.sampler.supports_smea() {
        resolved.smea = false;
    }
    resolved.smea_dyn = resolved.smea_dyn && resolved.smea;

    match base_image {
        Some(bytes) => resolved.base_image = Some(bytes.clone()),
        None => {
            // No base image: strip the fields whose presence would flip the
            // request into image-to-image mode.
            resolved.base_image = None;
            resolved.strength = None;
            resolved.noise = None;
        }
    }

    let current_replace = match label {
        Some(label) => label.to_string(),
        None => resolved.prompt.clone(),
    };
    GenerationTask {
        template: resolved,
        current_replace,
    }
}
