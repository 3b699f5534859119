//! Templated output path resolution.
//!
//! Both the directory template and the filename template accept `{name}`
//! placeholders (`date`, `time`, `seed`, `prompt`, `replace`); unknown names
//! are left verbatim so a literal braced segment survives. Resolved segments
//! are sanitized for the filesystem, and existing files are never
//! overwritten: collisions get a `" (n)"` suffix before the extension.
use std::collections::HashMap;
use std::path::{Path, PathBuf, MAIN_SEPARATOR, MAIN_SEPARATOR_STR};

use crate::error::AppResult;

pub const DEFAULT_FILENAME_TEMPLATE: &str = "{seed}-{prompt}";

/// Resolved filenames are clamped before the extension is appended; prompts
/// can be arbitrarily long.
const MAX_FILENAME_LEN: usize = 128;

const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Substitute `{name}` placeholders. Unknown names stay verbatim, braces
/// included.
pub fn substitute(template: &str, placeholders: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        match rest[open + 1..].find('}') {
            Some(close) => {
                let name = &rest[open + 1..open + 1 + close];
                match placeholders.get(name) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[open..open + close + 2]),
                }
                rest = &rest[open + close + 2..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if INVALID_CHARS.contains(&c) || (c as u32) < 0x20 {
                '_'
            } else {
                c
            }
        })
        .collect()
}

fn is_drive_prefix(segment: &str) -> bool {
    segment.len() == 2
        && segment.ends_with(':')
        && segment.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
}

/// Resolve the directory template: placeholder substitution and sanitization
/// per segment, with rooted prefixes passed through untouched.
pub fn resolve_directory(path_template: &str, placeholders: &HashMap<&str, String>) -> PathBuf {
    let mut resolved = PathBuf::new();
    for (i, segment) in path_template.split(MAIN_SEPARATOR).enumerate() {
        if segment.is_empty() {
            if i == 0 {
                resolved.push(MAIN_SEPARATOR_STR);
            }
            continue;
        }
        if i == 0 && is_drive_prefix(segment) {
            resolved.push(segment);
            continue;
        }
        resolved.push(sanitize(&substitute(segment, placeholders)));
    }
    resolved
}

/// Resolve the filename template to a sanitized, length-clamped stem. A
/// template that resolves blank falls back to the default.
pub fn resolve_filename(filename_template: &str, placeholders: &HashMap<&str, String>) -> String {
    let mut name = substitute(filename_template, placeholders);
    if name.trim().is_empty() {
        name = substitute(DEFAULT_FILENAME_TEMPLATE, placeholders);
    }
    sanitize(name.trim()).chars().take(MAX_FILENAME_LEN).collect()
}

/// First non-existing path for `stem.extension` under `dir`, suffixing
/// `" (1)"`, `" (2)"`, ... on collision.
pub fn disambiguate(dir: &Path, stem: &str, extension: &str) -> PathBuf {
    let candidate = dir.join(format!("{stem}.{extension}"));
    if !candidate.exists() {
        return candidate;
    }
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem} ({n}).{extension}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Resolve the full output path for one file, creating the directory tree.
pub fn resolve_output_path(
    path_template: &str,
    filename_template: &str,
    placeholders: &HashMap<&str, String>,
    extension: &str,
) -> AppResult<PathBuf> {
    let dir = resolve_directory(path_template, placeholders);
    std::fs::create_dir_all(&dir)?;
    let stem = resolve_filename(filename_template, placeholders);
    Ok(disambiguate(&dir, &stem, extension))
}

/// The placeholder set the execution engine populates at submission time.
pub fn placeholder_map(seed: i64, prompt: &str, replace: &str) -> HashMap<&'static str, String> {
    let now = chrono::Local::now();
    HashMap::from([
        ("date", now.format("%Y-%m-%d").to_string()),
        ("time", now.format("%H-%M-%S").to_string()),
        ("seed", seed.to_string()),
        ("prompt", prompt.to_string()),
        ("replace", replace.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placeholders() -> HashMap<&'static str, String> {
        HashMap::from([
            ("seed", "42".to_string()),
            ("prompt", "a castle".to_string()),
            ("replace", "red".to_string()),
        ])
    }

    #[test]
    fn substitutes_known_placeholders() {
        assert_eq!(
            substitute("{seed}-{prompt}", &placeholders()),
            "42-a castle"
        );
    }

    #[test]
    fn unknown_placeholders_stay_verbatim() {
        assert_eq!(substitute("{seed}-{huh}", &placeholders()), "42-{huh}");
        assert_eq!(substitute("dangling {seed", &placeholders()), "dangling {seed");
    }

    #[test]
    fn blank_filename_falls_back_to_the_default_template() {
        assert_eq!(resolve_filename("   ", &placeholders()), "42-a castle");
    }

    #[test]
    fn filenames_are_sanitized_and_clamped() {
        let mut map = placeholders();
        map.insert("prompt", format!("a/b:c{}", "x".repeat(300)));
        let name = resolve_filename("{seed}-{prompt}", &map);
        assert!(name.starts_with("42-a_b_c"));
        assert_eq!(name.chars().count(), MAX_FILENAME_LEN);
    }

    #[test]
    fn collisions_get_numbered_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let first = disambiguate(dir.path(), "42-a castle", "png");
        assert_eq!(first.file_name().unwrap(), "42-a castle.png");
        std::fs::write(&first, b"x").unwrap();

        let second = disambiguate(dir.path(), "42-a castle", "png");
        assert_eq!(second.file_name().unwrap(), "42-a castle (1).png");
        std::fs::write(&second, b"x").unwrap();

        let third = disambiguate(dir.path(), "42-a castle", "png");
        assert_eq!(third.file_name().unwrap(), "42-a castle (2).png");
    }

    #[test]
    fn resolve_creates_the_directory_tree() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir
            .path()
            .join("{date}")
            .join("{replace}")
            .to_string_lossy()
            .into_owned();
        let mut map = placeholders();
        map.insert("date", "2026-08-06".to_string());
        let path = resolve_output_path(&template, "{seed}", &map, "png").unwrap();
        assert!(path.parent().unwrap().is_dir());
        assert!(path.ends_with("2026-08-06/red/42.png"));
    }

    #[test]
    fn rooted_prefix_survives_resolution() {
        let resolved = resolve_directory("/tmp/{replace}", &placeholders());
        assert_eq!(resolved, PathBuf::from("/tmp/red"));
    }
}
