//! Workspace plumbing: the filename index used to resolve `@file`
//! mentions, and the append-only markdown target for write-to-file turns.

use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Pattern for `@name.ext` mentions inside a question.
pub fn mention_pattern() -> Regex {
    Regex::new(r"\B@([A-Za-z0-9_\-\[\]]+\.[A-Za-z0-9]+)").expect("mention pattern is valid")
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

fn is_excluded(entry: &DirEntry, excluded_dirs: &[String]) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    entry
        .file_name()
        .to_str()
        .map(|name| excluded_dirs.iter().any(|d| d == name))
        .unwrap_or(false)
}

/// Index workspace files by filename. A name can map to several paths;
/// only unambiguous names resolve as mentions.
pub fn file_titles(root: &Path, excluded_dirs: &[String]) -> HashMap<String, Vec<PathBuf>> {
    let mut titles: HashMap<String, Vec<PathBuf>> = HashMap::new();
    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || (!is_hidden(e) && !is_excluded(e, excluded_dirs)));

    for entry in walker.flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            titles
                .entry(name.to_string())
                .or_default()
                .push(entry.path().to_path_buf());
        }
    }
    titles
}

/// Find the `@file` mentions in a question that resolve to exactly one
/// indexed path. Ambiguous and unknown names are left alone.
pub fn find_mentions(
    question: &str,
    titles: &HashMap<String, Vec<PathBuf>>,
) -> Vec<(String, PathBuf)> {
    let pattern = mention_pattern();
    let mut mentioned = Vec::new();
    for caps in pattern.captures_iter(question) {
        let title = &caps[1];
        if let Some(paths) = titles.get(title) {
            if paths.len() == 1 && !mentioned.iter().any(|(t, _)| t == title) {
                mentioned.push((title.to_string(), paths[0].clone()));
            }
        }
    }
    mentioned
}

/// Keep only characters safe for an output file name.
pub fn sanitize_output_name(name: &str) -> String {
    let cleaned: String = name.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    if cleaned.is_empty() {
        "output".to_string()
    } else {
        cleaned
    }
}

/// Append content to `<name>.md` at the workspace root, creating it on
/// first use. Returns the file's path.
pub fn append_to_output(root: &Path, name: &str, content: &str) -> Result<PathBuf> {
    let path = root.join(format!("{}.md", sanitize_output_name(name)));
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
