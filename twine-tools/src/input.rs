use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use glob::MatchOptions;
use thiserror::Error;
use twine_publisher::{parse_archive, parse_html, parse_twee3, Story, Warning};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Could not open directory: {0}")]
    DirNotFound(String),
    #[error("Unsupported story file: {0} (expected .twee, .tw, .html or .json)")]
    UnknownInput(String),
    #[error("No passage named \"{0}\"")]
    UnknownPassage(String),
    #[error("No stories found in {0}")]
    NoStories(String),
}

pub fn read_file<P: AsRef<Path>>(p: P) -> anyhow::Result<String> {
    let p = p.as_ref();
    fs::read_to_string(p).with_context(|| format!("Could not read file: {}", p.display()))
}

/// Writes `contents`, creating missing parent directories.
pub fn write_file(path: &Path, contents: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("Could not create directory: {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("Could not write file: {}", path.display()))
}

pub fn print_warning(path: &Path, w: &Warning) {
    tracing::debug!(path = %path.display(), warning = ?w, "Parse warning");
    eprintln!("Warning: {}: {}", path.display(), w);
}

/// Expands a glob pattern relative to `base`.
pub fn glob_paths(pattern: &str, base: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let full = base.join(pattern);
    let mut res = vec![];
    for r in glob::glob_with(
        &full.to_string_lossy(),
        MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: true,
        },
    )? {
        match r {
            Ok(r) => res.push(r),
            Err(e) => tracing::warn!(error = %e, "Unreadable path while matching {}", pattern),
        }
    }
    Ok(res)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputKind {
    Twee,
    Html,
    Json,
}

fn input_kind(path: &Path) -> Result<InputKind, Error> {
    let ext = path.extension().map(|e| e.to_string_lossy().to_ascii_lowercase());
    match ext.as_deref() {
        Some("twee") | Some("tw") => Ok(InputKind::Twee),
        Some("html") | Some("htm") => Ok(InputKind::Html),
        Some("json") => Ok(InputKind::Json),
        _ => Err(Error::UnknownInput(path.display().to_string())),
    }
}

fn report(path: &Path, (story, warnings): (Story, Vec<Warning>)) -> Story {
    for w in &warnings {
        print_warning(path, w);
    }
    story
}

/// Reads one story from a Twee, published HTML or JSON file.
pub fn read_story(path: &Path) -> anyhow::Result<Story> {
    let kind = input_kind(path)?;
    let text = read_file(path)?;
    let context = || format!("Could not parse {}", path.display());
    let story = match kind {
        InputKind::Twee => report(path, parse_twee3(&text).with_context(context)?),
        InputKind::Html => report(path, parse_html(&text).with_context(context)?),
        InputKind::Json => serde_json::from_str(&text).with_context(context)?,
    };
    tracing::debug!(path = %path.display(), story = %story.name, passages = story.passages.len(), "Read story");
    Ok(story)
}

/// Reads every story in a file. HTML files are read as archives.
pub fn read_stories(path: &Path) -> anyhow::Result<Vec<Story>> {
    if input_kind(path)? != InputKind::Html {
        return Ok(vec![read_story(path)?]);
    }
    let stories: Vec<Story> = parse_archive(&read_file(path)?)
        .with_context(|| format!("Could not parse {}", path.display()))?
        .into_iter()
        .map(|parsed| report(path, parsed))
        .collect();
    if stories.is_empty() {
        return Err(Error::NoStories(path.display().to_string()).into());
    }
    Ok(stories)
}

/// A file name for `story`, with characters that are unsafe in paths replaced.
pub fn file_stem(story: &Story, fallback: &str) -> String {
    let name: String = story
        .name
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || " -_.".contains(c) { c } else { '_' })
        .collect();
    let name = name.trim_start_matches('.');
    if name.is_empty() {
        fallback.to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reads_each_kind() {
        let dir = tempfile::tempdir().unwrap();
        let twee = dir.path().join("cloak.twee");
        fs::write(&twee, include_str!("../../twine-publisher/test-data/cloak.twee")).unwrap();
        let story = read_story(&twee).unwrap();
        assert_eq!(story.name, "The Cloak of Darkness");

        let json = dir.path().join("cloak.json");
        fs::write(&json, serde_json::to_string(&story).unwrap()).unwrap();
        assert_eq!(read_story(&json).unwrap(), story);

        let html = dir.path().join("rock.HTML");
        fs::write(&html, include_str!("../../twine-publisher/test-data/published.html")).unwrap();
        assert_eq!(read_story(&html).unwrap().name, "Rock & Roll");
        assert_eq!(read_stories(&html).unwrap().len(), 1);
    }

    #[test]
    fn rejects_unknown_inputs() {
        let err = read_story(Path::new("story.docx")).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::UnknownInput(_))));
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.html");
        fs::write(&empty, "<html></html>").unwrap();
        assert!(matches!(read_stories(&empty).unwrap_err().downcast_ref::<Error>(), Some(Error::NoStories(_))));
    }

    #[test]
    fn globs_relative_to_base() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.twee"), "").unwrap();
        fs::write(dir.path().join("b.twee"), "").unwrap();
        fs::write(dir.path().join(".hidden.twee"), "").unwrap();
        let found = glob_paths("*.twee", dir.path()).unwrap();
        assert_eq!(found, vec![dir.path().join("a.twee"), dir.path().join("b.twee")]);
    }

    #[test]
    fn file_stems_are_safe() {
        let mut story = Story::new("Rock/Roll: Part 2");
        assert_eq!(file_stem(&story, "story"), "Rock_Roll_ Part 2");
        story.name = "..".to_string();
        assert_eq!(file_stem(&story, "story"), "story");
    }

    #[test]
    fn writes_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("dist/nested/story.html");
        write_file(&out, "<html></html>").unwrap();
        assert_eq!(read_file(&out).unwrap(), "<html></html>");
    }
}
