//! # twine_publisher
//!
//! The [Story] and [Passage] structs describe a Twine story.
//! They can be constructed by the user, imported using the parse_* functions, and
//! published into a playable HTML document through a story format with the [publish] module.
//! The [stats] module derives word counts and broken links from the same data.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use semver;
pub use serde_json;

/// An in-memory representation of a Twine story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Story {
    /// Identifies the story locally. Not published.
    pub id: String,
    /// The name of the story.
    pub name: String,
    /// The list of [Passage]s, in publishing order.
    pub passages: Vec<Passage>,
    /// The id of the passage the story starts at.
    pub start_passage: Option<String>,
    /// Name of the story format used to publish the story.
    pub story_format: String,
    /// Version of the story format the story was last edited with.
    pub story_format_version: String,
    /// The story JavaScript.
    pub script: String,
    /// The story stylesheet.
    pub stylesheet: String,
    /// Story tags. Cannot contain spaces.
    pub tags: Vec<String>,
    /// Display colors for passage tags.
    pub tag_colors: BTreeMap<String, String>,
    /// Zoom level of the story map.
    pub zoom: f64,
    pub last_update: DateTime<Utc>,
    /// The Interactive Fiction ID.
    pub ifid: String,
}

/// Representation of a passage in a [Story].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Passage {
    /// Identifies the passage inside its story.
    pub id: String,
    /// The id of the story this passage belongs to.
    pub story: String,
    /// The name of the passage. Unique inside its story.
    pub name: String,
    /// The text content of the passage.
    pub text: String,
    /// The passage tags. Cannot contain spaces.
    pub tags: Vec<String>,
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
    pub highlighted: bool,
    pub selected: bool,
}

impl Default for Story {
    fn default() -> Self {
        Self {
            id: new_id(),
            name: String::new(),
            passages: vec![],
            start_passage: None,
            story_format: String::new(),
            story_format_version: String::new(),
            script: String::new(),
            stylesheet: String::new(),
            tags: vec![],
            tag_colors: BTreeMap::new(),
            zoom: 1.0,
            last_update: Utc::now(),
            ifid: new_ifid(),
        }
    }
}

impl Default for Passage {
    fn default() -> Self {
        Self {
            id: new_id(),
            story: String::new(),
            name: String::new(),
            text: String::new(),
            tags: vec![],
            left: 0.0,
            top: 0.0,
            width: 100.0,
            height: 100.0,
            highlighted: false,
            selected: false,
        }
    }
}

impl Story {
    /// Creates an empty story with a fresh id and IFID.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Appends a passage and points its back-reference at this story.
    pub fn add_passage(&mut self, name: impl Into<String>, text: impl Into<String>) -> &mut Passage {
        let passage = Passage {
            story: self.id.clone(),
            name: name.into(),
            text: text.into(),
            ..Default::default()
        };
        self.passages.push(passage);
        let last = self.passages.len() - 1;
        &mut self.passages[last]
    }

    pub fn passage_with_id(&self, id: &str) -> Option<&Passage> {
        self.passages.iter().find(|p| p.id == id)
    }

    pub fn passage_with_name(&self, name: &str) -> Option<&Passage> {
        self.passages.iter().find(|p| p.name == name)
    }

    /// The start passage, if one is set and it exists in this story.
    pub fn start_passage(&self) -> Option<&Passage> {
        self.start_passage.as_deref().and_then(|id| self.passage_with_id(id))
    }

    /// Sets the start passage by name. Returns false if no passage has that name.
    pub fn set_start_by_name(&mut self, name: &str) -> bool {
        match self.passage_with_name(name).map(|p| p.id.clone()) {
            Some(id) => {
                self.start_passage = Some(id);
                true
            }
            None => false,
        }
    }
}

/// Information about the application publishing a story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub build_number: Option<String>,
}

impl Default for AppInfo {
    fn default() -> Self {
        Self {
            name: "Twine".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            build_number: None,
        }
    }
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generates an IFID, an uppercase version 4 UUID.
pub fn new_ifid() -> String {
    uuid::Uuid::new_v4().to_string().to_uppercase()
}

/// Possible parsing errors.
#[derive(Error, Debug)]
pub enum Error {
    /// No &lt;tw-storydata&gt; tag was found.
    #[error("No tw-storydata tag found in HTML")]
    StoryDataNotFound,
    /// A &lt;tw-storydata&gt; tag was opened but never closed.
    #[error("Could not parse HTML: {0}")]
    Malformed(String),
}

/// Possible warnings during parsing.
/// The parsers are generous and report many problems as warnings instead of errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    /// The story metadata wasn't a valid JSON object.
    StoryMetadataMalformed,
    /// The story's title is missing.
    StoryTitleMissing,
    /// The passage metadata wasn't a valid inline JSON object.
    /// The argument is the passage name.
    PassageMetadataMalformed(String),
    /// The passage tags weren't closed.
    /// The argument is the passage name.
    PassageTagsMalformed(String),
    /// 2 passages with the same name were found.
    /// The argument is the passage name.
    PassageDuplicated(String),
    /// A passage is missing it's name.
    PassageNameMissing,
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Warning::StoryMetadataMalformed => write!(f, "Story metadata is not valid JSON and has been discarded."),
            Warning::StoryTitleMissing => write!(f, "Story title is missing."),
            Warning::PassageMetadataMalformed(p) => write!(f, "Passage \"{}\" metadata is not valid JSON and has been discarded.", p),
            Warning::PassageTagsMalformed(p) => write!(f, "Passage \"{}\" tags are not valid and have been discarded.", p),
            Warning::PassageDuplicated(p) => write!(f, "Passage \"{}\" is duplicated, using the first occurrence.", p),
            Warning::PassageNameMissing => write!(f, "Passage name is missing, passage has been discarded."),
        }
    }
}

pub mod escape;
pub mod format;
pub mod links;
pub mod loader;
pub mod publish;
pub mod stats;
pub mod template;

mod import;
mod twee;

pub use import::*;
pub use twee::*;

pub use format::{FormatId, FormatProperties, FormatRegistry, LoadState, StoryFormat};
pub use links::parse_links;
pub use loader::{FormatLoader, LoadError};
pub use publish::{Archive, PublishError, PublishMode, PublishOptions, Published, Publisher, SkippedStory};
pub use stats::{story_stats, StoryStats};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passages_point_back_at_their_story() {
        let mut story = Story::new("Test");
        story.add_passage("Start", "Go to [[Other]].");
        story.add_passage("Other", "The end.");
        assert!(story.passages.iter().all(|p| p.story == story.id));
        assert_ne!(story.passages[0].id, story.passages[1].id);
    }

    #[test]
    fn start_passage_must_exist() {
        let mut story = Story::new("Test");
        story.add_passage("Start", "");
        assert!(story.start_passage().is_none());
        assert!(!story.set_start_by_name("Missing"));
        assert!(story.set_start_by_name("Start"));
        assert_eq!(story.start_passage().map(|p| p.name.as_str()), Some("Start"));
        story.start_passage = Some("gone".to_string());
        assert!(story.start_passage().is_none());
    }

    #[test]
    fn ifid_is_uppercase_uuid() {
        let ifid = new_ifid();
        assert_eq!(ifid.len(), 36);
        assert_eq!(ifid, ifid.to_uppercase());
    }

    #[test]
    fn story_json_uses_camel_case() {
        let mut story = Story::new("Json");
        story.story_format = "Harlowe".to_string();
        let json = serde_json::to_value(&story).unwrap();
        assert_eq!(json["storyFormat"], "Harlowe");
        let back: Story = serde_json::from_value(json).unwrap();
        assert_eq!(back, story);
    }
}
