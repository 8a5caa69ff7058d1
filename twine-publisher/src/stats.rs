//! Summary statistics over a story's passages.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::links::parse_links;
use crate::Story;

/// Counts derived from a story. Recomputed on demand, never cached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryStats {
    /// Characters across all passage texts.
    pub characters: usize,
    /// Whitespace-delimited words across all passage texts.
    pub words: usize,
    pub passages: usize,
    /// Distinct internal link targets, in order of first appearance.
    pub links: Vec<String>,
    /// Link occurrences, duplicates included.
    pub link_count: usize,
    /// Entries of `links` that name no passage in the story.
    pub broken_links: Vec<String>,
}

fn whitespace() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace pattern is valid"))
}

/// Counts the pieces left by splitting `text` on whitespace runs.
///
/// Leading or trailing whitespace produces an empty piece, and so does an
/// empty text, which therefore counts as one word.
// TODO: confirm with authors whether empty passages should count zero words.
pub fn word_count(text: &str) -> usize {
    whitespace().find_iter(text).count() + 1
}

/// Computes [StoryStats] for `story`.
pub fn story_stats(story: &Story) -> StoryStats {
    let mut stats = StoryStats {
        passages: story.passages.len(),
        ..Default::default()
    };
    for passage in &story.passages {
        stats.characters += passage.text.chars().count();
        stats.words += word_count(&passage.text);
        let links = parse_links(&passage.text, true);
        stats.link_count += links.len();
        for link in links {
            if !stats.links.contains(&link) {
                stats.links.push(link);
            }
        }
    }
    stats.broken_links = stats
        .links
        .iter()
        .filter(|link| story.passage_with_name(link).is_none())
        .cloned()
        .collect();
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_story() {
        assert_eq!(story_stats(&Story::new("Empty")), StoryStats::default());
    }

    #[test]
    fn counts_words_and_characters() {
        let mut story = Story::new("Counts");
        story.add_passage("Start", "Go to [[Other]].");
        story.add_passage("Other", "The end.");
        let stats = story_stats(&story);
        assert_eq!(stats.passages, 2);
        assert_eq!(stats.characters, 16 + 8);
        assert_eq!(stats.words, 3 + 2);
        assert_eq!(stats.links, vec!["Other"]);
        assert_eq!(stats.link_count, 1);
        assert!(stats.broken_links.is_empty());
    }

    #[test]
    fn empty_passage_counts_one_word() {
        assert_eq!(word_count(""), 1);
        assert_eq!(word_count(" two  words "), 4);
    }

    #[test]
    fn characters_are_not_bytes() {
        let mut story = Story::new("Unicode");
        story.add_passage("Start", "héllo");
        assert_eq!(story_stats(&story).characters, 5);
    }

    #[test]
    fn links_are_deduplicated_but_counted() {
        let mut story = Story::new("Links");
        story.add_passage("Start", "[[A]] [[B]] [[A]]");
        story.add_passage("A", "[[B]] [[Start]]");
        let stats = story_stats(&story);
        assert_eq!(stats.links, vec!["A", "B", "Start"]);
        assert_eq!(stats.link_count, 5);
        assert!(stats.link_count >= stats.links.len());
        assert_eq!(stats.broken_links, vec!["B"]);
    }

    #[test]
    fn broken_links_are_case_sensitive() {
        let mut story = Story::new("Case");
        story.add_passage("Start", "[[other]] [[https://example.org]]");
        story.add_passage("Other", "");
        let stats = story_stats(&story);
        assert_eq!(stats.links, vec!["other"]);
        assert_eq!(stats.broken_links, vec!["other"]);
    }
}
