use std::cell::RefCell;
use std::collections::HashMap;

use html5ever::tendril::StrTendril;
use html5ever::tokenizer::states::RawKind;
use html5ever::tokenizer::{BufferQueue, Tag, TagKind, Token, TokenSink, TokenSinkResult, Tokenizer, TokenizerOpts};

use crate::escape::{decode_entities, unescape_raw_text};
use crate::*;

/// Attributes of a start tag, names lowercased and values decoded.
struct Attributes(HashMap<String, String>);

impl Attributes {
    fn of(tag: &Tag) -> Self {
        Self(
            tag.attrs
                .iter()
                .map(|a| (a.name.local.to_string(), a.value.to_string()))
                .collect(),
        )
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

/// A raw-text child of &lt;tw-storydata&gt; whose text is being collected.
enum RawElement {
    Passage(Attributes),
    Style,
    Script,
}

impl RawElement {
    fn tag_name(&self) -> &'static str {
        match self {
            RawElement::Passage(_) => "tw-passagedata",
            RawElement::Style => "style",
            RawElement::Script => "script",
        }
    }
}

/// A &lt;tw-storydata&gt; element that hasn't been closed yet.
struct OpenStory {
    attributes: Attributes,
    passages: Vec<(Attributes, String)>,
    stylesheet: String,
    script: String,
    tag_colors: Vec<(String, String)>,
}

#[derive(Default)]
struct ImportState {
    story: Option<OpenStory>,
    raw: Option<(RawElement, String)>,
    stories: Vec<Result<(Story, Vec<Warning>), Error>>,
}

/// Raw-text handling of ordinary HTML elements, so markup-like text inside
/// them (a story format's own JavaScript, say) is never taken for story data.
fn raw_kind(name: &str) -> Option<RawKind> {
    match name {
        "script" => Some(RawKind::ScriptData),
        "style" | "xmp" | "iframe" | "noembed" | "noframes" => Some(RawKind::Rawtext),
        "title" | "textarea" => Some(RawKind::Rcdata),
        _ => None,
    }
}

impl ImportState {
    fn start_tag(&mut self, tag: &Tag) -> TokenSinkResult<()> {
        let name: &str = &tag.name;
        let skip = || raw_kind(name).map_or(TokenSinkResult::Continue, TokenSinkResult::RawData);
        let Some(story) = self.story.as_mut() else {
            if name == "tw-storydata" {
                self.story = Some(OpenStory {
                    attributes: Attributes::of(tag),
                    passages: vec![],
                    stylesheet: String::new(),
                    script: String::new(),
                    tag_colors: vec![],
                });
                return TokenSinkResult::Continue;
            }
            return skip();
        };
        let element = match name {
            "tw-passagedata" => RawElement::Passage(Attributes::of(tag)),
            "style" => RawElement::Style,
            "script" => RawElement::Script,
            "tw-tag" => {
                let attributes = Attributes::of(tag);
                if let (Some(name), Some(color)) = (attributes.get("name"), attributes.get("color")) {
                    story.tag_colors.push((name.to_string(), color.to_string()));
                }
                return TokenSinkResult::Continue;
            }
            _ => return skip(),
        };
        // Bodies end at their own closing tag only, whatever else they contain.
        self.raw = Some((element, String::new()));
        TokenSinkResult::RawData(RawKind::Rawtext)
    }

    fn end_tag(&mut self, name: &str) {
        if let Some((element, text)) = self.raw.take() {
            if element.tag_name() != name {
                self.raw = Some((element, text));
                return;
            }
            let Some(story) = self.story.as_mut() else {
                return;
            };
            match element {
                RawElement::Passage(attributes) => story.passages.push((attributes, decode_entities(&text))),
                RawElement::Style => append_code(&mut story.stylesheet, &unescape_raw_text(&text, "style")),
                RawElement::Script => append_code(&mut story.script, &unescape_raw_text(&text, "script")),
            }
            return;
        }
        if name == "tw-storydata" {
            if let Some(story) = self.story.take() {
                self.stories.push(Ok(build_story(story)));
            }
        }
    }

    fn end_of_file(&mut self) {
        if self.story.take().is_none() {
            return;
        }
        let element = self.raw.take().map_or("tw-storydata", |(element, _)| element.tag_name());
        self.stories
            .push(Err(Error::Malformed(format!("{} element is never closed", element))));
    }
}

/// Collects every &lt;tw-storydata&gt; element from the token stream.
#[derive(Default)]
struct StoryDataSink {
    state: RefCell<ImportState>,
}

impl TokenSink for StoryDataSink {
    type Handle = ();

    fn process_token(&self, token: Token, _line_number: u64) -> TokenSinkResult<()> {
        let mut state = self.state.borrow_mut();
        match token {
            Token::TagToken(tag) => match tag.kind {
                TagKind::StartTag => return state.start_tag(&tag),
                TagKind::EndTag => state.end_tag(&tag.name),
            },
            Token::CharacterTokens(text) => {
                if let Some((_, collected)) = state.raw.as_mut() {
                    collected.push_str(&text);
                }
            }
            Token::EOFToken => state.end_of_file(),
            _ => {}
        }
        TokenSinkResult::Continue
    }
}

fn read_stories(source: &str) -> Vec<Result<(Story, Vec<Warning>), Error>> {
    let input = BufferQueue::default();
    input.push_back(StrTendril::from_slice(source));
    let tokenizer = Tokenizer::new(StoryDataSink::default(), TokenizerOpts::default());
    let _ = tokenizer.feed(&input);
    tokenizer.end();
    let stories = std::mem::take(&mut tokenizer.sink.state.borrow_mut().stories);
    stories
}

fn parse_pair(value: Option<&str>) -> Option<(f64, f64)> {
    let (a, b) = value?.split_once(',')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

fn append_code(target: &mut String, code: &str) {
    if code.is_empty() {
        return;
    }
    if !target.is_empty() {
        target.push('\n');
    }
    target.push_str(code);
}

/// Parses a Twine archive, a list of &lt;tw-storydata&gt; tags, into a list of [Story]s.
///
/// A document without any story data is an empty archive.
pub fn parse_archive(source: &str) -> Result<Vec<(Story, Vec<Warning>)>, Error> {
    read_stories(source).into_iter().collect()
}

/// Parses a published Twine HTML file into a [Story], looking for a &lt;tw-storydata&gt; tag.
pub fn parse_html(source: &str) -> Result<(Story, Vec<Warning>), Error> {
    read_stories(source).into_iter().next().ok_or(Error::StoryDataNotFound)?
}

fn build_story(open: OpenStory) -> (Story, Vec<Warning>) {
    let storydata = &open.attributes;
    let mut warnings = vec![];
    let mut story = Story::new("");
    match storydata.get("name") {
        Some(name) => story.name = name.to_string(),
        None => warnings.push(Warning::StoryTitleMissing),
    }
    if let Some(ifid) = storydata.get("ifid").filter(|i| !i.is_empty()) {
        story.ifid = ifid.to_string();
    }
    story.story_format = storydata.get("format").unwrap_or_default().to_string();
    story.story_format_version = storydata.get("format-version").unwrap_or_default().to_string();
    story.tags = storydata
        .get("tags")
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if let Some(zoom) = storydata.get("zoom").and_then(|z| z.parse().ok()) {
        story.zoom = zoom;
    }
    story.stylesheet = open.stylesheet;
    story.script = open.script;
    story.tag_colors.extend(open.tag_colors);

    let mut passages: Vec<(u32, Attributes, String)> = open
        .passages
        .into_iter()
        .map(|(attributes, text)| {
            let pid = attributes.get("pid").and_then(|p| p.parse().ok()).unwrap_or(u32::MAX);
            (pid, attributes, text)
        })
        .collect();
    passages.sort_by_key(|(pid, _, _)| *pid);

    let startnode = storydata.get("startnode").and_then(|s| s.parse::<u32>().ok());
    let mut start = None;
    for (pid, attributes, text) in passages {
        let name = match attributes.get("name") {
            Some(name) if !name.is_empty() => name,
            _ => {
                warnings.push(Warning::PassageNameMissing);
                continue;
            }
        };
        if story.passage_with_name(name).is_some() {
            warnings.push(Warning::PassageDuplicated(name.to_string()));
            continue;
        }
        let passage = story.add_passage(name, text);
        passage.tags = attributes.get("tags").unwrap_or_default().split_whitespace().map(str::to_string).collect();
        if let Some((left, top)) = parse_pair(attributes.get("position")) {
            passage.left = left;
            passage.top = top;
        }
        if let Some((width, height)) = parse_pair(attributes.get("size")) {
            passage.width = width;
            passage.height = height;
        }
        if Some(pid) == startnode {
            start = Some(passage.id.clone());
        }
    }
    story.start_passage = start;
    (story, warnings)
}
