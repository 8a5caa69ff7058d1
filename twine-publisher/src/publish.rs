//! Publishing stories to HTML.
//!
//! A published story is the story format's template rendered with the
//! story's data. The data itself is a hidden `<tw-storydata>` element that the
//! format's runtime reads when the page loads. Archives are a series of these
//! elements with no format around them.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::escape::{escape_html, escape_raw_text};
use crate::format::{FormatNotFoundError, FormatProperties};
use crate::links::parse_links;
use crate::loader::{DefaultFetcher, FetchFormat, FormatError, FormatLoader, LoadError};
use crate::template::{Context, RenderWarning, Template, TemplateError, Value};
use crate::{AppInfo, Passage, Story};

/// What the published document is for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PublishMode {
    /// A normal, playable story.
    #[default]
    Play,
    /// Playable with the format's debugging aids turned on.
    Test,
    /// Rendered through a proofing format for reading or printing.
    Proof,
}

impl PublishMode {
    fn requires_start(self) -> bool {
        matches!(self, PublishMode::Play | PublishMode::Test)
    }

    fn name(self) -> &'static str {
        match self {
            PublishMode::Play => "play",
            PublishMode::Test => "test",
            PublishMode::Proof => "proof",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub mode: PublishMode,
    /// Id of a passage to start at instead of the story's start passage.
    pub start_passage: Option<String>,
    /// Extra options passed to the format runtime.
    pub format_options: Vec<String>,
}

impl PublishOptions {
    pub fn mode(mode: PublishMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    fn options_attribute(&self) -> String {
        let mut options = self.format_options.clone();
        if self.mode == PublishMode::Test && !options.iter().any(|o| o == "debug") {
            options.push("debug".to_string());
        }
        options.join(" ")
    }
}

/// Publishing a story failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error(transparent)]
    FormatNotFound(#[from] FormatNotFoundError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("Story \"{story}\" has no start passage")]
    NoStartPassage { story: String },
}

impl From<FormatError> for PublishError {
    fn from(e: FormatError) -> Self {
        match e {
            FormatError::NotFound(e) => PublishError::FormatNotFound(e),
            FormatError::Load(e) => PublishError::Load(e),
        }
    }
}

/// A published document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub html: String,
    /// Template problems that didn't stop publishing.
    pub warnings: Vec<RenderWarning>,
}

/// A story left out of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedStory {
    pub name: String,
    pub reason: PublishError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    pub html: String,
    /// Number of stories in `html`.
    pub stories: usize,
    pub skipped: Vec<SkippedStory>,
}

fn resolve_start<'a>(story: &'a Story, options: &PublishOptions) -> Result<Option<&'a Passage>, PublishError> {
    let start = options
        .start_passage
        .as_deref()
        .or(story.start_passage.as_deref())
        .and_then(|id| story.passage_with_id(id));
    if start.is_none() && options.mode.requires_start() && !story.passages.is_empty() {
        return Err(PublishError::NoStartPassage {
            story: story.name.clone(),
        });
    }
    Ok(start)
}

fn pid(story: &Story, passage: &Passage) -> Option<usize> {
    story.passages.iter().position(|p| p.id == passage.id).map(|i| i + 1)
}

fn passage_data(pid: usize, passage: &Passage) -> String {
    format!(
        "<tw-passagedata pid=\"{}\" name=\"{}\" tags=\"{}\" position=\"{},{}\" size=\"{},{}\">{}</tw-passagedata>",
        pid,
        escape_html(&passage.name),
        escape_html(&passage.tags.join(" ")),
        passage.left,
        passage.top,
        passage.width,
        passage.height,
        escape_html(&passage.text)
    )
}

/// Serializes a story into a `<tw-storydata>` element.
fn story_data(app: &AppInfo, story: &Story, start: Option<&Passage>, format: (&str, &str), options: &str) -> String {
    let startnode = start.and_then(|p| pid(story, p)).map(|pid| pid.to_string()).unwrap_or_default();
    let mut html = format!(
        "<tw-storydata name=\"{}\" startnode=\"{}\" creator=\"{}\" creator-version=\"{}\" format=\"{}\" format-version=\"{}\" ifid=\"{}\" options=\"{}\" tags=\"{}\" zoom=\"{}\" hidden>",
        escape_html(&story.name),
        startnode,
        escape_html(&app.name),
        escape_html(&app.version),
        escape_html(format.0),
        escape_html(format.1),
        escape_html(&story.ifid),
        escape_html(options),
        escape_html(&story.tags.join(" ")),
        story.zoom
    );
    html.push_str("<style role=\"stylesheet\" id=\"twine-user-stylesheet\" type=\"text/twine-css\">");
    html.push_str(&escape_raw_text(&story.stylesheet, "style"));
    html.push_str("</style>");
    html.push_str("<script role=\"script\" id=\"twine-user-script\" type=\"text/twine-javascript\">");
    html.push_str(&escape_raw_text(&story.script, "script"));
    html.push_str("</script>");
    for (tag, color) in &story.tag_colors {
        html.push_str(&format!("<tw-tag name=\"{}\" color=\"{}\"></tw-tag>", escape_html(tag), escape_html(color)));
    }
    for (i, passage) in story.passages.iter().enumerate() {
        html.push_str(&passage_data(i + 1, passage));
    }
    html.push_str("</tw-storydata>");
    html
}

/// Serializes a story's data element without rendering it through a format.
pub fn publish_story_data(app: &AppInfo, story: &Story, options: &PublishOptions) -> Result<String, PublishError> {
    let start = resolve_start(story, options)?;
    Ok(story_data(
        app,
        story,
        start,
        (story.story_format.as_str(), story.story_format_version.as_str()),
        &options.options_attribute(),
    ))
}

fn render_context(app: &AppInfo, story: &Story, start: Option<&Passage>, options: &PublishOptions, data: String) -> Context {
    let passages: Vec<Value> = story
        .passages
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let mut m = BTreeMap::new();
            m.insert("pid".to_string(), Value::from(i + 1));
            m.insert("id".to_string(), Value::from(&p.id));
            m.insert("name".to_string(), Value::from(&p.name));
            m.insert("text".to_string(), Value::from(&p.text));
            m.insert("tags".to_string(), Value::from(p.tags.clone()));
            m.insert("links".to_string(), Value::from(parse_links(&p.text, false)));
            m.insert("left".to_string(), Value::from(p.left));
            m.insert("top".to_string(), Value::from(p.top));
            m.insert("width".to_string(), Value::from(p.width));
            m.insert("height".to_string(), Value::from(p.height));
            m.insert("isStart".to_string(), Value::from(start.is_some_and(|s| s.id == p.id)));
            Value::Map(m)
        })
        .collect();

    let mut story_map = BTreeMap::new();
    story_map.insert("name".to_string(), Value::from(&story.name));
    story_map.insert("ifid".to_string(), Value::from(&story.ifid));
    story_map.insert("format".to_string(), Value::from(&story.story_format));
    story_map.insert("formatVersion".to_string(), Value::from(&story.story_format_version));
    story_map.insert("script".to_string(), Value::from(&story.script));
    story_map.insert("stylesheet".to_string(), Value::from(&story.stylesheet));
    story_map.insert("tags".to_string(), Value::from(story.tags.clone()));
    story_map.insert(
        "tagColors".to_string(),
        Value::Map(story.tag_colors.iter().map(|(k, v)| (k.clone(), Value::from(v))).collect()),
    );
    story_map.insert("zoom".to_string(), Value::from(story.zoom));
    story_map.insert("startPassage".to_string(), Value::from(start.map(|p| p.name.clone())));

    let mut app_map = BTreeMap::new();
    app_map.insert("name".to_string(), Value::from(&app.name));
    app_map.insert("version".to_string(), Value::from(&app.version));
    app_map.insert("buildNumber".to_string(), Value::from(app.build_number.clone()));

    Context::new()
        .with("STORY_NAME", &story.name)
        .with("STORY_DATA", Value::markup(data))
        .with("story", Value::Map(story_map))
        .with("passages", Value::List(passages))
        .with("app", Value::Map(app_map))
        .with("mode", options.mode.name())
        .with("debug", options.mode == PublishMode::Test)
        .with("proofing", options.mode == PublishMode::Proof)
        .with("formatOptions", options.options_attribute())
}

/// Renders `story` through `format`. Nothing is written anywhere; the caller
/// decides what to do with the document.
pub fn publish_story_with_format(
    app: &AppInfo,
    story: &Story,
    format: &FormatProperties,
    options: &PublishOptions,
) -> Result<Published, PublishError> {
    let start = resolve_start(story, options)?;
    let data = story_data(
        app,
        story,
        start,
        (story.story_format.as_str(), story.story_format_version.as_str()),
        &options.options_attribute(),
    );
    let template = Template::parse(&format.source)?;
    let rendered = template.render(&render_context(app, story, start, options, data));
    if !rendered.warnings.is_empty() {
        tracing::warn!(
            story = %story.name,
            format = %format.name,
            count = rendered.warnings.len(),
            "Story format template referenced undefined values"
        );
    }
    Ok(Published {
        html: rendered.output,
        warnings: rendered.warnings,
    })
}

/// Publishes stories with formats from an owned [FormatLoader].
pub struct Publisher<F: FetchFormat = DefaultFetcher> {
    loader: FormatLoader<F>,
    app: AppInfo,
    default_format: Option<(String, String)>,
    proofing_format: Option<(String, String)>,
}

impl<F: FetchFormat> Publisher<F> {
    pub fn new(loader: FormatLoader<F>, app: AppInfo) -> Self {
        Self {
            loader,
            app,
            default_format: None,
            proofing_format: None,
        }
    }

    /// Format used by stories that don't name one.
    pub fn with_default_format(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.default_format = Some((name.into(), version.into()));
        self
    }

    /// Format used in [PublishMode::Proof].
    pub fn with_proofing_format(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.proofing_format = Some((name.into(), version.into()));
        self
    }

    pub fn app(&self) -> &AppInfo {
        &self.app
    }

    pub fn loader(&self) -> &FormatLoader<F> {
        &self.loader
    }

    pub fn loader_mut(&mut self) -> &mut FormatLoader<F> {
        &mut self.loader
    }

    /// The name and version of the format `story` publishes with.
    fn story_format(&self, story: &Story) -> (String, String) {
        match &self.default_format {
            Some(default) if story.story_format.is_empty() => default.clone(),
            _ => (story.story_format.clone(), story.story_format_version.clone()),
        }
    }

    fn newest_proofing_format(&self) -> Option<Arc<FormatProperties>> {
        self.loader
            .registry()
            .proofing_candidates()
            .into_iter()
            .max_by(|a, b| a.version.cmp(&b.version))
            .and_then(|f| f.properties().cloned())
    }

    fn proofing_format(&mut self) -> Result<Arc<FormatProperties>, PublishError> {
        if let Some((name, version)) = self.proofing_format.clone() {
            return Ok(self.loader.load_format(&name, &version)?);
        }
        if let Some(format) = self.newest_proofing_format() {
            return Ok(format);
        }
        // A format only says whether it is for proofing once it is loaded.
        self.loader.load_all();
        self.newest_proofing_format().ok_or_else(|| {
            FormatNotFoundError {
                name: "proofing format".to_string(),
                version: "any".to_string(),
            }
            .into()
        })
    }

    /// Loads the right format for `story` and `options.mode`, then publishes.
    pub fn publish_story(&mut self, story: &Story, options: &PublishOptions) -> Result<Published, PublishError> {
        let format = match options.mode {
            PublishMode::Proof => self.proofing_format()?,
            _ => {
                let (name, version) = self.story_format(story);
                self.loader.load_format(&name, &version)?
            }
        };
        tracing::debug!(story = %story.name, format = %format.name, version = %format.version, mode = options.mode.name(), "Publishing story");
        publish_story_with_format(&self.app, story, &format, options)
    }

    /// Bundles `stories` into one archive document. Each story's format must
    /// resolve; stories whose format doesn't are skipped and reported.
    pub fn publish_archive(&mut self, stories: &[Story]) -> Archive {
        let mut archive = Archive {
            html: String::new(),
            stories: 0,
            skipped: vec![],
        };
        for story in stories {
            let (name, version) = self.story_format(story);
            match self.loader.load_format(&name, &version) {
                Ok(format) => {
                    archive
                        .html
                        .push_str(&story_data(&self.app, story, story.start_passage(), (format.name.as_str(), format.version.as_str()), ""));
                    archive.html.push_str("\n\n");
                    archive.stories += 1;
                }
                Err(e) => {
                    tracing::warn!(story = %story.name, error = %e, "Skipping story in archive");
                    archive.skipped.push(SkippedStory {
                        name: story.name.clone(),
                        reason: e.into(),
                    });
                }
            }
        }
        archive
    }
}
