use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::*;

#[derive(PartialEq, Eq)]
enum HeaderState {
    Name,
    Tags,
    Between,
}

/// A parsed `:: Name [tags] {metadata}` line.
struct Header<'a> {
    name: String,
    tags: Vec<String>,
    meta: Option<&'a str>,
    tags_closed: bool,
}

/// Contents of the `StoryData` passage.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct StoryData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ifid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    format_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    tag_colors: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    zoom: Option<f64>,
}

/// Inline passage metadata.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PassageMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    position: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<String>,
}

fn passage_start() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| RegexBuilder::new("^::").multi_line(true).build().expect("passage pattern is valid"))
}

fn parse_header(line: &str) -> Header<'_> {
    let mut header = Header {
        name: String::new(),
        tags: vec![],
        meta: None,
        tags_closed: true,
    };
    let mut tag = String::new();
    let mut state = HeaderState::Name;
    let mut escape = false;
    for (i, c) in line.char_indices() {
        match state {
            HeaderState::Name => {
                if escape {
                    escape = false;
                    header.name.push(c);
                    continue;
                }
                match c {
                    '\\' => escape = true,
                    '[' => state = HeaderState::Tags,
                    '{' => {
                        header.meta = Some(&line[i..]);
                        break;
                    }
                    _ => header.name.push(c),
                }
            }
            HeaderState::Tags => {
                if escape {
                    escape = false;
                    tag.push(c);
                    continue;
                }
                if c == '\\' {
                    escape = true;
                } else if c == ']' {
                    if !tag.is_empty() {
                        header.tags.push(std::mem::take(&mut tag));
                    }
                    state = HeaderState::Between;
                } else if c.is_whitespace() {
                    if !tag.is_empty() {
                        header.tags.push(std::mem::take(&mut tag));
                    }
                } else {
                    tag.push(c);
                }
            }
            HeaderState::Between => {
                if c == '{' {
                    header.meta = Some(&line[i..]);
                    break;
                }
            }
        }
    }
    if state == HeaderState::Tags {
        header.tags_closed = false;
        header.tags.clear();
    }
    header.name = header.name.trim().to_string();
    header
}

fn parse_pair(value: &str) -> Option<(f64, f64)> {
    let (a, b) = value.split_once(',')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

/// True for a line made of backslashes followed by `::`.
fn is_escaped_marker(line: &str) -> bool {
    line.trim_start_matches('\\').starts_with("::")
}

fn unescape_body(body: &str) -> String {
    body.split('\n')
        .map(|line| match line.strip_prefix('\\') {
            Some(rest) if is_escaped_marker(rest) => rest,
            _ => line,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn append_code(target: &mut String, code: &str) {
    if !target.is_empty() {
        target.push('\n');
    }
    target.push_str(code);
}

/// Parses Twee3 into a [Story].
///
/// Passages tagged `script` or `stylesheet` are concatenated into the story's
/// script and stylesheet instead of becoming passages.
pub fn parse_twee3(source: &str) -> Result<(Story, Vec<Warning>), Error> {
    let mut warnings = vec![];
    let mut story = Story::new("");
    let mut title = None;
    let mut data: Option<StoryData> = None;
    let starts: Vec<usize> = passage_start().find_iter(source).map(|m| m.end()).collect();
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).map(|&next| next - 2).unwrap_or(source.len());
        let block = &source[start..end];
        let (line, body) = block.split_once('\n').unwrap_or((block, ""));
        let header = parse_header(line.trim_end_matches('\r'));
        let body = unescape_body(body.trim_end());
        if !header.tags_closed {
            warnings.push(Warning::PassageTagsMalformed(header.name.clone()));
        }
        match header.name.as_str() {
            "" => warnings.push(Warning::PassageNameMissing),
            "StoryTitle" => {
                if title.is_some() {
                    warnings.push(Warning::PassageDuplicated("StoryTitle".to_string()));
                    continue;
                }
                title = Some(body.trim().to_string());
            }
            "StoryData" => {
                if data.is_some() {
                    warnings.push(Warning::PassageDuplicated("StoryData".to_string()));
                    continue;
                }
                data = Some(serde_json::from_str(&body).unwrap_or_else(|_| {
                    warnings.push(Warning::StoryMetadataMalformed);
                    StoryData::default()
                }));
            }
            _ if header.tags.iter().any(|t| t == "script") => append_code(&mut story.script, &body),
            _ if header.tags.iter().any(|t| t == "stylesheet") => append_code(&mut story.stylesheet, &body),
            name => {
                if story.passage_with_name(name).is_some() {
                    warnings.push(Warning::PassageDuplicated(name.to_string()));
                    continue;
                }
                let meta = match header.meta.map(serde_json::from_str::<PassageMeta>) {
                    None => PassageMeta::default(),
                    Some(Ok(meta)) => meta,
                    Some(Err(_)) => {
                        warnings.push(Warning::PassageMetadataMalformed(name.to_string()));
                        PassageMeta::default()
                    }
                };
                let passage = story.add_passage(name, body);
                passage.tags = header.tags;
                let position = meta.position.as_deref().map(parse_pair);
                let size = meta.size.as_deref().map(parse_pair);
                if matches!(position, Some(None)) || matches!(size, Some(None)) {
                    warnings.push(Warning::PassageMetadataMalformed(name.to_string()));
                }
                if let Some(Some((left, top))) = position {
                    passage.left = left;
                    passage.top = top;
                }
                if let Some(Some((width, height))) = size {
                    passage.width = width;
                    passage.height = height;
                }
            }
        }
    }

    match title {
        Some(title) => story.name = title,
        None => warnings.push(Warning::StoryTitleMissing),
    }
    let data = data.unwrap_or_default();
    if let Some(ifid) = data.ifid {
        story.ifid = ifid.to_uppercase();
    }
    story.story_format = data.format.unwrap_or_default();
    story.story_format_version = data.format_version.unwrap_or_default();
    story.tag_colors = data.tag_colors;
    if let Some(zoom) = data.zoom {
        story.zoom = zoom;
    }
    let start = data.start.unwrap_or_else(|| "Start".to_string());
    story.set_start_by_name(&start);
    Ok((story, warnings))
}

fn escape(t: &str) -> String {
    t.replace('\\', "\\\\")
        .replace('[', "\\[")
        .replace(']', "\\]")
        .replace('{', "\\{")
        .replace('}', "\\}")
}

fn escape_body(body: &str) -> String {
    body.split('\n')
        .map(|line| if is_escaped_marker(line) { format!("\\{}", line) } else { line.to_string() })
        .collect::<Vec<_>>()
        .join("\n")
}

fn write_passage(res: &mut String, name: &str, tags: &[String], meta: Option<&PassageMeta>, body: &str) {
    res.push_str(":: ");
    res.push_str(&escape(name));
    if !tags.is_empty() {
        res.push_str(" [");
        res.push_str(&tags.iter().map(|t| escape(t)).collect::<Vec<String>>().join(" "));
        res.push(']');
    }
    if let Some(meta) = meta.and_then(|m| serde_json::to_string(m).ok()) {
        res.push(' ');
        res.push_str(&meta);
    }
    res.push('\n');
    res.push_str(&escape_body(body));
    res.push_str("\n\n");
}

/// Serializes a [Story] into Twee3.
pub fn serialize_twee3(story: &Story) -> String {
    let mut res = String::new();
    write_passage(&mut res, "StoryTitle", &[], None, &story.name);

    let data = StoryData {
        ifid: Some(story.ifid.clone()),
        format: Some(story.story_format.clone()).filter(|f| !f.is_empty()),
        format_version: Some(story.story_format_version.clone()).filter(|v| !v.is_empty()),
        start: story.start_passage().map(|p| p.name.clone()),
        tag_colors: story.tag_colors.clone(),
        zoom: Some(story.zoom).filter(|&z| z != 1.0),
    };
    let data = serde_json::to_string_pretty(&data).unwrap_or_else(|_| "{}".to_string());
    write_passage(&mut res, "StoryData", &[], None, &data);

    if !story.script.is_empty() {
        write_passage(&mut res, "StoryScript", &["script".to_string()], None, &story.script);
    }
    if !story.stylesheet.is_empty() {
        write_passage(&mut res, "StoryStylesheet", &["stylesheet".to_string()], None, &story.stylesheet);
    }
    for p in &story.passages {
        let meta = PassageMeta {
            position: Some(format!("{},{}", p.left, p.top)),
            size: Some(format!("{},{}", p.width, p.height)).filter(|s| s != "100,100"),
        };
        write_passage(&mut res, &p.name, &p.tags, Some(&meta), &p.text);
    }
    res
}
