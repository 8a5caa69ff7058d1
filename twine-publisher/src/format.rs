//! Story formats and the registry of known format versions.
//!
//! A [StoryFormat] is identified by name and semantic version. Its definition
//! (template source plus metadata) is fetched lazily by the
//! [loader](crate::loader); until then it sits in the registry as
//! [LoadState::Unloaded]. The registry only ever grows: entries are never
//! removed, and loaded properties are immutable.

use std::fmt;
use std::sync::Arc;

use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::loader::LoadError;

/// Name + version pair identifying a format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FormatId {
    pub name: String,
    pub version: Version,
}

impl fmt::Display for FormatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

/// The contents of a format definition, as published by the format author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatProperties {
    pub name: String,
    pub version: String,
    /// HTML template the story data is rendered into.
    pub source: String,
    /// Proofing formats are meant for reading a story, not playing it.
    #[serde(default)]
    pub proofing: bool,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Editor extension code. Not used when publishing.
    #[serde(default)]
    pub hydrate: Option<String>,
}

/// Where a format is in its loading lifecycle.
///
/// `Unloaded -> Loading -> Loaded | Failed`, and `Failed -> Loading` on retry.
/// `Loaded` is terminal.
#[derive(Debug, Clone, Default)]
pub enum LoadState {
    #[default]
    Unloaded,
    Loading,
    Loaded(Arc<FormatProperties>),
    Failed(LoadError),
}

impl LoadState {
    pub fn properties(&self) -> Option<&Arc<FormatProperties>> {
        match self {
            LoadState::Loaded(p) => Some(p),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&LoadError> {
        match self {
            LoadState::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// A story format known to the registry.
#[derive(Debug, Clone)]
pub struct StoryFormat {
    pub name: String,
    pub version: Version,
    /// Location of the definition: an `http(s)://` or `file://` URL, or a path.
    pub url: String,
    /// False for formats bundled with the application.
    pub user_added: bool,
    pub state: LoadState,
}

impl StoryFormat {
    pub fn id(&self) -> FormatId {
        FormatId {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }

    pub fn properties(&self) -> Option<&Arc<FormatProperties>> {
        self.state.properties()
    }

    /// True once loaded, if the definition marks the format as proofing.
    pub fn is_proofing(&self) -> bool {
        self.properties().is_some_and(|p| p.proofing)
    }
}

/// No registered format satisfies a requested name and version.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No story format named \"{name}\" compatible with version {version} is available")]
pub struct FormatNotFoundError {
    pub name: String,
    pub version: String,
}

/// Returns true if `candidate` can stand in for `required`: same major
/// version, and not older.
pub fn is_compatible(required: &Version, candidate: &Version) -> bool {
    candidate.major == required.major && candidate >= required
}

/// Parses a version the way stories record them, tolerating missing minor or
/// patch components (`"2"`, `"2.1"`).
pub fn parse_version(version: &str) -> Result<Version, semver::Error> {
    let version = version.trim();
    let version = version.strip_prefix('v').unwrap_or(version);
    match version.split('.').count() {
        1 => Version::parse(&format!("{}.0.0", version)),
        2 => Version::parse(&format!("{}.0", version)),
        _ => Version::parse(version),
    }
}

/// The append-only set of known story formats.
#[derive(Debug, Clone, Default)]
pub struct FormatRegistry {
    formats: Vec<StoryFormat>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an unloaded format. Returns false, leaving the registry unchanged,
    /// if the name and version are already registered.
    pub fn register(&mut self, name: impl Into<String>, version: Version, url: impl Into<String>, user_added: bool) -> bool {
        let name = name.into();
        if self.get_by(&name, &version).is_some() {
            tracing::debug!(format = %name, %version, "Format already registered");
            return false;
        }
        self.formats.push(StoryFormat {
            name,
            version,
            url: url.into(),
            user_added,
            state: LoadState::Unloaded,
        });
        true
    }

    /// Adds a format whose definition has already been read.
    pub fn insert_loaded(&mut self, url: impl Into<String>, properties: FormatProperties, user_added: bool) -> Result<FormatId, semver::Error> {
        let version = parse_version(&properties.version)?;
        let id = FormatId {
            name: properties.name.clone(),
            version,
        };
        if self.get(&id).is_none() {
            self.formats.push(StoryFormat {
                name: id.name.clone(),
                version: id.version.clone(),
                url: url.into(),
                user_added,
                state: LoadState::Loaded(Arc::new(properties)),
            });
        } else {
            tracing::debug!(format = %id, "Format already registered");
        }
        Ok(id)
    }

    pub fn formats(&self) -> &[StoryFormat] {
        &self.formats
    }

    pub fn get(&self, id: &FormatId) -> Option<&StoryFormat> {
        self.get_by(&id.name, &id.version)
    }

    fn get_by(&self, name: &str, version: &Version) -> Option<&StoryFormat> {
        self.formats.iter().find(|f| f.name == name && &f.version == version)
    }

    pub(crate) fn set_state(&mut self, id: &FormatId, state: LoadState) {
        if let Some(f) = self.formats.iter_mut().find(|f| f.name == id.name && f.version == id.version) {
            f.state = state;
        }
    }

    /// Finds the format with exactly this name and version.
    pub fn with_name_and_version(&self, name: &str, version: &str) -> Result<&StoryFormat, FormatNotFoundError> {
        parse_version(version)
            .ok()
            .and_then(|v| self.get_by(name, &v))
            .ok_or_else(|| FormatNotFoundError {
                name: name.to_string(),
                version: version.to_string(),
            })
    }

    /// Finds the newest format named `name` that is compatible with `version`.
    pub fn latest_compatible(&self, name: &str, version: &str) -> Result<&StoryFormat, FormatNotFoundError> {
        let not_found = || FormatNotFoundError {
            name: name.to_string(),
            version: version.to_string(),
        };
        let required = parse_version(version).map_err(|_| not_found())?;
        self.formats
            .iter()
            .filter(|f| f.name == name && is_compatible(&required, &f.version))
            .max_by(|a, b| a.version.cmp(&b.version))
            .ok_or_else(not_found)
    }

    /// The newest version of every format name, sorted by name.
    pub fn latest_versions(&self) -> Vec<&StoryFormat> {
        let mut result: Vec<&StoryFormat> = vec![];
        for f in &self.formats {
            match result.iter_mut().find(|r| r.name == f.name) {
                Some(r) if r.version < f.version => *r = f,
                Some(_) => {}
                None => result.push(f),
            }
        }
        result.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
        result
    }

    /// Formats that can be offered for publishing. Proofing formats are left out.
    pub fn publish_candidates(&self) -> Vec<&StoryFormat> {
        self.formats.iter().filter(|f| !f.is_proofing()).collect()
    }

    /// Formats usable for proofing.
    pub fn proofing_candidates(&self) -> Vec<&StoryFormat> {
        self.formats.iter().filter(|f| f.is_proofing()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn props(name: &str, version: &str, proofing: bool) -> FormatProperties {
        FormatProperties {
            name: name.to_string(),
            version: version.to_string(),
            source: "{{STORY_DATA}}".to_string(),
            proofing,
            author: None,
            description: None,
            image: None,
            license: None,
            url: None,
            hydrate: None,
        }
    }

    fn harlowe_registry() -> FormatRegistry {
        let mut registry = FormatRegistry::new();
        for version in ["1.0.0", "1.2.0", "2.0.0"] {
            registry.register("Harlowe", v(version), format!("harlowe-{}/format.js", version), false);
        }
        registry
    }

    #[test]
    fn selects_highest_compatible_version() {
        let registry = harlowe_registry();
        let f = registry.latest_compatible("Harlowe", "1.0.0").unwrap();
        assert_eq!(f.version, v("1.2.0"));
        let f = registry.latest_compatible("Harlowe", "2.0.0").unwrap();
        assert_eq!(f.version, v("2.0.0"));
    }

    #[test]
    fn newer_requirement_is_not_satisfied_by_older_versions() {
        let registry = harlowe_registry();
        assert_eq!(
            registry.latest_compatible("Harlowe", "1.3.0").unwrap_err(),
            FormatNotFoundError {
                name: "Harlowe".to_string(),
                version: "1.3.0".to_string()
            }
        );
    }

    #[test]
    fn unknown_format_is_not_found() {
        let err = harlowe_registry().latest_compatible("Nonexistent", "9.9.9").unwrap_err();
        assert_eq!(err.name, "Nonexistent");
        assert!(err.to_string().contains("9.9.9"));
        assert!(harlowe_registry().latest_compatible("Harlowe", "not a version").is_err());
    }

    #[test]
    fn exact_lookup() {
        let registry = harlowe_registry();
        assert_eq!(registry.with_name_and_version("Harlowe", "1.0.0").unwrap().version, v("1.0.0"));
        assert!(registry.with_name_and_version("Harlowe", "1.1.0").is_err());
    }

    #[test]
    fn registration_is_append_only() {
        let mut registry = harlowe_registry();
        assert!(!registry.register("Harlowe", v("1.0.0"), "elsewhere.js", true));
        assert_eq!(registry.formats().len(), 3);
        assert_eq!(registry.formats()[0].url, "harlowe-1.0.0/format.js");
    }

    #[test]
    fn short_versions_are_padded() {
        assert_eq!(parse_version("2").unwrap(), v("2.0.0"));
        assert_eq!(parse_version("2.1").unwrap(), v("2.1.0"));
        assert_eq!(parse_version("v3.3.8").unwrap(), v("3.3.8"));
    }

    #[test]
    fn proofing_formats_are_filtered() {
        let mut registry = harlowe_registry();
        registry.insert_loaded("paperthin.js", props("Paperthin", "1.0.0", true), false).unwrap();
        registry.insert_loaded("snowman.js", props("Snowman", "2.0.2", false), false).unwrap();
        let publish: Vec<String> = registry.publish_candidates().iter().map(|f| f.id().to_string()).collect();
        assert!(!publish.contains(&"Paperthin 1.0.0".to_string()));
        assert!(publish.contains(&"Snowman 2.0.2".to_string()));
        let proofing = registry.proofing_candidates();
        assert_eq!(proofing.len(), 1);
        assert_eq!(proofing[0].name, "Paperthin");
        // Still selectable directly for proofing.
        assert!(registry.latest_compatible("Paperthin", "1.0.0").is_ok());
    }

    #[test]
    fn latest_versions_per_name() {
        let mut registry = harlowe_registry();
        registry.register("Chapbook", v("1.2.3"), "chapbook.js", false);
        let latest: Vec<String> = registry.latest_versions().iter().map(|f| f.id().to_string()).collect();
        assert_eq!(latest, vec!["Chapbook 1.2.3", "Harlowe 2.0.0"]);
    }
}
