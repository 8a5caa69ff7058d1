use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use twine_publisher::format::parse_version;
use twine_publisher::loader::{parse_format_definition, DEFAULT_TIMEOUT};
use twine_publisher::{AppInfo, FormatRegistry};

use crate::input::{glob_paths, read_file};

/// Name of the configuration file looked up in the current directory.
pub const CONFIG_FILE: &str = "twine.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FormatRef {
    pub name: String,
    pub version: String,
}

/// A format definition available at a URL, loaded when a story needs it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FormatEntry {
    pub name: String,
    pub version: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory published files are written to.
    pub output: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
    /// Glob patterns of format definition files, loaded eagerly.
    pub format_paths: Vec<String>,
    pub default_format: Option<FormatRef>,
    pub proofing_format: Option<FormatRef>,
    pub app: AppConfig,
    pub formats: Vec<FormatEntry>,
    /// Directory relative paths in the file are resolved against.
    #[serde(skip)]
    pub base: PathBuf,
}

impl Config {
    /// Reads `path`, or `twine.toml` if present, or falls back to defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
        match path {
            Some(path) => Self::read(path),
            None if Path::new(CONFIG_FILE).exists() => Self::read(Path::new(CONFIG_FILE)),
            None => {
                tracing::debug!("No {} found, using defaults", CONFIG_FILE);
                Ok(Config {
                    base: PathBuf::from("."),
                    ..Default::default()
                })
            }
        }
    }

    pub fn read(path: &Path) -> anyhow::Result<Config> {
        let mut config: Config =
            toml::from_str(&read_file(path)?).with_context(|| format!("Invalid configuration in {}", path.display()))?;
        config.base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_TIMEOUT)
    }

    pub fn output_dir(&self) -> Option<PathBuf> {
        self.output.as_ref().map(|o| self.base.join(o))
    }

    pub fn app_info(&self) -> AppInfo {
        let default = AppInfo::default();
        AppInfo {
            name: self.app.name.clone().unwrap_or(default.name),
            version: self.app.version.clone().unwrap_or(default.version),
            build_number: None,
        }
    }

    /// Builds the format registry. `[[formats]]` entries are registered
    /// unloaded; files matching `format_paths` are read now. Unusable entries
    /// are logged and left out.
    pub fn registry(&self) -> FormatRegistry {
        let mut registry = FormatRegistry::new();
        for entry in &self.formats {
            match parse_version(&entry.version) {
                Ok(version) => {
                    registry.register(&entry.name, version, self.resolve_url(&entry.url), true);
                }
                Err(e) => tracing::warn!(format = %entry.name, version = %entry.version, error = %e, "Ignoring format with invalid version"),
            }
        }
        for pattern in &self.format_paths {
            let paths = match glob_paths(pattern, &self.base) {
                Ok(paths) => paths,
                Err(e) => {
                    tracing::warn!(%pattern, error = %e, "Invalid format path pattern");
                    continue;
                }
            };
            if paths.is_empty() {
                tracing::warn!(%pattern, "No story format matches pattern");
            }
            for path in paths {
                let url = path.to_string_lossy().to_string();
                let loaded = read_file(&path)
                    .and_then(|text| parse_format_definition(&url, &text).map_err(anyhow::Error::from))
                    .and_then(|props| registry.insert_loaded(url.clone(), props, true).map_err(anyhow::Error::from));
                match loaded {
                    Ok(id) => tracing::debug!(format = %id, path = %url, "Loaded story format"),
                    Err(e) => tracing::warn!(path = %url, error = %e, "Could not load story format"),
                }
            }
        }
        registry
    }

    fn resolve_url(&self, url: &str) -> String {
        if url.contains("://") || Path::new(url).is_absolute() {
            url.to_string()
        } else {
            self.base.join(url).to_string_lossy().to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    const MINIMAL: &str = include_str!("../../twine-publisher/test-data/format.js");
    const PROOFING: &str = include_str!("../../twine-publisher/test-data/proofing.js");

    #[test]
    fn empty_file_is_all_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "").unwrap();
        let config = Config::read(&path).unwrap();
        assert_eq!(config.base, dir.path());
        assert_eq!(config.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(config.output_dir(), None);
        assert_eq!(config.app_info(), AppInfo::default());
        assert!(config.registry().formats().is_empty());
    }

    #[test]
    fn reads_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(
            &path,
            r#"
output = "dist"
timeout_ms = 500
format_paths = ["formats/*.js"]
default_format = { name = "Minimal", version = "1.0.0" }
proofing_format = { name = "Paperthin", version = "1.0.0" }

[app]
name = "Twine"
version = "2.10.0"

[[formats]]
name = "Harlowe"
version = "3.3.8"
url = "https://example.org/harlowe-3.3.8/format.js"
"#,
        )
        .unwrap();
        let config = Config::read(&path).unwrap();
        assert_eq!(config.output_dir(), Some(dir.path().join("dist")));
        assert_eq!(config.timeout(), Duration::from_millis(500));
        assert_eq!(
            config.default_format,
            Some(FormatRef {
                name: "Minimal".to_string(),
                version: "1.0.0".to_string()
            })
        );
        assert_eq!(config.app_info().version, "2.10.0");
        assert_eq!(config.formats[0].url, "https://example.org/harlowe-3.3.8/format.js");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "outptu = \"dist\"\n").unwrap();
        let err = Config::read(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid configuration"));
    }

    #[test]
    fn registry_loads_format_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("formats")).unwrap();
        fs::write(dir.path().join("formats/minimal.js"), MINIMAL).unwrap();
        fs::write(dir.path().join("formats/paperthin.js"), PROOFING).unwrap();
        fs::write(dir.path().join("formats/broken.js"), "window.storyFormat(").unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(
            &path,
            "format_paths = [\"formats/*.js\"]\n\n[[formats]]\nname = \"Local\"\nversion = \"2\"\nurl = \"local/format.js\"\n",
        )
        .unwrap();
        let registry = Config::read(&path).unwrap().registry();
        let mut names: Vec<String> = registry.formats().iter().map(|f| f.id().to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["Local 2.0.0", "Minimal 1.0.0", "Paperthin 1.0.0"]);
        assert_eq!(registry.proofing_candidates().len(), 1);
        let local = registry.with_name_and_version("Local", "2.0.0").unwrap();
        assert_eq!(local.url, dir.path().join("local/format.js").to_string_lossy());
        assert!(local.properties().is_none());
    }
}
