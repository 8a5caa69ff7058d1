//! Fetching and parsing story format definitions.
//!
//! Format definitions are JavaScript files of the form
//! `window.storyFormat({...});` wrapping a JSON object, or a bare JSON object.
//! [FormatLoader] owns the [FormatRegistry] and a [FetchFormat] implementation,
//! and processes load requests one at a time in submission order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use ureq::Agent;

use crate::format::{parse_version, FormatId, FormatNotFoundError, FormatProperties, FormatRegistry, LoadState};

/// Time budget for fetching one format definition.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Largest format definition accepted over HTTP.
const MAX_DEFINITION_SIZE: u64 = 64 * 1024 * 1024;

/// A format definition could not be loaded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("Could not load story format from {url}: {message}")]
    Fetch { url: String, message: String },
    #[error("Loading story format from {url} timed out after {timeout_ms} ms")]
    Timeout { url: String, timeout_ms: u64 },
    #[error("Story format at {url} is malformed: {message}")]
    Malformed { url: String, message: String },
    #[error("Story format at {url} is {found}, expected {expected}")]
    Mismatch { url: String, expected: String, found: String },
}

/// Resolving or loading a format failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error(transparent)]
    NotFound(#[from] FormatNotFoundError),
    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Retrieves the text of a format definition.
pub trait FetchFormat {
    fn fetch(&self, url: &str) -> Result<String, LoadError>;
}

/// Fetches `http(s)://` URLs over the network and reads anything else,
/// including `file://` URLs, from disk.
pub struct DefaultFetcher {
    agent: Agent,
    timeout: Duration,
}

impl DefaultFetcher {
    pub fn new(timeout: Duration) -> Self {
        let agent = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self { agent, timeout }
    }

    fn fetch_http(&self, url: &str) -> Result<String, LoadError> {
        let fetch_error = |message: String| LoadError::Fetch {
            url: url.to_string(),
            message,
        };
        let response = match self.agent.get(url).call() {
            Ok(r) => r,
            Err(ureq::Error::Timeout(_)) => {
                return Err(LoadError::Timeout {
                    url: url.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
            Err(e) => return Err(fetch_error(e.to_string())),
        };
        let status = response.status().as_u16();
        if status >= 400 {
            return Err(fetch_error(format!("HTTP {}", status)));
        }
        let mut body = response.into_body();
        body.with_config()
            .limit(MAX_DEFINITION_SIZE)
            .read_to_string()
            .map_err(|e| match e {
                ureq::Error::Timeout(_) => LoadError::Timeout {
                    url: url.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                },
                e => fetch_error(e.to_string()),
            })
    }
}

impl Default for DefaultFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl FetchFormat for DefaultFetcher {
    fn fetch(&self, url: &str) -> Result<String, LoadError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            tracing::debug!(%url, "Fetching story format");
            return self.fetch_http(url);
        }
        let path = url.strip_prefix("file://").unwrap_or(url);
        tracing::debug!(%path, "Reading story format");
        std::fs::read_to_string(path).map_err(|e| LoadError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

/// Parses a format definition, either JSONP (`window.storyFormat({...})`) or plain JSON.
pub fn parse_format_definition(url: &str, text: &str) -> Result<FormatProperties, LoadError> {
    let malformed = |message: String| LoadError::Malformed {
        url: url.to_string(),
        message,
    };
    let text = text.trim();
    let json = if text.starts_with('{') {
        text
    } else {
        let call = text
            .find("storyFormat")
            .ok_or_else(|| malformed("no storyFormat() call found".to_string()))?;
        let open = text[call..]
            .find('(')
            .map(|i| call + i + 1)
            .ok_or_else(|| malformed("storyFormat is never called".to_string()))?;
        let close = text
            .rfind(')')
            .filter(|&close| close >= open)
            .ok_or_else(|| malformed("storyFormat() call is not closed".to_string()))?;
        &text[open..close]
    };
    serde_json::from_str(json).map_err(|e| malformed(e.to_string()))
}

/// Loads story formats into a registry through an injected fetcher.
pub struct FormatLoader<F: FetchFormat = DefaultFetcher> {
    registry: FormatRegistry,
    fetcher: F,
    queue: VecDeque<FormatId>,
}

impl FormatLoader<DefaultFetcher> {
    /// A loader using [DefaultFetcher] with the given timeout.
    pub fn with_timeout(registry: FormatRegistry, timeout: Duration) -> Self {
        Self::new(registry, DefaultFetcher::new(timeout))
    }
}

impl<F: FetchFormat> FormatLoader<F> {
    pub fn new(registry: FormatRegistry, fetcher: F) -> Self {
        Self {
            registry,
            fetcher,
            queue: VecDeque::new(),
        }
    }

    pub fn registry(&self) -> &FormatRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut FormatRegistry {
        &mut self.registry
    }

    /// Finds the newest format compatible with `name` and `version` and makes
    /// sure it is loaded.
    pub fn load_format(&mut self, name: &str, version: &str) -> Result<Arc<FormatProperties>, FormatError> {
        let id = self.registry.latest_compatible(name, version)?.id();
        self.load(&id)
    }

    /// Loads exactly the format `id`. A loaded format is returned without refetching;
    /// a failed one is attempted again.
    pub fn load(&mut self, id: &FormatId) -> Result<Arc<FormatProperties>, FormatError> {
        let format = self.registry.get(id).ok_or_else(|| FormatNotFoundError {
            name: id.name.clone(),
            version: id.version.to_string(),
        })?;
        if let Some(properties) = format.properties() {
            tracing::debug!(format = %id, "Story format already loaded");
            return Ok(Arc::clone(properties));
        }
        let url = format.url.clone();
        self.registry.set_state(id, LoadState::Loading);
        match self.fetch_and_parse(id, &url) {
            Ok(properties) => {
                let properties = Arc::new(properties);
                self.registry.set_state(id, LoadState::Loaded(Arc::clone(&properties)));
                tracing::debug!(format = %id, "Loaded story format");
                Ok(properties)
            }
            Err(e) => {
                tracing::warn!(format = %id, error = %e, "Failed to load story format");
                self.registry.set_state(id, LoadState::Failed(e.clone()));
                Err(e.into())
            }
        }
    }

    fn fetch_and_parse(&self, id: &FormatId, url: &str) -> Result<FormatProperties, LoadError> {
        let text = self.fetcher.fetch(url)?;
        let properties = parse_format_definition(url, &text)?;
        let found_version = parse_version(&properties.version).ok();
        if properties.name != id.name || found_version.as_ref() != Some(&id.version) {
            return Err(LoadError::Mismatch {
                url: url.to_string(),
                expected: id.to_string(),
                found: format!("{} {}", properties.name, properties.version),
            });
        }
        Ok(properties)
    }

    /// Queues a load request behind any already waiting.
    pub fn enqueue(&mut self, id: FormatId) {
        self.queue.push_back(id);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Processes queued requests in order, one at a time. Every request gets
    /// exactly one result; a failure does not stop the requests behind it.
    pub fn load_queued(&mut self) -> Vec<(FormatId, Result<Arc<FormatProperties>, FormatError>)> {
        let mut results = Vec::with_capacity(self.queue.len());
        while let Some(id) = self.queue.pop_front() {
            tracing::debug!(format = %id, remaining = self.queue.len(), "Processing format load request");
            let result = self.load(&id);
            results.push((id, result));
        }
        results
    }

    /// Queues every format that isn't loaded yet, then processes the queue.
    pub fn load_all(&mut self) -> Vec<(FormatId, Result<Arc<FormatProperties>, FormatError>)> {
        let pending: Vec<FormatId> = self
            .registry
            .formats()
            .iter()
            .filter(|f| f.properties().is_none())
            .map(|f| f.id())
            .collect();
        for id in pending {
            self.enqueue(id);
        }
        self.load_queued()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use super::*;
    use pretty_assertions::assert_eq;
    use semver::Version;

    /// Serves definitions from memory and records which URLs were requested.
    #[derive(Default)]
    pub(crate) struct MemoryFetcher {
        files: HashMap<String, Result<String, LoadError>>,
        requests: RefCell<Vec<String>>,
    }

    impl MemoryFetcher {
        pub(crate) fn with(mut self, url: &str, result: Result<String, LoadError>) -> Self {
            self.files.insert(url.to_string(), result);
            self
        }
    }

    impl FetchFormat for MemoryFetcher {
        fn fetch(&self, url: &str) -> Result<String, LoadError> {
            self.requests.borrow_mut().push(url.to_string());
            self.files.get(url).cloned().unwrap_or_else(|| {
                Err(LoadError::Fetch {
                    url: url.to_string(),
                    message: "404".to_string(),
                })
            })
        }
    }

    pub(crate) fn definition(name: &str, version: &str) -> String {
        format!(
            "window.storyFormat({{\"name\":\"{}\",\"version\":\"{}\",\"source\":\"<html>{{{{STORY_DATA}}}}</html>\"}});",
            name, version
        )
    }

    fn id(name: &str, version: &str) -> FormatId {
        FormatId {
            name: name.to_string(),
            version: Version::parse(version).unwrap(),
        }
    }

    fn registry(entries: &[(&str, &str, &str)]) -> FormatRegistry {
        let mut registry = FormatRegistry::new();
        for (name, version, url) in entries {
            registry.register(*name, Version::parse(version).unwrap(), *url, false);
        }
        registry
    }

    #[test]
    fn parses_jsonp_definition() {
        let p = parse_format_definition("x", &definition("Harlowe", "3.3.8")).unwrap();
        assert_eq!(p.name, "Harlowe");
        assert_eq!(p.version, "3.3.8");
        assert_eq!(p.source, "<html>{{STORY_DATA}}</html>");
        assert!(!p.proofing);
    }

    #[test]
    fn parses_bare_json_definition() {
        let p = parse_format_definition("x", r#"{"name":"Paperthin","version":"1.0.0","source":"","proofing":true}"#).unwrap();
        assert!(p.proofing);
    }

    #[test]
    fn rejects_malformed_definitions() {
        for text in ["", "alert(1)", "window.storyFormat({\"name\": 1});", "window.storyFormat({\"name\":\"A\"}"] {
            let err = parse_format_definition("bad.js", text).unwrap_err();
            assert!(matches!(err, LoadError::Malformed { .. }), "{}: {:?}", text, err);
        }
    }

    #[test]
    fn load_format_picks_latest_compatible() {
        let fetcher = MemoryFetcher::default()
            .with("h1.0", Ok(definition("Harlowe", "1.0.0")))
            .with("h1.2", Ok(definition("Harlowe", "1.2.0")))
            .with("h2.0", Ok(definition("Harlowe", "2.0.0")));
        let mut loader = FormatLoader::new(
            registry(&[("Harlowe", "1.0.0", "h1.0"), ("Harlowe", "1.2.0", "h1.2"), ("Harlowe", "2.0.0", "h2.0")]),
            fetcher,
        );
        let p = loader.load_format("Harlowe", "1.0.0").unwrap();
        assert_eq!(p.version, "1.2.0");
        assert_eq!(*loader.fetcher.requests.borrow(), vec!["h1.2"]);
    }

    #[test]
    fn loaded_formats_are_not_refetched() {
        let fetcher = MemoryFetcher::default().with("s", Ok(definition("Snowman", "2.0.2")));
        let mut loader = FormatLoader::new(registry(&[("Snowman", "2.0.2", "s")]), fetcher);
        let first = loader.load(&id("Snowman", "2.0.2")).unwrap();
        let second = loader.load(&id("Snowman", "2.0.2")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loader.fetcher.requests.borrow().len(), 1);
        assert!(loader.registry().get(&id("Snowman", "2.0.2")).unwrap().properties().is_some());
    }

    #[test]
    fn unknown_format_is_not_found() {
        let mut loader = FormatLoader::new(FormatRegistry::new(), MemoryFetcher::default());
        let err = loader.load_format("Nonexistent", "9.9.9").unwrap_err();
        assert!(matches!(err, FormatError::NotFound(_)));
        assert!(loader.fetcher.requests.borrow().is_empty());
    }

    #[test]
    fn failed_load_is_recorded_and_retried() {
        let timeout = LoadError::Timeout {
            url: "c".to_string(),
            timeout_ms: 2000,
        };
        let fetcher = MemoryFetcher::default().with("c", Err(timeout.clone()));
        let mut loader = FormatLoader::new(registry(&[("Chapbook", "1.2.3", "c")]), fetcher);
        let err = loader.load(&id("Chapbook", "1.2.3")).unwrap_err();
        assert_eq!(err, FormatError::Load(timeout.clone()));
        assert!(err.to_string().contains("timed out"));
        let state = &loader.registry().get(&id("Chapbook", "1.2.3")).unwrap().state;
        assert_eq!(state.error(), Some(&timeout));

        loader.fetcher.files.insert("c".to_string(), Ok(definition("Chapbook", "1.2.3")));
        assert!(loader.load(&id("Chapbook", "1.2.3")).is_ok());
        assert_eq!(loader.fetcher.requests.borrow().len(), 2);
    }

    #[test]
    fn mismatched_definition_fails() {
        let fetcher = MemoryFetcher::default().with("s", Ok(definition("SugarCube", "2.36.1")));
        let mut loader = FormatLoader::new(registry(&[("Snowman", "2.0.2", "s")]), fetcher);
        match loader.load(&id("Snowman", "2.0.2")) {
            Err(FormatError::Load(LoadError::Mismatch { expected, found, .. })) => {
                assert_eq!(expected, "Snowman 2.0.2");
                assert_eq!(found, "SugarCube 2.36.1");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn queue_is_fifo_and_failures_do_not_block() {
        let fetcher = MemoryFetcher::default()
            .with("a", Ok(definition("A", "1.0.0")))
            .with("c", Ok(definition("C", "1.0.0")));
        let mut loader = FormatLoader::new(registry(&[("A", "1.0.0", "a"), ("B", "1.0.0", "b"), ("C", "1.0.0", "c")]), fetcher);
        loader.enqueue(id("C", "1.0.0"));
        loader.enqueue(id("B", "1.0.0"));
        loader.enqueue(id("A", "1.0.0"));
        assert_eq!(loader.queued(), 3);
        let results = loader.load_queued();
        assert_eq!(loader.queued(), 0);
        assert_eq!(*loader.fetcher.requests.borrow(), vec!["c", "b", "a"]);
        let outcomes: Vec<(String, bool)> = results.iter().map(|(id, r)| (id.name.clone(), r.is_ok())).collect();
        assert_eq!(
            outcomes,
            vec![("C".to_string(), true), ("B".to_string(), false), ("A".to_string(), true)]
        );
    }

    #[test]
    fn load_all_skips_loaded_formats() {
        let fetcher = MemoryFetcher::default()
            .with("a", Ok(definition("A", "1.0.0")))
            .with("b", Ok(definition("B", "1.0.0")));
        let mut loader = FormatLoader::new(registry(&[("A", "1.0.0", "a"), ("B", "1.0.0", "b")]), fetcher);
        loader.load(&id("A", "1.0.0")).unwrap();
        let results = loader.load_all();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, id("B", "1.0.0"));
        assert_eq!(*loader.fetcher.requests.borrow(), vec!["a", "b"]);
    }

    /// Answers one HTTP request with `response` and returns the URL to request.
    fn serve_once(response: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/format.js", listener.local_addr().unwrap());
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0; 4096];
            let _ = stream.read(&mut request);
            stream.write_all(response.as_bytes()).unwrap();
        });
        url
    }

    #[test]
    fn default_fetcher_downloads_definitions() {
        let body = definition("Snowman", "2.0.2");
        let url = serve_once(format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/javascript\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        ));
        let text = DefaultFetcher::default().fetch(&url).unwrap();
        assert_eq!(text, body);
    }

    #[test]
    fn default_fetcher_reports_http_errors() {
        let url = serve_once("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string());
        match DefaultFetcher::default().fetch(&url) {
            Err(LoadError::Fetch { url: failed, message }) => {
                assert_eq!(failed, url);
                assert_eq!(message, "HTTP 404");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn default_fetcher_times_out() {
        // Connections queue in the backlog but are never answered.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/format.js", listener.local_addr().unwrap());
        let fetcher = DefaultFetcher::new(Duration::from_millis(300));
        assert_eq!(
            fetcher.fetch(&url),
            Err(LoadError::Timeout {
                url: url.clone(),
                timeout_ms: 300
            })
        );
        drop(listener);
    }

    #[test]
    fn default_fetcher_reads_files() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/test-data/format.js");
        let fetcher = DefaultFetcher::default();
        let text = fetcher.fetch(&format!("file://{}", path)).unwrap();
        let p = parse_format_definition(path, &text).unwrap();
        assert_eq!(p.name, "Minimal");
        assert!(matches!(fetcher.fetch("/does/not/exist.js"), Err(LoadError::Fetch { .. })));
    }
}
