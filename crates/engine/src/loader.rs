//! Built-in model loaders for local files and HTTP URLs

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use imgload_scheduler::{CancellationToken, Priority};

use crate::error::StrategyError;
use crate::resource::DataSource;
use crate::strategy::{DataFetcher, ModelLoader};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const READ_TIMEOUT: Duration = Duration::from_secs(6);

#[derive(Debug)]
struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("fetch cancelled")
    }
}

impl std::error::Error for Cancelled {}

fn check(token: &CancellationToken) -> Result<(), StrategyError> {
    if token.is_cancelled() {
        Err(Box::new(Cancelled))
    } else {
        Ok(())
    }
}

/// Loads [`PathBuf`] models from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileLoader;

impl ModelLoader<PathBuf> for FileLoader {
    fn build_fetcher(&self, path: &PathBuf, _width: u32, _height: u32) -> Option<Arc<dyn DataFetcher>> {
        Some(Arc::new(FileFetcher { path: path.clone() }))
    }
}

#[derive(Debug)]
pub struct FileFetcher {
    path: PathBuf,
}

impl DataFetcher for FileFetcher {
    fn load_data(
        &self,
        _priority: Priority,
        token: &CancellationToken,
    ) -> Result<Box<dyn Read + Send>, StrategyError> {
        check(token)?;
        let file = File::open(&self.path)?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn id(&self) -> String {
        format!("file://{}", self.path.display())
    }

    fn data_source(&self) -> DataSource {
        DataSource::Local
    }
}

/// An HTTP(S) URL plus request headers.
///
/// The cache identity drops the query string and fragment, so signed or
/// expiring parameters do not defeat caching; the full URL is still fetched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UrlModel {
    url: String,
    headers: Vec<(String, String)>,
}

impl UrlModel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn cache_id(&self) -> &str {
        let end = self.url.find(|c: char| c == '?' || c == '#').unwrap_or(self.url.len());
        &self.url[..end]
    }
}

/// Fetches [`UrlModel`]s with `ureq`.
#[derive(Clone)]
pub struct HttpLoader {
    agent: ureq::Agent,
}

impl HttpLoader {
    pub fn new(agent: ureq::Agent) -> Self {
        Self { agent }
    }
}

impl Default for HttpLoader {
    fn default() -> Self {
        Self::new(
            ureq::AgentBuilder::new()
                .timeout_connect(CONNECT_TIMEOUT)
                .timeout_read(READ_TIMEOUT)
                .build(),
        )
    }
}

impl ModelLoader<UrlModel> for HttpLoader {
    fn handles(&self, model: &UrlModel) -> bool {
        let url = model.url.to_ascii_lowercase();
        url.starts_with("http://") || url.starts_with("https://")
    }

    fn build_fetcher(&self, model: &UrlModel, _width: u32, _height: u32) -> Option<Arc<dyn DataFetcher>> {
        Some(Arc::new(HttpFetcher {
            agent: self.agent.clone(),
            model: model.clone(),
        }))
    }
}

pub struct HttpFetcher {
    agent: ureq::Agent,
    model: UrlModel,
}

impl DataFetcher for HttpFetcher {
    fn load_data(
        &self,
        _priority: Priority,
        token: &CancellationToken,
    ) -> Result<Box<dyn Read + Send>, StrategyError> {
        check(token)?;
        let mut request = self.agent.get(&self.model.url);
        for (name, value) in &self.model.headers {
            request = request.set(name, value);
        }
        let response = request.call()?;
        check(token)?;
        log::debug!(
            "fetched {} ({})",
            self.model.cache_id(),
            response.header("Content-Type").unwrap_or("unknown type")
        );
        Ok(Box::new(response.into_reader()))
    }

    fn id(&self) -> String {
        self.model.cache_id().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_cache_id_strips_query_and_fragment() {
        assert_eq!(
            UrlModel::new("https://cdn.example.com/a.png?sig=123&exp=9").cache_id(),
            "https://cdn.example.com/a.png"
        );
        assert_eq!(
            UrlModel::new("https://example.com/b.png#frag").cache_id(),
            "https://example.com/b.png"
        );
        assert_eq!(UrlModel::new("https://example.com/c.png").cache_id(), "https://example.com/c.png");
    }

    #[test]
    fn test_http_loader_handles_only_http_urls() {
        let loader = HttpLoader::default();
        assert!(loader.handles(&UrlModel::new("https://example.com/a.png")));
        assert!(loader.handles(&UrlModel::new("HTTP://example.com/a.png")));
        assert!(!loader.handles(&UrlModel::new("ftp://example.com/a.png")));
    }

    #[test]
    fn test_headers_are_kept_in_order() {
        let model = UrlModel::new("https://example.com/a.png")
            .header("Authorization", "Bearer t")
            .header("Accept", "image/png");
        assert_eq!(model.headers()[0].0, "Authorization");
        assert_eq!(model.headers()[1].1, "image/png");
    }

    #[test]
    fn test_file_fetcher_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"bytes").unwrap();

        let fetcher = FileLoader.build_fetcher(&path, 0, 0).unwrap();
        assert_eq!(fetcher.data_source(), DataSource::Local);
        let mut data = String::new();
        fetcher
            .load_data(Priority::Normal, &CancellationToken::new())
            .unwrap()
            .read_to_string(&mut data)
            .unwrap();
        assert_eq!(data, "bytes");
    }

    #[test]
    fn test_missing_file_and_cancelled_fetch_fail() {
        let fetcher = FileLoader
            .build_fetcher(&PathBuf::from("/definitely/not/here.png"), 0, 0)
            .unwrap();
        assert!(fetcher.load_data(Priority::Normal, &CancellationToken::new()).is_err());

        let token = CancellationToken::new();
        token.cancel();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"bytes").unwrap();
        let fetcher = FileLoader.build_fetcher(&path, 0, 0).unwrap();
        assert!(fetcher.load_data(Priority::Normal, &token).is_err());
    }
}
