use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::config::NetworkSection;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("failed to build http client: {0}")]
    Build(String),
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("transport error for {url}: {source}")]
    Transport {
        url: String,
        source: reqwest::Error,
    },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type HttpResult<T> = Result<T, HttpError>;

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }
}

/// Pooled request execution shared by every component. Retries are not
/// this layer's concern; a transport failure surfaces as a typed error
/// and the fetcher decides what to do with it.
///
/// `file://` URLs are served from disk with a synthetic 200/404, which
/// keeps fixtures and the test suite off the network.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    default_headers: HashMap<String, String>,
}

impl HttpClient {
    pub fn new(network: &NetworkSection) -> HttpResult<Self> {
        let client = Client::builder()
            .user_agent(network.user_agent.clone())
            .connect_timeout(Duration::from_secs(network.connect_timeout_s))
            .timeout(Duration::from_secs(network.request_timeout_s))
            .pool_max_idle_per_host(network.max_keepalive)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|err| HttpError::Build(err.to_string()))?;

        let mut default_headers = HashMap::new();
        default_headers.insert("User-Agent".to_string(), network.user_agent.clone());
        if network.impersonate_browser {
            for (name, value) in browser_profile_headers() {
                default_headers.insert(name.to_string(), value.to_string());
            }
        }
        Ok(Self {
            client,
            default_headers,
        })
    }

    pub async fn get(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> HttpResult<HttpResponse> {
        self.get_with_timeout(url, headers, None).await
    }

    pub async fn get_with_timeout(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        timeout: Option<Duration>,
    ) -> HttpResult<HttpResponse> {
        if let Some(path) = file_url_path(url)? {
            return read_local(&path).await;
        }
        let mut request = self.client.get(url);
        for (name, value) in self.merged_headers(headers) {
            request = request.header(name, value);
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await.map_err(|source| HttpError::Transport {
            url: url.to_string(),
            source,
        })?;
        into_response(url, response).await
    }

    pub async fn post(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: Vec<u8>,
    ) -> HttpResult<HttpResponse> {
        if let Some(path) = file_url_path(url)? {
            // The request body is irrelevant for canned local responses.
            return read_local(&path).await;
        }
        let mut request = self.client.post(url).body(body);
        for (name, value) in self.merged_headers(headers) {
            request = request.header(name, value);
        }
        let response = request.send().await.map_err(|source| HttpError::Transport {
            url: url.to_string(),
            source,
        })?;
        into_response(url, response).await
    }

    /// Streaming GET straight into a file, used by the single-file MP4
    /// path. `on_chunk` receives the size of every chunk written so the
    /// caller can drive byte-based progress.
    pub async fn stream_to_file<F>(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        path: &Path,
        mut on_chunk: F,
    ) -> HttpResult<u64>
    where
        F: FnMut(u64),
    {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| HttpError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        if let Some(source_path) = file_url_path(url)? {
            let bytes = fs::copy(&source_path, path)
                .await
                .map_err(|source| HttpError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            on_chunk(bytes);
            return Ok(bytes);
        }
        let mut request = self.client.get(url);
        for (name, value) in self.merged_headers(headers) {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|source| HttpError::Transport {
                url: url.to_string(),
                source,
            })?;
        let mut file = fs::File::create(path)
            .await
            .map_err(|source| HttpError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let mut stream = response.bytes_stream();
        let mut total = 0u64;
        use futures::StreamExt;
        while let Some(chunk) = stream.next().await {
            let data = chunk.map_err(|source| HttpError::Transport {
                url: url.to_string(),
                source,
            })?;
            file.write_all(&data)
                .await
                .map_err(|source| HttpError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            total += data.len() as u64;
            on_chunk(data.len() as u64);
        }
        file.flush().await.map_err(|source| HttpError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(total)
    }

    fn merged_headers(&self, extra: &HashMap<String, String>) -> HashMap<String, String> {
        let mut merged = self.default_headers.clone();
        for (name, value) in extra {
            merged.insert(name.clone(), value.clone());
        }
        merged
    }
}

fn file_url_path(url: &str) -> HttpResult<Option<PathBuf>> {
    let Ok(parsed) = Url::parse(url) else {
        return Err(HttpError::InvalidUrl {
            url: url.to_string(),
            reason: "not an absolute url".into(),
        });
    };
    if parsed.scheme() != "file" {
        return Ok(None);
    }
    parsed
        .to_file_path()
        .map(Some)
        .map_err(|_| HttpError::InvalidUrl {
            url: url.to_string(),
            reason: "invalid file url".into(),
        })
}

async fn read_local(path: &Path) -> HttpResult<HttpResponse> {
    match fs::read(path).await {
        Ok(body) => Ok(HttpResponse {
            status: 200,
            headers: HashMap::new(),
            body,
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HttpResponse {
            status: 404,
            headers: HashMap::new(),
            body: Vec::new(),
        }),
        Err(source) => Err(HttpError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn into_response(url: &str, response: reqwest::Response) -> HttpResult<HttpResponse> {
    let status = response.status().as_u16();
    let mut headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }
    let body = response
        .bytes()
        .await
        .map_err(|source| HttpError::Transport {
            url: url.to_string(),
            source,
        })?;
    Ok(HttpResponse {
        status,
        headers,
        body: body.to_vec(),
    })
}

/// Header profile applied when `impersonate_browser` is set. Some origins
/// filter on more than the User-Agent; sending the full set of Chrome
/// request headers gets past the cheap checks.
fn browser_profile_headers() -> Vec<(&'static str, &'static str)> {
    vec![
        (
            "Accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        ),
        ("Accept-Language", "en-US,en;q=0.9"),
        ("Sec-Fetch-Dest", "empty"),
        ("Sec-Fetch-Mode", "cors"),
        ("Sec-Fetch-Site", "same-site"),
        (
            "sec-ch-ua",
            "\"Chromium\";v=\"131\", \"Not_A Brand\";v=\"24\"",
        ),
        ("sec-ch-ua-mobile", "?0"),
        ("sec-ch-ua-platform", "\"Windows\""),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkSection;

    #[tokio::test]
    async fn file_url_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, b"segment-bytes").unwrap();
        let client = HttpClient::new(&NetworkSection::default()).unwrap();
        let url = format!("file://{}", path.display());
        let response = client.get(&url, &HashMap::new()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"segment-bytes");
    }

    #[tokio::test]
    async fn missing_file_maps_to_404() {
        let dir = tempfile::tempdir().unwrap();
        let client = HttpClient::new(&NetworkSection::default()).unwrap();
        let url = format!("file://{}/absent.ts", dir.path().display());
        let response = client.get(&url, &HashMap::new()).await.unwrap();
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn stream_to_file_reports_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.mp4");
        std::fs::write(&source, vec![0u8; 2048]).unwrap();
        let client = HttpClient::new(&NetworkSection::default()).unwrap();
        let url = format!("file://{}", source.display());
        let dest = dir.path().join("copy.mp4");
        let mut seen = 0u64;
        let total = client
            .stream_to_file(&url, &HashMap::new(), &dest, |chunk| seen += chunk)
            .await
            .unwrap();
        assert_eq!(total, 2048);
        assert_eq!(seen, 2048);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 2048);
    }

    #[test]
    fn relative_url_is_rejected() {
        assert!(matches!(
            file_url_path("segments/0001.ts"),
            Err(HttpError::InvalidUrl { .. })
        ));
    }
}
