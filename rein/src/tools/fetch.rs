use super::{OpResult, UrlFetcher};

/// Response bodies beyond this many bytes are cut and marked `[truncated]`.
const MAX_BYTES: usize = 100_000;

/// Plain HTTP GET returning the body as text.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl UrlFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> OpResult {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return OpResult::err_fmt(format_args!("Unsupported URL scheme: {url}"));
        }
        tracing::debug!(url, "fetching url");

        let resp = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => return OpResult::err_fmt(format_args!("Request failed: {e}")),
        };
        let status = resp.status();
        if !status.is_success() {
            return OpResult::err_fmt(format_args!("HTTP {status}"));
        }
        match resp.bytes().await {
            Ok(bytes) => OpResult::ok(truncate_body(&bytes)),
            Err(e) => OpResult::err_fmt(format_args!("Failed to read body: {e}")),
        }
    }
}

fn truncate_body(bytes: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_BYTES)]).into_owned();
    if bytes.len() > MAX_BYTES {
        text.push_str("\n[truncated]");
    }
    text
}
