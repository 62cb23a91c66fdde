//! Fetching CSV sources over HTTP for URL imports.

use crate::error::{ApiError, Result};
use bytes::Bytes;
use futures::Stream;
use reqwest::{Client, Url};
use tracing::debug;

/// Filename used when the URL path has no final segment.
pub const DEFAULT_FILENAME: &str = "downloaded.csv";

/// Parse and check a source URL. Only `http` and `https` are accepted.
pub fn parse_source_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| ApiError::BadRequest(format!("Invalid URL {}: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ApiError::BadRequest(format!(
            "Unsupported URL scheme '{}': only http and https can be fetched",
            other
        ))),
    }
}

/// Last non-empty path segment of `url`, or [`DEFAULT_FILENAME`].
pub fn filename_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_FILENAME.to_string())
}

/// Start downloading `raw_url`, returning the derived filename and the body
/// as a byte stream. Non-success statuses are `Fetch` errors.
pub async fn open(
    client: &Client,
    raw_url: &str,
) -> Result<(String, impl Stream<Item = reqwest::Result<Bytes>>)> {
    let url = parse_source_url(raw_url)?;
    let filename = filename_from_url(&url);

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| ApiError::Fetch(format!("Failed to download file: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ApiError::Fetch(format!("Status code: {}", status.as_u16())));
    }
    debug!(url = %raw_url, filename = %filename, "Fetching CSV source");

    Ok((filename, response.bytes_stream()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_from_url() {
        let url = parse_source_url("https://example.com/data/people.csv?x=1").unwrap();
        assert_eq!(filename_from_url(&url), "people.csv");

        let url = parse_source_url("https://example.com/").unwrap();
        assert_eq!(filename_from_url(&url), DEFAULT_FILENAME);

        let url = parse_source_url("http://example.com").unwrap();
        assert_eq!(filename_from_url(&url), DEFAULT_FILENAME);
    }

    #[test]
    fn test_rejects_unusable_urls() {
        assert!(matches!(parse_source_url("not a url"), Err(ApiError::BadRequest(_))));
        assert!(matches!(
            parse_source_url("file:///etc/passwd"),
            Err(ApiError::BadRequest(_))
        ));
    }
}
