//! Blacklist feed ingestion
//!
//! A feed is a plain-text, hosts-file-style resource reached through a
//! `file://` or `http(s)://` URI. [`open_feed`] resolves the URI into a
//! buffered line reader and [`parse_lines`] streams it through the
//! hosts-format tokenizer:
//!
//! ```text
//! # comment                      -> skipped
//! 0.0.0.0 ads.example  # note    -> "ads.example"   (second field wins)
//! tracker.example                -> "tracker.example"
//! *.doubleclick.example          -> glob pattern, routed by the store
//! ```
//!
//! The parser is streaming and stateless; the caller-supplied predicate is
//! the only routing decision point.

use std::io;

use reqwest::header;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::error::{Error, Result};

/// Content type required from HTTP feeds.
const FEED_CONTENT_TYPE: &str = "text/plain";

/// A buffered byte stream over a feed resource.
pub type FeedReader = Box<dyn AsyncBufRead + Send + Unpin>;

/// Open a feed by URI.
///
/// `file://` URIs open a local file at `host + path` (so both
/// `file:///etc/hosts` and `file://relative/path` work). `http://` and
/// `https://` URIs are fetched with the supplied client; anything but a
/// 200 response carrying `text/plain` is rejected and the body dropped.
///
/// # Errors
///
/// - [`Error::FeedOpen`] for malformed URIs, unsupported schemes, missing
///   files and request failures
/// - [`Error::FeedHttpStatus`] for non-200 responses
/// - [`Error::FeedContentType`] for non-`text/plain` responses
pub async fn open_feed(uri: &str, http: &reqwest::Client) -> Result<FeedReader> {
    let parsed = reqwest::Url::parse(uri).map_err(|e| Error::feed_open(uri, e))?;

    match parsed.scheme() {
        "file" => {
            let path = format!("{}{}", parsed.host_str().unwrap_or(""), parsed.path());
            let file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| Error::feed_open(uri, e))?;
            Ok(Box::new(BufReader::new(file)))
        }
        "http" | "https" => {
            let response = http
                .get(parsed)
                .send()
                .await
                .map_err(|e| Error::feed_open(uri, e))?;

            let status = response.status();
            if status != reqwest::StatusCode::OK {
                return Err(Error::FeedHttpStatus {
                    uri: uri.to_string(),
                    status: status.as_u16(),
                });
            }

            let content_type = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if !content_type.contains(FEED_CONTENT_TYPE) {
                return Err(Error::FeedContentType {
                    uri: uri.to_string(),
                    content_type: content_type.to_string(),
                });
            }

            let body = response
                .bytes()
                .await
                .map_err(|e| Error::feed_open(uri, e))?;
            Ok(Box::new(io::Cursor::new(body)))
        }
        scheme => Err(Error::feed_open(uri, format!("unsupported scheme '{scheme}'"))),
    }
}

/// Stream a feed line by line, handing each parsed token to `handler`.
///
/// Per line: truncate at `#`, trim whitespace, skip blanks, split on
/// whitespace runs and take the second field if present (hosts-file
/// convention), else the first. Returns the number of tokens for which the
/// handler returned `true`.
///
/// # Errors
///
/// Returns [`Error::FeedIo`] on a terminal read error.
pub async fn parse_lines<R, F>(reader: R, mut handler: F) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(&str) -> bool,
{
    let mut lines = reader.lines();
    let mut count = 0;

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| Error::feed_io("reading feed line", e))?
    {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let mut fields = line.split_whitespace();
        let first = fields.next().unwrap_or(line);
        let token = fields.next().unwrap_or(first);
        if handler(token) {
            count += 1;
        }
    }

    Ok(count)
}
