//! Documentation connector.
//!
//! Fetches a single plain-text export of the documentation (an
//! `llms-full.txt` style dump) and splits it into one record per section.
//!
//! # Sectioning
//!
//! A line of one to three `#` followed by whitespace starts a new section.
//! Deeper headings stay inside their parent section, and lines inside
//! fenced code blocks are never headings (Python comments are common in
//! the export). Each section's origin is its heading path, e.g.
//! `Nodes and pipelines > Run a pipeline`; text before the first heading
//! becomes a `Preamble` section. Sections without body text are dropped.
//!
//! Record ids are `docs:{slug(origin)}`; when two sections share a path,
//! later ones get `-2`, `-3`, ... in document order, so ids stay stable as
//! long as the export's structure does.
//!
//! # Location
//!
//! `sources.docs.url` may be `http(s)://...`, `file://...`, or a plain
//! path. HTTP requests use the configured timeout and are retried on
//! network errors, 5xx, and 429 (honouring `Retry-After`); 401/403 fail
//! immediately with `source_unavailable`.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::DocsSourceConfig;
use crate::embedding::{retry_after_secs, truncate};
use crate::error::{KbError, Result};
use crate::models::{DocumentRecord, SourceKind};
use crate::retry::RetryPolicy;
use crate::traits::{Connector, FetchOptions, RecordStream};

/// A section of the export before it becomes a record.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    /// Heading path, outermost first.
    pub path: Vec<String>,
    pub body: String,
}

impl Section {
    pub fn origin(&self) -> String {
        if self.path.is_empty() {
            "Preamble".to_string()
        } else {
            self.path.join(" > ")
        }
    }
}

pub struct DocsConnector {
    config: DocsSourceConfig,
    client: reqwest::Client,
}

enum Location {
    Http(String),
    File(PathBuf),
}

impl DocsConnector {
    pub fn new(config: DocsSourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("kedro-rag/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| KbError::Configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn location(&self) -> Location {
        let url = self.config.url.trim();
        if let Some(path) = url.strip_prefix("file://") {
            Location::File(PathBuf::from(path))
        } else if url.starts_with("http://") || url.starts_with("https://") {
            Location::Http(url.to_string())
        } else {
            Location::File(PathBuf::from(url))
        }
    }

    /// Fetch the export and split it into records.
    pub async fn load(&self) -> Result<Vec<DocumentRecord>> {
        let (content, modified) = match self.location() {
            Location::Http(url) => self.fetch_http(&url).await?,
            Location::File(path) => read_file(&path).await?,
        };

        let sections = split_sections(&content);
        let records = sections_to_records(&sections, modified);
        info!(
            url = %self.config.url,
            bytes = content.len(),
            sections = records.len(),
            "documentation export loaded"
        );
        Ok(records)
    }

    async fn fetch_http(&self, url: &str) -> Result<(String, DateTime<Utc>)> {
        let policy = RetryPolicy::new(self.config.max_retries, self.config.retry_base_ms);
        let mut attempt = 0u32;

        loop {
            let err = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let modified = resp
                            .headers()
                            .get(reqwest::header::LAST_MODIFIED)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(Utc::now);
                        let text = resp.text().await.map_err(|e| {
                            KbError::SourceUnavailable(format!("reading {}: {}", url, e))
                        })?;
                        return Ok((text, modified));
                    }

                    let retry_after = retry_after_secs(&resp);
                    let body = resp.text().await.unwrap_or_default();
                    let message = format!("{} returned {}: {}", url, status, truncate(&body, 200));
                    match status.as_u16() {
                        429 => KbError::RateLimited {
                            message,
                            retry_after,
                        },
                        s if s >= 500 => KbError::SourceUnavailable(message),
                        // 401/403 and other client errors will not improve.
                        _ => return Err(KbError::SourceUnavailable(message)),
                    }
                }
                Err(e) => KbError::SourceUnavailable(format!("{} unreachable: {}", url, e)),
            };

            if attempt >= policy.max_retries {
                return Err(err);
            }
            attempt += 1;
            let retry_after = match &err {
                KbError::RateLimited { retry_after, .. } => *retry_after,
                _ => None,
            };
            let delay = policy.delay_for(attempt, retry_after);
            warn!(url, attempt, delay_ms = delay.as_millis() as u64, error = %err, "documentation fetch failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

async fn read_file(path: &Path) -> Result<(String, DateTime<Utc>)> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        KbError::SourceUnavailable(format!("cannot read {}: {}", path.display(), e))
    })?;
    let modified = tokio::fs::metadata(path)
        .await
        .ok()
        .and_then(|m| m.modified().ok())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(Utc::now);
    Ok((content, modified))
}

impl Connector for DocsConnector {
    fn name(&self) -> &str {
        "docs"
    }

    fn description(&self) -> &str {
        "Documentation export split into heading sections"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Documentation
    }

    fn target(&self) -> String {
        self.config.url.clone()
    }

    fn fetch(&self, _options: FetchOptions) -> RecordStream<'_> {
        stream::once(self.load())
            .map_ok(|records| stream::iter(records.into_iter().map(Ok::<_, KbError>)))
            .try_flatten()
            .boxed()
    }
}

/// Heading level (1-3) and title, if `line` is a section heading.
fn heading(line: &str) -> Option<(usize, &str)> {
    let hashes = line.bytes().take_while(|b| *b == b'#').count();
    if !(1..=3).contains(&hashes) {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.starts_with(|c: char| c.is_whitespace()) {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim();
    if title.is_empty() {
        None
    } else {
        Some((hashes, title))
    }
}

/// Split an export into sections on level 1-3 headings.
pub fn split_sections(content: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut path: Vec<(usize, String)> = Vec::new();
    let mut body = String::new();
    let mut in_fence = false;

    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        }

        if !in_fence {
            if let Some((level, title)) = heading(line) {
                flush_section(&path, &mut body, &mut sections);
                while path.last().is_some_and(|(l, _)| *l >= level) {
                    path.pop();
                }
                path.push((level, title.to_string()));
                continue;
            }
        }

        body.push_str(line);
        body.push('\n');
    }
    flush_section(&path, &mut body, &mut sections);

    sections
}

fn flush_section(path: &[(usize, String)], body: &mut String, out: &mut Vec<Section>) {
    let text = body.trim();
    if !text.is_empty() {
        out.push(Section {
            path: path.iter().map(|(_, t)| t.clone()).collect(),
            body: text.to_string(),
        });
    }
    body.clear();
}

fn sections_to_records(sections: &[Section], timestamp: DateTime<Utc>) -> Vec<DocumentRecord> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut records = Vec::with_capacity(sections.len());

    for section in sections {
        let origin = section.origin();
        let base = slugify(&origin);
        let count = seen.entry(base.clone()).or_insert(0);
        *count += 1;
        let id = if *count == 1 {
            format!("docs:{}", base)
        } else {
            debug!(origin = %origin, ordinal = *count, "duplicate section path");
            format!("docs:{}-{}", base, count)
        };

        let title = section
            .path
            .last()
            .cloned()
            .unwrap_or_else(|| origin.clone());

        records.push(DocumentRecord {
            id,
            kind: SourceKind::Documentation,
            text: format!("{}\n\n{}", origin, section.body),
            origin,
            title: Some(title),
            timestamp,
            author: None,
            metadata: serde_json::json!({ "depth": section.path.len() }),
        });
    }

    records
}

/// Lowercase ASCII alphanumerics joined by single dashes; path separators
/// become `--`.
pub fn slugify(origin: &str) -> String {
    origin
        .split(" > ")
        .map(|part| {
            let mut slug = String::with_capacity(part.len());
            let mut dash = false;
            for c in part.chars() {
                if c.is_ascii_alphanumeric() {
                    slug.push(c.to_ascii_lowercase());
                    dash = false;
                } else if !dash && !slug.is_empty() {
                    slug.push('-');
                    dash = true;
                }
            }
            slug.trim_end_matches('-').to_string()
        })
        .collect::<Vec<_>>()
        .join("--")
}
