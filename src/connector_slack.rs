//! Slack connector.
//!
//! Reads recent conversation history from the configured channels through
//! the Slack Web API and yields one record per thread (or per standalone
//! message). Records are produced lazily, one history page at a time.
//!
//! # Flow
//!
//! 1. `auth.test` validates the bot token.
//! 2. Channels are resolved: ids via `conversations.info`, names via
//!    `conversations.list`. With no channels configured, every channel the
//!    bot is a member of is read.
//! 3. A channel the bot has not joined is `permission_denied`, never an
//!    empty result.
//! 4. `conversations.history` is paged from `now - days_back`; threads are
//!    expanded with `conversations.replies` when `include_threads` is set.
//! 5. Authors are resolved with `users.info` and cached for the fetch;
//!    lookups that fail fall back to `Unknown User`.
//!
//! Bot posts and join/leave notices are skipped, as are empty messages.
//! With `questions_only`, threads whose opening message does not look like
//! a question are skipped too.
//!
//! # Errors
//!
//! | Slack response | Result |
//! |----------------|--------|
//! | HTTP 429 / `ratelimited` | retried with backoff, then `rate_limited` |
//! | network error / HTTP 5xx / `internal_error` | retried, then `source_unavailable` |
//! | `invalid_auth`, `not_authed`, `token_revoked`, ... | `source_unavailable` |
//! | `not_in_channel`, `channel_not_found` | `permission_denied` |

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SlackSourceConfig;
use crate::embedding::{retry_after_secs, truncate};
use crate::error::{KbError, Result};
use crate::models::{DocumentRecord, SourceKind};
use crate::retry::RetryPolicy;
use crate::traits::{Connector, FetchOptions, RecordStream};

const SKIPPED_SUBTYPES: &[&str] = &["bot_message", "channel_join", "channel_leave"];

const QUESTION_INDICATORS: &[&str] = &[
    "?", "how do", "how to", "what is", "what are", "where is", "where are", "when is",
    "when do", "why", "which", "can i", "could i", "should i", "help", "issue", "problem",
    "error", "trouble", "stuck", "failing",
];

/// Whether a message reads like a request for help.
pub fn is_question(text: &str) -> bool {
    let lower = text.to_lowercase();
    QUESTION_INDICATORS.iter().any(|i| lower.contains(i))
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
    pub is_member: bool,
    pub is_private: bool,
    pub num_members: Option<u64>,
    pub topic: Option<String>,
}

impl ChannelInfo {
    fn from_json(v: &Value) -> Option<Self> {
        Some(Self {
            id: v.get("id")?.as_str()?.to_string(),
            name: v
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string(),
            is_member: v.get("is_member").and_then(|m| m.as_bool()).unwrap_or(false),
            is_private: v.get("is_private").and_then(|m| m.as_bool()).unwrap_or(false),
            num_members: v.get("num_members").and_then(|n| n.as_u64()),
            topic: v
                .get("topic")
                .and_then(|t| t.get("value"))
                .and_then(|t| t.as_str())
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SlackMessage {
    ts: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
    #[serde(default)]
    reply_count: u64,
}

impl SlackMessage {
    fn is_content(&self) -> bool {
        let skipped = self
            .subtype
            .as_deref()
            .is_some_and(|s| SKIPPED_SUBTYPES.contains(&s));
        !skipped && !self.text.trim().is_empty()
    }

    /// A reply echoed into the channel; the thread covers it.
    fn is_broadcast_reply(&self) -> bool {
        self.thread_ts.as_deref().is_some_and(|t| t != self.ts)
    }
}

enum Failure {
    Retry(KbError),
    Fatal(KbError),
}

fn classify_api_error(method: &str, code: &str) -> Failure {
    let message = format!("{}: {}", method, code);
    match code {
        "ratelimited" => Failure::Retry(KbError::RateLimited {
            message,
            retry_after: None,
        }),
        "internal_error" | "fatal_error" | "service_unavailable" | "request_timeout" => {
            Failure::Retry(KbError::SourceUnavailable(message))
        }
        "not_in_channel" | "channel_not_found" => Failure::Fatal(KbError::PermissionDenied(
            format!("{} (invite the bot to the channel)", message),
        )),
        "invalid_auth" | "not_authed" | "account_inactive" | "token_revoked"
        | "token_expired" | "missing_scope" | "no_permission" => Failure::Fatal(
            KbError::SourceUnavailable(format!("{} (check SLACK_BOT_TOKEN and its scopes)", message)),
        ),
        _ => Failure::Fatal(KbError::SourceUnavailable(message)),
    }
}

/// Parse a Slack `ts` (`"1700000000.123456"`).
fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, "0"));
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = format!("{:0<6}", frac).get(..6)?.parse().ok()?;
    DateTime::from_timestamp(secs, micros * 1000)
}

fn looks_like_channel_id(s: &str) -> bool {
    s.len() >= 9
        && s.starts_with(['C', 'G', 'D'])
        && s.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

pub struct SlackConnector {
    config: SlackSourceConfig,
    token: String,
    client: reqwest::Client,
    policy: RetryPolicy,
}

/// Progress of one lazy fetch.
struct FetchState {
    started: bool,
    requested: Vec<String>,
    oldest: String,
    channels: VecDeque<ChannelInfo>,
    current: Option<ChannelInfo>,
    cursor: Option<String>,
    pending: VecDeque<DocumentRecord>,
    users: HashMap<String, String>,
}

impl SlackConnector {
    pub fn new(config: SlackSourceConfig) -> Result<Self> {
        let token = config
            .token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                KbError::Configuration(
                    "sources.slack.token is not set (set the SLACK_BOT_TOKEN environment variable \
                     or [sources.slack].token in the settings file)"
                        .into(),
                )
            })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("kedro-rag/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| KbError::Configuration(format!("failed to build HTTP client: {}", e)))?;
        let policy = RetryPolicy::new(config.max_retries, config.retry_base_ms);
        Ok(Self {
            config,
            token,
            client,
            policy,
        })
    }

    /// One Web API call with retries. Returns the response body on `ok: true`.
    async fn call(&self, method: &str, params: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}/{}", self.config.api_base.trim_end_matches('/'), method);
        let mut attempt = 0u32;

        loop {
            let err = match self.call_once(&url, method, params).await {
                Ok(body) => return Ok(body),
                Err(Failure::Fatal(e)) => return Err(e),
                Err(Failure::Retry(e)) => e,
            };

            if attempt >= self.policy.max_retries {
                return Err(err);
            }
            attempt += 1;
            let retry_after = match &err {
                KbError::RateLimited { retry_after, .. } => *retry_after,
                _ => None,
            };
            let delay = self.policy.delay_for(attempt, retry_after);
            warn!(
                method,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Slack call failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn call_once(
        &self,
        url: &str,
        method: &str,
        params: &[(&str, String)],
    ) -> std::result::Result<Value, Failure> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .query(params)
            .send()
            .await
            .map_err(|e| {
                Failure::Retry(KbError::SourceUnavailable(format!(
                    "{}: Slack unreachable: {}",
                    method, e
                )))
            })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(Failure::Retry(KbError::RateLimited {
                message: format!("{}: HTTP 429", method),
                retry_after: retry_after_secs(&resp),
            }));
        }
        if status.is_server_error() {
            return Err(Failure::Retry(KbError::SourceUnavailable(format!(
                "{}: HTTP {}",
                method, status
            ))));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Failure::Fatal(KbError::SourceUnavailable(format!(
                "{}: HTTP {}: {}",
                method,
                status,
                truncate(&body, 200)
            ))));
        }

        let body: Value = resp.json().await.map_err(|e| {
            Failure::Retry(KbError::SourceUnavailable(format!(
                "{}: invalid response: {}",
                method, e
            )))
        })?;

        if body.get("ok").and_then(|v| v.as_bool()) == Some(true) {
            Ok(body)
        } else {
            let code = body
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown_error");
            Err(classify_api_error(method, code))
        }
    }

    /// Validate the token; returns the workspace name.
    pub async fn auth_test(&self) -> Result<String> {
        let body = self.call("auth.test", &[]).await?;
        let team = body
            .get("team")
            .and_then(|t| t.as_str())
            .unwrap_or("unknown")
            .to_string();
        info!(team = %team, "connected to Slack");
        Ok(team)
    }

    /// Every public and private channel visible to the bot.
    pub async fn list_channels(&self) -> Result<Vec<ChannelInfo>> {
        let mut channels = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut params = vec![
                ("types", "public_channel,private_channel".to_string()),
                ("exclude_archived", "true".to_string()),
                ("limit", self.config.page_size.to_string()),
            ];
            if let Some(c) = &cursor {
                params.push(("cursor", c.clone()));
            }
            let body = self.call("conversations.list", &params).await?;
            if let Some(list) = body.get("channels").and_then(|c| c.as_array()) {
                channels.extend(list.iter().filter_map(ChannelInfo::from_json));
            }
            cursor = next_cursor(&body);
            if cursor.is_none() {
                break;
            }
        }

        debug!(count = channels.len(), "listed Slack channels");
        Ok(channels)
    }

    async fn channel_info(&self, id: &str) -> Result<ChannelInfo> {
        let body = self
            .call("conversations.info", &[("channel", id.to_string())])
            .await?;
        body.get("channel")
            .and_then(ChannelInfo::from_json)
            .ok_or_else(|| {
                KbError::SourceUnavailable(format!("conversations.info: no channel in response for {}", id))
            })
    }

    /// Resolve requested ids/names, enforcing membership.
    async fn resolve_channels(&self, requested: &[String]) -> Result<Vec<ChannelInfo>> {
        if requested.is_empty() {
            let member: Vec<ChannelInfo> = self
                .list_channels()
                .await?
                .into_iter()
                .filter(|c| c.is_member)
                .collect();
            info!(count = member.len(), "reading every channel the bot has joined");
            return Ok(member);
        }

        let mut listing: Option<Vec<ChannelInfo>> = None;
        let mut resolved = Vec::with_capacity(requested.len());

        for entry in requested {
            let wanted = entry.trim().trim_start_matches('#');
            let channel = if looks_like_channel_id(wanted) {
                self.channel_info(wanted).await?
            } else {
                if listing.is_none() {
                    listing = Some(self.list_channels().await?);
                }
                listing
                    .as_ref()
                    .and_then(|all| all.iter().find(|c| c.name == wanted))
                    .cloned()
                    .ok_or_else(|| {
                        KbError::PermissionDenied(format!(
                            "channel #{} is not visible to the bot (invite it to the channel)",
                            wanted
                        ))
                    })?
            };

            if !channel.is_member {
                return Err(KbError::PermissionDenied(format!(
                    "the bot is not a member of #{} ({}); invite it with /invite",
                    channel.name, channel.id
                )));
            }
            resolved.push(channel);
        }

        Ok(resolved)
    }

    async fn history_page(
        &self,
        channel: &str,
        oldest: &str,
        cursor: Option<&str>,
    ) -> Result<(Vec<SlackMessage>, Option<String>)> {
        let mut params = vec![
            ("channel", channel.to_string()),
            ("oldest", oldest.to_string()),
            ("limit", self.config.page_size.to_string()),
        ];
        if let Some(c) = cursor {
            params.push(("cursor", c.to_string()));
        }
        let body = self.call("conversations.history", &params).await?;
        Ok((parse_messages(&body), next_cursor(&body)))
    }

    /// Parent and replies of a thread, oldest first.
    async fn thread(&self, channel: &str, thread_ts: &str) -> Result<Vec<SlackMessage>> {
        let mut messages = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut params = vec![
                ("channel", channel.to_string()),
                ("ts", thread_ts.to_string()),
                ("limit", self.config.page_size.to_string()),
            ];
            if let Some(c) = &cursor {
                params.push(("cursor", c.clone()));
            }
            let body = self.call("conversations.replies", &params).await?;
            messages.extend(parse_messages(&body));
            cursor = next_cursor(&body);
            if cursor.is_none() {
                break;
            }
        }
        Ok(messages)
    }

    async fn user_name(&self, users: &mut HashMap<String, String>, user_id: Option<&str>) -> String {
        let Some(id) = user_id.filter(|u| !u.is_empty()) else {
            return "Unknown User".to_string();
        };
        if let Some(name) = users.get(id) {
            return name.clone();
        }

        let name = match self.call("users.info", &[("user", id.to_string())]).await {
            Ok(body) => {
                let user = body.get("user");
                user.and_then(|u| u.get("real_name"))
                    .or_else(|| user.and_then(|u| u.get("profile")).and_then(|p| p.get("real_name")))
                    .and_then(|n| n.as_str())
                    .filter(|n| !n.is_empty())
                    .or_else(|| user.and_then(|u| u.get("name")).and_then(|n| n.as_str()))
                    .unwrap_or("Unknown User")
                    .to_string()
            }
            Err(e) => {
                warn!(user = id, error = %e, "user lookup failed");
                "Unknown User".to_string()
            }
        };
        users.insert(id.to_string(), name.clone());
        name
    }

    /// Turn one history page into records.
    async fn page_records(
        &self,
        channel: &ChannelInfo,
        messages: Vec<SlackMessage>,
        users: &mut HashMap<String, String>,
    ) -> Result<Vec<DocumentRecord>> {
        let mut records = Vec::new();

        for parent in messages {
            if !parent.is_content() || parent.is_broadcast_reply() {
                continue;
            }
            if self.config.questions_only && !is_question(&parent.text) {
                continue;
            }

            let thread = if self.config.include_threads && parent.reply_count > 0 {
                let all = self.thread(&channel.id, &parent.ts).await?;
                if all.is_empty() {
                    vec![parent.clone()]
                } else {
                    all
                }
            } else {
                vec![parent.clone()]
            };

            let mut lines = Vec::with_capacity(thread.len());
            let mut latest = parent.ts.clone();
            for msg in thread.iter().filter(|m| m.is_content()) {
                let author = self.user_name(users, msg.user.as_deref()).await;
                lines.push(format!("{}: {}", author, msg.text.trim()));
                if parse_ts(&msg.ts) > parse_ts(&latest) {
                    latest = msg.ts.clone();
                }
            }
            if lines.is_empty() {
                continue;
            }

            let author = self.user_name(users, parent.user.as_deref()).await;
            let timestamp = parse_ts(&latest).unwrap_or_else(Utc::now);
            let title = parent
                .text
                .lines()
                .next()
                .map(|l| truncate(l.trim(), 80).to_string());

            records.push(DocumentRecord {
                id: format!("chat:{}:{}", channel.id, parent.ts),
                kind: SourceKind::Chat,
                origin: channel.id.clone(),
                title,
                text: lines.join("\n\n"),
                timestamp,
                author: Some(author),
                metadata: serde_json::json!({
                    "channel": channel.name,
                    "thread_ts": parent.ts,
                    "reply_count": parent.reply_count,
                    "messages": lines.len(),
                    "message_type": if is_question(&parent.text) { "question" } else { "message" },
                }),
            });
        }

        Ok(records)
    }

    /// Advance the fetch until a record is ready or every channel is read.
    async fn step(&self, mut st: FetchState) -> Result<Option<(DocumentRecord, FetchState)>> {
        loop {
            if let Some(record) = st.pending.pop_front() {
                return Ok(Some((record, st)));
            }

            if !st.started {
                st.started = true;
                self.auth_test().await?;
                st.channels = self.resolve_channels(&st.requested).await?.into();
                continue;
            }

            let channel = match st.current.clone() {
                Some(c) => c,
                None => match st.channels.pop_front() {
                    Some(next) => {
                        info!(channel = %next.name, id = %next.id, "reading Slack channel");
                        st.current = Some(next.clone());
                        st.cursor = None;
                        next
                    }
                    None => return Ok(None),
                },
            };

            let (messages, cursor) = self
                .history_page(&channel.id, &st.oldest, st.cursor.as_deref())
                .await?;
            debug!(channel = %channel.id, messages = messages.len(), "history page");

            let records = self.page_records(&channel, messages, &mut st.users).await?;
            st.pending.extend(records);

            match cursor {
                Some(c) => st.cursor = Some(c),
                None => st.current = None,
            }
        }
    }
}

fn parse_messages(body: &Value) -> Vec<SlackMessage> {
    body.get("messages")
        .and_then(|m| m.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|m| serde_json::from_value(m.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

fn next_cursor(body: &Value) -> Option<String> {
    body.get("response_metadata")
        .and_then(|m| m.get("next_cursor"))
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

impl Connector for SlackConnector {
    fn name(&self) -> &str {
        "slack"
    }

    fn description(&self) -> &str {
        "Slack channel history, one record per thread"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Chat
    }

    fn target(&self) -> String {
        if self.config.channels.is_empty() {
            "all joined channels".to_string()
        } else {
            self.config.channels.join(", ")
        }
    }

    fn fetch(&self, options: FetchOptions) -> RecordStream<'_> {
        let days = options.days_back.unwrap_or(self.config.days_back).max(1);
        let oldest = Utc::now() - chrono::Duration::days(days as i64);
        let state = FetchState {
            started: false,
            requested: options
                .channels
                .unwrap_or_else(|| self.config.channels.clone()),
            oldest: format!("{}.000000", oldest.timestamp()),
            channels: VecDeque::new(),
            current: None,
            cursor: None,
            pending: VecDeque::new(),
            users: HashMap::new(),
        };

        stream::try_unfold(state, move |st| self.step(st)).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_question() {
        assert!(is_question("How do I run a single node?"));
        assert!(is_question("pipeline error when loading catalog"));
        assert!(!is_question("Thanks, that worked"));
    }

    #[test]
    fn test_parse_ts() {
        let dt = parse_ts("1700000000.123456").unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
        assert_eq!(dt.timestamp_subsec_micros(), 123_456);
        assert_eq!(parse_ts("1700000000").unwrap().timestamp(), 1_700_000_000);
        assert!(parse_ts("nope").is_none());
    }

    #[test]
    fn test_channel_id_detection() {
        assert!(looks_like_channel_id("C024BE91L"));
        assert!(looks_like_channel_id("G0123456789"));
        assert!(!looks_like_channel_id("kedro-help"));
        assert!(!looks_like_channel_id("C01"));
    }

    #[test]
    fn test_message_hygiene() {
        let msg = |subtype: Option<&str>, text: &str| SlackMessage {
            ts: "1.0".into(),
            user: Some("U1".into()),
            text: text.into(),
            subtype: subtype.map(str::to_string),
            thread_ts: None,
            reply_count: 0,
        };
        assert!(msg(None, "hello").is_content());
        assert!(!msg(Some("bot_message"), "beep").is_content());
        assert!(!msg(Some("channel_join"), "joined").is_content());
        assert!(!msg(None, "   ").is_content());
    }

    #[test]
    fn test_api_error_classification() {
        assert!(matches!(
            classify_api_error("conversations.history", "not_in_channel"),
            Failure::Fatal(KbError::PermissionDenied(_))
        ));
        assert!(matches!(
            classify_api_error("auth.test", "invalid_auth"),
            Failure::Fatal(KbError::SourceUnavailable(_))
        ));
        assert!(matches!(
            classify_api_error("conversations.history", "ratelimited"),
            Failure::Retry(KbError::RateLimited { .. })
        ));
    }

    #[test]
    fn test_new_requires_token() {
        let err = match SlackConnector::new(SlackSourceConfig::default()) {
            Err(e) => e,
            Ok(_) => panic!("expected configuration error"),
        };
        assert!(err.to_string().contains("SLACK_BOT_TOKEN"));
    }
}
