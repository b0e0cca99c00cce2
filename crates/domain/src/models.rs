use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlugError {
    #[error("slug is empty")]
    Empty,
    #[error("slug contains a path separator or '..'")]
    Traversal,
    #[error("slug may only contain letters, digits, '-' and '_'")]
    InvalidCharacters,
}

/// Identifier of a content page. Doubles as the directory name holding that
/// page's comments, so it must never be able to leave that directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Slug(String);

impl Slug {
    pub fn new(s: impl Into<String>) -> Result<Self, SlugError> {
        let s = s.into();
        if s.is_empty() {
            return Err(SlugError::Empty);
        }
        if s.contains("..") || s.contains('/') || s.contains('\\') {
            return Err(SlugError::Traversal);
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(SlugError::InvalidCharacters);
        }
        Ok(Self(s))
    }

    pub fn is_valid(s: &str) -> bool {
        Self::new(s).is_ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Slug {
    type Error = SlugError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Slug> for String {
    fn from(slug: Slug) -> Self {
        slug.0
    }
}

impl fmt::Display for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// 原样接收的表单，仅在单次请求内存在
#[derive(Debug, Clone)]
pub struct Submission {
    pub name: String,
    pub email: Option<String>,
    pub body: String,
    pub slug: String,
    pub reply_to: Option<String>,
    pub redirect_url: String,
    pub honeypot: String,
    pub form_timestamp: Option<String>,
    /// `Origin`, or the scheme and host of `Referer`.
    pub origin: Option<String>,
    pub client_ip: IpAddr,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub body: String,
    #[serde(serialize_with = "serialize_seconds")]
    pub date: DateTime<Utc>,
    pub slug: Slug,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Slug>,
}

impl CommentRecord {
    pub fn from_submission(submission: Submission, slug: Slug, reply_to: Option<Slug>) -> Self {
        Self {
            name: submission.name,
            email: submission.email.filter(|e| !e.is_empty()),
            body: submission.body,
            date: submission.received_at,
            slug,
            reply_to,
        }
    }
}

fn serialize_seconds<S: Serializer>(date: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&date.to_rfc3339_opts(SecondsFormat::Secs, true))
}
