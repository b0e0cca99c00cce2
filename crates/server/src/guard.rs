use axum::{
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
};
use domain::{Slug, Submission};
use regex::Regex;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::rate_limit::RateLimiter;

pub const ERROR_PARAM: &str = "comment_error";
pub const SUCCESS_FRAGMENT: &str = "comment-submitted";

const BOT_MESSAGE: &str = "Comment rejected";

pub struct GuardConfig {
    pub allowed_origins: Vec<String>,
    pub max_body_chars: usize,
    // 以下字段为空或为 0 时关闭对应检查
    pub honeypot_field: String,
    pub timestamp_field: String,
    pub min_submit_secs: i64,
    pub max_links: usize,
    pub blocked_patterns: Vec<Regex>,
}

#[derive(Clone)]
pub struct Guard {
    config: Arc<GuardConfig>,
    limiter: RateLimiter,
}

#[derive(Debug)]
pub struct Accepted {
    pub redirect: Url,
    pub slug: Slug,
    pub reply_to: Option<Slug>,
}

#[derive(Debug)]
pub enum Rejection {
    MethodNotAllowed,
    // 没有可信的跳转目标
    Forbidden(&'static str),
    BadRequest(String),
    Redirect { to: Url, message: String },
}

impl Guard {
    pub fn new(config: GuardConfig, limiter: RateLimiter) -> Self {
        Self {
            config: Arc::new(config),
            limiter,
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        origin.map_or(false, |o| self.is_allowed(o))
    }

    fn is_allowed(&self, origin: &str) -> bool {
        self.config.allowed_origins.iter().any(|o| o == origin)
    }

    /// Runs the content checks in order; the first failure wins.
    pub fn inspect(&self, submission: &Submission) -> Result<Accepted, Rejection> {
        let redirect = if submission.redirect_url.is_empty() {
            None
        } else {
            match Url::parse(&submission.redirect_url) {
                Ok(url) if self.is_allowed(&origin_of(&url)) => Some(url),
                _ => {
                    warn!(
                        "Rejected redirect target {:?} from {} (origin {:?})",
                        submission.redirect_url, submission.client_ip, submission.origin
                    );
                    return Err(Rejection::Forbidden(
                        "Forbidden: redirect URL origin not allowed",
                    ));
                }
            }
        };

        const MISSING: &str = "Missing required fields (name, body, slug, url)";
        let Some(redirect) = redirect else {
            return Err(Rejection::BadRequest(MISSING.to_string()));
        };
        if submission.name.is_empty() || submission.body.is_empty() || submission.slug.is_empty()
        {
            return Err(reject(&redirect, MISSING));
        }

        if submission.body.chars().count() > self.config.max_body_chars {
            return Err(reject(&redirect, "Comment body too long"));
        }

        let slug = Slug::new(submission.slug.as_str())
            .map_err(|_| reject(&redirect, "Invalid slug"))?;
        let reply_to = match submission.reply_to.as_deref() {
            Some(r) if !r.is_empty() => {
                Some(Slug::new(r).map_err(|_| reject(&redirect, "Invalid reply_to"))?)
            }
            _ => None,
        };

        if !self.config.honeypot_field.is_empty() && !submission.honeypot.is_empty() {
            info!("Honeypot triggered by {}", submission.client_ip);
            return Err(reject(&redirect, BOT_MESSAGE));
        }

        if self.submitted_too_fast(submission) {
            info!("Submission from {} arrived too fast", submission.client_ip);
            return Err(reject(&redirect, BOT_MESSAGE));
        }

        if let Some(message) = self.check_body_content(&submission.body) {
            info!("Spam heuristics rejected comment from {}", submission.client_ip);
            return Err(reject(&redirect, &message));
        }

        if !self.limiter.allow(submission.client_ip) {
            info!("Rate limit exceeded for {}", submission.client_ip);
            return Err(reject(
                &redirect,
                "Too many comments, please try again later",
            ));
        }

        Ok(Accepted {
            redirect,
            slug,
            reply_to,
        })
    }

    /// A missing timestamp passes; an unparseable or out-of-range one does not.
    fn submitted_too_fast(&self, submission: &Submission) -> bool {
        if self.config.min_submit_secs <= 0 {
            return false;
        }
        let Some(raw) = submission.form_timestamp.as_deref().filter(|s| !s.is_empty()) else {
            return false;
        };
        match raw.parse::<i64>() {
            Ok(ts) => submission
                .received_at
                .timestamp()
                .checked_sub(ts)
                .map_or(true, |elapsed| elapsed < self.config.min_submit_secs),
            Err(_) => true,
        }
    }

    fn check_body_content(&self, body: &str) -> Option<String> {
        if self.config.max_links > 0 {
            let links = body.matches("http://").count() + body.matches("https://").count();
            if links > self.config.max_links {
                return Some(format!("Too many links (max {})", self.config.max_links));
            }
        }

        if self.config.blocked_patterns.iter().any(|re| re.is_match(body)) {
            return Some("Comment contains blocked content".to_string());
        }
        None
    }
}

impl Accepted {
    pub fn reject(&self, message: &str) -> Rejection {
        reject(&self.redirect, message)
    }

    pub fn success_url(&self) -> Url {
        let mut url = self.redirect.clone();
        url.set_fragment(Some(SUCCESS_FRAGMENT));
        url
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Rejection::MethodNotAllowed => {
                (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed").into_response()
            }
            Rejection::Forbidden(message) => (StatusCode::FORBIDDEN, message).into_response(),
            Rejection::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            Rejection::Redirect { to, message } => {
                Redirect::to(error_url(&to, &message).as_str()).into_response()
            }
        }
    }
}

fn reject(redirect: &Url, message: &str) -> Rejection {
    Rejection::Redirect {
        to: redirect.clone(),
        message: message.to_string(),
    }
}

// 替换旧的 comment_error，避免重复叠加
fn error_url(redirect: &Url, message: &str) -> Url {
    let kept: Vec<(String, String)> = redirect
        .query_pairs()
        .filter(|(k, _)| k != ERROR_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut url = redirect.clone();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(ERROR_PARAM, message);
    if url.fragment() == Some("") {
        url.set_fragment(None);
    }
    url
}

/// `Origin`, or the scheme and host of `Referer` when it is absent.
pub fn request_origin(headers: &HeaderMap) -> Option<String> {
    if let Some(origin) = headers.get(header::ORIGIN) {
        return origin.to_str().ok().map(str::to_string);
    }
    let referer = headers.get(header::REFERER)?.to_str().ok()?;
    Url::parse(referer).ok().map(|u| origin_of(&u))
}

pub fn origin_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    }
}
