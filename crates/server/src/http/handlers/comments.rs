use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::HeaderMap,
    response::Redirect,
};
use chrono::Utc;
use domain::{CommentRecord, Submission};
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::{error, info, warn};

use crate::guard::{request_origin, Rejection};
use crate::state::AppState;

/// Raw form bodies beyond this are refused before parsing.
pub const MAX_FORM_BYTES: usize = 64 * 1024;

pub async fn submit_comment(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Body,
) -> Result<Redirect, Rejection> {
    let origin = request_origin(&headers);
    if !state.guard.origin_allowed(origin.as_deref()) {
        warn!(
            "Rejected submission from {}: origin {:?} not allowed",
            addr.ip(),
            origin
        );
        return Err(Rejection::Forbidden("Forbidden: origin not allowed"));
    }

    let bytes = axum::body::to_bytes(body, MAX_FORM_BYTES)
        .await
        .map_err(|_| Rejection::BadRequest("Bad request".to_string()))?;
    let mut form = parse_form(&bytes);

    let config = state.guard.config();
    let honeypot = if config.honeypot_field.is_empty() {
        String::new()
    } else {
        form.remove(&config.honeypot_field).unwrap_or_default()
    };
    let form_timestamp = form.remove(&config.timestamp_field);

    let submission = Submission {
        name: form.remove("name").unwrap_or_default(),
        email: form.remove("email").filter(|e| !e.is_empty()),
        body: form.remove("body").unwrap_or_default(),
        slug: form.remove("slug").unwrap_or_default(),
        reply_to: form.remove("reply_to"),
        redirect_url: form.remove("url").unwrap_or_default(),
        honeypot,
        form_timestamp,
        origin,
        client_ip: addr.ip(),
        received_at: Utc::now(),
    };

    let accepted = state.guard.inspect(&submission)?;

    if !state.working_copy.post_exists(&accepted.slug) {
        return Err(accepted.reject("Post not found"));
    }

    let record = CommentRecord::from_submission(
        submission,
        accepted.slug.clone(),
        accepted.reply_to.clone(),
    );
    let path = state.working_copy.write_comment(&record).map_err(|e| {
        error!("Failed to write comment on {}: {}", accepted.slug, e);
        accepted.reject("Failed to save comment")
    })?;

    if let Err(e) = state
        .publisher
        .publish(path.clone(), accepted.slug.clone())
        .await
    {
        // 文件留在工作区，下一次成功同步时会一并提交
        error!("Failed to publish {}: {:#}", path.display(), e);
        return Err(accepted.reject("Failed to publish comment"));
    }

    info!("Comment saved and pushed: {}", path.display());
    Ok(Redirect::to(accepted.success_url().as_str()))
}

/// Decodes `application/x-www-form-urlencoded` fields, trimmed. The first
/// occurrence of a repeated key wins.
fn parse_form(bytes: &[u8]) -> HashMap<String, String> {
    let mut form = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(bytes) {
        form.entry(key.into_owned())
            .or_insert_with(|| value.trim().to_string());
    }
    form
}
