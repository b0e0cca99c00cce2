use anyhow::{bail, Context};
use chrono::Utc;
use reqwest::{header, redirect, StatusCode};

const BASE_URL: &str = "http://127.0.0.1:8080";
const ORIGIN: &str = "http://localhost:4000";
const SLUG: &str = "hello-world";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 不跟随跳转，直接观察服务端返回的 Location
    let client = reqwest::Client::builder()
        .redirect(redirect::Policy::none())
        .build()?;
    println!("Starting gitcomments test client...");

    println!("\n[1/3] Checking server health...");
    let health = client
        .get(format!("{}/health", BASE_URL))
        .send()
        .await
        .context("Server unreachable")?;
    println!("   -> {} {}", health.status(), health.text().await?);

    println!("\n[2/3] Submitting comment on '{}'...", SLUG);
    // 隐藏时间戳需早于最短提交间隔
    let rendered_at = (Utc::now().timestamp() - 30).to_string();
    let redirect_url = format!("{}/{}/", ORIGIN, SLUG);
    let form = [
        ("name", "Ferris"),
        ("email", "ferris@example.com"),
        ("body", "This is a message from the gitcomments test client!"),
        ("slug", SLUG),
        ("url", redirect_url.as_str()),
        ("website", ""),
        ("_timestamp", rendered_at.as_str()),
    ];

    let resp = client
        .post(format!("{}/comment", BASE_URL))
        .header(header::ORIGIN, ORIGIN)
        .form(&form)
        .send()
        .await?;

    println!("\n[3/3] Inspecting response...");
    if resp.status() != StatusCode::SEE_OTHER {
        let status = resp.status();
        bail!("Unexpected response {}: {}", status, resp.text().await?);
    }

    let location = resp
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if location.contains("comment_error=") {
        println!("   -> ❌ Rejected: {}", location);
    } else {
        println!("   -> ✅ Published, redirected to {}", location);
    }

    Ok(())
}
