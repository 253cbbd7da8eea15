#![allow(dead_code)]

pub mod app;

use std::time::Duration;

/// Scrapes `url` until the body satisfies `predicate`, giving up after
/// roughly two seconds. Request accounting happens after the response is
/// sent, so a scrape may not yet see the request that preceded it.
pub async fn scrape_until<F>(url: &str, predicate: F) -> Option<String>
where
    F: Fn(&str) -> bool,
{
    for _ in 0..100 {
        if let Ok(response) = reqwest::get(url).await {
            if let Ok(body) = response.text().await {
                if predicate(&body) {
                    return Some(body);
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}
