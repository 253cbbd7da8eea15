#[path = "../helpers/mod.rs"]
mod helpers;

use helpers::{app::TestAppBuilder, scrape_until};
use promstatus::config::ScopeConfig;
use promstatus::scoreboard::{ProcessSlot, ServerSnapshot, StatusSource, WorkerState};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_scrape_serves_prometheus_text() {
    let app = TestAppBuilder::new().build().await.unwrap();

    let response = reqwest::get(app.metrics_url()).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "text/plain; version=0.0.4"
    );
    let body = response.text().await.unwrap();
    assert!(body.contains("apache_server_info"));
    assert!(body.contains("apache_cpu_load"));

    app.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_endpoint_traffic_is_accounted() {
    let app = TestAppBuilder::new().build().await.unwrap();

    let missing = reqwest::get(app.url("/nope")).await.unwrap();
    assert_eq!(missing.status(), 404);

    let body = scrape_until(&app.metrics_url(), |body| {
        body.contains(r#"apache_requests_total{method="GET",status="404"} 1"#)
    })
    .await;
    assert!(body.is_some(), "the 404 was never accounted");

    let body = scrape_until(&app.metrics_url(), |body| {
        body.contains(r#"apache_requests_total{method="GET",status="200"}"#)
    })
    .await
    .expect("scrapes were never accounted");
    assert!(body.contains("apache_response_time_seconds_bucket"));

    app.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_uri_label_drops_the_query_string() {
    let mut builder = TestAppBuilder::new().with_label_format("%U;%s");
    builder.config.label_names = vec!["uri".to_string(), "status".to_string()];
    let app = builder.build().await.unwrap();

    let missing = reqwest::get(app.url("/nope?id=42")).await.unwrap();
    assert_eq!(missing.status(), 404);

    let body = scrape_until(&app.metrics_url(), |body| {
        body.contains(r#"apache_requests_total{uri="/nope",status="404"} 1"#)
    })
    .await
    .expect("the 404 was never accounted under its path");
    assert!(!body.contains("id=42"));

    app.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_handler_is_only_set_for_the_metrics_route() {
    let mut builder = TestAppBuilder::new().with_label_format("%R;%s");
    builder.config.label_names = vec!["handler".to_string(), "status".to_string()];
    let app = builder.build().await.unwrap();

    reqwest::get(app.url("/nope")).await.unwrap();

    let body = scrape_until(&app.metrics_url(), |body| {
        body.contains(r#"apache_requests_total{handler="-",status="404"} 1"#)
            && body.contains(r#"apache_requests_total{handler="metrics",status="200"}"#)
    })
    .await;
    assert!(body.is_some(), "handlers were not accounted as expected");

    app.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_queued_requests_are_accounted_before_shutdown_completes() {
    let app = TestAppBuilder::new().build().await.unwrap();
    let module = app.module();

    for _ in 0..5 {
        let response = reqwest::get(app.url("/nope")).await.unwrap();
        assert_eq!(response.status(), 404);
    }
    app.shutdown(Duration::from_secs(2)).await.unwrap();

    let dump = module.on_scrape().await.unwrap();
    assert!(
        dump.contains(r#"apache_requests_total{method="GET",status="404"} 5"#),
        "{dump}"
    );
}

#[tokio::test]
async fn test_scope_format_reads_request_headers() {
    let mut builder = TestAppBuilder::new();
    builder.config.scopes = vec![ScopeConfig {
        path: "/metrics".to_string(),
        label_format: Some("%m;%{X-Canary}i".to_string()),
        enabled: None,
    }];
    let app = builder.build().await.unwrap();

    let client = reqwest::Client::new();
    let response = client
        .get(app.metrics_url())
        .header("X-Canary", "canary")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body = scrape_until(&app.metrics_url(), |body| {
        body.contains(r#"apache_requests_total{method="GET",status="canary"} 1"#)
    })
    .await;
    assert!(body.is_some());

    app.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_disabled_scope_is_not_accounted() {
    let mut builder = TestAppBuilder::new();
    builder.config.enabled = false;
    let app = builder.build().await.unwrap();

    for _ in 0..3 {
        reqwest::get(app.metrics_url()).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    let body = reqwest::get(app.metrics_url())
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(!body.contains("apache_requests_total{"));

    app.shutdown(Duration::from_secs(2)).await.unwrap();
}

struct FixedStatus;

impl StatusSource for FixedStatus {
    fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            uptime: Duration::from_secs(42),
            mpm_generation: 1,
            config_generation: 1,
            load_average: Some(0.5),
            max_servers: 1,
            threads_per_child: 2,
            processes: vec![ProcessSlot {
                pid: Some(1234),
                quiescing: false,
                generation: 1,
                workers: vec![WorkerState::Ready, WorkerState::BusyWrite],
            }],
        }
    }
}

#[tokio::test]
async fn test_scrape_folds_scoreboard() {
    let app = TestAppBuilder::new()
        .with_status_source(Arc::new(FixedStatus))
        .build()
        .await
        .unwrap();

    let body = reqwest::get(app.metrics_url())
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.lines().any(|line| line == "apache_server_uptime_seconds 42"));
    assert!(body.lines().any(|line| line == r#"apache_workers{state="ready"} 1"#));
    assert!(body.lines().any(|line| line == r#"apache_workers{state="busy"} 1"#));
    assert!(body
        .lines()
        .any(|line| line == r#"apache_workers_scoreboard{state="reply"} 1"#));

    app.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_scrape_fails_when_collector_is_gone() {
    let collector = TestAppBuilder::new().build_collector().await.unwrap();
    let path = collector.collector_path().to_path_buf();
    let app = TestAppBuilder::new()
        .external_collector(&path)
        .build()
        .await
        .unwrap();

    let response = reqwest::get(app.metrics_url()).await.unwrap();
    assert_eq!(response.status(), 200);

    collector.shutdown(Duration::from_secs(2)).await.unwrap();

    let response = reqwest::get(app.metrics_url()).await.unwrap();
    assert_eq!(response.status(), 503);
    let body = response.text().await.unwrap();
    assert!(body.starts_with("metrics unavailable:"), "{body}");

    app.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_external_collector_must_exist() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = TestAppBuilder::new().external_collector(&dir.path().join("absent.sock"));
    builder.config.collector.startup_attempts = 2;
    builder.config.collector.startup_interval_ms = 1;

    let err = builder.build().await.err().expect("build should fail");
    assert!(format!("{err:#}").contains("collector did not start"));
}
