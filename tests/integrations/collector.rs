#[path = "../helpers/mod.rs"]
mod helpers;

use helpers::app::TestAppBuilder;
use promstatus::request::Request;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

async fn exchange(path: &Path, commands: &str) -> String {
    let mut stream = UnixStream::connect(path).await.unwrap();
    stream.write_all(commands.as_bytes()).await.unwrap();
    let mut reply = String::new();
    tokio::time::timeout(Duration::from_secs(2), stream.read_to_string(&mut reply))
        .await
        .expect("collector did not answer")
        .unwrap();
    reply
}

#[tokio::test]
async fn test_update_then_dump() {
    let app = TestAppBuilder::new().build_collector().await.unwrap();
    let path = app.collector_path().to_path_buf();

    let dump = exchange(
        &path,
        "update:request:apache_requests_total;1;GET;200\nmetrics\n",
    )
    .await;

    assert!(dump.ends_with("\n\n"));
    assert_eq!(dump.matches("\n\n").count(), 1);
    assert!(dump
        .lines()
        .any(|line| line == r#"apache_requests_total{method="GET",status="200"} 1"#));

    app.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_unknown_commands_are_skipped() {
    let app = TestAppBuilder::new().build_collector().await.unwrap();
    let path = app.collector_path().to_path_buf();

    let dump = exchange(&path, "update:bogus\nflush\nmetrics\n").await;
    assert!(dump.ends_with("\n\n"));
    assert!(dump.contains("apache_server_info"));

    app.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_updates_accumulate_across_connections() {
    let app = TestAppBuilder::new().build_collector().await.unwrap();
    let path = app.collector_path().to_path_buf();

    for _ in 0..3 {
        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream
            .write_all(b"request:apache_requests_total;1;PUT;204\n\n")
            .await
            .unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    let dump = exchange(&path, "metrics\n").await;
    assert!(dump
        .lines()
        .any(|line| line == r#"apache_requests_total{method="PUT",status="204"} 3"#));

    app.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_socket_removed_on_shutdown() {
    let app = TestAppBuilder::new().build_collector().await.unwrap();
    let path = app.collector_path().to_path_buf();
    assert!(path.exists());

    app.shutdown(Duration::from_secs(2)).await.unwrap();
    assert!(!path.exists());
}

#[tokio::test]
async fn test_second_collector_on_live_socket_fails() {
    let first = TestAppBuilder::new().build_collector().await.unwrap();

    let mut second = TestAppBuilder::new();
    second.config.collector.socket_path = first.collector_path().to_path_buf();
    assert!(second.build_collector().await.is_err());

    first.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_module_reports_through_spawned_collector() {
    let mut builder = TestAppBuilder::new().socket_mode();
    builder.config.http.enabled = false;
    let app = builder.build().await.unwrap();
    let module = app.module();

    let mut request = Request::new("GET", "/index.html").with_status(200);
    request.bytes_sent = 512;
    module.on_request_complete(&request).await;
    module.on_request_complete(&request).await;

    let dump = module.on_scrape().await.unwrap();
    assert!(dump
        .lines()
        .any(|line| line == r#"apache_requests_total{method="GET",status="200"} 2"#));
    assert!(dump.contains("apache_response_size_bytes_bucket"));

    let path = app.collector_path().to_path_buf();
    app.shutdown(Duration::from_secs(2)).await.unwrap();
    assert!(!path.exists());
}
