use clap::Parser;
use promstatus::cli::{Cli, Command};
use promstatus::config::{CollectorMode, Config, ScopeConfig};
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

/// A helper function to run a test with a temporary config file.
fn with_config_file<F>(toml_content: &str, test_fn: F)
where
    F: FnOnce(PathBuf),
{
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{}", toml_content).unwrap();
    let path = file.path().to_path_buf();
    test_fn(path);
}

#[test]
fn test_load_full_valid_config() {
    let toml_content = r#"
        log_level = "debug"
        namespace = "web"
        server_name = "www.example.com"
        label_names = ["method", "status", "vhost"]
        label_format = "%m;%>s;%v"
        tick_interval_seconds = 10

        [[scopes]]
        path = "/api"
        label_format = "%m;%>s;api"

        [[scopes]]
        path = "/server-status"
        enabled = false

        [buckets]
        time = [0.05, 0.5, 5]
        size = "1000;100000"

        [collector]
        mode = "socket"
        socket_path = "/run/promstatus/collector.sock"
        timeout_ms = 250
        spawn = false

        [http]
        listen_address = "0.0.0.0:9200"
        path = "/prometheus"

        [process]
        match_names = ["nginx"]
    "#;

    with_config_file(toml_content, |path| {
        let cli = Cli::try_parse_from(["promstatus", "--config", path.to_str().unwrap()]).unwrap();
        let config = Config::load(&cli).unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.namespace, "web");
        assert_eq!(config.server_name, "www.example.com");
        assert_eq!(config.label_names, vec!["method", "status", "vhost"]);
        assert_eq!(config.label_format, "%m;%>s;%v");
        assert_eq!(config.tick_interval_seconds, 10);
        assert_eq!(
            config.scopes,
            vec![
                ScopeConfig {
                    path: "/api".to_string(),
                    label_format: Some("%m;%>s;api".to_string()),
                    enabled: None,
                },
                ScopeConfig {
                    path: "/server-status".to_string(),
                    label_format: None,
                    enabled: Some(false),
                },
            ]
        );
        assert_eq!(config.buckets.time, vec![0.05, 0.5, 5.0]);
        assert_eq!(config.buckets.size, vec![1000.0, 100000.0]);
        assert_eq!(config.collector.mode, CollectorMode::Socket);
        assert_eq!(
            config.collector.socket_path,
            PathBuf::from("/run/promstatus/collector.sock")
        );
        assert_eq!(config.collector.timeout().as_millis(), 250);
        assert!(!config.collector.spawn);
        assert_eq!(config.http.listen_address.port(), 9200);
        assert_eq!(config.http.path, "/prometheus");
        assert_eq!(config.process.match_names, vec!["nginx"]);
        // Untouched settings keep their defaults.
        assert!(config.enabled);
        assert_eq!(config.collector.startup_attempts, 20);
    });
}

#[test]
fn test_cli_overrides_file() {
    let toml_content = r#"
        label_format = "%m;%s"
        log_level = "warn"
    "#;

    with_config_file(toml_content, |path| {
        let cli = Cli::try_parse_from([
            "promstatus",
            "--config",
            path.to_str().unwrap(),
            "--label-format",
            "%m;%U",
            "--log-level",
            "trace",
            "--socket",
            "/tmp/other.sock",
            "--listen",
            "127.0.0.1:9300",
            "collector",
        ])
        .unwrap();
        assert_eq!(cli.command(), Command::Collector);

        let config = Config::load(&cli).unwrap();
        assert_eq!(config.label_format, "%m;%U");
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.collector.mode, CollectorMode::Socket);
        assert_eq!(config.collector.socket_path, PathBuf::from("/tmp/other.sock"));
        assert_eq!(config.http.listen_address.port(), 9300);
    });
}

#[test]
fn test_label_names_as_string() {
    with_config_file(r#"label_names = "method; status ;handler""#, |path| {
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.label_names, vec!["method", "status", "handler"]);
    });
}

#[test]
fn test_invalid_buckets_are_rejected() {
    with_config_file(
        r#"
        [buckets]
        time = "0.1;fast"
        "#,
        |path| {
            let err = Config::from_file(&path).unwrap_err();
            assert!(format!("{err:#}").contains("fast"));
        },
    );
}

#[test]
fn test_missing_config_file_is_an_error() {
    let cli = Cli::try_parse_from(["promstatus", "--config", "/nonexistent/promstatus.toml"])
        .unwrap();
    let err = Config::load(&cli).unwrap_err();
    assert!(err.to_string().contains("does not exist"));
}

#[test]
fn test_environment_overrides_file() {
    with_config_file(r#"[http]
path = "/from-file""#, |path| {
        std::env::set_var("PROMSTATUS_HTTP__PATH", "/from-env");
        let config = Config::from_file(&path);
        std::env::remove_var("PROMSTATUS_HTTP__PATH");

        assert_eq!(config.unwrap().http.path, "/from-env");
    });
}
