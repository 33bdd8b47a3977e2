use std::io::Write;

use marquee::config::MarqueeConfig;
use marquee::errors::ConfigError;
use marquee::wire::FrameLimits;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[actor]
name = "lobby"
min_frame_ms = 5

[wire]
max_len = 8192

[tcp]
listen = "0.0.0.0:7100"

[[worker]]
alias = "kv"
count = 3
keep_alive_ms = 1000
"#
    )
    .unwrap();

    let config = MarqueeConfig::from_file(file.path()).unwrap();
    assert_eq!(config.actor.name, "lobby");
    assert_eq!(config.actor.min_frame_ms, 5);
    assert_eq!(config.wire.limits(), FrameLimits::new(7, 8192));
    assert_eq!(config.tcp.listen.as_deref(), Some("0.0.0.0:7100"));
    assert_eq!(config.workers[0].alias, "kv");
    assert_eq!(config.workers[0].count, 3);
    assert_eq!(config.workers[0].keep_alive_ms, 1000);
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = MarqueeConfig::from_file(dir.path().join("absent.toml"));
    assert!(matches!(result, Err(ConfigError::Io(_))));
}
