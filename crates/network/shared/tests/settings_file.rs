use std::io::Write;

use network_shared::NetworkSettings;
use network_shared::messaging::frames::CompressionKind;

#[test]
fn load_reads_and_validates_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
max_consecutive_decode_failures = 5

[handshake]
timeout_ms = 250

[compression]
preferred = ["none"]
"#
    )
    .unwrap();

    let settings = NetworkSettings::load(file.path()).unwrap();
    assert_eq!(settings.max_consecutive_decode_failures, 5);
    assert_eq!(settings.handshake.timeout_ms, 250);
    assert_eq!(settings.compression.preferred, vec![CompressionKind::None]);
}

#[test]
fn load_reports_path_on_invalid_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[flow_control]\nqueue_bound = 0").unwrap();

    let err = NetworkSettings::load(file.path()).unwrap_err();
    let rendered = format!("{err:#}");
    assert!(rendered.contains("invalid network settings"), "{rendered}");
    assert!(rendered.contains("queue_bound"), "{rendered}");
}

#[test]
fn load_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    assert!(NetworkSettings::load(dir.path().join("missing.toml")).is_err());
}
