use asrlink_core::{AppConfig, AudioEncoding, ConfigError};
use std::path::Path;
use std::time::Duration;

#[test]
fn test_demo_config_loads() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos/config.toml");
    let config = AppConfig::load_from_file(&path).unwrap();

    assert_eq!(config.endpoint().to_string(), "smartspeech.sber.ru:443");
    assert_eq!(config.recognition.audio_encoding, AudioEncoding::PcmS16le);
    assert_eq!(config.recognition.language_code, "ru-RU");
    assert_eq!(config.session_options().timeout, Duration::from_secs(30));
    assert_eq!(
        config.transport.script.as_deref(),
        Some(Path::new("demos/replay.toml"))
    );
}

#[test]
fn test_invalid_recognition_section_rejected_on_load() {
    let dir = std::env::temp_dir().join("asrlink_core_integration");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("bad.toml");
    std::fs::write(
        &path,
        r#"
[recognition]
audio_encoding = "pcm_s16le"
sample_rate_hz = 12345
"#,
    )
    .unwrap();

    let result = AppConfig::load_from_file(&path);
    assert!(matches!(result, Err(ConfigError::Invalid(_))));

    std::fs::remove_dir_all(&dir).unwrap();
}
