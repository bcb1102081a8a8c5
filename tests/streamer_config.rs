use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use camera_appsrc::config::{PipelineKind, StreamerConfig, DEFAULT_RETRIEVE_TIMEOUT};
use camera_appsrc::PixelEncoding;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAMERA_APPSRC_CONFIG",
        "CAMERA_APPSRC_DEVICE",
        "CAMERA_APPSRC_WIDTH",
        "CAMERA_APPSRC_HEIGHT",
        "CAMERA_APPSRC_FPS",
        "CAMERA_APPSRC_TIMEOUT_MS",
        "CAMERA_APPSRC_THROUGHPUT_LIMIT",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = StreamerConfig::load().expect("load defaults");
    assert!(cfg.device.uri.starts_with("stub://"));
    assert_eq!(cfg.device.second_uri, None);
    assert_eq!(cfg.device.encoding, PixelEncoding::Rgb8);
    assert_eq!(cfg.bridge.width, None);
    assert_eq!(cfg.bridge.retrieve_timeout, DEFAULT_RETRIEVE_TIMEOUT);
    assert_eq!(cfg.pipeline.port, 5000);
}

#[test]
fn loads_toml_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let toml = r#"
        [device]
        uri = "stub://bench"
        encoding = "BayerRG8"

        [capture]
        width = 640
        height = 480
        fps = 15.0
        on_demand = true
        frame_limit = 100

        [post]
        rescale_width = 320
        rescale_height = 240
        rotation = 90

        [pipeline]
        kind = "h264file"
        target = "/tmp/capture.mp4"
    "#;
    file.write_all(toml.as_bytes()).expect("write config");

    std::env::set_var("CAMERA_APPSRC_CONFIG", file.path());
    std::env::set_var("CAMERA_APPSRC_WIDTH", "800");
    std::env::set_var("CAMERA_APPSRC_TIMEOUT_MS", "250");

    let cfg = StreamerConfig::load().expect("load config");
    assert_eq!(cfg.device.uri, "stub://bench");
    assert_eq!(cfg.device.encoding, PixelEncoding::BayerRg8);
    assert_eq!(cfg.bridge.width, Some(800));
    assert_eq!(cfg.bridge.height, Some(480));
    assert_eq!(cfg.bridge.frame_rate, Some(15.0));
    assert!(cfg.bridge.on_demand);
    assert_eq!(cfg.bridge.frame_limit, Some(100));
    assert_eq!(cfg.bridge.rescale_width, Some(320));
    assert_eq!(cfg.bridge.rotation, Some(90));
    assert_eq!(cfg.bridge.retrieve_timeout, Duration::from_millis(250));
    assert_eq!(cfg.pipeline.kind, PipelineKind::H264File);
    assert_eq!(cfg.pipeline.target.as_deref(), Some("/tmp/capture.mp4"));

    clear_env();
}

#[test]
fn loads_json_file_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".json")
        .tempfile()
        .expect("temp config");
    let json = r#"{
        "device": { "uri": "stub://left", "second_uri": "stub://right" },
        "capture": { "throughput_limit": 100000000 },
        "pipeline": { "kind": "sidebyside" }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");
    std::env::set_var("CAMERA_APPSRC_CONFIG", file.path());

    let cfg = StreamerConfig::load().expect("load config");
    assert_eq!(cfg.pipeline.kind, PipelineKind::SideBySide);
    assert_eq!(cfg.device_uris(), vec!["stub://left", "stub://right"]);
    assert_eq!(cfg.bridge_config_for(2).throughput_limit, Some(50_000_000));
    assert_eq!(cfg.bridge_config_for(1).throughput_limit, Some(100_000_000));

    clear_env();
}

#[test]
fn framebuffer_target_defaults_to_fb0() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(b"[pipeline]\nkind = \"framebuffer\"\n")
        .expect("write config");
    std::env::set_var("CAMERA_APPSRC_CONFIG", file.path());

    let cfg = StreamerConfig::load().expect("load config");
    assert_eq!(cfg.pipeline.target.as_deref(), Some("/dev/fb0"));

    clear_env();
}

#[test]
fn rejects_incomplete_or_invalid_settings() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut stream = NamedTempFile::new().expect("temp config");
    stream
        .write_all(b"[pipeline]\nkind = \"h264stream\"\n")
        .expect("write config");
    std::env::set_var("CAMERA_APPSRC_CONFIG", stream.path());
    let err = StreamerConfig::load().expect_err("stream without host");
    assert!(err.to_string().contains("target host"));

    let mut pair = NamedTempFile::new().expect("temp config");
    pair.write_all(b"[pipeline]\nkind = \"sidebyside\"\n")
        .expect("write config");
    std::env::set_var("CAMERA_APPSRC_CONFIG", pair.path());
    let err = StreamerConfig::load().expect_err("side by side with one camera");
    assert!(err.to_string().contains("second_uri"));

    std::env::remove_var("CAMERA_APPSRC_CONFIG");
    std::env::set_var("CAMERA_APPSRC_FPS", "fast");
    let err = StreamerConfig::load().expect_err("non-numeric fps");
    assert!(err.to_string().contains("CAMERA_APPSRC_FPS"));

    std::env::set_var("CAMERA_APPSRC_FPS", "0");
    let err = StreamerConfig::load().expect_err("zero fps");
    assert!(err.to_string().contains("invalid capture settings"));

    clear_env();
}

#[test]
fn later_layers_can_complete_an_incomplete_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(b"[pipeline]\nkind = \"h264stream\"\n")
        .expect("write config");
    std::env::set_var("CAMERA_APPSRC_CONFIG", file.path());
    std::env::set_var("CAMERA_APPSRC_WIDTH", "0");

    let mut cfg = StreamerConfig::load_unvalidated().expect("layers load without validation");
    assert_eq!(cfg.pipeline.kind, PipelineKind::H264Stream);
    assert_eq!(cfg.bridge.width, Some(0));
    assert!(cfg.validate().is_err());

    // What a command line would supply on top.
    cfg.pipeline.target = Some("192.168.1.20".to_string());
    cfg.bridge.width = Some(640);
    cfg.validate().expect("completed config validates");
    assert_eq!(cfg.pipeline.port, 5000);

    let mut pair = NamedTempFile::new().expect("temp config");
    pair.write_all(b"[pipeline]\nkind = \"sidebyside\"\n")
        .expect("write config");
    std::env::set_var("CAMERA_APPSRC_CONFIG", pair.path());
    std::env::remove_var("CAMERA_APPSRC_WIDTH");

    let mut cfg = StreamerConfig::load_unvalidated().expect("layers load without validation");
    cfg.device.second_uri = Some("stub://right".to_string());
    cfg.validate().expect("second camera supplied later");
    assert_eq!(cfg.device_uris().len(), 2);

    clear_env();
}
