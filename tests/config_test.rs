//! The shipped sample configuration stays loadable.

use std::path::PathBuf;

use camstack::config::{CameraFamily, CamstackConfig};
use camstack::modes::ModeId;

fn sample() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/simcam.toml")
}

#[test]
fn test_sample_config_loads() {
    let config = CamstackConfig::load_from(sample()).expect("sample config");
    assert_eq!(config.camera.family, CameraFamily::Simulated);
    assert_eq!(config.camera.worker_session(), "simcam_fgrab");
    assert_eq!(config.dependents.len(), 2);
    assert_eq!(config.rpc.bind.as_deref(), Some("127.0.0.1:7201"));

    let modes = config.mode_table();
    for id in ["FULL", "HALF", "QUARTER", "STRIP"] {
        assert!(modes.contains(&ModeId::from(id)), "{id}");
    }
    let strip = modes.lookup(&ModeId::from("STRIP")).expect("STRIP");
    assert_eq!((strip.width(), strip.height()), (320, 32));
}

#[test]
fn test_sample_dependents_render_with_the_full_geometry() {
    let config = CamstackConfig::load_from(sample()).expect("sample config");
    let ctx = camstack::dependents::RenderContext {
        width: 320,
        height: 256,
        stream: "simcam".into(),
        camera: "simcam".into(),
    };
    let dark = config
        .dependents
        .iter()
        .find(|d| d.name == "simcam_dark")
        .expect("simcam_dark");
    assert_eq!(
        dark.render(&ctx).expect("render"),
        "milk-exec \"darkcube simcam 320 256\""
    );
}
