//! watchpostd - live detection feed daemon
//!
//! Startup order:
//! 1. Load configuration (file named by `--config` / `WATCHPOST_CONFIG`, then env)
//! 2. Rebuild the saved-detection index from disk
//! 3. Load the detection model (fatal on failure)
//! 4. Open the capture source and start the detection loop (fatal on failure)
//! 5. Serve the HTTP API until Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use watchpost::{
    api::ApiServer,
    ingest::open_source,
    load_detector, CameraStatus, DetectionLoop, ModelInfo, ServiceConfig, ServiceState,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "WATCHPOST_CONFIG")]
    config: Option<PathBuf>,
    /// Listen address override, e.g. 127.0.0.1:5000.
    #[arg(long)]
    addr: Option<String>,
    /// Validate configuration, storage and model, then exit without opening the camera.
    #[arg(long)]
    check: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = ServiceConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api.addr = addr;
    }
    log::info!(
        "watchpostd {}: source={} model={} target={} threshold={:.2} storage={} (max {})",
        env!("CARGO_PKG_VERSION"),
        config.capture.source,
        config.model_path,
        config.detection.target_class,
        config.detection.confidence_threshold,
        config.storage.dir.display(),
        config.storage.max_images
    );

    let store = Arc::new(config.detection_store());
    store.initialize()?;

    let mut detector = load_detector(&config.model_path)?;
    detector.warm_up()?;
    let model = ModelInfo::from_detector(config.model_path.clone(), detector.as_ref());
    log::info!(
        "model {} loaded ({} backend): {:?}",
        model.path,
        detector.name(),
        model.class_names
    );

    if args.check {
        println!(
            "config ok: {} saved image(s) indexed, {} model class(es), api {}",
            store.len(),
            model.class_names.len(),
            config.api.addr
        );
        return Ok(());
    }

    let frames = Arc::new(config.frame_state());
    let camera = Arc::new(CameraStatus::new());
    let source = open_source(&config.capture)?;
    let loop_handle = DetectionLoop::new(
        source,
        detector,
        frames.clone(),
        store.clone(),
        camera.clone(),
        config.pipeline_config(),
    )
    .start()?;

    let state = Arc::new(ServiceState::new(&config, frames, store, camera, model));
    let api_handle = ApiServer::new(config.api.clone(), state).spawn()?;
    log::info!("api listening on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("watchpostd running; waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    loop_handle.stop()?;
    let open_connections = api_handle.active_connections();
    if open_connections > 0 {
        log::info!("closing {} open api connection(s)", open_connections);
    }
    api_handle.stop()?;
    log::info!("watchpostd stopped");
    Ok(())
}
