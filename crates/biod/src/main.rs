//! bioauthd - local biometric authentication daemon

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::info;

use biod::{ipc, BiometricsService, DaemonConfig};
use face_pipeline::{
    EyeDetector, FaceDetector, FacePipeline, FrameSource, GeometricEyeDetector,
    LiveDataPublisher, PeerClient, RustfaceDetector, V4lCamera,
};
use fprint_backend::Registry;
use fprint_engine::FprintEngine;
use template_store::{FaceStore, FingerprintStore};

#[derive(Parser)]
#[command(name = "bioauthd", version, about = "Local biometric authentication daemon")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    biod::init_logging();

    let cli = Cli::parse();
    let config = DaemonConfig::load(cli.config.as_deref()).context("loading configuration")?;
    info!("bioauthd v{}", env!("CARGO_PKG_VERSION"));

    let registry = Registry::discover(&config.plugin_dir);
    let fprint_store = Arc::new(FingerprintStore::new(&config.fprint_store_dir));
    let engine = Arc::new(FprintEngine::new(registry, fprint_store));

    let publisher = Arc::new(
        LiveDataPublisher::bind(&config.live_data_socket).context("binding live-data socket")?,
    );
    let face_store = Arc::new(FaceStore::new(&config.face_store_dir));
    let comparator = Arc::new(PeerClient::new(&config.peer_socket));

    let video_device = config.video_device.clone();
    let face_model = config.face_model.clone();
    let pipeline = Arc::new(FacePipeline::new(
        move || Ok(Box::new(V4lCamera::open(&video_device)?) as Box<dyn FrameSource>),
        move || {
            Ok((
                Box::new(RustfaceDetector::from_model_file(&face_model)?) as Box<dyn FaceDetector>,
                Box::new(GeometricEyeDetector) as Box<dyn EyeDetector>,
            ))
        },
        comparator,
        publisher,
        face_store,
    ));

    let (events, _) = broadcast::channel(256);
    let service = Arc::new(BiometricsService::new(engine, pipeline, events));

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = ipc::serve(&config.socket_path, service) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("terminated, shutting down");
            Ok(())
        }
    }
}
