use anyhow::{Context, Result};
use facegate_core::{
    ArcFaceEmbedder, CascadeDetector, CascadeParams, Embedder, FaceDetector, FaceEngine, FaceImageNormalizer,
    FaceRecognizer, ScrfdDetector,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod enrollment;

use config::{Config, DetectorKind};
use dbus_interface::{FacegateService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        detector = config.detector.as_str(),
        model_dir = %config.model_dir.display(),
        workers = config.workers,
        threshold = config.match_threshold,
        "facegated starting"
    );

    // Load models synchronously (fail-fast)
    let detector = load_detector(&config)?;
    let arcface_path = config.arcface_model_path();
    let embedder: Box<dyn Embedder> = Box::new(
        ArcFaceEmbedder::load(&arcface_path)
            .with_context(|| format!("failed to load ArcFace model from {arcface_path}"))?,
    );

    let engine = FaceEngine::new(
        FaceImageNormalizer::new(detector),
        FaceRecognizer::new(embedder, config.match_threshold),
        config.workers,
    )
    .context("failed to start recognition engine")?;

    let service = FacegateService::new(Arc::new(engine), config.enrollment_file.clone(), config.detector);
    let enrolled = service
        .load_enrollment_file()
        .with_context(|| format!("failed to load enrollments from {}", config.enrollment_file.display()))?;
    tracing::info!(enrolled, "enrollments loaded");

    let _connection = zbus::connection::Builder::system()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the system bus")?;

    tracing::info!(bus_name = BUS_NAME, "facegated ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    Ok(())
}

fn load_detector(config: &Config) -> Result<Box<dyn FaceDetector>> {
    let detector: Box<dyn FaceDetector> = match config.detector {
        DetectorKind::Scrfd => {
            let path = config.scrfd_model_path();
            Box::new(
                ScrfdDetector::load(&path).with_context(|| format!("failed to load SCRFD model from {path}"))?,
            )
        }
        DetectorKind::Cascade => {
            let path = config.cascade_model_path();
            let params = CascadeParams { min_neighbors: config.min_neighbors, ..CascadeParams::default() };
            Box::new(
                CascadeDetector::load(&path, params)
                    .with_context(|| format!("failed to load cascade model from {path}"))?,
            )
        }
    };
    Ok(detector)
}
