use anyhow::Result;
use facegate_core::FacePipeline;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

const BUS_NAME: &str = "org.facegate.FaceGate1";
const OBJECT_PATH: &str = "/org/facegate/FaceGate1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facegated starting");

    let config = config::Config::from_env()?;
    tracing::info!(
        cascade = %config.paths.cascade.display(),
        model = %config.paths.model.display(),
        store = %config.paths.store.display(),
        threshold = config.pipeline.verification_threshold,
        augmentations = config.pipeline.enrollment.augmentations,
        "configuration loaded"
    );

    // Load cascade, model and store synchronously (fail-fast)
    let pipeline = FacePipeline::load(&config.pipeline, &config.paths)?;
    let engine = engine::spawn_engine(pipeline)?;

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, dbus_interface::FaceGateService::new(engine))?
        .build()
        .await?;

    tracing::info!(
        bus = BUS_NAME,
        path = OBJECT_PATH,
        session = config.session_bus,
        "facegated ready"
    );

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    Ok(())
}
