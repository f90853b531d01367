use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

// `#[zbus::proxy]` generates `FaceGateProxy` (async) and `FaceGateProxyBlocking`.
#[zbus::proxy(
    interface = "org.facegate.FaceGate1",
    default_service = "org.facegate.FaceGate1",
    default_path = "/org/facegate/FaceGate1"
)]
trait FaceGate {
    async fn register(&self, user: &str, image: &[u8]) -> zbus::Result<String>;
    async fn verify(&self, user: &str, image: &[u8]) -> zbus::Result<String>;
    async fn user_status(&self, user: &str) -> zbus::Result<String>;
    async fn delete(&self, user: &str) -> zbus::Result<String>;
    async fn info(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facegate", about = "facegate face verification CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    /// (also enabled by FACEGATE_SESSION_BUS=1)
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a user from a photo
    Register {
        #[arg(short, long)]
        user: String,
        /// Image file (PNG, JPEG, ...)
        image: PathBuf,
    },
    /// Check a photo against a user's enrollment
    Verify {
        #[arg(short, long)]
        user: String,
        image: PathBuf,
    },
    /// Show whether a user is enrolled
    Status {
        #[arg(short, long)]
        user: String,
    },
    /// Remove a user's enrollment
    Delete {
        #[arg(short, long)]
        user: String,
    },
    /// Show daemon status
    Info,
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read image {}", path.display()))
}

/// Whether a daemon reply reports success.
fn reply_succeeded(reply: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(reply)
        .ok()
        .and_then(|v| v.get("success").and_then(|s| s.as_bool()))
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let session = cli.session || std::env::var("FACEGATE_SESSION_BUS").is_ok_and(|v| v == "1");
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = FaceGateProxy::new(&conn).await.context("facegated is not reachable")?;

    let reply = match cli.command {
        Commands::Register { user, image } => proxy.register(&user, &read_image(&image)?).await?,
        Commands::Verify { user, image } => proxy.verify(&user, &read_image(&image)?).await?,
        Commands::Status { user } => proxy.user_status(&user).await?,
        Commands::Delete { user } => proxy.delete(&user).await?,
        Commands::Info => proxy.info().await?,
    };
    tracing::debug!(reply = %reply, "daemon reply");

    match serde_json::from_str::<serde_json::Value>(&reply) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{reply}"),
    }

    if !reply_succeeded(&reply) {
        std::process::exit(1);
    }
    Ok(())
}
