use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lookout_core::{
    AnalysisMode, AnalysisRequestKind, FrameCanvas, HttpInferenceClient, LiveSession,
    SessionConfig, SessionEvent,
};
use lookout_hw::{CaptureBackend, FrameEncoder, SyntheticBackend, V4l2Backend};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "lookout", about = "Live face analysis against a remote inference backend")]
struct Cli {
    /// TOML config file (default: $LOOKOUT_CONFIG)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Backend base URL, e.g. http://localhost:5001
    #[arg(long, global = true, value_name = "URL")]
    backend: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyse the camera feed until interrupted
    Live {
        /// identify, group, verify or crowd
        #[arg(short, long, default_value = "identify")]
        mode: AnalysisRequestKind,
        /// User that must be present (verify mode, repeatable)
        #[arg(long = "require", value_name = "NAME")]
        required: Vec<String>,
        /// Use a generated test pattern instead of a camera
        #[arg(long)]
        synthetic: bool,
        /// V4L2 device path
        #[arg(long)]
        device: Option<String>,
        /// Milliseconds between analysis requests
        #[arg(long, value_name = "MS")]
        interval: Option<u64>,
        /// Stop after this many seconds
        #[arg(long, value_name = "SECS")]
        duration: Option<u64>,
        /// Save the final overlay frame to this image file
        #[arg(long, value_name = "PATH")]
        snapshot: Option<PathBuf>,
    },
    /// Register a face from 1-5 image files
    Register {
        /// Name to register the face under
        #[arg(short, long)]
        name: String,
        #[arg(required = true, num_args = 1..=5, value_name = "IMAGE")]
        images: Vec<PathBuf>,
    },
    /// List users registered with the backend
    Users,
    /// List V4L2 capture devices
    Devices,
}

/// Options for a `live` run after config and flags are merged.
struct LiveOptions {
    mode: AnalysisMode,
    duration: Option<Duration>,
    snapshot: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(url) = cli.backend {
        config.backend_url = url;
    }

    match cli.command {
        Commands::Live {
            mode,
            required,
            synthetic,
            device,
            interval,
            duration,
            snapshot,
        } => {
            if let Some(device) = device {
                config.camera_device = device;
            }
            if let Some(ms) = interval {
                config.tick_interval_ms = ms;
            }
            let options = LiveOptions {
                mode: analysis_mode(mode, required)?,
                duration: duration.map(Duration::from_secs),
                snapshot,
            };

            if synthetic {
                let backend = SyntheticBackend::new(config.capture_width, config.capture_height, 30);
                run_live(backend, &config, options).await?;
            } else {
                let backend = V4l2Backend::new(
                    config.camera_device.clone(),
                    config.capture_width,
                    config.capture_height,
                );
                run_live(backend, &config, options).await?;
            }
        }
        Commands::Register { name, images } => {
            register(&config, &name, &images).await?;
        }
        Commands::Users => {
            let client = HttpInferenceClient::new(&config.backend_url, config.request_timeout())?;
            let users = client
                .registered_users()
                .await
                .context("failed to list registered users")?;
            if users.is_empty() {
                println!("No users registered");
            }
            for user in users {
                match user.registration_date {
                    Some(date) => println!("{}  (registered {date})", user.name),
                    None => println!("{}", user.name),
                }
            }
        }
        Commands::Devices => {
            let devices = V4l2Backend::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} [{}] {}", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
    }

    Ok(())
}

fn analysis_mode(kind: AnalysisRequestKind, required: Vec<String>) -> Result<AnalysisMode> {
    if !required.is_empty() && kind != AnalysisRequestKind::GroupVerify {
        bail!("--require only applies to verify mode");
    }
    Ok(match kind {
        AnalysisRequestKind::Identify => AnalysisMode::Identify,
        AnalysisRequestKind::GroupAnalyze => AnalysisMode::GroupAnalyze,
        AnalysisRequestKind::GroupVerify => {
            if required.is_empty() {
                bail!("verify mode needs at least one --require NAME");
            }
            AnalysisMode::GroupVerify {
                required_users: required,
            }
        }
        AnalysisRequestKind::CrowdCount => AnalysisMode::CrowdCount,
    })
}

async fn run_live<B: CaptureBackend>(backend: B, config: &Config, options: LiveOptions) -> Result<()> {
    let client = Arc::new(HttpInferenceClient::new(&config.backend_url, config.request_timeout())?);
    let session_config = SessionConfig {
        tick_interval: config.tick_interval(),
        render_fps: config.render_fps,
        ..SessionConfig::default()
    };
    let canvas = FrameCanvas::new(config.display_width, config.display_height);
    let mut session = LiveSession::new(
        backend,
        client,
        canvas,
        FrameEncoder::new(config.jpeg_quality),
        session_config,
    );
    let mut events = session.take_events().context("session events unavailable")?;

    session
        .start(options.mode)
        .await
        .context("failed to start camera")?;
    println!(
        "Analysing {} against {} (Ctrl-C to stop)",
        session.backend().describe(),
        config.backend_url
    );

    let deadline = async {
        match options.duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut outcome = Ok(());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Some(SessionEvent::ResultPublished { .. }) => {
                    if let Some(result) = session.store().latest() {
                        println!("{}", result.summary());
                    }
                }
                Some(SessionEvent::RequestFailed { error, .. }) => {
                    eprintln!("analysis failed: {error}");
                }
                Some(SessionEvent::CameraLost(fault)) => {
                    outcome = Err(match fault {
                        Some(e) => anyhow::anyhow!("camera lost: {e}"),
                        None => anyhow::anyhow!("camera lost"),
                    });
                    break;
                }
                Some(SessionEvent::CameraFailed(e)) => {
                    outcome = Err(anyhow::anyhow!("camera failed: {e}"));
                    break;
                }
                None => break,
            },
        }
    }

    if let Some(path) = &options.snapshot {
        save_snapshot(&session, path)?;
    }
    session.shutdown().await;
    outcome
}

fn save_snapshot<B: CaptureBackend>(
    session: &LiveSession<B, HttpInferenceClient, FrameCanvas>,
    path: &Path,
) -> Result<()> {
    session
        .renderer()
        .with_canvas(|canvas| canvas.save(path))
        .with_context(|| format!("failed to save snapshot to {}", path.display()))?;
    println!("Saved overlay snapshot to {}", path.display());
    Ok(())
}

async fn register(config: &Config, name: &str, paths: &[PathBuf]) -> Result<()> {
    let encoder = FrameEncoder::new(config.jpeg_quality);
    let mut images = Vec::with_capacity(paths.len());
    for path in paths {
        let image = encoder
            .encode_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?;
        images.push(image);
    }

    let client = HttpInferenceClient::new(&config.backend_url, config.request_timeout())?;
    let outcome = client
        .register_face(name, &images)
        .await
        .with_context(|| format!("failed to register {name}"))?;
    println!("{}", outcome.message);
    if let Some(n) = outcome.images_processed {
        println!("Images processed: {n}");
    }
    Ok(())
}
