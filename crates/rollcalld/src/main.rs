use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{Annotator, IdentityStore, RecognitionEngine, Role, Sample, SharedAnalyzer};
use rollcall_hw::{CameraError, VideoSource};
use rollcalld::{CaptureController, Config, Enrollee, EnrollmentRegistry, FaceStore, JournalSink};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rollcall", version, about = "Face-recognition attendance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor a camera and mark attendance until Ctrl-C
    Run {
        /// Camera index, device path or image directory (overrides ROLLCALL_CAMERA_SOURCE)
        #[arg(short, long)]
        source: Option<String>,
        /// Seconds between status log lines
        #[arg(long, default_value_t = 10)]
        status_every: u64,
    },
    /// Enroll a new identity with guided multi-angle capture
    Enroll {
        /// Identity id (stored upper-case)
        id: String,
        /// Display name
        name: String,
        #[arg(short, long, default_value = "student")]
        role: Role,
        #[arg(short, long)]
        source: Option<String>,
        /// Samples to collect
        #[arg(long)]
        count: Option<usize>,
        /// Minimum pose difference between samples, in degrees
        #[arg(long)]
        angle: Option<f32>,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove {
        /// Identity id
        id: String,
    },
    /// List video capture devices
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Run { source, status_every } => run(config, source, status_every).await,
        Commands::Enroll {
            id,
            name,
            role,
            source,
            count,
            angle,
            timeout,
        } => {
            let enrollee = Enrollee::new(&id, &name, role)?;
            tokio::task::spawn_blocking(move || enroll(config, enrollee, source, count, angle, timeout)).await?
        }
        Commands::List => list(&config),
        Commands::Remove { id } => {
            let store = FaceStore::open(&config.faces_dir)?;
            let id = id.trim().to_uppercase();
            if store.delete(&id)? {
                println!("Removed {id}");
            } else {
                println!("No identity {id}");
            }
            Ok(())
        }
        Commands::Devices => devices(),
    }
}

async fn run(config: Config, source: Option<String>, status_every: u64) -> Result<()> {
    let source = source.unwrap_or_else(|| config.camera_source.clone());
    let engine = Arc::new(engine(&config, load_analyzer(&config)?)?);
    let sink = Arc::new(
        JournalSink::open(&config.journal_path)
            .with_context(|| format!("opening attendance journal {}", config.journal_path.display()))?,
    );
    let controller = Arc::new(CaptureController::new(
        config.controller(),
        Arc::new(config.video_source()),
        engine,
        sink,
    ));

    tracing::info!(source = %source, journal = %config.journal_path.display(), "rollcall starting");
    if config.auto_start {
        controller.start(&source).context("starting capture")?;
    } else {
        tracing::info!("auto-start disabled; waiting for Ctrl-C");
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(Duration::from_secs(status_every.max(1)));
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                tracing::info!("rollcall shutting down");
                break;
            }
            _ = ticker.tick() => {
                let status = controller.status();
                tracing::info!(
                    phase = ?status.phase,
                    known = status.known_identities,
                    dropped = status.frames_dropped,
                    "status"
                );
                if config.auto_start && !status.running && !status.busy {
                    tracing::info!("capture session ended");
                    break;
                }
            }
        }
    }

    let ctl = Arc::clone(&controller);
    tokio::task::spawn_blocking(move || ctl.stop()).await??;
    Ok(())
}

fn enroll(
    config: Config,
    enrollee: Enrollee,
    source: Option<String>,
    count: Option<usize>,
    angle: Option<f32>,
    timeout: u64,
) -> Result<()> {
    let source = source.unwrap_or_else(|| config.camera_source.clone());
    let engine = Arc::new(engine(&config, load_analyzer(&config)?)?);
    let registry = EnrollmentRegistry::new(engine, config.sampler(), config.session_expiry());
    let token = registry.create_sampler(enrollee.clone(), count, angle)?;

    let mut device = config
        .video_source()
        .open(&source)
        .with_context(|| format!("opening {source}"))?;
    println!("Enrolling {} ({}). Look at the camera and slowly turn your head.", enrollee.name, enrollee.id);

    let deadline = Instant::now() + Duration::from_secs(timeout);
    let mut last_message = String::new();
    let result = loop {
        if Instant::now() >= deadline {
            break Err(anyhow::anyhow!("enrollment timed out after {timeout}s"));
        }
        let frame = match device.read() {
            Ok(frame) => frame,
            Err(e) if e.is_transient() => continue,
            Err(CameraError::Exhausted) => break Err(anyhow::anyhow!("source ran out of frames")),
            Err(e) => break Err(e.into()),
        };

        let outcome = match registry.accept(token, Sample::Frame(frame)) {
            Ok(outcome) => outcome,
            Err(e) => break Err(e.into()),
        };
        if outcome.accepted || outcome.message != last_message {
            println!("{}", outcome.message);
            last_message = outcome.message;
        }
        if outcome.accepted && registry.finalize(token).is_ok() {
            break registry.complete(token).map_err(anyhow::Error::from);
        }
    };
    device.release();

    match result {
        Ok(identity) => {
            println!("Enrolled {} with {} embeddings", identity.id, identity.embeddings.len());
            Ok(())
        }
        Err(e) => {
            registry.cancel(token);
            Err(e)
        }
    }
}

fn list(config: &Config) -> Result<()> {
    let store = FaceStore::open(&config.faces_dir)?;
    let identities = store.load_all()?;
    if identities.is_empty() {
        println!("No identities enrolled");
        return Ok(());
    }
    println!("{:<12} {:<24} {:<8} {:>7}  CREATED", "ID", "NAME", "ROLE", "VECTORS");
    for identity in identities {
        println!(
            "{:<12} {:<24} {:<8} {:>7}  {}",
            identity.id,
            identity.name,
            identity.role,
            identity.embeddings.len(),
            identity.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn engine(config: &Config, analyzer: SharedAnalyzer) -> Result<RecognitionEngine> {
    let store = FaceStore::open(&config.faces_dir)
        .with_context(|| format!("opening faces directory {}", config.faces_dir.display()))?;
    let annotator = match &config.label_font {
        Some(path) => Annotator::with_font_file(path).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "label font unavailable; drawing boxes only");
            Annotator::new()
        }),
        None => Annotator::new(),
    };
    let engine = RecognitionEngine::new(config.recognition(), Arc::new(store), analyzer, annotator);
    if let Err(e) = engine.reload() {
        tracing::warn!(error = %e, "initial gallery load failed");
    }
    Ok(engine)
}

#[cfg(feature = "onnx")]
fn load_analyzer(config: &Config) -> Result<SharedAnalyzer> {
    let analyzer = rollcall_core::onnx::OnnxAnalyzer::load(&config.model_dir)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    Ok(rollcall_core::analyzer::shared(analyzer))
}

#[cfg(not(feature = "onnx"))]
fn load_analyzer(_config: &Config) -> Result<SharedAnalyzer> {
    anyhow::bail!("built without a face analyzer; rebuild with `--features onnx`")
}

#[cfg(feature = "v4l2")]
fn devices() -> Result<()> {
    let devices = rollcall_hw::V4l2Camera::list_devices();
    if devices.is_empty() {
        println!("No video capture devices found");
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
    Ok(())
}

#[cfg(not(feature = "v4l2"))]
fn devices() -> Result<()> {
    anyhow::bail!("built without V4L2 support; rebuild with `--features v4l2`")
}
