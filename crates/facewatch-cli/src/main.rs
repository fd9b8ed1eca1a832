use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use facewatch_core::alignment::align_face;
use facewatch_core::store::StoredIdentity;
use facewatch_core::{
    ArcFaceExtractor, CoordinateMapper, EmbeddingExtractor, FaceDetector, FacewatchConfig, Frame,
    Gallery, JsonLinesSink, LinearMatcher, LivenessGate, OnnxLivenessChecker, OrchestratorConfig,
    RecognitionOrchestrator, Rect, ScrfdDetector, SqliteGalleryStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "facewatch", about = "facewatch live face recognition CLI")]
struct Cli {
    /// TOML configuration file (FACEWATCH_* variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the recognition pipeline over a directory of frames
    Watch {
        /// Directory of images, fed in file-name order
        #[arg(long)]
        frames: PathBuf,
        /// Frames per second to feed
        #[arg(long, default_value_t = 10.0)]
        fps: f32,
        /// Capture log (JSON lines); defaults to capture.output_path
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Enroll a person from a single image
    Enroll {
        /// Stable person id
        #[arg(long)]
        id: String,
        /// Display name
        #[arg(long)]
        name: String,
        /// Image containing exactly the face to enroll
        image: PathBuf,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove {
        /// Person id to remove
        id: String,
    },
    /// Map a frame-space rectangle into view space
    Map {
        /// Frame size, WxH
        #[arg(long)]
        frame: String,
        /// View size, WxH
        #[arg(long)]
        view: String,
        /// Mirror horizontally (front-facing camera)
        #[arg(long)]
        front: bool,
        /// Rectangle as left,top,right,bottom
        rect: String,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = FacewatchConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Watch { frames, fps, out } => watch(&config, &frames, fps, out).await,
        Commands::Enroll { id, name, image } => enroll(&config, id, name, &image).await,
        Commands::List => {
            let store = SqliteGalleryStore::open(&config.gallery.db_path)?;
            let identities = store.list()?;
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for identity in identities {
                println!(
                    "{:<24} {:<24} dim={:<5} model={:<12} {}",
                    identity.person_id,
                    identity.display_name,
                    identity.dimension.map_or("-".to_string(), |d| d.to_string()),
                    identity.model_version.as_deref().unwrap_or("-"),
                    identity.created_at,
                );
            }
            Ok(())
        }
        Commands::Remove { id } => {
            let store = SqliteGalleryStore::open(&config.gallery.db_path)?;
            if !store.remove(&id)? {
                bail!("no identity with id {id}");
            }
            println!("Removed {id}");
            Ok(())
        }
        Commands::Map {
            frame,
            view,
            front,
            rect,
        } => {
            let (fw, fh) = parse_size(&frame)?;
            let (vw, vh) = parse_size(&view)?;
            let mapper = CoordinateMapper::configured(fw, fh, vw, vh, front)?;
            let r = mapper.map(&parse_rect(&rect)?)?;
            println!("{:.1},{:.1},{:.1},{:.1}", r.left, r.top, r.right, r.bottom);
            Ok(())
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Inference backends shared by `watch` and `enroll`.
struct Backends {
    detector: Arc<ScrfdDetector>,
    liveness: LivenessGate,
    extractor: Arc<ArcFaceExtractor>,
}

fn load_backends(config: &FacewatchConfig) -> Result<Backends> {
    let models = &config.models;

    let scrfd_path = models.scrfd_model_path();
    let detector = ScrfdDetector::load(&scrfd_path)?
        .with_thresholds(models.detection_confidence, models.nms_threshold);
    tracing::info!(path = %scrfd_path, "SCRFD detector loaded");

    let liveness_path = models.liveness_model_path();
    let checker =
        OnnxLivenessChecker::load(&liveness_path)?.with_live_class(models.liveness_live_class);
    tracing::info!(
        path = %liveness_path,
        live_class = models.liveness_live_class,
        "liveness model loaded"
    );

    let arcface_path = models.arcface_model_path();
    let extractor = ArcFaceExtractor::load(&arcface_path)?;
    tracing::info!(path = %arcface_path, "ArcFace extractor loaded");

    let liveness = LivenessGate::new(
        Arc::new(checker),
        config.recognition.liveness_threshold,
        Duration::from_millis(config.recognition.backend_timeout_ms),
    );

    Ok(Backends {
        detector: Arc::new(detector),
        liveness,
        extractor: Arc::new(extractor),
    })
}

async fn watch(config: &FacewatchConfig, dir: &Path, fps: f32, out: Option<PathBuf>) -> Result<()> {
    if !(fps.is_finite() && fps > 0.0) {
        bail!("--fps must be positive, got {fps}");
    }
    let paths = frame_paths(dir)?;
    if paths.is_empty() {
        bail!("no image files in {}", dir.display());
    }

    let backends = load_backends(config)?;
    let recognition = &config.recognition;

    let store = SqliteGalleryStore::open(&config.gallery.db_path)?;
    let gallery = Arc::new(Gallery::new(Arc::new(store), recognition.embedding_dimension));
    gallery.refresh().await?;

    let out = out.unwrap_or_else(|| config.capture.output_path.clone());
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create capture directory {}", parent.display()))?;
    }
    let sink = JsonLinesSink::open(&out).await?;

    let orch = Arc::new(RecognitionOrchestrator::new(
        backends.detector,
        backends.liveness,
        backends.extractor,
        gallery.clone(),
        Box::new(LinearMatcher::new(recognition.metric, recognition.accept_threshold)),
        Arc::new(sink),
        OrchestratorConfig::from(recognition),
    ));

    let refresher = (config.gallery.refresh_interval_secs > 0).then(|| {
        let gallery = gallery.clone();
        let period = Duration::from_secs(config.gallery.refresh_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = gallery.refresh().await {
                    tracing::debug!(error = %err, "periodic gallery refresh failed");
                }
            }
        })
    });

    let (tx, rx) = mpsc::channel(2);
    let pump = tokio::spawn(facewatch_core::run_stream(orch.clone(), rx));

    tracing::info!(frames = paths.len(), fps, out = %out.display(), "watch started");
    tokio::select! {
        fed = feed_frames(paths, fps, tx) => fed?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted; finishing in-flight cycle");
            orch.shutdown();
        }
    }

    let summary = pump.await?;
    if let Some(refresher) = refresher {
        refresher.abort();
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "stream": summary,
            "orchestrator": orch.stats(),
        }))?
    );
    Ok(())
}

/// Decode each image and push it at a fixed rate. Timestamps are milliseconds
/// since the feed started.
async fn feed_frames(paths: Vec<PathBuf>, fps: f32, tx: mpsc::Sender<Frame>) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs_f32(1.0 / fps));
    let start = Instant::now();

    for path in paths {
        ticker.tick().await;
        let image = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || image::open(&path)).await?
        };
        let image = match image {
            Ok(image) => image,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping undecodable frame");
                continue;
            }
        };
        let frame = Frame::from_image(&image, start.elapsed().as_millis() as u64)?;
        if tx.send(frame).await.is_err() {
            break;
        }
    }
    Ok(())
}

fn frame_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg" | "bmp" | "pgm"))
            .unwrap_or(false);
        if is_image {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

async fn enroll(config: &FacewatchConfig, id: String, name: String, image: &Path) -> Result<()> {
    let backends = load_backends(config)?;
    let decoded = image::open(image).with_context(|| format!("open {}", image.display()))?;
    let frame = Frame::from_image(&decoded, 0)?;

    let faces = backends.detector.detect(&frame).await?;
    if faces.len() > 1 {
        tracing::warn!(count = faces.len(), "multiple faces found; enrolling the most confident");
    }
    let face = faces
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no face detected in {}", image.display()))?;

    let crop = frame.crop(&face.rect, config.recognition.liveness_crop_scale);
    let verdict = backends.liveness.evaluate(&crop).await?;
    if !verdict.is_live {
        bail!("liveness check rejected the face (score {:.3})", verdict.score);
    }

    let embedding = backends.extractor.embed(&align_face(&frame, &face)).await?;
    let store = SqliteGalleryStore::open(&config.gallery.db_path)?;
    store.enroll(&StoredIdentity {
        person_id: id.clone(),
        display_name: name,
        embedding: Some(embedding.values),
        raw_features: None,
        model_version: embedding.model_version,
    })?;

    tracing::info!(person_id = %id, confidence = face.confidence, "identity enrolled");
    println!("Enrolled {id} (face confidence {:.3}, liveness {:.3})", face.confidence, verdict.score);
    Ok(())
}

fn parse_size(s: &str) -> Result<(f32, f32)> {
    let (w, h) = s
        .split_once('x')
        .ok_or_else(|| anyhow!("expected WxH, got {s:?}"))?;
    Ok((w.trim().parse()?, h.trim().parse()?))
}

fn parse_rect(s: &str) -> Result<Rect> {
    let parts = s
        .split(',')
        .map(|p| p.trim().parse::<f32>())
        .collect::<Result<Vec<_>, _>>()?;
    match parts.as_slice() {
        [l, t, r, b] => Ok(Rect::new(*l, *t, *r, *b)),
        _ => bail!("expected left,top,right,bottom, got {s:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("640x480").unwrap(), (640.0, 480.0));
        assert!(parse_size("640").is_err());
        assert!(parse_size("ax480").is_err());
    }

    #[test]
    fn test_parse_rect() {
        assert_eq!(
            parse_rect("10, 20,30,40").unwrap(),
            Rect::new(10.0, 20.0, 30.0, 40.0)
        );
        assert!(parse_rect("1,2,3").is_err());
    }

    #[test]
    fn test_frame_paths_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.png", "a.JPG", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let names: Vec<_> = frame_paths(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.JPG", "b.png"]);
    }
}
