use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use facegate_core::{
    CascadeDetector, CascadeParams, FaceDetector, FaceImageNormalizer, Image, RawImage, ScrfdDetector,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facegate", about = "facegate face recognition CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the descriptor of the largest face in an image
    Descriptor {
        /// Image file
        image: PathBuf,
    },
    /// Check an already cropped 112x112 face against enrolled faces
    Check {
        /// Face crop file
        image: PathBuf,
    },
    /// Detect, normalize and check a full image
    Identify {
        /// Image file
        image: PathBuf,
    },
    /// Check a descriptor (JSON array) against enrolled faces
    CheckDescriptor {
        /// File holding the descriptor JSON
        file: PathBuf,
    },
    /// Replace all enrolled descriptors with a JSON enrollment list
    Update {
        /// File holding `[{"id", "owner_id", "features"}]`
        file: PathBuf,
    },
    /// Make the daemon re-read its enrollment file
    Reload,
    /// Show daemon status
    Status,
    /// Run face detection locally, without the daemon
    Detect {
        /// Image file
        image: PathBuf,
        /// Detector backend
        #[arg(short, long, value_enum, default_value_t = Backend::Scrfd)]
        detector: Backend,
        /// Model directory (default: $FACEGATE_MODEL_DIR or /usr/share/facegate/models)
        #[arg(long)]
        model_dir: Option<PathBuf>,
        /// Votes a cascade region needs
        #[arg(long, default_value_t = CascadeParams::default().min_neighbors)]
        min_neighbors: usize,
        /// Write the normalized crop of the chosen face here
        #[arg(long)]
        save_crop: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Scrfd,
    Cascade,
}

// `#[zbus::proxy]` generates `FacegateProxy` (async) and `FacegateProxyBlocking`.
#[zbus::proxy(
    interface = "org.facegate.Engine1",
    default_service = "org.facegate.Engine1",
    default_path = "/org/facegate/Engine1"
)]
trait Facegate {
    async fn calculate_descriptor(&self, image_path: &str) -> zbus::Result<String>;
    async fn check_face(&self, image_path: &str) -> zbus::Result<String>;
    async fn identify_image(&self, image_path: &str) -> zbus::Result<String>;
    async fn check_descriptor(&self, descriptor_json: &str) -> zbus::Result<String>;
    async fn update_descriptors(&self, enrollments_json: &str) -> zbus::Result<u32>;
    async fn reload_enrollments(&self) -> zbus::Result<u32>;
    async fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Descriptor { image } => {
            let path = daemon_path(&image)?;
            print_json(&connect().await?.calculate_descriptor(&path).await?)?;
        }
        Commands::Check { image } => {
            let path = daemon_path(&image)?;
            print_json(&connect().await?.check_face(&path).await?)?;
        }
        Commands::Identify { image } => {
            let path = daemon_path(&image)?;
            print_json(&connect().await?.identify_image(&path).await?)?;
        }
        Commands::CheckDescriptor { file } => {
            let json = read_text(&file)?;
            print_json(&connect().await?.check_descriptor(&json).await?)?;
        }
        Commands::Update { file } => {
            let json = read_text(&file)?;
            let count = connect().await?.update_descriptors(&json).await?;
            println!("{count} descriptors enrolled");
        }
        Commands::Reload => {
            let count = connect().await?.reload_enrollments().await?;
            println!("{count} descriptors enrolled");
        }
        Commands::Status => {
            print_json(&connect().await?.status().await?)?;
        }
        Commands::Detect { image, detector, model_dir, min_neighbors, save_crop } => {
            detect(&image, detector, model_dir, min_neighbors, save_crop.as_deref())?;
        }
    }

    Ok(())
}

async fn connect() -> Result<FacegateProxy<'static>> {
    let conn = zbus::Connection::system()
        .await
        .context("cannot connect to the system bus")?;
    FacegateProxy::new(&conn)
        .await
        .context("facegated is not reachable")
}

/// The daemon resolves paths in its own working directory.
fn daemon_path(path: &Path) -> Result<String> {
    let absolute = std::fs::canonicalize(path).with_context(|| format!("cannot open {}", path.display()))?;
    Ok(absolute.to_string_lossy().into_owned())
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))
}

fn print_json(reply: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(reply).context("daemon sent malformed JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn detect(
    image_path: &Path,
    backend: Backend,
    model_dir: Option<PathBuf>,
    min_neighbors: usize,
    save_crop: Option<&Path>,
) -> Result<()> {
    let model_dir = model_dir
        .or_else(|| std::env::var("FACEGATE_MODEL_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("/usr/share/facegate/models"));

    let detector: Box<dyn FaceDetector> = match backend {
        Backend::Scrfd => {
            let path = model_dir.join("det_10g.onnx");
            Box::new(ScrfdDetector::load(&path.to_string_lossy())?)
        }
        Backend::Cascade => {
            let path = model_dir.join("seeta_fd_frontal_v1.0.bin");
            let params = CascadeParams { min_neighbors, ..CascadeParams::default() };
            Box::new(CascadeDetector::load(&path.to_string_lossy(), params)?)
        }
    };
    let normalizer = FaceImageNormalizer::new(detector);

    let decoded = image::open(image_path).with_context(|| format!("cannot open {}", image_path.display()))?;
    let raw = RawImage::from(decoded);
    if !normalizer.check_image_valid(&raw) {
        let reason = raw.validate().err().unwrap_or_default();
        return Err(anyhow!("{} is not a usable image: {reason}", image_path.display()));
    }
    let image = Image::try_from(raw).map_err(|e| anyhow!(e))?;

    println!("Image: {}x{} ({} channels)", image.width(), image.height(), image.channels());
    let faces = normalizer.find_faces(&image)?;
    println!("Faces: {}", faces.len());
    for (i, face) in faces.iter().enumerate() {
        println!(
            "  [{i}] x={} y={} w={} h={} area={}{}",
            face.x,
            face.y,
            face.width,
            face.height,
            face.area(),
            if face.landmarks.is_some() { " landmarks" } else { "" }
        );
    }

    let Some(chosen) = normalizer.aligner().select_face(&faces) else {
        println!("No face detected.");
        return Ok(());
    };
    let index = faces.iter().position(|f| std::ptr::eq(f, chosen)).unwrap_or(0);
    println!("Chosen: [{index}]");

    if let Some(out) = save_crop {
        let crop = normalizer.aligner().align(&image, chosen);
        save_image(&crop, out)?;
        println!("Crop written to {}", out.display());
    }
    Ok(())
}

fn save_image(image: &Image, path: &Path) -> Result<()> {
    let (w, h) = (image.width() as u32, image.height() as u32);
    let data: Vec<u8> = image.pixels().iter().copied().collect();
    let saved = if image.channels() == 1 {
        image::GrayImage::from_raw(w, h, data).map(|img| img.save(path))
    } else {
        image::RgbImage::from_raw(w, h, data).map(|img| img.save(path))
    };
    saved
        .ok_or_else(|| anyhow!("crop buffer does not match {w}x{h}"))?
        .with_context(|| format!("cannot write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_defaults_follow_library() {
        let cli = Cli::try_parse_from(["facegate", "detect", "photo.jpg"]).unwrap();
        let Commands::Detect { detector, min_neighbors, save_crop, .. } = cli.command else {
            panic!("parsed as another subcommand");
        };
        assert!(matches!(detector, Backend::Scrfd));
        assert_eq!(min_neighbors, CascadeParams::default().min_neighbors);
        assert!(save_crop.is_none());
    }

    #[test]
    fn test_min_neighbors_override() {
        let cli = Cli::try_parse_from(["facegate", "detect", "-d", "cascade", "--min-neighbors", "5", "p.png"]).unwrap();
        assert!(matches!(cli.command, Commands::Detect { detector: Backend::Cascade, min_neighbors: 5, .. }));
    }
}
