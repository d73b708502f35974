use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};

// `#[zbus::proxy]` generates `AttendanceProxy` (async) and
// `AttendanceProxyBlocking`. Only the async variant is used here.
#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn enroll(&self, id: &str, name: &str, images: Vec<Vec<u8>>) -> zbus::Result<String>;
    async fn recognize(&self, image: Vec<u8>, lecture: &str, slot: i32) -> zbus::Result<String>;
    async fn detect(&self, image: Vec<u8>) -> zbus::Result<String>;
    async fn mark(&self, id: &str, name: &str, lecture: &str, slot: i32) -> zbus::Result<String>;
    async fn history(&self, id: &str, year: i32, month: u32) -> zbus::Result<String>;
    async fn list_attendance(&self) -> zbus::Result<String>;
    async fn list_attendees(&self) -> zbus::Result<String>;
    async fn clear_identity(&self, id: &str) -> zbus::Result<u64>;
    async fn clear_all(&self) -> zbus::Result<u64>;
    async fn logs(&self) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn remove_identity(&self, id: &str) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll (or re-enroll) a person from one or more photos
    Enroll {
        /// Roll number or other unique identifier
        #[arg(short, long)]
        id: String,
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Image files (JPEG, PNG, ...)
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Recognize faces in a photo and mark attendance
    Recognize {
        image: PathBuf,
        /// Lecture the attendance belongs to
        #[arg(short, long)]
        lecture: Option<String>,
        /// Lecture slot number
        #[arg(short, long, requires = "lecture")]
        slot: Option<u32>,
    },
    /// Detect faces only, without matching
    Detect {
        image: PathBuf,
        /// Save each detected face crop into this directory
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Mark a person present without a photo
    Mark {
        #[arg(short, long)]
        id: String,
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        lecture: Option<String>,
        #[arg(short, long, requires = "lecture")]
        slot: Option<u32>,
    },
    /// Show one month of attendance for a person
    History {
        id: String,
        #[arg(short, long)]
        year: i32,
        #[arg(short, long)]
        month: u32,
    },
    /// Show every attendance record
    Attendance,
    /// List everyone who has been marked at least once
    Attendees,
    /// Delete attendance records
    Clear {
        /// Only this person's records
        #[arg(long, conflicts_with = "all")]
        id: Option<String>,
        /// Every record
        #[arg(long)]
        all: bool,
    },
    /// Show the recognition log
    Logs,
    /// List enrolled people
    List,
    /// Remove an enrolled person
    Remove { id: String },
    /// Show daemon status
    Status,
}

/// A face box as reported by `Detect`.
#[derive(Debug, Deserialize)]
struct DetectedFace {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    confidence: f32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    };
    let conn = conn.context("connecting to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Enroll { id, name, images } => {
            let images = images.iter().map(|p| read_image(p)).collect::<Result<Vec<_>>>()?;
            print_json(&proxy.enroll(&id, &name, images).await?)?;
        }
        Commands::Recognize { image, lecture, slot } => {
            let bytes = read_image(&image)?;
            let reply = proxy
                .recognize(bytes, lecture.as_deref().unwrap_or(""), slot_arg(slot))
                .await?;
            print_json(&reply)?;
        }
        Commands::Mark { id, name, lecture, slot } => {
            let outcome = proxy
                .mark(&id, &name, lecture.as_deref().unwrap_or(""), slot_arg(slot))
                .await?;
            println!("{id}: {outcome}");
        }
        Commands::Detect { image, out } => {
            let bytes = read_image(&image)?;
            let reply = proxy.detect(bytes.clone()).await?;
            print_json(&reply)?;
            if let Some(dir) = out {
                let faces: Vec<DetectedFace> = serde_json::from_str(&reply)?;
                let saved = save_crops(&bytes, &faces, &dir)?;
                println!("saved {saved} face crop(s) to {}", dir.display());
            }
        }
        Commands::History { id, year, month } => {
            print_json(&proxy.history(&id, year, month).await?)?;
        }
        Commands::Attendance => print_json(&proxy.list_attendance().await?)?,
        Commands::Attendees => print_json(&proxy.list_attendees().await?)?,
        Commands::Clear { id, all } => {
            let removed = match (id, all) {
                (Some(id), _) => proxy.clear_identity(&id).await?,
                (None, true) => proxy.clear_all().await?,
                (None, false) => bail!("pass --id <ID> or --all"),
            };
            println!("removed {removed} attendance record(s)");
        }
        Commands::Logs => print_json(&proxy.logs().await?)?,
        Commands::List => print_json(&proxy.list_identities().await?)?,
        Commands::Remove { id } => {
            if proxy.remove_identity(&id).await? {
                println!("removed {id}");
            } else {
                println!("{id} is not enrolled");
            }
        }
        Commands::Status => print_json(&proxy.status().await?)?,
    }

    Ok(())
}

/// D-Bus encoding of an optional slot: negative means none.
fn slot_arg(slot: Option<u32>) -> i32 {
    slot.map_or(-1, |s| i32::try_from(s).unwrap_or(i32::MAX))
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn print_json(reply: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(reply)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Crop each face out of the source image and write `face-N.png` files.
fn save_crops(bytes: &[u8], faces: &[DetectedFace], dir: &Path) -> Result<usize> {
    let img = image::load_from_memory(bytes)?.to_rgb8();
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    for (i, face) in faces.iter().enumerate() {
        let crop = image::imageops::crop_imm(&img, face.x, face.y, face.width, face.height).to_image();
        let path = dir.join(format!("face-{i}.png"));
        crop.save(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        tracing::debug!(index = i, confidence = face.confidence, path = %path.display(), "saved face crop");
    }
    Ok(faces.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_slot_requires_lecture() {
        assert!(Cli::try_parse_from(["rollcall", "recognize", "a.jpg", "--slot", "2"]).is_err());
        let cli = Cli::try_parse_from(["rollcall", "recognize", "a.jpg", "-l", "DBMS", "-s", "2"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Recognize { lecture: Some(ref l), slot: Some(2), .. } if l == "DBMS"
        ));
    }

    #[test]
    fn test_mark_arguments() {
        let cli = Cli::try_parse_from(["rollcall", "mark", "-i", "21CS001", "-n", "Asha", "-l", "OS", "-s", "3"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Mark { ref id, lecture: Some(ref l), slot: Some(3), .. } if id == "21CS001" && l == "OS"
        ));
        assert!(Cli::try_parse_from(["rollcall", "mark", "-i", "1", "-n", "A", "-s", "3"]).is_err());
        assert_eq!(slot_arg(None), -1);
        assert_eq!(slot_arg(Some(4)), 4);
    }

    #[test]
    fn test_save_crops_writes_one_file_per_face() {
        let mut bytes = Vec::new();
        image::RgbImage::from_pixel(40, 30, image::Rgb([10, 20, 30]))
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        let faces = vec![
            DetectedFace { x: 0, y: 0, width: 10, height: 10, confidence: 0.9 },
            DetectedFace { x: 20, y: 10, width: 15, height: 20, confidence: 0.7 },
        ];
        let dir = std::env::temp_dir().join(format!("rollcall-crops-{}", std::process::id()));
        assert_eq!(save_crops(&bytes, &faces, &dir).unwrap(), 2);
        let second = image::open(dir.join("face-1.png")).unwrap();
        assert_eq!((second.width(), second.height()), (15, 20));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
