use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use vigil_core::catalog::{parse_catalog, CatalogEntry};
use vigil_core::detector::OnnxPresenceDetector;
use vigil_core::extractor::{EmbeddingExtractor, OnnxExtractor};
use vigil_core::forest::ForestConfig;
use vigil_core::persist;
use vigil_core::resolver::{IdentityResolver, ResolverConfig};
use vigil_core::store::Generation;
use vigil_core::types::IdentificationResult;
use vigil_hw::V4l2Camera;

#[derive(Parser)]
#[command(name = "vigil", about = "Vigil face identification tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ModelArgs {
    /// Directory holding face_detector.onnx and face_embedder.onnx
    #[arg(long, env = "VIGIL_MODEL_DIR", default_value = "models")]
    model_dir: PathBuf,
    /// Embedding dimension produced by the embedder
    #[arg(long, env = "VIGIL_DIMENSION", default_value_t = 128)]
    dimension: usize,
    /// Minimum detector confidence for a face
    #[arg(long, env = "VIGIL_DETECTOR_CONFIDENCE", default_value_t = 0.7)]
    detector_confidence: f32,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the catalog, build the identity index and save it
    BuildIndex {
        #[arg(long, env = "VIGIL_CATALOG_URL", default_value = "http://127.0.0.1:8081/getAllDataWithUsername")]
        catalog_url: String,
        #[arg(short, long, env = "VIGIL_INDEX_PATH", default_value = "identity.vidx")]
        output: PathBuf,
        #[arg(long, env = "VIGIL_DIMENSION", default_value_t = 128)]
        dimension: usize,
        #[arg(long, env = "VIGIL_N_TREES", default_value_t = 50)]
        n_trees: usize,
    },
    /// Print statistics for a saved index
    Inspect {
        #[arg(short, long, env = "VIGIL_INDEX_PATH", default_value = "identity.vidx")]
        index: PathBuf,
    },
    /// Identify the face in an image against a saved index
    Identify {
        image: PathBuf,
        #[arg(short, long, env = "VIGIL_INDEX_PATH", default_value = "identity.vidx")]
        index: PathBuf,
        #[arg(short, long, default_value_t = 10)]
        k: usize,
        #[arg(short, long, default_value_t = 0.36)]
        threshold: f32,
        #[command(flatten)]
        models: ModelArgs,
    },
    /// Print the embedding extracted from an image
    Embed {
        image: PathBuf,
        #[command(flatten)]
        models: ModelArgs,
    },
    /// List V4L2 capture devices
    Devices,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::BuildIndex {
            catalog_url,
            output,
            dimension,
            n_trees,
        } => {
            let entries = fetch_entries(&catalog_url)?;
            let summary = build_index(entries, dimension, n_trees, &output)?;
            print_json(&summary)?;
        }
        Commands::Inspect { index } => {
            let generation = persist::load_from_path(&index)
                .with_context(|| format!("failed to load {}", index.display()))?;
            print_json(&index_summary(&generation))?;
        }
        Commands::Identify {
            image,
            index,
            k,
            threshold,
            models,
        } => {
            let generation = persist::load_from_path(&index)
                .with_context(|| format!("failed to load {}", index.display()))?;
            if generation.dim() != models.dimension {
                bail!(
                    "index dimension {} does not match embedder dimension {}",
                    generation.dim(),
                    models.dimension
                );
            }

            let mut extractor = load_extractor(&models)?;
            let result = match extractor.extract(&image)? {
                Some(embedding) => {
                    let resolver = IdentityResolver::new(ResolverConfig {
                        k,
                        distance_threshold: threshold,
                        ..ResolverConfig::default()
                    });
                    IdentificationResult::from(resolver.resolve_in(&generation, &embedding))
                }
                None => {
                    eprintln!("no face found in {}", image.display());
                    IdentificationResult::unknown()
                }
            };
            print_json(&json!({
                "username": result.display_name(),
                "member_id": result.wire_member_id(),
                "avg_distance": result.avg_distance,
            }))?;
        }
        Commands::Embed { image, models } => {
            let mut extractor = load_extractor(&models)?;
            match extractor.extract(&image)? {
                Some(embedding) => print_json(&embedding)?,
                None => bail!("no face found in {}", image.display()),
            }
        }
        Commands::Devices => {
            let devices = V4l2Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
    }

    Ok(())
}

fn fetch_entries(url: &str) -> Result<Vec<CatalogEntry>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let body = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.text())
        .with_context(|| format!("failed to fetch catalog from {url}"))?;
    Ok(parse_catalog(&body)?)
}

/// Build a generation from `entries`, save it to `output` and describe it.
fn build_index(entries: Vec<CatalogEntry>, dim: usize, n_trees: usize, output: &Path) -> Result<serde_json::Value> {
    let fetched = entries.len();
    let forest = ForestConfig {
        n_trees,
        ..ForestConfig::default()
    };
    let generation = Generation::build(entries, dim, &forest);
    if generation.is_empty() {
        bail!("catalog has no usable records ({fetched} fetched); nothing written");
    }

    persist::save_to_path(&generation, output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    tracing::info!(path = %output.display(), records = generation.len(), "index written");

    let mut summary = index_summary(&generation);
    summary["fetched"] = json!(fetched);
    summary["skipped"] = json!(fetched - generation.len());
    summary["path"] = json!(output.display().to_string());
    Ok(summary)
}

fn index_summary(generation: &Generation) -> serde_json::Value {
    let mut members: Vec<&str> = generation
        .store()
        .records()
        .iter()
        .map(|r| r.username.as_str())
        .collect();
    members.sort_unstable();
    members.dedup();

    json!({
        "records": generation.len(),
        "identities": members.len(),
        "dimension": generation.dim(),
        "trees": generation.forest().map_or(0, |f| f.n_trees()),
        "nodes": generation.forest().map_or(0, |f| f.node_count()),
    })
}

fn load_extractor(models: &ModelArgs) -> Result<OnnxExtractor> {
    let detector = OnnxPresenceDetector::load(&models.model_dir.join("face_detector.onnx"), models.detector_confidence)
        .context("failed to load face detector")?;
    OnnxExtractor::load(&models.model_dir.join("face_embedder.onnx"), detector, models.dimension)
        .context("failed to load face embedder")
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<CatalogEntry> {
        vec![
            CatalogEntry::new("alice", "1", vec![1.0, 0.0, 0.0]),
            CatalogEntry::new("alice", "1", vec![0.9, 0.1, 0.0]),
            CatalogEntry::new("bob", "2", vec![0.0, 1.0, 0.0]),
            CatalogEntry {
                username: Some("broken".into()),
                ..Default::default()
            },
        ]
    }

    #[test]
    fn test_build_index_writes_loadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.vidx");

        let summary = build_index(entries(), 3, 5, &path).unwrap();
        assert_eq!(summary["fetched"], 4);
        assert_eq!(summary["records"], 3);
        assert_eq!(summary["skipped"], 1);
        assert_eq!(summary["identities"], 2);
        assert_eq!(summary["trees"], 5);

        let loaded = persist::load_from_path(&path).unwrap();
        assert_eq!(index_summary(&loaded)["records"], 3);
    }

    #[test]
    fn test_build_index_refuses_empty_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.vidx");
        assert!(build_index(Vec::new(), 3, 5, &path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_identify_arguments() {
        let cli = Cli::try_parse_from(["vigil", "identify", "face.jpg", "-k", "5", "--threshold", "0.4"]).unwrap();
        match cli.command {
            Commands::Identify { image, k, threshold, .. } => {
                assert_eq!(image, PathBuf::from("face.jpg"));
                assert_eq!(k, 5);
                assert!((threshold - 0.4).abs() < 1e-6);
            }
            _ => panic!("expected identify"),
        }
    }
}
