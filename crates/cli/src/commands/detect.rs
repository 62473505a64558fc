use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use probe_core::config::load_probe_config;
use probe_core::model::ResultRecord;
use probe_core::services::{default_kind_registry, DetectionInputs, Runner};
use tracing::info;

use crate::{existing_dir, existing_file};

/// Arguments of the `detect` subcommand, independent of clap.
#[derive(Debug, Clone, Default)]
pub struct DetectArgs {
    pub config: PathBuf,
    pub binary_dir: Option<PathBuf>,
    pub binary_name: Option<String>,
    pub source_dir: Option<PathBuf>,
    pub build_log: Option<PathBuf>,
    pub features: Vec<String>,
}

/// Validate the location arguments and turn them into detection inputs.
///
/// At least one location is required; `--binary-dir` and `--binary-name`
/// only make sense together.
pub fn detection_inputs(args: &DetectArgs) -> Result<DetectionInputs> {
    let mut inputs = DetectionInputs::default();
    match (&args.binary_dir, &args.binary_name) {
        (Some(dir), Some(name)) => {
            let dir = existing_dir("--binary-dir", dir)?;
            let binary = existing_file("--binary-name", &dir.join(name))?;
            let short = PathBuf::from(name)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| name.clone());
            inputs = inputs.with_binary(binary, short);
        }
        (None, None) => {}
        _ => bail!("--binary-dir and --binary-name must be given together"),
    }
    if let Some(dir) = &args.source_dir {
        inputs = inputs.with_source_dir(existing_dir("--source-dir", dir)?);
    }
    if let Some(log) = &args.build_log {
        inputs = inputs.with_build_log(existing_file("--build-log", log)?);
    }
    if inputs.is_empty() {
        bail!(
            "at least one of --binary-dir/--binary-name, --source-dir or --build-log is required"
        );
    }
    Ok(inputs)
}

/// Run detection and return the ordered result record.
pub fn run_detect(args: &DetectArgs) -> Result<ResultRecord> {
    let config_path = existing_file("--config", &args.config)?;
    let inputs = detection_inputs(args)?;
    let config = load_probe_config(&config_path)?;
    let kinds = default_kind_registry();
    info!(config = %config_path.display(), "running detection");
    let record = Runner::new(&config, &kinds, inputs)
        .run(&args.features)
        .context("Detection failed")?;
    Ok(record)
}

/// `detect`: print one JSON object mapping each feature to its value.
pub fn detect_command(args: &DetectArgs) -> Result<()> {
    let record = run_detect(args)?;
    println!("{}", serde_json::to_string(&record)?);
    Ok(())
}
