use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, ArgGroup, Parser, Subcommand};
use feature_probe::commands::{
    bisect_command, detect_command, harness_command, init_logging, list_kinds_command, BisectArgs,
    DetectArgs, HarnessArgs,
};
use probe_core::services::harness::DEFAULT_OUT_FILE;

/// Detect hardening and coding-practice features in packages.
///
/// This CLI is a thin wrapper around `probe-core` (exposed in code as `probe_core`).
/// JSON results go to stdout; logs go to stderr.
#[derive(Parser, Debug)]
#[command(
    name = "feature-probe",
    version,
    about = "Feature detection and bisection",
    long_about = None
)]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug, -vvv trace). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the detectors for the selected features and print a JSON object.
    #[command(group(
        ArgGroup::new("location")
            .required(true)
            .multiple(true)
            .args(["binary_dir", "source_dir", "build_log"])
    ))]
    Detect {
        /// Probe config (YAML) declaring detectors and parsers.
        #[arg(long)]
        config: PathBuf,

        /// Directory the binary package was extracted into.
        #[arg(long, requires = "binary_name")]
        binary_dir: Option<PathBuf>,

        /// Binary path relative to --binary-dir.
        #[arg(long, requires = "binary_dir")]
        binary_name: Option<String>,

        /// Extracted source package directory.
        #[arg(long)]
        source_dir: Option<PathBuf>,

        /// Build log file.
        #[arg(long)]
        build_log: Option<PathBuf>,

        /// Feature to report; repeat for several. Defaults to the config's selection.
        #[arg(long = "feature")]
        features: Vec<String>,
    },

    /// Find the first-parent commit that introduced a feature.
    Bisect {
        /// Probe config used at every commit, with only the source tree available.
        #[arg(long)]
        config: PathBuf,

        /// Git repository to bisect. Its checkout is left untouched; commits are
        /// checked out in a scratch worktree.
        #[arg(long)]
        repo: PathBuf,

        #[arg(long)]
        feature: String,

        /// Oldest commit of the range. Defaults to the root commit.
        #[arg(long)]
        old: Option<String>,

        /// Newest commit of the range. Defaults to --branch, then HEAD.
        #[arg(long)]
        new: Option<String>,

        #[arg(long)]
        branch: Option<String>,
    },

    /// Run detection (and optionally bisection) over a list of packages.
    Harness {
        /// JSON array of package infos.
        package_infos: PathBuf,

        /// Harness settings (YAML).
        #[arg(long)]
        settings: PathBuf,

        #[arg(long, default_value = DEFAULT_OUT_FILE)]
        out: PathBuf,

        /// Index of the first package to process.
        #[arg(long, default_value_t = 0)]
        start_offset: usize,

        /// Stop after this many packages produced results. Defaults to all.
        #[arg(long)]
        count: Option<usize>,

        #[arg(long, default_value_t = false)]
        no_bisect: bool,
    },

    /// List the detector and parser kinds a config can use.
    Kinds {
        /// Emit JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Detect { config, binary_dir, binary_name, source_dir, build_log, features } => {
            detect_command(&DetectArgs {
                config,
                binary_dir,
                binary_name,
                source_dir,
                build_log,
                features,
            })?
        }
        Command::Bisect { config, repo, feature, old, new, branch } => {
            bisect_command(&BisectArgs { config, repo, feature, old, new, branch })?
        }
        Command::Harness { package_infos, settings, out, start_offset, count, no_bisect } => {
            harness_command(&HarnessArgs {
                package_infos,
                settings,
                out,
                start_offset,
                count,
                no_bisect,
            })?
        }
        Command::Kinds { json } => list_kinds_command(json)?,
    }

    Ok(())
}
