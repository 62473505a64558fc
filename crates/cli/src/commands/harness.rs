use std::path::PathBuf;

use anyhow::Result;
use probe_core::services::default_kind_registry;
use probe_core::services::harness::{
    load_package_infos, write_records, CommandArtifactProvider, DetectionHarness, HarnessOptions,
    HarnessSettings, PackageRecord,
};
use probe_core::workspace::ScratchLayout;
use tracing::info;

use crate::{canonicalize_or_current, existing_file};

#[derive(Debug, Clone, Default)]
pub struct HarnessArgs {
    pub package_infos: PathBuf,
    pub settings: PathBuf,
    pub out: PathBuf,
    pub start_offset: usize,
    pub count: Option<usize>,
    pub no_bisect: bool,
}

/// Run the batch over every package and return the collected records.
pub fn run_harness(args: &HarnessArgs) -> Result<Vec<PackageRecord>> {
    let infos_path = existing_file("package infos", &args.package_infos)?;
    let settings_path = existing_file("--settings", &args.settings)?;
    let packages = load_package_infos(&infos_path)?;
    let settings = HarnessSettings::load(&settings_path)?;
    let configs = settings.load_configs()?;
    let bisection = settings.load_bisection_config()?;
    let whitelist = settings.load_whitelist()?;
    let kinds = default_kind_registry();

    let provider =
        CommandArtifactProvider::new(settings.commands.clone(), settings.command_timeout());
    let harness = DetectionHarness::new(
        &configs,
        &bisection,
        &kinds,
        ScratchLayout::new(&settings.scratch_root),
        provider,
    )
    .with_whitelist(whitelist)
    .with_options(HarnessOptions {
        start_offset: args.start_offset,
        count: args.count,
        skip_bisect: args.no_bisect,
    });
    harness.run(&packages)
}

/// `harness`: process the package list and write the JSON array to `--out`.
pub fn harness_command(args: &HarnessArgs) -> Result<()> {
    let out = canonicalize_or_current(&args.out)?;
    let records = run_harness(args)?;
    write_records(&out, &records)?;
    info!(records = records.len(), out = %out.display(), "wrote detection results");
    Ok(())
}
