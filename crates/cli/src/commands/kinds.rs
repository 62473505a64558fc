use anyhow::Result;
use probe_core::services::default_kind_registry;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct KindList {
    pub detectors: Vec<String>,
    pub parsers: Vec<String>,
}

pub fn registered_kinds() -> KindList {
    let registry = default_kind_registry();
    KindList { detectors: registry.detector_kinds(), parsers: registry.parser_kinds() }
}

/// List detector and parser kinds usable in a probe config.
pub fn list_kinds_command(json: bool) -> Result<()> {
    let kinds = registered_kinds();
    if json {
        println!("{}", serde_json::to_string_pretty(&kinds)?);
        return Ok(());
    }

    println!("Detector kinds:");
    for kind in &kinds.detectors {
        println!("- {kind}");
    }
    println!("Parser kinds:");
    for kind in &kinds.parsers {
        println!("- {kind}");
    }
    Ok(())
}
