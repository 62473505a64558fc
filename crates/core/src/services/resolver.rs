//! Feature resolution: which detectors does a requested feature set need?

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::{DetectorSpec, ProbeConfig};
use crate::model::FeatureId;
use crate::services::detection::ProbeError;

/// Feature -> name of the detector that produces it.
#[derive(Debug, Clone, Default)]
pub struct FeatureIndex {
    producers: HashMap<FeatureId, String>,
}

impl FeatureIndex {
    /// Scan detector specs in declaration order.
    ///
    /// A feature claimed twice is a `DuplicateFeatureClaim` unless the config
    /// opts into `allow_duplicate_claims`, where the later detector wins.
    pub fn build(config: &ProbeConfig) -> Result<Self, ProbeError> {
        let mut producers: HashMap<FeatureId, String> = HashMap::new();
        for detector in &config.detectors {
            for feature in &detector.features {
                if let Some(previous) = producers.get(feature) {
                    if previous == &detector.name {
                        continue;
                    }
                    if !config.allow_duplicate_claims {
                        return Err(ProbeError::DuplicateFeatureClaim {
                            feature: feature.clone(),
                            first: previous.clone(),
                            second: detector.name.clone(),
                        });
                    }
                    warn!(
                        feature = %feature,
                        replaced = %previous,
                        by = %detector.name,
                        "duplicate feature claim; later detector wins"
                    );
                }
                producers.insert(feature.clone(), detector.name.clone());
            }
        }
        Ok(Self { producers })
    }

    pub fn producer(&self, feature: &str) -> Option<&str> {
        self.producers.get(feature).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }
}

/// One requested feature paired with the detector that answers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment<'a> {
    pub feature: FeatureId,
    pub detector: &'a DetectorSpec,
}

/// Map every requested feature to its producing detector.
///
/// Fails on the first feature without a producer, so no partial selection
/// ever reaches construction. Assignments keep request order; repeated
/// features collapse to their first occurrence.
pub fn assign<'a>(
    requested: &[FeatureId],
    config: &'a ProbeConfig,
) -> Result<Vec<Assignment<'a>>, ProbeError> {
    let index = FeatureIndex::build(config)?;
    let mut assignments: Vec<Assignment<'a>> = Vec::new();
    for feature in requested {
        if assignments.iter().any(|a| &a.feature == feature) {
            continue;
        }
        let producer = index
            .producer(feature)
            .ok_or_else(|| ProbeError::MissingFeatureProducer(feature.clone()))?;
        let detector = config.detector(producer).ok_or_else(|| {
            ProbeError::InvalidConfig(format!("feature index names unknown detector '{producer}'"))
        })?;
        debug!(feature = %feature, detector = %detector.name, "resolved feature");
        assignments.push(Assignment { feature: feature.clone(), detector });
    }
    Ok(assignments)
}

/// The deduplicated detector specs needed for `requested`, in first-request order.
pub fn resolve<'a>(
    requested: &[FeatureId],
    config: &'a ProbeConfig,
) -> Result<Vec<&'a DetectorSpec>, ProbeError> {
    let mut selected: Vec<&'a DetectorSpec> = Vec::new();
    for assignment in assign(requested, config)? {
        if !selected.iter().any(|d| d.name == assignment.detector.name) {
            selected.push(assignment.detector);
        }
    }
    Ok(selected)
}
