//! The runner: resolve requested features, build what they need, run it once.
//!
//! The lifecycle is encoded in types: a [`Runner`] is configured, [`Runner::prepare`]
//! yields a ready [`PreparedRun`], and [`PreparedRun::execute`] consumes it.

use tracing::info;

use crate::config::ProbeConfig;
use crate::model::{FeatureId, ResultRecord};
use crate::services::detection::{DetectionInputs, Detector, ProbeError};
use crate::services::registry::{InstanceBuilder, KindRegistry};
use crate::services::resolver::assign;

/// A configured runner: config and kinds are fixed, inputs name the artifacts.
pub struct Runner<'a> {
    config: &'a ProbeConfig,
    kinds: &'a KindRegistry,
    inputs: DetectionInputs,
}

impl<'a> Runner<'a> {
    pub fn new(config: &'a ProbeConfig, kinds: &'a KindRegistry, inputs: DetectionInputs) -> Self {
        Self { config, kinds, inputs }
    }

    pub fn inputs(&self) -> &DetectionInputs {
        &self.inputs
    }

    /// Resolve `requested` (or `features_selected` when empty) and construct
    /// the selected detectors plus the parsers they reference.
    ///
    /// Nothing is constructed unless every feature has a producer.
    pub fn prepare(&self, requested: &[FeatureId]) -> Result<PreparedRun, ProbeError> {
        let features = self.config.features_or_default(requested);
        let assignments = assign(&features, self.config)?;

        let mut builder = InstanceBuilder::new(self.kinds, self.config, &self.inputs);
        let mut detectors: Vec<Box<dyn Detector>> = Vec::new();
        let mut plan: Vec<(FeatureId, usize)> = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let slot = match detectors.iter().position(|d| d.name() == assignment.detector.name) {
                Some(slot) => slot,
                None => {
                    detectors.push(builder.detector(assignment.detector)?);
                    detectors.len() - 1
                }
            };
            plan.push((assignment.feature, slot));
        }

        info!(
            features = plan.len(),
            detectors = detectors.len(),
            parsers = builder.constructed_parsers().len(),
            "run prepared"
        );
        Ok(PreparedRun {
            plan,
            detectors,
            constructed_parsers: builder.constructed_parsers().to_vec(),
        })
    }

    /// Prepare and execute in one step.
    pub fn run(&self, requested: &[FeatureId]) -> Result<ResultRecord, ProbeError> {
        self.prepare(requested)?.execute()
    }
}

/// Detectors and parsers resolved for one run, ready to execute.
pub struct PreparedRun {
    plan: Vec<(FeatureId, usize)>,
    detectors: Vec<Box<dyn Detector>>,
    constructed_parsers: Vec<String>,
}

impl PreparedRun {
    /// Features in the order their results will appear.
    pub fn features(&self) -> Vec<&str> {
        self.plan.iter().map(|(f, _)| f.as_str()).collect()
    }

    pub fn detector_names(&self) -> Vec<&str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    /// Parser names constructed while preparing, each exactly once.
    pub fn constructed_parsers(&self) -> &[String] {
        &self.constructed_parsers
    }

    /// Query each feature's detector once, sequentially, in request order.
    ///
    /// The first detector error aborts the run; no partial record is returned.
    pub fn execute(self) -> Result<ResultRecord, ProbeError> {
        let mut record = ResultRecord::new();
        for (feature, slot) in &self.plan {
            let detector = &self.detectors[*slot];
            info!(detector = %detector.name(), feature = %feature, "running detector");
            let value = detector.detect(feature)?;
            record.insert(feature.clone(), value);
        }
        Ok(record)
    }
}
