//! Locate the commit that introduced a feature.
//!
//! [`find_introduction`] is a first-true binary search over an ordered
//! history, assuming the feature never disappears once introduced. The
//! git-backed [`bisect_feature`] feeds it a [`CheckoutOracle`] that runs the
//! detectors against each checked-out commit. A caller's own checkout is
//! never checked out into; the search runs in a scratch worktree instead.

use tracing::{info, warn};

use crate::config::ProbeConfig;
use crate::model::FeatureId;
use crate::services::detection::{DetectionInputs, ProbeError};
use crate::services::git::GitWorkTree;
use crate::services::registry::KindRegistry;
use crate::services::resolver::assign;
use crate::services::runner::Runner;

/// Answers "is the feature present at this commit?".
pub trait Oracle {
    fn is_present(&mut self, commit: &str) -> Result<bool, ProbeError>;
}

impl<F> Oracle for F
where
    F: FnMut(&str) -> Result<bool, ProbeError>,
{
    fn is_present(&mut self, commit: &str) -> Result<bool, ProbeError> {
        self(commit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundReason {
    /// The newest commit does not have the feature.
    AbsentAtNewest,
    /// The oldest commit already has it, so the introduction predates the range.
    PresentAtOldest,
    EmptyHistory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BisectOutcome {
    Introduced { commit: String, evaluations: usize },
    NotFound { reason: NotFoundReason, evaluations: usize },
}

impl BisectOutcome {
    pub fn commit(&self) -> Option<&str> {
        match self {
            BisectOutcome::Introduced { commit, .. } => Some(commit),
            BisectOutcome::NotFound { .. } => None,
        }
    }

    pub fn evaluations(&self) -> usize {
        match self {
            BisectOutcome::Introduced { evaluations, .. }
            | BisectOutcome::NotFound { evaluations, .. } => *evaluations,
        }
    }
}

/// First commit in `history` (oldest first) at which `oracle` turns true.
///
/// The newest and oldest endpoints are checked first; after that the search
/// keeps `lo` absent and `hi` present, so it needs about `log2(N)` more
/// evaluations. An oracle error aborts the search.
pub fn find_introduction<O: Oracle + ?Sized>(
    history: &[String],
    oracle: &mut O,
) -> Result<BisectOutcome, ProbeError> {
    let Some(newest) = history.last() else {
        return Ok(BisectOutcome::NotFound { reason: NotFoundReason::EmptyHistory, evaluations: 0 });
    };
    let mut evaluations = 1;
    if !oracle.is_present(newest)? {
        return Ok(BisectOutcome::NotFound { reason: NotFoundReason::AbsentAtNewest, evaluations });
    }
    if history.len() == 1 {
        return Ok(BisectOutcome::NotFound { reason: NotFoundReason::PresentAtOldest, evaluations });
    }
    evaluations += 1;
    if oracle.is_present(&history[0])? {
        return Ok(BisectOutcome::NotFound { reason: NotFoundReason::PresentAtOldest, evaluations });
    }

    let (mut lo, mut hi) = (0, history.len() - 1);
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        evaluations += 1;
        if oracle.is_present(&history[mid])? {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    Ok(BisectOutcome::Introduced { commit: history[hi].clone(), evaluations })
}

/// Oracle that checks a commit out and runs the detectors on the bare source tree.
pub struct CheckoutOracle<'a> {
    tree: &'a GitWorkTree,
    config: &'a ProbeConfig,
    kinds: &'a KindRegistry,
    feature: FeatureId,
}

impl<'a> CheckoutOracle<'a> {
    pub fn new(
        tree: &'a GitWorkTree,
        config: &'a ProbeConfig,
        kinds: &'a KindRegistry,
        feature: impl Into<FeatureId>,
    ) -> Self {
        Self { tree, config, kinds, feature: feature.into() }
    }
}

impl Oracle for CheckoutOracle<'_> {
    fn is_present(&mut self, commit: &str) -> Result<bool, ProbeError> {
        self.tree.checkout(commit)?;
        let inputs = DetectionInputs::source_only(self.tree.path());
        let record = Runner::new(self.config, self.kinds, inputs).run(&[self.feature.clone()])?;
        let present = record.get(&self.feature).map(|v| v.is_present()).unwrap_or(false);
        info!(commit, feature = %self.feature, present, "evaluated commit");
        Ok(present)
    }
}

/// Puts the tree back on the ref it was on when created.
struct RestoreCheckout<'a> {
    tree: &'a GitWorkTree,
    original: String,
}

impl Drop for RestoreCheckout<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.tree.checkout(&self.original) {
            warn!(original = %self.original, error = %err, "failed to restore checkout");
        }
    }
}

/// Bisect `feature` over the first-parent history `old..=new` of `tree`.
///
/// The feature must resolve against `config` before any checkout happens.
/// An owned tree is checked out into directly and returned to its original
/// ref on every exit path. A borrowed tree keeps its files and ref untouched:
/// commits are checked out in a scratch worktree removed afterwards.
pub fn bisect_feature(
    tree: &GitWorkTree,
    config: &ProbeConfig,
    kinds: &KindRegistry,
    feature: &str,
    old: &str,
    new: &str,
) -> Result<BisectOutcome, ProbeError> {
    assign(&[feature.to_string()], config)?;
    if tree.is_owned() {
        return bisect_in(tree, config, kinds, feature, old, new);
    }

    let (old, new) = (tree.resolve(old)?, tree.resolve(new)?);
    let scratch = tempfile::Builder::new()
        .prefix("probe-bisect")
        .tempdir()
        .map_err(|e| ProbeError::io(std::env::temp_dir(), e))?;
    let worktree = tree.scratch_worktree(&scratch.path().join("tree"))?;
    bisect_in(&worktree, config, kinds, feature, &old, &new)
}

fn bisect_in(
    tree: &GitWorkTree,
    config: &ProbeConfig,
    kinds: &KindRegistry,
    feature: &str,
    old: &str,
    new: &str,
) -> Result<BisectOutcome, ProbeError> {
    let _restore = RestoreCheckout { tree, original: tree.current_ref()? };
    let history = tree.first_parent_range(old, new)?;
    info!(feature, commits = history.len(), "bisecting");

    let mut oracle = CheckoutOracle::new(tree, config, kinds, feature);
    let outcome = find_introduction(&history, &mut oracle)?;
    match &outcome {
        BisectOutcome::Introduced { commit, evaluations } => {
            info!(feature, commit = %commit, evaluations, "feature introduced")
        }
        BisectOutcome::NotFound { reason, evaluations } => {
            info!(feature, reason = ?reason, evaluations, "no introducing commit in range")
        }
    }
    Ok(outcome)
}
