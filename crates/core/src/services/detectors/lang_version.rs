use std::cmp::Ordering;
use std::rc::Rc;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::model::FeatureValue;
use crate::services::detection::{BuildStage, Detector, ParseSelector, Parser, ProbeError};
use crate::services::detectors::expect_lines;

/// `-std=` spellings recognised in compiler lines.
const STANDARD_SPELLINGS: [&str; 18] = [
    "c++98", "c++03", "gnu++98", "gnu++03", "c++11", "c++0x", "gnu++11", "gnu++0x", "c++14",
    "c++1y", "gnu++14", "gnu++1y", "c++17", "c++1z", "gnu++17", "gnu++1z", "c++2a", "gnu++2a",
];

/// Normalized standards, oldest first.
const STANDARD_NAMES: [&str; 6] = ["c++98", "c++03", "c++11", "c++14", "c++17", "c++2a"];

/// Compiler version above which the default dialect is C++14.
const CXX14_DEFAULT_GCC: &str = "6.1";

pub const NO_STANDARD: &str = "none";

/// `g++ (= [epoch:]X.Y...)` version banner.
static GCC_BANNER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"g\+\+ \(= (?:[0-9]+:)?([0-9.]+).*\)").expect("valid regex")
});

/// Reports the oldest C++ standard the package is compiled against.
pub struct LangVersionDetector {
    name: String,
    parser: Rc<dyn Parser>,
}

impl LangVersionDetector {
    pub fn new(name: impl Into<String>, parser: Rc<dyn Parser>) -> Self {
        Self { name: name.into(), parser }
    }
}

impl Detector for LangVersionDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, feature: &str) -> Result<FeatureValue, ProbeError> {
        let output = self.parser.parse(&ParseSelector::Stage(BuildStage::All))?;
        let lines = expect_lines(self.parser.name(), output)?;
        info!(detector = %self.name, count = lines.len(), "found compiler lines");

        let spellings = standards_in(&lines);
        let standard = match oldest_standard(&spellings) {
            Some(standard) => {
                debug!(detector = %self.name, ?spellings, standard, "detected c++ standard");
                standard.to_string()
            }
            None => {
                warn!(detector = %self.name, "language version not found");
                NO_STANDARD.to_string()
            }
        };
        debug!(detector = %self.name, feature, standard = %standard, "ran detector");
        Ok(FeatureValue::Text(standard))
    }
}

/// Standard spellings mentioned anywhere in `lines`, falling back to the
/// compiler version banner when no explicit `-std=` is present.
pub fn standards_in(lines: &[String]) -> Vec<&'static str> {
    let found: Vec<&'static str> = STANDARD_SPELLINGS
        .iter()
        .copied()
        .filter(|spelling| lines.iter().any(|line| line.contains(spelling)))
        .collect();
    if !found.is_empty() {
        return found;
    }

    let joined = lines.join("\n");
    match GCC_BANNER.captures(&joined).and_then(|caps| caps.get(1)) {
        Some(version) => {
            if compare_versions(CXX14_DEFAULT_GCC, version.as_str()) == Ordering::Less {
                vec!["c++14"]
            } else {
                vec!["c++03"]
            }
        }
        None => Vec::new(),
    }
}

/// Map spellings onto normalized standards and keep the oldest.
pub fn oldest_standard(spellings: &[&str]) -> Option<&'static str> {
    spellings.iter().filter_map(|s| standard_rank(s)).min().map(|rank| STANDARD_NAMES[rank])
}

fn standard_rank(spelling: &str) -> Option<usize> {
    let suffix = spelling.get(spelling.len().saturating_sub(2)..)?;
    match suffix {
        "98" => Some(0),
        "03" => Some(1),
        "0x" | "11" => Some(2),
        "14" | "1y" => Some(3),
        "17" | "1z" => Some(4),
        "2a" => Some(5),
        _ => None,
    }
}

/// Compare dotted numeric versions component by component; missing
/// components count as zero, trailing non-digits are ignored.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| {
                let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().unwrap_or(0)
            })
            .collect()
    };
    let (left, right) = (parse(a), parse(b));
    let len = left.len().max(right.len());
    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
