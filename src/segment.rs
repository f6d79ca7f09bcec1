//! Rule-based business segments from (r, fm) score codes

use crate::scoring::ScoredRecord;
use log::warn;
use regex::{NoExpand, Regex};
use serde::{Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;

/// Ordered (pattern, label) rules. Every rule is applied, in this order, to
/// the output of the previous one.
pub const SEGMENT_RULES: [(&str, &str); 11] = [
    ("22", "hibernating"),
    ("[1-2][1-2]", "lost"),
    ("15", "can't lose"),
    ("[1-2][3-5]", "at risk"),
    ("3[1-2]", "about to sleep"),
    ("33", "need attention"),
    ("55", "champions"),
    ("[3-5][4-5]", "loyal customers"),
    ("41", "promising"),
    ("51", "new customers"),
    ("[4-5][2-3]", "potential loyalists"),
];

/// Combined frequency/monetary score, truncated toward zero.
pub fn fm_score(f: u8, m: u8) -> u8 {
    (f + m) / 2
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    Hibernating,
    Lost,
    CantLose,
    AtRisk,
    AboutToSleep,
    NeedAttention,
    Champions,
    LoyalCustomers,
    Promising,
    NewCustomers,
    PotentialLoyalists,
    /// A code no rule rewrote; carries the raw code
    Unclassified(String),
}

impl Segment {
    pub fn label(&self) -> &str {
        match self {
            Segment::Hibernating => "hibernating",
            Segment::Lost => "lost",
            Segment::CantLose => "can't lose",
            Segment::AtRisk => "at risk",
            Segment::AboutToSleep => "about to sleep",
            Segment::NeedAttention => "need attention",
            Segment::Champions => "champions",
            Segment::LoyalCustomers => "loyal customers",
            Segment::Promising => "promising",
            Segment::NewCustomers => "new customers",
            Segment::PotentialLoyalists => "potential loyalists",
            Segment::Unclassified(code) => code,
        }
    }

    /// Map a label back to its segment; unknown labels are unclassified
    pub fn from_label(label: &str) -> Self {
        match label {
            "hibernating" => Segment::Hibernating,
            "lost" => Segment::Lost,
            "can't lose" => Segment::CantLose,
            "at risk" => Segment::AtRisk,
            "about to sleep" => Segment::AboutToSleep,
            "need attention" => Segment::NeedAttention,
            "champions" => Segment::Champions,
            "loyal customers" => Segment::LoyalCustomers,
            "promising" => Segment::Promising,
            "new customers" => Segment::NewCustomers,
            "potential loyalists" => Segment::PotentialLoyalists,
            other => Segment::Unclassified(other.to_string()),
        }
    }

    pub fn is_classified(&self) -> bool {
        !matches!(self, Segment::Unclassified(_))
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for Segment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentedRecord {
    pub scored: ScoredRecord,
    pub segment: Segment,
}

/// Compiled segment rule table
#[derive(Debug, Clone)]
pub struct SegmentClassifier {
    rules: Vec<(Regex, &'static str)>,
}

impl SegmentClassifier {
    pub fn new() -> crate::Result<Self> {
        let rules = SEGMENT_RULES
            .iter()
            .map(|(pattern, label)| -> crate::Result<(Regex, &'static str)> {
                Ok((Regex::new(pattern)?, *label))
            })
            .collect::<crate::Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Resolve the `"{r}{fm}"` code through every rule in sequence.
    pub fn classify(&self, r: u8, fm: u8) -> Segment {
        let code = self
            .rules
            .iter()
            .fold(format!("{r}{fm}"), |code, (pattern, label)| {
                pattern.replace_all(&code, NoExpand(*label)).into_owned()
            });
        Segment::from_label(&code)
    }

    /// Attach a segment to every scored record.
    ///
    /// Codes left unclassified are kept with their raw code and reported
    /// once each.
    pub fn classify_all(&self, records: Vec<ScoredRecord>) -> Vec<SegmentedRecord> {
        let mut unmapped = BTreeSet::new();
        let segmented = records
            .into_iter()
            .map(|scored| {
                let segment = self.classify(scored.scores.r, scored.scores.fm);
                if let Segment::Unclassified(code) = &segment {
                    unmapped.insert(code.clone());
                }
                SegmentedRecord { scored, segment }
            })
            .collect();
        for code in unmapped {
            warn!("Score code {} matched no segment rule", code);
        }
        segmented
    }
}
