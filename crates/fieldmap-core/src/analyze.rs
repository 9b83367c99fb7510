//! Position comparison and layout analysis.
//!
//! Diffs a freshly extracted position set against a reference set for the
//! same template, scores placement accuracy, and flags layout problems
//! (overlapping boxes, fields packed too tightly). Pure functions over the
//! model types; nothing here touches a document.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::model::{FieldPosition, PositionSet};

/// Thresholds for the comparator. Millimeter units throughout.
#[derive(Clone, Copy, Debug)]
pub struct CompareOptions {
    /// Largest per-axis delta still counted as a match.
    pub tolerance_mm: f64,
    /// Two boxes must intersect deeper than this on both axes to be
    /// reported as overlapping.
    pub overlap_buffer_mm: f64,
    /// Minimum vertical gap between stacked fields on a page.
    pub min_spacing_mm: f64,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            tolerance_mm: 1.0,
            overlap_buffer_mm: 2.0,
            min_spacing_mm: 3.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonStatus {
    Matched,
    Misaligned,
    Missing,
    Extra,
}

impl fmt::Display for ComparisonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComparisonStatus::Matched => "matched",
            ComparisonStatus::Misaligned => "misaligned",
            ComparisonStatus::Missing => "missing",
            ComparisonStatus::Extra => "extra",
        };
        f.write_str(s)
    }
}

/// One field's verdict. `delta` is `(actual - expected)` per axis and is
/// present whenever the field exists in both sets.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonEntry {
    pub field_name: String,
    pub status: ComparisonStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<FieldPosition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<FieldPosition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<(f64, f64)>,
}

/// Two fields whose boxes intersect on the same page.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Overlap {
    pub field_a: String,
    pub field_b: String,
    pub page: u32,
}

/// Two vertically stacked fields closer than the minimum gap.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpacingViolation {
    pub field_a: String,
    pub field_b: String,
    pub page: u32,
    pub gap_mm: f64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonReport {
    pub template_id: String,
    pub entries: Vec<ComparisonEntry>,
    pub matched: usize,
    pub misaligned: usize,
    pub missing: usize,
    pub extra: usize,
    /// `matched / (matched + misaligned + missing)`; extra fields are
    /// reported but never penalize. An empty reference scores 1.0.
    pub accuracy: f64,
    pub overlaps: Vec<Overlap>,
    pub spacing_violations: Vec<SpacingViolation>,
    /// Mean `(dx, dy)` over same-page misaligned fields. Advisory input for
    /// adjustment tooling, never applied here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_correction: Option<(f64, f64)>,
}

impl ComparisonReport {
    /// One line per field plus a closing tally, for terminal review.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.entries.len() + 1);
        for entry in &self.entries {
            match entry.delta {
                Some((dx, dy)) => lines.push(format!(
                    "{}: {} (dx {:+.2}mm, dy {:+.2}mm)",
                    entry.field_name, entry.status, dx, dy
                )),
                None => lines.push(format!("{}: {}", entry.field_name, entry.status)),
            }
        }
        lines.push(format!(
            "accuracy {:.1}% ({} matched, {} misaligned, {} missing, {} extra)",
            self.accuracy * 100.0,
            self.matched,
            self.misaligned,
            self.missing,
            self.extra
        ));
        lines
    }
}

/// Compares `actual` (extracted) against `expected` (reference), walking the
/// union of field names. Overlap and spacing checks run over `actual`, the
/// geometry that would land on paper.
pub fn compare(
    actual: &PositionSet,
    expected: &PositionSet,
    options: &CompareOptions,
) -> ComparisonReport {
    let names: BTreeSet<&String> = expected
        .fields
        .keys()
        .chain(actual.fields.keys())
        .collect();

    let mut entries = Vec::with_capacity(names.len());
    let (mut matched, mut misaligned, mut missing, mut extra) = (0usize, 0usize, 0usize, 0usize);
    let mut drift: Vec<(f64, f64)> = Vec::new();

    for name in names {
        let entry = match (expected.get(name), actual.get(name)) {
            (Some(exp), Some(act)) => {
                let dx = act.x - exp.x;
                let dy = act.y - exp.y;
                let same_page = act.page == exp.page;
                let status = if same_page && dx.abs().max(dy.abs()) <= options.tolerance_mm {
                    matched += 1;
                    ComparisonStatus::Matched
                } else {
                    misaligned += 1;
                    if same_page {
                        drift.push((dx, dy));
                    }
                    ComparisonStatus::Misaligned
                };
                ComparisonEntry {
                    field_name: name.clone(),
                    status,
                    expected: Some(exp.clone()),
                    actual: Some(act.clone()),
                    delta: Some((dx, dy)),
                }
            }
            (Some(exp), None) => {
                missing += 1;
                ComparisonEntry {
                    field_name: name.clone(),
                    status: ComparisonStatus::Missing,
                    expected: Some(exp.clone()),
                    actual: None,
                    delta: None,
                }
            }
            (None, Some(act)) => {
                extra += 1;
                ComparisonEntry {
                    field_name: name.clone(),
                    status: ComparisonStatus::Extra,
                    expected: None,
                    actual: Some(act.clone()),
                    delta: None,
                }
            }
            (None, None) => unreachable!("name came from one of the sets"),
        };
        entries.push(entry);
    }

    let scored = matched + misaligned + missing;
    let accuracy = if scored == 0 {
        1.0
    } else {
        matched as f64 / scored as f64
    };

    let suggested_correction = if drift.is_empty() {
        None
    } else {
        let n = drift.len() as f64;
        let (sx, sy) = drift
            .iter()
            .fold((0.0, 0.0), |(ax, ay), (dx, dy)| (ax + dx, ay + dy));
        Some((sx / n, sy / n))
    };

    ComparisonReport {
        template_id: actual.template_id.clone(),
        entries,
        matched,
        misaligned,
        missing,
        extra,
        accuracy,
        overlaps: detect_overlaps(actual, options.overlap_buffer_mm),
        spacing_violations: detect_spacing_violations(actual, options.min_spacing_mm),
        suggested_correction,
    }
}

/// Page-scoped pairwise scan. Two boxes are overlapping when their
/// intersection is deeper than `buffer_mm` on both axes, so fields that
/// merely touch or share an edge stay quiet.
pub fn detect_overlaps(set: &PositionSet, buffer_mm: f64) -> Vec<Overlap> {
    let mut overlaps = Vec::new();
    for page in set.pages() {
        let fields = set.fields_on_page(page);
        for i in 0..fields.len() {
            for j in (i + 1)..fields.len() {
                let (name_a, a) = fields[i];
                let (name_b, b) = fields[j];
                let depth_x = a.right().min(b.right()) - a.x.max(b.x);
                let depth_y = a.bottom().min(b.bottom()) - a.y.max(b.y);
                if depth_x > buffer_mm && depth_y > buffer_mm {
                    overlaps.push(Overlap {
                        field_a: name_a.clone(),
                        field_b: name_b.clone(),
                        page,
                    });
                }
            }
        }
    }
    overlaps
}

/// Flags consecutive fields (per page, top to bottom) whose vertical gap is
/// under `min_gap_mm`. Pairs that actually intersect are the overlap
/// detector's business and are not repeated here.
pub fn detect_spacing_violations(set: &PositionSet, min_gap_mm: f64) -> Vec<SpacingViolation> {
    let mut violations = Vec::new();
    for page in set.pages() {
        let mut fields = set.fields_on_page(page);
        fields.sort_by(|(name_a, a), (name_b, b)| {
            a.y.partial_cmp(&b.y)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| name_a.cmp(name_b))
        });
        for pair in fields.windows(2) {
            let (name_a, a) = pair[0];
            let (name_b, b) = pair[1];
            let gap = b.y - a.bottom();
            if (0.0..min_gap_mm).contains(&gap) {
                violations.push(SpacingViolation {
                    field_a: name_a.clone(),
                    field_b: name_b.clone(),
                    page,
                    gap_mm: gap,
                });
            }
        }
    }
    violations
}
