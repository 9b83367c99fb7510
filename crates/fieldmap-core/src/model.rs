//! Data model for field positions, value maps, and engine results.
//!
//! All geometry here is in storage space: millimeters from the top-left of
//! the page, y increasing downward. Conversion to and from PDF user space
//! happens at the extraction and rendering boundaries (see [`crate::coords`]).

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Font size applied when a position file omits one.
pub const DEFAULT_FONT_SIZE_PT: f64 = 9.0;

/// The kind of a form field. Governs how a bound value is drawn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Textarea,
    Checkbox,
    Date,
    Number,
    Select,
    Signature,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Textarea => "textarea",
            FieldType::Checkbox => "checkbox",
            FieldType::Date => "date",
            FieldType::Number => "number",
            FieldType::Select => "select",
            FieldType::Signature => "signature",
        }
    }
}

impl Default for FieldType {
    fn default() -> Self {
        FieldType::Text
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(FieldType::Text),
            "textarea" => Ok(FieldType::Textarea),
            "checkbox" => Ok(FieldType::Checkbox),
            "date" => Ok(FieldType::Date),
            "number" => Ok(FieldType::Number),
            "select" => Ok(FieldType::Select),
            "signature" => Ok(FieldType::Signature),
            other => Err(format!("Unknown field type: {}", other)),
        }
    }
}

/// Font style for drawn text. Maps onto the standard-14 Helvetica family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FontStyle {
    None,
    Bold,
    Italic,
}

impl Default for FontStyle {
    fn default() -> Self {
        FontStyle::None
    }
}

impl FontStyle {
    /// Standard-14 font name for this style.
    pub fn font_name(&self) -> &'static str {
        match self {
            FontStyle::None => "Helvetica",
            FontStyle::Bold => "Helvetica-Bold",
            FontStyle::Italic => "Helvetica-Oblique",
        }
    }
}

fn default_font_size() -> f64 {
    DEFAULT_FONT_SIZE_PT
}

/// Geometry and rendering attributes for one field on one page.
///
/// `x`/`y` are the top-left corner of the field box in storage millimeters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldPosition {
    pub page: u32,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default = "default_font_size")]
    pub font_size_pt: f64,
    #[serde(default)]
    pub font_style: FontStyle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl FieldPosition {
    /// A text position with default font attributes.
    pub fn new(page: u32, x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            page,
            x,
            y,
            width,
            height,
            field_type: FieldType::default(),
            font_size_pt: DEFAULT_FONT_SIZE_PT,
            font_style: FontStyle::default(),
            label: None,
        }
    }

    pub fn with_type(mut self, field_type: FieldType) -> Self {
        self.field_type = field_type;
        self
    }

    /// Right edge in storage millimeters.
    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    /// Bottom edge in storage millimeters (larger y is lower on the page).
    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    fn validate(&self, name: &str, page_count: u32) -> Result<(), ValidationError> {
        if self.width <= 0.0 || self.height <= 0.0 {
            return Err(ValidationError::NonPositiveSize {
                field: name.to_string(),
            });
        }
        if self.page < 1 || self.page > page_count {
            return Err(ValidationError::PageOutOfRange {
                field: name.to_string(),
                page: self.page,
                page_count,
            });
        }
        Ok(())
    }
}

/// The stored mapping from field name to position for one template.
///
/// Field names are unique by construction. Created by the extractor or
/// authored by hand, persisted by the store, consumed read-only by the
/// renderer and the analyzer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionSet {
    pub template_id: String,
    pub fields: BTreeMap<String, FieldPosition>,
}

impl PositionSet {
    pub fn new(template_id: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, position: FieldPosition) {
        self.fields.insert(name.into(), position);
    }

    pub fn get(&self, name: &str) -> Option<&FieldPosition> {
        self.fields.get(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldPosition)> {
        self.fields.iter()
    }

    /// Fields on the given 1-based page, in name order.
    pub fn fields_on_page(&self, page: u32) -> Vec<(&String, &FieldPosition)> {
        self.fields.iter().filter(|(_, p)| p.page == page).collect()
    }

    /// Distinct pages referenced by this set, ascending.
    pub fn pages(&self) -> Vec<u32> {
        let mut pages: Vec<u32> = self.fields.values().map(|p| p.page).collect();
        pages.sort_unstable();
        pages.dedup();
        pages
    }

    /// Checks every position against the size invariant and the document's
    /// page count. Returns the first violation found, in field-name order.
    pub fn validate_against(&self, page_count: u32) -> Result<(), ValidationError> {
        for (name, position) in &self.fields {
            position.validate(name, page_count)?;
        }
        Ok(())
    }
}

/// A value bound to a field name in a fill request.
///
/// Untagged so plain JSON scalars deserialize naturally: `true` becomes
/// `Bool`, `42` becomes `Number`, `"2024-03-01"` becomes `Date`, and any
/// other string becomes `Text`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Date(NaiveDate),
    Text(String),
}

impl FieldValue {
    /// Whether a checkbox bound to this value gets a mark.
    pub fn is_truthy(&self) -> bool {
        match self {
            FieldValue::Bool(b) => *b,
            FieldValue::Number(n) => *n != 0.0,
            FieldValue::Text(s) => matches!(s.as_str(), "1" | "true" | "yes"),
            FieldValue::Date(_) => false,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

/// A request to render a filled document for one template.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FillRequest {
    pub template_id: String,
    pub values: BTreeMap<String, FieldValue>,
    pub output_path: PathBuf,
}

/// What the renderer produced, with counts for the caller's logs.
#[derive(Clone, Debug, Serialize)]
pub struct FillOutcome {
    pub output_path: PathBuf,
    pub page_count: u32,
    pub bytes_written: u64,
    pub fields_filled: usize,
    pub fields_skipped: usize,
}

/// Everything the extractor learned about a source document.
///
/// `background_images` is populated only on the no-form-fields fallback
/// path; `page_sizes_mm` is indexed by page order (page 1 first).
#[derive(Clone, Debug, Serialize)]
pub struct ExtractionResult {
    pub fields: PositionSet,
    pub background_images: BTreeMap<u32, PathBuf>,
    pub page_count: u32,
    pub page_sizes_mm: Vec<(f64, f64)>,
}

impl ExtractionResult {
    pub fn has_fields(&self) -> bool {
        !self.fields.is_empty()
    }

    /// True when extraction fell back to rasterized backgrounds.
    pub fn used_fallback(&self) -> bool {
        !self.background_images.is_empty()
    }
}
