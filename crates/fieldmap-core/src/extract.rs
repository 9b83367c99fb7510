//! Position extraction from a source document's interactive form.
//!
//! Walks each page's annotations for form widgets, resolves the owning field
//! dictionary (name chain, inherited type and flags), and normalizes widget
//! rectangles into storage space. Documents with no form at all fall back to
//! per-page background rasterization so positions can be authored by hand
//! against the images.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use lopdf::{Document, Object, ObjectId};
use regex::bytes::Regex;
use tracing::{debug, info, warn};

use crate::coords;
use crate::error::ExtractionError;
use crate::model::{ExtractionResult, FieldPosition, FieldType, FontStyle, PositionSet};
use crate::raster::PageRasterizer;

/// Text-field flag marking a multiline (textarea) field.
const FLAG_MULTILINE: i64 = 1 << 12;

/// Guard against cyclic Parent chains in malformed documents.
const MAX_PARENT_DEPTH: usize = 16;

lazy_static! {
    static ref COUNT_RE: Regex = Regex::new(r"/Count\s+(\d+)").unwrap();
    static ref ENCRYPT_RE: Regex = Regex::new(r"/Encrypt\b").unwrap();
}

/// Deterministic file name for a page's background image.
pub fn background_image_name(template_id: &str, page: u32) -> String {
    format!("{}_page{}_background.png", template_id, page)
}

/// Extracts field positions from `source`, rasterizing page backgrounds into
/// `backgrounds_dir` when the document carries no form fields or cannot be
/// parsed structurally.
///
/// Fatal failures are a missing/corrupt file (`Unreadable`) and encryption
/// (`Encrypted`). Per-page rasterization failures are logged and the page is
/// omitted from the result.
pub fn extract_positions(
    source: &Path,
    template_id: &str,
    backgrounds_dir: &Path,
    rasterizer: &dyn PageRasterizer,
) -> Result<ExtractionResult, ExtractionError> {
    let bytes = fs::read(source)
        .map_err(|e| ExtractionError::Unreadable(format!("{}: {}", source.display(), e)))?;
    if !bytes.starts_with(b"%PDF") {
        return Err(ExtractionError::Unreadable(format!(
            "{}: not a PDF document",
            source.display()
        )));
    }

    match load_document(&bytes) {
        Ok(doc) => {
            let (page_count, page_sizes_mm) = page_geometry(&doc);
            match collect_fields(&doc, template_id) {
                Ok(fields) => {
                    info!(
                        template_id,
                        fields = fields.len(),
                        pages = page_count,
                        "extracted field positions"
                    );
                    Ok(ExtractionResult {
                        fields,
                        background_images: BTreeMap::new(),
                        page_count,
                        page_sizes_mm,
                    })
                }
                Err(ExtractionError::NoFormFields) => {
                    info!(
                        template_id,
                        pages = page_count,
                        "no form fields found, rasterizing page backgrounds"
                    );
                    let background_images = rasterize_pages(
                        source,
                        template_id,
                        page_count,
                        backgrounds_dir,
                        rasterizer,
                    );
                    Ok(ExtractionResult {
                        fields: PositionSet::new(template_id),
                        background_images,
                        page_count,
                        page_sizes_mm,
                    })
                }
                Err(other) => Err(other),
            }
        }
        Err(ExtractionError::Encrypted) => Err(ExtractionError::Encrypted),
        Err(parse_err) => {
            // A real PDF lopdf cannot digest. The page-count probe lets the
            // background fallback still run; without it the document is
            // genuinely unreadable.
            if ENCRYPT_RE.is_match(&bytes) {
                return Err(ExtractionError::Encrypted);
            }
            let Some(page_count) = probe_page_count(&bytes) else {
                return Err(parse_err);
            };
            warn!(
                template_id,
                pages = page_count,
                error = %parse_err,
                "document not parseable, falling back to page backgrounds"
            );
            let background_images =
                rasterize_pages(source, template_id, page_count, backgrounds_dir, rasterizer);
            Ok(ExtractionResult {
                fields: PositionSet::new(template_id),
                background_images,
                page_count,
                page_sizes_mm: Vec::new(),
            })
        }
    }
}

/// Parses the document and rejects encrypted ones.
pub fn load_document(bytes: &[u8]) -> Result<Document, ExtractionError> {
    let doc =
        Document::load_mem(bytes).map_err(|e| ExtractionError::Unreadable(e.to_string()))?;
    if doc.trailer.get(b"Encrypt").is_ok() {
        return Err(ExtractionError::Encrypted);
    }
    Ok(doc)
}

/// Page count and per-page `(width_mm, height_mm)`, in page order.
pub fn page_geometry(doc: &Document) -> (u32, Vec<(f64, f64)>) {
    let pages = doc.get_pages();
    let sizes = pages
        .values()
        .map(|&page_id| {
            let (w_pt, h_pt) = page_dimensions_pt(doc, page_id);
            (coords::pt_to_mm(w_pt), coords::pt_to_mm(h_pt))
        })
        .collect();
    (pages.len() as u32, sizes)
}

/// Collects every named form widget into a position set.
///
/// Returns `NoFormFields` (the non-fatal fallback trigger) when the document
/// has no named widgets at all.
pub fn collect_fields(doc: &Document, template_id: &str) -> Result<PositionSet, ExtractionError> {
    let mut set = PositionSet::new(template_id);

    for (&page_num, &page_id) in &doc.get_pages() {
        let (_, page_height_pt) = page_dimensions_pt(doc, page_id);

        for annot in page_annotations(doc, page_id) {
            if !is_widget(annot) {
                continue;
            }
            let Some(name) = field_name(doc, annot) else {
                debug!(page = page_num, "skipping unnamed widget");
                continue;
            };
            let Some([x1, y1, x2, y2]) = widget_rect(doc, annot) else {
                debug!(field = %name, "skipping widget without a rectangle");
                continue;
            };

            let field_type = field_type_of(doc, annot);
            let height_mm = coords::pt_to_mm(y2 - y1);
            let (x_mm, y_mm) = coords::to_storage(x1, y2, page_height_pt);

            set.insert(
                name,
                FieldPosition {
                    page: page_num,
                    x: x_mm,
                    y: y_mm,
                    width: coords::pt_to_mm(x2 - x1),
                    height: height_mm,
                    field_type,
                    font_size_pt: estimate_font_size(height_mm),
                    font_style: FontStyle::None,
                    label: None,
                },
            );
        }
    }

    if set.is_empty() {
        return Err(ExtractionError::NoFormFields);
    }
    Ok(set)
}

/// Scans raw bytes for page-tree `/Count` entries. The largest value is the
/// root node's total. Used when the document structure cannot be parsed.
pub fn probe_page_count(bytes: &[u8]) -> Option<u32> {
    COUNT_RE
        .captures_iter(bytes)
        .filter_map(|c| {
            std::str::from_utf8(c.get(1)?.as_bytes())
                .ok()?
                .parse::<u32>()
                .ok()
        })
        .max()
        .filter(|&n| n > 0)
}

fn rasterize_pages(
    source: &Path,
    template_id: &str,
    page_count: u32,
    backgrounds_dir: &Path,
    rasterizer: &dyn PageRasterizer,
) -> BTreeMap<u32, PathBuf> {
    let mut images = BTreeMap::new();

    if let Err(e) = fs::create_dir_all(backgrounds_dir) {
        warn!(dir = %backgrounds_dir.display(), error = %e, "cannot create backgrounds directory");
        return images;
    }
    if !rasterizer.is_available() {
        warn!(
            rasterizer = rasterizer.name(),
            "raster tool unavailable, no backgrounds produced"
        );
        return images;
    }

    for page in 1..=page_count {
        let output = backgrounds_dir.join(background_image_name(template_id, page));
        match rasterizer.rasterize_page(source, page, &output) {
            Ok(()) => {
                images.insert(page, output);
            }
            // Page-level isolation: siblings still get their backgrounds.
            Err(e) => warn!(page, error = %e, "page rasterization failed, page omitted"),
        }
    }
    images
}

/// Point size guessed from the box height in storage millimeters, held to
/// the 8-12pt band the templates were authored in.
fn estimate_font_size(height_mm: f64) -> f64 {
    height_mm.trunc().clamp(8.0, 12.0)
}

/// Follows a reference to its target; other objects pass through.
fn resolve<'a>(doc: &'a Document, object: &'a Object) -> &'a Object {
    match object {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(object),
        _ => object,
    }
}

fn as_f64(object: &Object) -> Option<f64> {
    match object {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(*r as f64),
        _ => None,
    }
}

/// Page `MediaBox` in points, resolved through the Parent chain when
/// inherited; US Letter when absent entirely.
pub(crate) fn page_dimensions_pt(doc: &Document, page_id: ObjectId) -> (f64, f64) {
    let mut current = Some(page_id);
    for _ in 0..MAX_PARENT_DEPTH {
        let Some(id) = current else { break };
        let Ok(dict) = doc.get_object(id).and_then(|o| o.as_dict()) else {
            break;
        };
        if let Ok(media_box) = dict.get(b"MediaBox") {
            if let Object::Array(values) = resolve(doc, media_box) {
                if values.len() >= 4 {
                    let nums: Vec<f64> = values
                        .iter()
                        .filter_map(|v| as_f64(resolve(doc, v)))
                        .collect();
                    if nums.len() >= 4 {
                        return ((nums[2] - nums[0]).abs(), (nums[3] - nums[1]).abs());
                    }
                }
            }
        }
        current = match dict.get(b"Parent") {
            Ok(Object::Reference(parent_id)) => Some(*parent_id),
            _ => None,
        };
    }
    (coords::LETTER_WIDTH_PT, coords::LETTER_HEIGHT_PT)
}

/// Annotation dictionaries of a page, references resolved.
fn page_annotations<'a>(doc: &'a Document, page_id: ObjectId) -> Vec<&'a lopdf::Dictionary> {
    let Ok(page_dict) = doc.get_object(page_id).and_then(|o| o.as_dict()) else {
        return Vec::new();
    };
    let Ok(annots) = page_dict.get(b"Annots") else {
        return Vec::new();
    };
    let Object::Array(entries) = resolve(doc, annots) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| resolve(doc, entry).as_dict().ok())
        .collect()
}

fn is_widget(annot: &lopdf::Dictionary) -> bool {
    matches!(annot.get(b"Subtype"), Ok(Object::Name(n)) if n == b"Widget")
}

/// Decodes a PDF text string: UTF-16BE with BOM, else UTF-8, else Latin-1.
fn decode_text(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks(2)
            .filter(|c| c.len() == 2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        if let Ok(s) = String::from_utf16(&units) {
            return s;
        }
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Fully-qualified field name: partial `T` values along the Parent chain
/// joined with `.`, root first. `None` for unnamed widgets.
fn field_name(doc: &Document, annot: &lopdf::Dictionary) -> Option<String> {
    let mut parts = Vec::new();
    let mut current = Some(annot);
    for _ in 0..MAX_PARENT_DEPTH {
        let Some(dict) = current else { break };
        if let Ok(Object::String(bytes, _)) = dict.get(b"T").map(|t| resolve(doc, t)) {
            parts.push(decode_text(bytes));
        }
        current = match dict.get(b"Parent") {
            Ok(Object::Reference(id)) => doc.get_object(*id).and_then(|o| o.as_dict()).ok(),
            _ => None,
        };
    }
    if parts.is_empty() {
        return None;
    }
    parts.reverse();
    Some(parts.join("."))
}

/// Inheritable lookup along the Parent chain.
fn inherited<'a>(
    doc: &'a Document,
    annot: &'a lopdf::Dictionary,
    key: &[u8],
) -> Option<&'a Object> {
    let mut current = Some(annot);
    for _ in 0..MAX_PARENT_DEPTH {
        let dict = current?;
        if let Ok(value) = dict.get(key) {
            return Some(resolve(doc, value));
        }
        current = match dict.get(b"Parent") {
            Ok(Object::Reference(id)) => doc.get_object(*id).and_then(|o| o.as_dict()).ok(),
            _ => None,
        };
    }
    None
}

/// Field kind from the `FT` entry (with inheritance); the multiline flag
/// refines `Tx` into a textarea.
fn field_type_of(doc: &Document, annot: &lopdf::Dictionary) -> FieldType {
    let flags = inherited(doc, annot, b"Ff")
        .and_then(as_f64)
        .map(|f| f as i64)
        .unwrap_or(0);

    match inherited(doc, annot, b"FT") {
        Some(Object::Name(name)) => match name.as_slice() {
            b"Tx" if flags & FLAG_MULTILINE != 0 => FieldType::Textarea,
            b"Tx" => FieldType::Text,
            b"Btn" => FieldType::Checkbox,
            b"Ch" => FieldType::Select,
            b"Sig" => FieldType::Signature,
            _ => FieldType::Text,
        },
        _ => FieldType::Text,
    }
}

/// Widget `Rect` normalized to `[x1, y1, x2, y2]` with x1<=x2, y1<=y2.
fn widget_rect(doc: &Document, annot: &lopdf::Dictionary) -> Option<[f64; 4]> {
    let rect = annot.get(b"Rect").ok()?;
    let Object::Array(values) = resolve(doc, rect) else {
        return None;
    };
    if values.len() < 4 {
        return None;
    }
    let nums: Vec<f64> = values
        .iter()
        .filter_map(|v| as_f64(resolve(doc, v)))
        .collect();
    if nums.len() < 4 {
        return None;
    }
    Some([
        nums[0].min(nums[2]),
        nums[1].min(nums[3]),
        nums[0].max(nums[2]),
        nums[1].max(nums[3]),
    ])
}
