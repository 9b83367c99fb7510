//! Filled-document rendering.
//!
//! Two paths produce the same kind of output. When the source document is
//! parseable, an overlay content stream is appended to each page so the
//! original artwork survives untouched. When only rasterized backgrounds
//! exist, a fresh document is assembled with one full-page image per page
//! and the same overlay drawn on top.
//!
//! Values with no stored position, and positions with no supplied value,
//! are skipped without error; only a position pointing past the end of the
//! document fails the whole render.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use tracing::debug;

use crate::coords::{self, MM_PER_PT};
use crate::error::RenderError;
use crate::extract::page_dimensions_pt;
use crate::model::{FieldPosition, FieldType, FieldValue, FontStyle, PositionSet};

/// Average Helvetica advance as a fraction of the font size, used to fit
/// characters into a field box without measuring glyphs.
const AVG_GLYPH_WIDTH_EM: f64 = 0.5;

/// Line leading as a multiple of the font size.
const LINE_SPACING: f64 = 1.2;

/// Baseline offset below the field's top edge, as a fraction of font size.
const BASELINE_DROP: f64 = 0.8;

const DATE_OUTPUT_FORMAT: &str = "%m/%d/%Y";
const DATE_INPUT_FORMAT: &str = "%Y-%m-%d";

/// ZapfDingbats check mark glyph.
const CHECK_MARK: &str = "4";

const MAX_PARENT_DEPTH: usize = 16;

/// Counts reported back to the caller after a render.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FillStats {
    pub filled: usize,
    pub skipped: usize,
}

/// Draws the supplied values onto the source document's own pages.
///
/// Returns the saved document bytes. Fails fast with `InvalidPageRef` if any
/// value-bearing position points beyond the document's last page.
pub fn overlay_on_source(
    source: &[u8],
    positions: &PositionSet,
    values: &BTreeMap<String, FieldValue>,
) -> Result<(Vec<u8>, FillStats), RenderError> {
    let mut doc =
        Document::load_mem(source).map_err(|e| RenderError::Unreadable(e.to_string()))?;
    let pages = doc.get_pages();
    let page_count = pages.len() as u32;
    check_page_refs(positions, values, page_count)?;

    let mut stats = FillStats::default();
    let mut staged: Vec<(ObjectId, String)> = Vec::new();
    for (&page_num, &page_id) in &pages {
        let (_, page_height_pt) = page_dimensions_pt(&doc, page_id);
        let ops = page_ops(positions, values, page_num, page_height_pt, &mut stats);
        if !ops.is_empty() {
            staged.push((page_id, ops));
        }
    }
    stats.skipped = positions.len() - stats.filled;

    if !staged.is_empty() {
        let fonts = register_overlay_fonts(&mut doc);
        for (page_id, ops) in staged {
            append_page_content(&mut doc, page_id, ops);
            ensure_overlay_fonts(&mut doc, page_id, &fonts);
        }
    }

    Ok((save_document(&mut doc)?, stats))
}

/// Assembles a new document from per-page background images, then draws the
/// supplied values on top.
///
/// The page count is the highest page carrying either a background or a
/// value-bearing position; every page up to it needs a background image.
/// Page sizes come from `page_sizes_mm` (page 1 first) and default to A4.
pub fn build_from_backgrounds(
    backgrounds: &BTreeMap<u32, PathBuf>,
    page_sizes_mm: &[(f64, f64)],
    positions: &PositionSet,
    values: &BTreeMap<String, FieldValue>,
) -> Result<(Vec<u8>, FillStats), RenderError> {
    let last_needed = positions
        .iter()
        .filter(|(name, _)| values.contains_key(name.as_str()))
        .map(|(_, p)| p.page)
        .max()
        .unwrap_or(0);
    let last_background = backgrounds.keys().max().copied().unwrap_or(0);
    let page_count = last_needed.max(last_background);
    if page_count == 0 {
        return Err(RenderError::MissingBackground(1));
    }

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let fonts = register_overlay_fonts(&mut doc);
    let mut stats = FillStats::default();
    let mut page_ids = Vec::new();

    for page in 1..=page_count {
        let path = backgrounds
            .get(&page)
            .ok_or(RenderError::MissingBackground(page))?;
        let image = load_background(path)?;
        let image_id = image_xobject(&mut doc, &image)?;

        let (width_mm, height_mm) = page_sizes_mm
            .get((page - 1) as usize)
            .copied()
            .unwrap_or((coords::A4_WIDTH_MM, coords::A4_HEIGHT_MM));
        let width_pt = coords::mm_to_pt(width_mm);
        let height_pt = coords::mm_to_pt(height_mm);

        let image_name = format!("Im{}", page);
        let mut content = format!(
            "q\n{:.2} 0 0 {:.2} 0 0 cm\n/{} Do\nQ\n",
            width_pt, height_pt, image_name
        );
        content.push_str(&page_ops(positions, values, page, height_pt, &mut stats));
        let content_id = doc.add_object(Object::Stream(Stream::new(
            Dictionary::new(),
            content.into_bytes(),
        )));

        let mut xobjects = Dictionary::new();
        xobjects.set(image_name, Object::Reference(image_id));
        let resources = dictionary! {
            "XObject" => Object::Dictionary(xobjects),
            "Font" => Object::Dictionary(fonts.font_dictionary()),
        };

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(pages_id),
            "MediaBox" => vec![
                0.into(),
                0.into(),
                Object::Real(width_pt as f32),
                Object::Real(height_pt as f32),
            ],
            "Resources" => Object::Dictionary(resources),
            "Contents" => Object::Reference(content_id),
        });
        page_ids.push(page_id);
    }
    stats.skipped = positions.len() - stats.filled;

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => Object::Array(page_ids.iter().map(|&id| Object::Reference(id)).collect()),
            "Count" => Object::Integer(page_count as i64),
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => Object::Reference(pages_id),
    });
    doc.trailer.set("Root", Object::Reference(catalog_id));

    Ok((save_document(&mut doc)?, stats))
}

fn save_document(doc: &mut Document) -> Result<Vec<u8>, RenderError> {
    let mut output = Vec::new();
    doc.save_to(&mut output).map_err(|e| {
        RenderError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    })?;
    Ok(output)
}

fn check_page_refs(
    positions: &PositionSet,
    values: &BTreeMap<String, FieldValue>,
    page_count: u32,
) -> Result<(), RenderError> {
    for (name, position) in positions.iter() {
        if values.contains_key(name.as_str())
            && (position.page < 1 || position.page > page_count)
        {
            return Err(RenderError::InvalidPageRef {
                page: position.page,
                page_count,
            });
        }
    }
    Ok(())
}

/// Overlay operators for every drawable field on one page. Increments
/// `stats.filled` per field that produced ink.
fn page_ops(
    positions: &PositionSet,
    values: &BTreeMap<String, FieldValue>,
    page: u32,
    page_height_pt: f64,
    stats: &mut FillStats,
) -> String {
    let mut ops = String::new();
    for (name, position) in positions.fields_on_page(page) {
        let Some(value) = values.get(name.as_str()) else {
            debug!(field = %name, page, "no value supplied, field skipped");
            continue;
        };
        match field_ops(position, value, page_height_pt) {
            Some(field) => {
                ops.push_str(&field);
                stats.filled += 1;
            }
            None => debug!(field = %name, page, "value produced no ink, field skipped"),
        }
    }
    ops
}

/// Operators for a single field, or `None` when the value draws nothing
/// (empty text, falsy checkbox).
fn field_ops(position: &FieldPosition, value: &FieldValue, page_height_pt: f64) -> Option<String> {
    let x_pt = coords::mm_to_pt(position.x);
    let top_pt = page_height_pt - coords::mm_to_pt(position.y);
    let size = position.font_size_pt;
    let baseline = top_pt - size * BASELINE_DROP;
    let font = font_resource(position.font_style);

    match position.field_type {
        FieldType::Checkbox => {
            if !value.is_truthy() {
                return None;
            }
            Some(show_text("FmZapf", size, x_pt, baseline, CHECK_MARK))
        }
        FieldType::Textarea => {
            let text = plain_text(value);
            if text.trim().is_empty() {
                return None;
            }
            let limit = max_line_chars(position.width, size);
            let max_lines = max_wrapped_lines(position.height, size);
            let lines = wrap_words(&text, limit, max_lines);
            Some(show_lines(font, size, x_pt, baseline, &lines))
        }
        FieldType::Date => {
            let text = date_text(value);
            if text.is_empty() {
                return None;
            }
            Some(show_text(font, size, x_pt, baseline, &text))
        }
        FieldType::Number => {
            let text = number_text(value);
            if text.is_empty() {
                return None;
            }
            Some(show_text(font, size, x_pt, baseline, &text))
        }
        FieldType::Text | FieldType::Select | FieldType::Signature => {
            let text = plain_text(value);
            if text.trim().is_empty() {
                return None;
            }
            let clipped = clip_chars(&text, max_line_chars(position.width, size));
            Some(show_text(font, size, x_pt, baseline, &clipped))
        }
    }
}

fn show_text(font: &str, size: f64, x: f64, baseline: f64, text: &str) -> String {
    format!(
        "q\nBT\n/{} {:.1} Tf\n0 0 0 rg\n{:.2} {:.2} Td\n({}) Tj\nET\nQ\n",
        font,
        size,
        x,
        baseline,
        escape_text(text)
    )
}

fn show_lines(font: &str, size: f64, x: f64, baseline: f64, lines: &[String]) -> String {
    let leading = size * LINE_SPACING;
    let mut ops = format!(
        "q\nBT\n/{} {:.1} Tf\n0 0 0 rg\n{:.2} {:.2} Td\n",
        font, size, x, baseline
    );
    for (index, line) in lines.iter().enumerate() {
        if index > 0 {
            ops.push_str(&format!("0 {:.2} Td\n", -leading));
        }
        ops.push_str(&format!("({}) Tj\n", escape_text(line)));
    }
    ops.push_str("ET\nQ\n");
    ops
}

fn font_resource(style: FontStyle) -> &'static str {
    match style {
        FontStyle::None => "FmHelv",
        FontStyle::Bold => "FmHelvB",
        FontStyle::Italic => "FmHelvO",
    }
}

/// Escapes a string for a PDF literal string in a content stream. The
/// overlay fonts use the standard Latin set, so anything outside ASCII is
/// replaced rather than mis-encoded.
fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 4);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '(' => out.push_str("\\("),
            ')' => out.push_str("\\)"),
            '\n' | '\r' | '\t' => out.push(' '),
            c if (c as u32) < 0x80 => out.push(c),
            _ => out.push('?'),
        }
    }
    out
}

fn plain_text(value: &FieldValue) -> String {
    match value {
        FieldValue::Text(s) => s.clone(),
        FieldValue::Number(n) => number_string(*n),
        FieldValue::Bool(b) => if *b { "Yes" } else { "No" }.to_string(),
        FieldValue::Date(d) => d.format(DATE_OUTPUT_FORMAT).to_string(),
    }
}

/// Date fields render one fixed format; ISO text re-parses into it, any
/// other text passes through verbatim.
fn date_text(value: &FieldValue) -> String {
    match value {
        FieldValue::Date(d) => d.format(DATE_OUTPUT_FORMAT).to_string(),
        FieldValue::Text(s) => NaiveDate::parse_from_str(s, DATE_INPUT_FORMAT)
            .map(|d| d.format(DATE_OUTPUT_FORMAT).to_string())
            .unwrap_or_else(|_| s.clone()),
        other => plain_text(other),
    }
}

/// Number fields draw the value as given, no locale formatting.
fn number_text(value: &FieldValue) -> String {
    match value {
        FieldValue::Number(n) => number_string(*n),
        FieldValue::Text(s) => s.clone(),
        other => plain_text(other),
    }
}

fn number_string(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn clip_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

fn max_line_chars(width_mm: f64, font_size_pt: f64) -> usize {
    let glyph_mm = font_size_pt * MM_PER_PT * AVG_GLYPH_WIDTH_EM;
    ((width_mm / glyph_mm).floor() as usize).max(1)
}

fn max_wrapped_lines(height_mm: f64, font_size_pt: f64) -> usize {
    let line_mm = font_size_pt * MM_PER_PT * LINE_SPACING;
    ((height_mm / line_mm).floor() as usize).max(1)
}

/// Greedy word wrap into at most `max_lines` lines of `limit` characters.
/// Words longer than a line are hard-split; overflow past the last line is
/// dropped.
fn wrap_words(text: &str, limit: usize, max_lines: usize) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    'words: for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while !word.is_empty() {
            let sep = usize::from(current_len > 0);
            if current_len + sep + word.len() <= limit {
                if sep == 1 {
                    current.push(' ');
                }
                current.extend(word.iter());
                current_len += sep + word.len();
                continue 'words;
            }
            if current_len == 0 {
                let head: String = word[..limit].iter().collect();
                word.drain(..limit);
                lines.push(head);
            } else {
                lines.push(std::mem::take(&mut current));
                current_len = 0;
            }
            if lines.len() == max_lines {
                return lines;
            }
        }
    }
    if current_len > 0 {
        lines.push(current);
    }
    lines
}

struct OverlayFonts {
    helv: ObjectId,
    bold: ObjectId,
    oblique: ObjectId,
    zapf: ObjectId,
}

impl OverlayFonts {
    fn entries(&self) -> [(&'static str, ObjectId); 4] {
        [
            ("FmHelv", self.helv),
            ("FmHelvB", self.bold),
            ("FmHelvO", self.oblique),
            ("FmZapf", self.zapf),
        ]
    }

    fn font_dictionary(&self) -> Dictionary {
        let mut fonts = Dictionary::new();
        for (name, id) in self.entries() {
            fonts.set(name, Object::Reference(id));
        }
        fonts
    }
}

fn register_overlay_fonts(doc: &mut Document) -> OverlayFonts {
    let mut add = |base: &str| {
        doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => base,
        })
    };
    let helv = add("Helvetica");
    let bold = add("Helvetica-Bold");
    let oblique = add("Helvetica-Oblique");
    let zapf = add("ZapfDingbats");
    OverlayFonts {
        helv,
        bold,
        oblique,
        zapf,
    }
}

/// Appends an overlay stream to the page's Contents, preserving whatever
/// content arrangement the page already has.
fn append_page_content(doc: &mut Document, page_id: ObjectId, ops: String) {
    let stream_id = doc.add_object(Object::Stream(Stream::new(
        Dictionary::new(),
        ops.into_bytes(),
    )));
    if let Ok(Object::Dictionary(ref mut page_dict)) = doc.get_object_mut(page_id) {
        let contents = match page_dict.get(b"Contents") {
            Ok(Object::Reference(id)) => Object::Array(vec![
                Object::Reference(*id),
                Object::Reference(stream_id),
            ]),
            Ok(Object::Array(existing)) => {
                let mut refs = existing.clone();
                refs.push(Object::Reference(stream_id));
                Object::Array(refs)
            }
            _ => Object::Reference(stream_id),
        };
        page_dict.set("Contents", contents);
    }
}

/// Gives the page its own Resources dictionary (cloning an inherited one if
/// needed) with the overlay fonts merged in. Existing font entries win.
fn ensure_overlay_fonts(doc: &mut Document, page_id: ObjectId, fonts: &OverlayFonts) {
    let mut resources = effective_resources(doc, page_id);
    let mut font_dict = match resources.get(b"Font") {
        Ok(Object::Dictionary(existing)) => existing.clone(),
        Ok(Object::Reference(id)) => doc
            .get_object(*id)
            .ok()
            .and_then(|o| o.as_dict().ok())
            .cloned()
            .unwrap_or_else(Dictionary::new),
        _ => Dictionary::new(),
    };
    for (name, id) in fonts.entries() {
        if font_dict.get(name.as_bytes()).is_err() {
            font_dict.set(name, Object::Reference(id));
        }
    }
    resources.set("Font", Object::Dictionary(font_dict));
    if let Ok(Object::Dictionary(ref mut page_dict)) = doc.get_object_mut(page_id) {
        page_dict.set("Resources", Object::Dictionary(resources));
    }
}

/// The page's effective Resources: its own, or the nearest inherited one up
/// the Parent chain, cloned. Empty when none exists.
fn effective_resources(doc: &Document, page_id: ObjectId) -> Dictionary {
    let mut current = Some(page_id);
    for _ in 0..MAX_PARENT_DEPTH {
        let Some(id) = current else { break };
        let Ok(dict) = doc.get_object(id).and_then(|o| o.as_dict()) else {
            break;
        };
        if let Ok(resources) = dict.get(b"Resources") {
            match resources {
                Object::Dictionary(d) => return d.clone(),
                Object::Reference(resource_id) => {
                    if let Ok(Object::Dictionary(d)) = doc.get_object(*resource_id) {
                        return d.clone();
                    }
                }
                _ => {}
            }
        }
        current = match dict.get(b"Parent") {
            Ok(Object::Reference(parent_id)) => Some(*parent_id),
            _ => None,
        };
    }
    Dictionary::new()
}

struct BackgroundImage {
    width: u32,
    height: u32,
    gray: bool,
    data: Vec<u8>,
}

/// Decodes a background PNG to 8-bit RGB or grayscale samples, dropping any
/// alpha channel.
fn load_background(path: &Path) -> Result<BackgroundImage, RenderError> {
    let file = std::fs::File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            RenderError::Unreadable(format!("background image missing: {}", path.display()))
        } else {
            RenderError::Io(e)
        }
    })?;
    let mut decoder = png::Decoder::new(file);
    decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
    let mut reader = decoder
        .read_info()
        .map_err(|e| RenderError::Unreadable(format!("{}: {}", path.display(), e)))?;
    let mut buf = vec![0u8; reader.output_buffer_size()];
    let info = reader
        .next_frame(&mut buf)
        .map_err(|e| RenderError::Unreadable(format!("{}: {}", path.display(), e)))?;
    buf.truncate(info.buffer_size());

    let (data, gray) = match info.color_type {
        png::ColorType::Rgb => (buf, false),
        png::ColorType::Rgba => (drop_alpha(&buf, 4, 3), false),
        png::ColorType::Grayscale => (buf, true),
        png::ColorType::GrayscaleAlpha => (drop_alpha(&buf, 2, 1), true),
        // EXPAND resolves indexed data to RGB before we see it.
        png::ColorType::Indexed => (buf, false),
    };
    Ok(BackgroundImage {
        width: info.width,
        height: info.height,
        gray,
        data,
    })
}

fn drop_alpha(buf: &[u8], stride: usize, keep: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(buf.len() / stride * keep);
    for pixel in buf.chunks_exact(stride) {
        out.extend_from_slice(&pixel[..keep]);
    }
    out
}

fn image_xobject(doc: &mut Document, image: &BackgroundImage) -> Result<ObjectId, RenderError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&image.data)?;
    let compressed = encoder.finish()?;

    let dict = dictionary! {
        "Type" => "XObject",
        "Subtype" => "Image",
        "Width" => Object::Integer(image.width as i64),
        "Height" => Object::Integer(image.height as i64),
        "ColorSpace" => if image.gray { "DeviceGray" } else { "DeviceRGB" },
        "BitsPerComponent" => Object::Integer(8),
        "Filter" => "FlateDecode",
    };
    Ok(doc.add_object(Object::Stream(Stream::new(dict, compressed))))
}
