//! Coordinate conversion between PDF user space and storage space.
//!
//! PDF user space puts the origin at the bottom-left of the page with y
//! increasing upward, in points (1/72 inch). Position files store millimeters
//! from the top-left with y increasing downward, which is how the authoring
//! tools and the comparison reports think about a page.
//!
//! Pure arithmetic, no I/O, no error conditions.

/// Millimeters per PDF point, at the precision the position files use.
pub const MM_PER_PT: f64 = 0.352_778;

/// US Letter page size in points.
pub const LETTER_WIDTH_PT: f64 = 612.0;
pub const LETTER_HEIGHT_PT: f64 = 792.0;

/// A4 page size in points and millimeters.
pub const A4_WIDTH_PT: f64 = 595.28;
pub const A4_HEIGHT_PT: f64 = 841.89;
pub const A4_WIDTH_MM: f64 = 210.0;
pub const A4_HEIGHT_MM: f64 = 297.0;

/// Converts a length in points to millimeters.
#[inline]
pub fn pt_to_mm(pt: f64) -> f64 {
    pt * MM_PER_PT
}

/// Converts a length in millimeters to points.
#[inline]
pub fn mm_to_pt(mm: f64) -> f64 {
    mm / MM_PER_PT
}

/// Converts a point in PDF user space (origin bottom-left, y-up, points) to
/// storage space (origin top-left, y-down, millimeters).
///
/// `page_height_pt` is the height of the page the point sits on.
pub fn to_storage(pdf_x: f64, pdf_y: f64, page_height_pt: f64) -> (f64, f64) {
    (pt_to_mm(pdf_x), pt_to_mm(page_height_pt - pdf_y))
}

/// Converts a point in storage space (top-left, y-down, millimeters) back to
/// PDF user space (bottom-left, y-up, points). Exact inverse of
/// [`to_storage`].
pub fn to_source(x_mm: f64, y_mm: f64, page_height_pt: f64) -> (f64, f64) {
    (mm_to_pt(x_mm), page_height_pt - mm_to_pt(y_mm))
}
