//! PDF form-field position engine.
//!
//! This crate extracts fillable-field geometry from a source document's
//! interactive form, stores it as a page-relative position model, renders
//! key/value data onto documents at those positions, and compares extracted
//! geometry against a reference to score placement accuracy.
//!
//! Positions are stored in top-left-origin millimeters; [`coords`] converts
//! between that space and PDF user-space points. The modules mirror the
//! pipeline: [`extract`] → [`store`] → {[`fill`], [`analyze`]}, with
//! [`raster`] wrapping the external tool used when a document has no form
//! at all.

pub mod analyze;
pub mod coords;
pub mod error;
pub mod extract;
pub mod fill;
pub mod model;
pub mod raster;
pub mod store;

pub use analyze::{
    compare, CompareOptions, ComparisonEntry, ComparisonReport, ComparisonStatus, Overlap,
    SpacingViolation,
};
pub use error::{
    CompareError, ExtractionError, RasterError, RenderError, StoreError, ValidationError,
};
pub use model::{
    ExtractionResult, FieldPosition, FieldType, FieldValue, FillOutcome, FillRequest, FontStyle,
    PositionSet,
};
pub use raster::{GhostscriptRasterizer, PageRasterizer, StubRasterizer, DEFAULT_RASTER_DPI};
pub use store::PositionStore;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Directory layout and rasterization settings for a [`PositionEngine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding source documents, one `{template_id}.pdf` each.
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,
    /// Directory holding position files.
    #[serde(default = "default_positions_dir")]
    pub positions_dir: PathBuf,
    /// Directory for rasterized page backgrounds.
    #[serde(default = "default_backgrounds_dir")]
    pub backgrounds_dir: PathBuf,
    /// Resolution for the rasterization fallback (default: 200)
    #[serde(default = "default_raster_dpi")]
    pub raster_dpi: u32,
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("templates")
}

fn default_positions_dir() -> PathBuf {
    PathBuf::from("positions")
}

fn default_backgrounds_dir() -> PathBuf {
    PathBuf::from("backgrounds")
}

fn default_raster_dpi() -> u32 {
    DEFAULT_RASTER_DPI
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            templates_dir: default_templates_dir(),
            positions_dir: default_positions_dir(),
            backgrounds_dir: default_backgrounds_dir(),
            raster_dpi: default_raster_dpi(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the TOML is
    /// malformed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        toml::from_str(s).context("Failed to parse TOML configuration")
    }
}

/// The facade collaborating applications call with a template id and a
/// value map.
///
/// Owns the position store and the raster adapter. Extraction persists
/// found fields through the store; fill reads them back and renders; compare
/// scores them against a reference position file. Operations are
/// batch-style and idempotent — re-invoking with the same inputs produces
/// the same outputs.
pub struct PositionEngine {
    config: EngineConfig,
    store: PositionStore,
    rasterizer: Box<dyn PageRasterizer>,
}

impl PositionEngine {
    /// Engine using a discovered Ghostscript install for the background
    /// fallback. When none is installed the fallback degrades to producing
    /// no backgrounds, with a warning per run.
    pub fn new(config: EngineConfig) -> Self {
        let rasterizer = GhostscriptRasterizer::discover()
            .unwrap_or_else(|| GhostscriptRasterizer::with_binary("gs"))
            .with_dpi(config.raster_dpi);
        Self::with_rasterizer(config, Box::new(rasterizer))
    }

    /// Engine with an explicit raster adapter.
    pub fn with_rasterizer(config: EngineConfig, rasterizer: Box<dyn PageRasterizer>) -> Self {
        let store = PositionStore::new(&config.positions_dir);
        Self {
            config,
            store,
            rasterizer,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &PositionStore {
        &self.store
    }

    /// Where the source document for a template id is expected to live.
    pub fn template_source_path(&self, template_id: &str) -> PathBuf {
        self.config
            .templates_dir
            .join(format!("{}.pdf", template_id))
    }

    /// Extracts field positions from `source` and persists them under
    /// `template_id` when any were found. On the no-form-fields fallback
    /// path, page backgrounds land in the configured backgrounds directory.
    pub fn extract(
        &self,
        source: &Path,
        template_id: &str,
    ) -> Result<ExtractionResult, ExtractionError> {
        let result = extract::extract_positions(
            source,
            template_id,
            &self.config.backgrounds_dir,
            self.rasterizer.as_ref(),
        )?;
        if result.has_fields() {
            self.store.save(&result.fields)?;
        }
        Ok(result)
    }

    /// Renders `request.values` onto the template's source document, or
    /// onto its rasterized backgrounds when the source is missing or
    /// unparseable, then writes the result to `request.output_path`.
    pub fn fill(&self, request: &FillRequest) -> Result<FillOutcome, RenderError> {
        let started = Instant::now();
        let positions = self.store.load(&request.template_id)?;
        info!(
            template_id = %request.template_id,
            fields = positions.len(),
            values = request.values.len(),
            "rendering filled document"
        );

        let source_path = self.template_source_path(&request.template_id);
        let source = fs::read(&source_path)
            .ok()
            .filter(|bytes| extract::load_document(bytes).is_ok());
        let (bytes, stats) = match source {
            Some(bytes) => fill::overlay_on_source(&bytes, &positions, &request.values)?,
            None => {
                debug!(
                    source = %source_path.display(),
                    "source not usable, building from backgrounds"
                );
                let backgrounds = self.collect_backgrounds(&request.template_id);
                fill::build_from_backgrounds(&backgrounds, &[], &positions, &request.values)?
            }
        };

        // Advisory re-parse; a rendered document that lopdf itself cannot
        // read again deserves a loud log line.
        let page_count = match lopdf::Document::load_mem(&bytes) {
            Ok(doc) => doc.get_pages().len() as u32,
            Err(e) => {
                warn!(error = %e, "rendered output does not re-parse");
                0
            }
        };

        if let Some(parent) = request.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&request.output_path, &bytes)?;

        let outcome = FillOutcome {
            output_path: request.output_path.clone(),
            page_count,
            bytes_written: bytes.len() as u64,
            fields_filled: stats.filled,
            fields_skipped: stats.skipped,
        };
        info!(
            path = %outcome.output_path.display(),
            pages = outcome.page_count,
            bytes = outcome.bytes_written,
            filled = outcome.fields_filled,
            skipped = outcome.fields_skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "filled document written"
        );
        Ok(outcome)
    }

    /// Compares the stored positions for `template_id` against a reference
    /// position file, with default thresholds.
    pub fn compare(
        &self,
        template_id: &str,
        reference_path: &Path,
    ) -> Result<ComparisonReport, CompareError> {
        self.compare_with(template_id, reference_path, &CompareOptions::default())
    }

    /// [`compare`](Self::compare) with explicit thresholds.
    pub fn compare_with(
        &self,
        template_id: &str,
        reference_path: &Path,
        options: &CompareOptions,
    ) -> Result<ComparisonReport, CompareError> {
        let actual = self.store.load(template_id)?;
        let expected = PositionStore::load_path(reference_path)
            .map_err(|e| CompareError::Reference(e.to_string()))?;
        let report = analyze::compare(&actual, &expected, options);
        info!(
            template_id,
            accuracy = report.accuracy,
            matched = report.matched,
            misaligned = report.misaligned,
            missing = report.missing,
            extra = report.extra,
            "positions compared"
        );
        Ok(report)
    }

    /// Template ids with stored positions.
    pub fn templates(&self) -> Result<Vec<String>, StoreError> {
        self.store.templates()
    }

    /// Consecutive page backgrounds for a template, stopping at the first
    /// page with no image.
    fn collect_backgrounds(&self, template_id: &str) -> BTreeMap<u32, PathBuf> {
        let mut backgrounds = BTreeMap::new();
        for page in 1.. {
            let path = self
                .config
                .backgrounds_dir
                .join(extract::background_image_name(template_id, page));
            if !path.exists() {
                break;
            }
            backgrounds.insert(page, path);
        }
        backgrounds
    }
}
