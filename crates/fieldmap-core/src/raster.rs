//! External rasterization adapter.
//!
//! Rasterizing a source page to a PNG is the only operation the engine
//! delegates to an out-of-process tool. The adapter turns that dependency
//! into a narrow trait with typed failures, so extraction and rendering stay
//! pure and unit-testable against [`StubRasterizer`].
//!
//! Invocations are blocking with an enforced wall-clock timeout; a failure
//! is scoped to the page being processed.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::RasterError;

/// Default render resolution, matching what the position files were
/// authored against.
pub const DEFAULT_RASTER_DPI: u32 = 200;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

const GHOSTSCRIPT_CANDIDATES: &[&str] = &[
    "gs",
    "/usr/bin/gs",
    "/usr/local/bin/gs",
    "/opt/homebrew/bin/gs",
];

/// One page in, one PNG out.
pub trait PageRasterizer {
    /// Identifier for logs.
    fn name(&self) -> &'static str;

    /// Whether the backing tool is present on this system.
    fn is_available(&self) -> bool;

    /// Renders the 1-based `page` of `source` to `output` as a PNG.
    fn rasterize_page(&self, source: &Path, page: u32, output: &Path) -> Result<(), RasterError>;
}

/// Ghostscript-backed rasterizer.
#[derive(Debug, Clone)]
pub struct GhostscriptRasterizer {
    binary: PathBuf,
    dpi: u32,
    grayscale: bool,
    timeout: Duration,
}

impl GhostscriptRasterizer {
    /// Uses the given Ghostscript binary with default settings.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            dpi: DEFAULT_RASTER_DPI,
            grayscale: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Probes the usual install locations and returns a rasterizer for the
    /// first Ghostscript that answers `--version`.
    pub fn discover() -> Option<Self> {
        for candidate in GHOSTSCRIPT_CANDIDATES {
            let found = Command::new(candidate)
                .arg("--version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false);
            if found {
                debug!(binary = candidate, "found ghostscript");
                return Some(Self::with_binary(candidate));
            }
        }
        None
    }

    pub fn with_dpi(mut self, dpi: u32) -> Self {
        self.dpi = dpi;
        self
    }

    /// Renders with the grayscale device instead of 24-bit color.
    pub fn grayscale(mut self, grayscale: bool) -> Self {
        self.grayscale = grayscale;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Argument list for rendering a single page.
    fn page_args(&self, source: &Path, page: u32, output: &Path) -> Vec<String> {
        let device = if self.grayscale { "pnggray" } else { "png16m" };
        vec![
            "-dSAFER".to_string(),
            "-dNOPAUSE".to_string(),
            "-dBATCH".to_string(),
            format!("-sDEVICE={}", device),
            format!("-r{}", self.dpi),
            format!("-dFirstPage={}", page),
            format!("-dLastPage={}", page),
            format!("-sOutputFile={}", output.display()),
            source.display().to_string(),
        ]
    }
}

impl PageRasterizer for GhostscriptRasterizer {
    fn name(&self) -> &'static str {
        "ghostscript"
    }

    fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn rasterize_page(&self, source: &Path, page: u32, output: &Path) -> Result<(), RasterError> {
        let start = Instant::now();
        let mut child = Command::new(&self.binary)
            .args(self.page_args(source, page, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RasterError::ToolNotFound
                } else {
                    RasterError::Io(e)
                }
            })?;

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if start.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RasterError::Timeout {
                    page,
                    seconds: self.timeout.as_secs(),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            return Err(RasterError::Failed {
                page,
                status: status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        if !output.exists() {
            return Err(RasterError::Failed {
                page,
                status: 0,
                stderr: "tool exited cleanly but produced no output file".to_string(),
            });
        }

        debug!(
            page,
            elapsed_ms = start.elapsed().as_millis() as u64,
            output = %output.display(),
            "rasterized page"
        );
        Ok(())
    }
}

/// In-process rasterizer for tests: writes a solid-white PNG of a fixed
/// pixel size, and can be told to fail for specific pages.
#[derive(Debug, Clone)]
pub struct StubRasterizer {
    width: u32,
    height: u32,
    fail_pages: Vec<u32>,
}

impl StubRasterizer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            fail_pages: Vec::new(),
        }
    }

    /// Marks pages whose rasterization should fail.
    pub fn failing_on(mut self, pages: &[u32]) -> Self {
        self.fail_pages = pages.to_vec();
        self
    }
}

impl Default for StubRasterizer {
    fn default() -> Self {
        // 200 DPI US Letter
        Self::new(1700, 2200)
    }
}

impl PageRasterizer for StubRasterizer {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn rasterize_page(&self, _source: &Path, page: u32, output: &Path) -> Result<(), RasterError> {
        if self.fail_pages.contains(&page) {
            return Err(RasterError::Failed {
                page,
                status: 1,
                stderr: "stub configured to fail".to_string(),
            });
        }

        let file = std::fs::File::create(output)?;
        let mut encoder = png::Encoder::new(std::io::BufWriter::new(file), self.width, self.height);
        encoder.set_color(png::ColorType::Rgb);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder
            .write_header()
            .map_err(|e| io_error(page, &e.to_string()))?;
        let white = vec![0xFFu8; (self.width * self.height * 3) as usize];
        writer
            .write_image_data(&white)
            .map_err(|e| io_error(page, &e.to_string()))?;
        Ok(())
    }
}

fn io_error(page: u32, message: &str) -> RasterError {
    RasterError::Failed {
        page,
        status: -1,
        stderr: message.to_string(),
    }
}
