//! Page rasterization for perceptual hashing and extractor page images.

use std::io::Cursor;

use image::{DynamicImage, GenericImageView, GrayImage, ImageOutputFormat, Luma};
use lopdf::{Document, Object, ObjectId};
use pdfium_render::prelude::*;
use tracing::{debug, warn};

use super::FingerprintError;

/// Maximum width or height of a rendered page.
const MAX_DIMENSION_PX: u32 = 4096;

/// PDF points per inch.
const POINTS_PER_INCH: f32 = 72.0;

/// Renders one page of a PDF to PNG bytes.
///
/// `page_index` is zero-based.
pub trait PageRenderer: Send + Sync {
    fn render_page(
        &self,
        pdf_bytes: &[u8],
        page_index: usize,
        dpi: u32,
    ) -> Result<Vec<u8>, FingerprintError>;
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, FingerprintError> {
    let mut cursor = Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, ImageOutputFormat::Png)
        .map_err(|e| FingerprintError::ImageProcessing(format!("PNG encoding failed: {e}")))?;
    Ok(cursor.into_inner())
}

// ── PDFium ───────────────────────────────────────────────

/// Renders pages with Google PDFium.
///
/// `Pdfium` is `!Send`, so each call binds the library afresh; the OS
/// caches the dynamic load.
pub struct PdfiumRenderer;

impl PdfiumRenderer {
    /// Fails fast when no PDFium library can be bound.
    pub fn new() -> Result<Self, FingerprintError> {
        let _ = load_pdfium()?;
        Ok(Self)
    }
}

/// Discovery order: `PDFIUM_DYNAMIC_LIB_PATH`, next to the executable,
/// `<exe_dir>/pdfium/lib`, then the system search path.
fn load_pdfium() -> Result<Pdfium, FingerprintError> {
    let unavailable = |reason: String| FingerprintError::Rendering { page: 0, reason };

    if let Ok(path) = std::env::var("PDFIUM_DYNAMIC_LIB_PATH") {
        debug!(path = %path, "Loading PDFium from env var");
        let bindings = Pdfium::bind_to_library(&path)
            .map_err(|e| unavailable(format!("Failed to load PDFium from {path}: {e}")))?;
        return Ok(Pdfium::new(bindings));
    }

    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
    {
        for dir in [exe_dir.clone(), exe_dir.join("pdfium").join("lib")] {
            let lib_path =
                Pdfium::pdfium_platform_library_name_at_path(dir.to_string_lossy().as_ref());
            if let Ok(bindings) = Pdfium::bind_to_library(&lib_path) {
                debug!(dir = %dir.display(), "Loaded PDFium next to executable");
                return Ok(Pdfium::new(bindings));
            }
        }
    }

    let bindings = Pdfium::bind_to_system_library().map_err(|e| {
        unavailable(format!(
            "PDFium library not found. Set PDFIUM_DYNAMIC_LIB_PATH or install PDFium: {e}"
        ))
    })?;
    Ok(Pdfium::new(bindings))
}

/// Pixel size for a page at `dpi`, capped at `MAX_DIMENSION_PX` with the
/// aspect ratio preserved.
fn compute_render_dimensions(width_points: f32, height_points: f32, dpi: u32) -> (u32, u32) {
    let scale = dpi as f32 / POINTS_PER_INCH;
    let raw_w = (width_points * scale).max(1.0);
    let raw_h = (height_points * scale).max(1.0);

    let max_dim = raw_w.max(raw_h);
    if max_dim > MAX_DIMENSION_PX as f32 {
        let ratio = MAX_DIMENSION_PX as f32 / max_dim;
        (
            ((raw_w * ratio) as u32).clamp(1, MAX_DIMENSION_PX),
            ((raw_h * ratio) as u32).clamp(1, MAX_DIMENSION_PX),
        )
    } else {
        (raw_w as u32, raw_h as u32)
    }
}

impl PageRenderer for PdfiumRenderer {
    fn render_page(
        &self,
        pdf_bytes: &[u8],
        page_index: usize,
        dpi: u32,
    ) -> Result<Vec<u8>, FingerprintError> {
        let pdfium = load_pdfium()?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf_bytes, None)
            .map_err(|e| FingerprintError::DocumentUnreadable(format!("PDFium: {e}")))?;

        let pages = document.pages();
        let index = u16::try_from(page_index).map_err(|_| FingerprintError::Rendering {
            page: page_index,
            reason: "Page index exceeds u16".into(),
        })?;
        let page = pages.get(index).map_err(|_| FingerprintError::Rendering {
            page: page_index,
            reason: format!("Out of range (document has {} pages)", pages.len()),
        })?;

        let (width, height) = compute_render_dimensions(page.width().value, page.height().value, dpi);
        let config = PdfRenderConfig::new()
            .set_target_width(width as i32)
            .set_maximum_height(height as i32);

        let bitmap = page
            .render_with_config(&config)
            .map_err(|e| FingerprintError::Rendering {
                page: page_index,
                reason: e.to_string(),
            })?;

        let png = encode_png(&bitmap.as_image())?;
        debug!(page = page_index, width, height, png_size = png.len(), "Rendered page");
        Ok(png)
    }
}

// ── Embedded scan images ─────────────────────────────────

/// Fallback renderer for scanned PDFs when PDFium is not installed:
/// returns the largest image XObject on the page. `dpi` is ignored; the
/// scan's own resolution is used.
pub struct LopdfImageRenderer;

impl PageRenderer for LopdfImageRenderer {
    fn render_page(
        &self,
        pdf_bytes: &[u8],
        page_index: usize,
        _dpi: u32,
    ) -> Result<Vec<u8>, FingerprintError> {
        let doc = Document::load_mem(pdf_bytes)
            .map_err(|e| FingerprintError::DocumentUnreadable(e.to_string()))?;

        let page_id = doc
            .page_iter()
            .nth(page_index)
            .ok_or_else(|| FingerprintError::Rendering {
                page: page_index,
                reason: "Page not found".into(),
            })?;

        let image = largest_page_image(&doc, page_id).ok_or_else(|| FingerprintError::Rendering {
            page: page_index,
            reason: "No decodable image on page".into(),
        })?;
        encode_png(&image)
    }
}

fn largest_page_image(doc: &Document, page_id: ObjectId) -> Option<DynamicImage> {
    let page = doc.get_object(page_id).ok()?.as_dict().ok()?;
    let resources = resolve(doc, page.get(b"Resources").ok()?).as_dict().ok()?;
    let xobjects = resolve(doc, resources.get(b"XObject").ok()?).as_dict().ok()?;

    xobjects
        .iter()
        .filter_map(|(_, obj)| match resolve(doc, obj) {
            Object::Stream(stream) => Some(stream),
            _ => None,
        })
        .filter(|stream| {
            matches!(stream.dict.get(b"Subtype"), Ok(Object::Name(n)) if n == b"Image")
        })
        .filter_map(decode_image_stream)
        .max_by_key(|img| img.width() as u64 * img.height() as u64)
}

fn decode_image_stream(stream: &lopdf::Stream) -> Option<DynamicImage> {
    let content = stream
        .decompressed_content()
        .unwrap_or_else(|_| stream.content.clone());

    // DCT (JPEG) and other self-describing payloads.
    if let Ok(img) = image::load_from_memory(&content) {
        return Some(img);
    }

    let dict = &stream.dict;
    let width = dict.get(b"Width").ok()?.as_i64().ok()? as u32;
    let height = dict.get(b"Height").ok()?.as_i64().ok()? as u32;
    let gray = matches!(dict.get(b"ColorSpace"), Ok(Object::Name(n)) if n == b"DeviceGray");

    if gray {
        GrayImage::from_raw(width, height, content).map(DynamicImage::ImageLuma8)
    } else {
        image::RgbImage::from_raw(width, height, content).map(DynamicImage::ImageRgb8)
    }
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        _ => obj,
    }
}

// ── Mock for testing ─────────────────────────────────────

/// Deterministic renderer that draws a seeded block pattern per page.
///
/// Every document rendered with the same seed gets the same page images, so
/// perceptual matching is driven entirely by the seed and page index.
pub struct MockPageRenderer {
    seed: u64,
    failing_page: Option<usize>,
}

impl MockPageRenderer {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            failing_page: None,
        }
    }

    pub fn failing_on_page(mut self, page: usize) -> Self {
        self.failing_page = Some(page);
        self
    }
}

impl PageRenderer for MockPageRenderer {
    fn render_page(
        &self,
        _pdf_bytes: &[u8],
        page_index: usize,
        dpi: u32,
    ) -> Result<Vec<u8>, FingerprintError> {
        if self.failing_page == Some(page_index) {
            return Err(FingerprintError::Rendering {
                page: page_index,
                reason: "Mock render failure".into(),
            });
        }
        let side = (dpi * 2).clamp(16, 600);
        let seed = self.seed.wrapping_mul(1000).wrapping_add(page_index as u64);
        encode_png(&DynamicImage::ImageLuma8(block_pattern(seed, side, side * 13 / 10)))
    }
}

/// An 8x10 grid of pseudo-random gray blocks scaled to `width` x `height`.
///
/// The same seed gives the same picture at any size.
pub fn block_pattern(seed: u64, width: u32, height: u32) -> GrayImage {
    const COLS: u32 = 8;
    const ROWS: u32 = 10;

    let mut state = seed ^ 0x9E37_79B9_7F4A_7C15;
    let mut next = || {
        // xorshift64*
        state ^= state >> 12;
        state ^= state << 25;
        state ^= state >> 27;
        (state.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 56) as u8
    };
    let levels: Vec<u8> = (0..COLS * ROWS).map(|_| next()).collect();

    GrayImage::from_fn(width.max(1), height.max(1), |x, y| {
        let col = (x * COLS / width.max(1)).min(COLS - 1);
        let row = (y * ROWS / height.max(1)).min(ROWS - 1);
        Luma([levels[(row * COLS + col) as usize]])
    })
}
