//! Export orchestration.
//!
//! Each export owns a fresh rendering surface for its whole lifetime and walks a small state
//! machine: `Idle -> Rendering(page) -> ... -> Assembling -> Done | Failed`. Pages are always
//! rendered in ascending order. Whatever happens, the surface is destroyed exactly once.

use crate::config::ExportConfig;
use crate::error::{CoreError, Result};
use crate::pdf;
use crate::png::{self, DIAGRAM_KEY, DPI_KEY, PngOutput};
use crate::surface::{Bounds, PdfPrintOptions, RenderInfo, SurfaceFactory, SurfaceHandle, spawn_surface};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ExtendedColorType, ImageEncoder, RgbaImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Pdf,
    Png,
    #[serde(alias = "jpeg")]
    Jpg,
    Svg,
    Xml,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Png => "png",
            Self::Jpg => "jpg",
            Self::Svg => "svg",
            Self::Xml => "xml",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpg),
            "svg" => Some(Self::Svg),
            "xml" | "drawio" => Some(Self::Xml),
            _ => None,
        }
    }

    fn is_raster(self) -> bool {
        matches!(self, Self::Png | Self::Jpg)
    }
}

/// Zero-based page selection. Ranges are inclusive and clamped to the rendered page count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum PageSelection {
    Single { index: u32 },
    Range { from: u32, to: u32 },
    All,
}

impl Default for PageSelection {
    fn default() -> Self {
        Self::Single { index: 0 }
    }
}

impl PageSelection {
    pub fn first_page(&self) -> u32 {
        match *self {
            Self::Single { index } => index,
            Self::Range { from, .. } => from,
            Self::All => 0,
        }
    }

    /// Last page to render once the document reports `page_count` pages.
    pub fn last_page(&self, page_count: u32) -> u32 {
        let last_existing = page_count.saturating_sub(1);
        match *self {
            Self::Single { index } => index,
            Self::Range { from, to } => to.min(last_existing).max(from),
            Self::All => last_existing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SvgTheme {
    #[default]
    Auto,
    Dark,
    Light,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkTarget {
    #[default]
    Auto,
    NewWin,
    SameWin,
}

/// Everything a rendering surface and the finishing stages need to produce one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExportRequest {
    pub format: ExportFormat,
    pub pages: PageSelection,
    pub scale: f64,
    pub border: u32,
    /// Fit the raster output to this width (ignored when `height` is set).
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Background colour; `None` or `"none"` keeps PNG output transparent.
    pub bg: Option<String>,
    pub embed_xml: bool,
    /// Diagram source, embedded into PNG and PDF output when `embed_xml` is set.
    pub xml: Option<String>,
    pub dpi: Option<f64>,
    pub jpeg_quality: Option<u8>,
    /// Return the artifact as base64 text.
    pub base64: bool,
    pub theme: SvgTheme,
    pub link_target: LinkTarget,
    pub embed_images: bool,
    pub embed_fonts: bool,
    pub crop: bool,
    pub page_margin: u32,
    /// Layer indices to show; `None` shows the document's visible layers.
    pub layers: Option<Vec<u32>>,
    pub uncompressed: bool,
}

impl Default for ExportRequest {
    fn default() -> Self {
        Self {
            format: ExportFormat::default(),
            pages: PageSelection::default(),
            scale: 1.0,
            border: 0,
            width: None,
            height: None,
            bg: None,
            embed_xml: false,
            xml: None,
            dpi: None,
            jpeg_quality: None,
            base64: false,
            theme: SvgTheme::default(),
            link_target: LinkTarget::default(),
            embed_images: true,
            embed_fonts: true,
            crop: false,
            page_margin: 0,
            layers: None,
            uncompressed: false,
        }
    }
}

impl ExportRequest {
    pub fn validate(&self) -> Result<()> {
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(CoreError::InvalidRequest(format!("scale {}", self.scale)));
        }
        if let PageSelection::Range { from, to } = self.pages {
            if from > to {
                return Err(CoreError::InvalidRequest(format!("page range {from}..{to}")));
            }
        }
        if let Some(quality) = self.jpeg_quality {
            if !(1..=100).contains(&quality) {
                return Err(CoreError::InvalidRequest(format!("jpeg quality {quality}")));
            }
        }
        if matches!(self.width, Some(0)) || matches!(self.height, Some(0)) {
            return Err(CoreError::InvalidRequest("zero output size".into()));
        }
        Ok(())
    }

    /// Background colour to paint, if any.
    pub fn background(&self) -> Option<&str> {
        self.bg.as_deref().filter(|bg| !bg.eq_ignore_ascii_case("none"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutput {
    Bytes(Vec<u8>),
    Text(String),
}

impl ExportOutput {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Text(text) => text.into_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportState {
    Idle,
    Rendering { page: u32 },
    Assembling,
    Done,
    Failed,
}

/// Runs exports, each on its own surface from `factory`. Cheap to clone; concurrent exports
/// are independent.
#[derive(Clone)]
pub struct Exporter {
    factory: Arc<dyn SurfaceFactory>,
    config: ExportConfig,
}

impl Exporter {
    pub fn new(factory: Arc<dyn SurfaceFactory>, config: ExportConfig) -> Self {
        Self { factory, config }
    }

    pub async fn export(&self, request: &ExportRequest) -> Result<ExportOutput> {
        request.validate()?;
        let backend = self
            .factory
            .create(request)
            .map_err(|err| CoreError::Render(format!("{err:#}")))?;

        let mut run = ExportRun {
            request,
            config: &self.config,
            surface: spawn_surface(backend),
            state: ExportState::Idle,
        };
        let result = run.drive().await;
        run.enter(if result.is_ok() {
            ExportState::Done
        } else {
            ExportState::Failed
        });

        let ExportRun { surface, .. } = run;
        surface.destroy().await;

        match &result {
            Ok(_) => info!(format = request.format.extension(), "export finished"),
            Err(err) => warn!(format = request.format.extension(), error = %err, "export failed"),
        }
        result
    }
}

struct ExportRun<'a> {
    request: &'a ExportRequest,
    config: &'a ExportConfig,
    surface: SurfaceHandle,
    state: ExportState,
}

impl ExportRun<'_> {
    fn enter(&mut self, state: ExportState) {
        debug!(from = ?self.state, to = ?state, "export state");
        self.state = state;
    }

    async fn drive(&mut self) -> Result<ExportOutput> {
        match self.request.format {
            ExportFormat::Pdf => self.export_pdf().await,
            ExportFormat::Png | ExportFormat::Jpg => self.export_raster().await,
            ExportFormat::Svg => self.export_svg().await,
            ExportFormat::Xml => self.export_xml().await,
        }
    }

    async fn render(&mut self, page: u32) -> Result<(RenderInfo, Bounds)> {
        self.enter(ExportState::Rendering { page });
        let info = self.surface.render(page).await?;
        let min = self.config.min_content_size;
        match info.bounds {
            Some(bounds)
                if bounds.width >= min && bounds.height >= min && fits_surface(&bounds) =>
            {
                Ok((info, bounds))
            }
            _ => Err(CoreError::Render(format!(
                "page {page} rendered empty or invalid content"
            ))),
        }
    }

    /// Diagram source to embed, falling back to the surface's own serialisation.
    async fn diagram_source(&mut self) -> Result<Option<String>> {
        if !self.request.embed_xml {
            return Ok(None);
        }
        match &self.request.xml {
            Some(xml) => Ok(Some(xml.clone())),
            None => self.surface.xml_data().await.map(Some),
        }
    }

    async fn export_pdf(&mut self) -> Result<ExportOutput> {
        let options = PdfPrintOptions {
            crop: self.request.crop,
            margin: self.request.page_margin,
        };
        let mut page = self.request.pages.first_page();
        let mut last = None;
        let mut buffers = Vec::new();

        loop {
            let (info, _) = self.render(page).await?;
            let last_page = *last.get_or_insert_with(|| self.request.pages.last_page(info.page_count));
            buffers.push(self.surface.print_to_pdf(options).await?);
            if page >= last_page {
                break;
            }
            page += 1;
        }

        let xml = self.diagram_source().await?;
        self.enter(ExportState::Assembling);
        let merged = pdf::merge_pdfs(&buffers, xml.as_deref(), &self.config.creator)?;
        Ok(self.transport(merged))
    }

    async fn export_raster(&mut self) -> Result<ExportOutput> {
        let (_, bounds) = self.render(self.request.pages.first_page()).await?;

        // One extra pixel keeps scrollbars out of the capture.
        let width = ((bounds.width + bounds.x).ceil() as u32).saturating_add(1);
        let height = ((bounds.height + bounds.y).ceil() as u32).saturating_add(1);
        self.surface.resize(width, height).await?;

        let delay = self
            .config
            .capture_delay((bounds.width * bounds.height) as u64);
        tokio::time::sleep(delay).await;
        let captured = self.surface.capture().await?;

        let xml = if self.request.format == ExportFormat::Png {
            self.diagram_source().await?
        } else {
            None
        };
        self.enter(ExportState::Assembling);

        let (target_w, target_h) = fit_size(width, height, self.request.width, self.request.height);
        let image = if captured.dimensions() == (target_w, target_h) {
            captured
        } else {
            imageops::resize(&captured, target_w, target_h, FilterType::Triangle)
        };

        let quality = self.request.jpeg_quality.unwrap_or(self.config.jpeg_quality);
        let mut data = encode_raster(image, self.request.format, quality)?;

        if self.request.format == ExportFormat::Png {
            if let Some(dpi) = self.request.dpi {
                data = png::inject_chunk(&data, DPI_KEY, &dpi.to_string(), false, false)?.into_bytes();
            }
            if let Some(xml) = xml {
                return Ok(
                    match png::inject_chunk(&data, DIAGRAM_KEY, &xml, true, self.request.base64)? {
                        PngOutput::Bytes(bytes) => ExportOutput::Bytes(bytes),
                        PngOutput::Base64(text) => ExportOutput::Text(text),
                    },
                );
            }
        }
        Ok(self.transport(data))
    }

    async fn export_svg(&mut self) -> Result<ExportOutput> {
        self.render(self.request.pages.first_page()).await?;
        let svg = self.surface.svg_data().await?;
        Ok(ExportOutput::Text(svg))
    }

    async fn export_xml(&mut self) -> Result<ExportOutput> {
        let xml = self.surface.xml_data().await?;
        Ok(ExportOutput::Text(xml))
    }

    fn transport(&self, bytes: Vec<u8>) -> ExportOutput {
        if self.request.base64 {
            ExportOutput::Text(STANDARD.encode(bytes))
        } else {
            ExportOutput::Bytes(bytes)
        }
    }
}

/// Finite bounds whose far edge still fits a `u32` surface.
fn fits_surface(bounds: &Bounds) -> bool {
    let limit = f64::from(u32::MAX);
    let axis = |origin: f64, extent: f64| {
        origin.is_finite() && extent.is_finite() && (origin + extent).ceil() < limit
    };
    axis(bounds.x, bounds.width) && axis(bounds.y, bounds.height)
}

/// Output size honouring a requested width or height; height wins when both are given.
pub fn fit_size(width: u32, height: u32, want_w: Option<u32>, want_h: Option<u32>) -> (u32, u32) {
    let scale = match (want_w, want_h) {
        (_, Some(h)) => f64::from(h) / f64::from(height),
        (Some(w), None) => f64::from(w) / f64::from(width),
        (None, None) => return (width, height),
    };
    let scaled = |v: u32| ((f64::from(v) * scale).round() as u32).max(1);
    (scaled(width), scaled(height))
}

fn encode_raster(image: RgbaImage, format: ExportFormat, quality: u8) -> Result<Vec<u8>> {
    debug_assert!(format.is_raster());
    let (width, height) = image.dimensions();
    let mut out = Vec::new();
    let encoded = match format {
        ExportFormat::Jpg => {
            let rgb = DynamicImage::ImageRgba8(image).into_rgb8();
            JpegEncoder::new_with_quality(&mut out, quality).write_image(
                rgb.as_raw(),
                width,
                height,
                ExtendedColorType::Rgb8,
            )
        }
        _ => PngEncoder::new(&mut out).write_image(
            image.as_raw(),
            width,
            height,
            ExtendedColorType::Rgba8,
        ),
    };
    encoded.map_err(|err| CoreError::Render(format!("image encoding failed: {err}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn height_wins_over_width() {
        assert_eq!(fit_size(201, 101, Some(100), Some(202)), (402, 202));
        assert_eq!(fit_size(200, 100, Some(100), None), (100, 50));
        assert_eq!(fit_size(200, 100, None, None), (200, 100));
    }

    #[test]
    fn ranges_clamp_to_page_count() {
        let range = PageSelection::Range { from: 1, to: 9 };
        assert_eq!(range.first_page(), 1);
        assert_eq!(range.last_page(3), 2);
        assert_eq!(PageSelection::All.last_page(4), 3);
        assert_eq!(PageSelection::All.last_page(0), 0);
        assert_eq!(PageSelection::Single { index: 2 }.last_page(1), 2);
    }

    #[test]
    fn request_defaults_and_aliases() {
        let request: ExportRequest =
            serde_json::from_str(r#"{"format":"jpeg","pages":{"kind":"all"},"linkTarget":"new-win"}"#)
                .unwrap();
        assert_eq!(request.format, ExportFormat::Jpg);
        assert_eq!(request.pages, PageSelection::All);
        assert_eq!(request.link_target, LinkTarget::NewWin);
        assert_eq!(request.scale, 1.0);
        assert_eq!(request.border, 0);
        assert!(request.background().is_none());
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let bad_range = ExportRequest {
            pages: PageSelection::Range { from: 3, to: 1 },
            ..ExportRequest::default()
        };
        assert!(matches!(bad_range.validate(), Err(CoreError::InvalidRequest(_))));
        let bad_scale = ExportRequest {
            scale: 0.0,
            ..ExportRequest::default()
        };
        assert!(bad_scale.validate().is_err());
        assert!(ExportRequest::default().validate().is_ok());
    }

    #[test]
    fn none_background_is_transparent() {
        let request = ExportRequest {
            bg: Some("none".into()),
            ..ExportRequest::default()
        };
        assert_eq!(request.background(), None);
        let white = ExportRequest {
            bg: Some("#ffffff".into()),
            ..ExportRequest::default()
        };
        assert_eq!(white.background(), Some("#ffffff"));
    }

    #[test]
    fn jpeg_drops_alpha() {
        let image = RgbaImage::from_pixel(4, 3, image::Rgba([255, 0, 0, 255]));
        let jpeg = encode_raster(image, ExportFormat::Jpg, 90).unwrap();
        assert_eq!(&jpeg[..3], b"\xFF\xD8\xFF");
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (4, 3));
    }
}
