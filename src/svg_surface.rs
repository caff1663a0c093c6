//! Built-in headless rendering surface over pre-rendered SVG pages.
//!
//! Pages are rasterised with `resvg`. PDF "printing" embeds a 2x raster of the page as a
//! single image, which is enough for batch exports without a browser engine.

use crate::export::{ExportFormat, ExportRequest};
use crate::surface::{Bounds, PdfPrintOptions, RenderInfo, RenderJob, SurfaceBackend, SurfaceFactory};
use anyhow::{Context, Result, anyhow, bail};
use flate2::Compression;
use flate2::write::ZlibEncoder;
use image::RgbaImage;
use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, Stream, dictionary};
use once_cell::sync::Lazy;
use resvg::tiny_skia::{Color, Pixmap, Transform};
use std::io::Write;
use std::sync::Arc;
use usvg::fontdb;

static FONT_DB: Lazy<Arc<fontdb::Database>> = Lazy::new(|| {
    let mut db = fontdb::Database::new();
    db.load_system_fonts();
    Arc::new(db)
});

/// CSS pixels to PDF points.
const PX_TO_PT: f32 = 0.75;
const PRINT_RESOLUTION: f32 = 2.0;

/// Serves surfaces over a fixed set of SVG pages and an optional diagram source.
#[derive(Debug, Clone)]
pub struct SvgPagesFactory {
    pages: Arc<Vec<String>>,
    xml: Option<Arc<String>>,
}

impl SvgPagesFactory {
    pub fn new(pages: Vec<String>, xml: Option<String>) -> Self {
        Self {
            pages: Arc::new(pages),
            xml: xml.map(Arc::new),
        }
    }
}

impl SurfaceFactory for SvgPagesFactory {
    fn create(&self, request: &ExportRequest) -> Result<Box<dyn SurfaceBackend>> {
        if self.pages.is_empty() {
            bail!("document has no pages");
        }
        let background = match request.background() {
            Some(bg) => Some(parse_color(bg)?),
            // JPEG has no alpha; paint white instead of letting it turn black.
            None if request.format == ExportFormat::Jpg => Some(Color::WHITE),
            None => None,
        };
        Ok(Box::new(SvgPageSurface {
            pages: self.pages.clone(),
            xml: self.xml.clone(),
            scale: request.scale as f32,
            border: request.border as f32,
            background,
            page: 0,
            viewport: None,
        }))
    }
}

struct SvgPageSurface {
    pages: Arc<Vec<String>>,
    xml: Option<Arc<String>>,
    scale: f32,
    border: f32,
    background: Option<Color>,
    page: usize,
    viewport: Option<(u32, u32)>,
}

impl SvgPageSurface {
    fn tree(&self) -> Result<usvg::Tree> {
        let svg = self
            .pages
            .get(self.page)
            .ok_or_else(|| anyhow!("page {} out of range", self.page))?;
        let mut options = usvg::Options::default();
        options.fontdb = FONT_DB.clone();
        usvg::Tree::from_str(svg, &options).with_context(|| format!("page {}", self.page))
    }

    /// Page size in surface pixels, scale and border applied.
    fn content_size(&self, tree: &usvg::Tree) -> (f32, f32) {
        let size = tree.size();
        (
            size.width() * self.scale + 2.0 * self.border,
            size.height() * self.scale + 2.0 * self.border,
        )
    }

    fn rasterize(&self, resolution: f32, background: Option<Color>) -> Result<Pixmap> {
        let tree = self.tree()?;
        let (content_w, content_h) = self.content_size(&tree);
        let (width, height) = self
            .viewport
            .map(|(w, h)| (w as f32, h as f32))
            .unwrap_or((content_w.ceil(), content_h.ceil()));

        let mut pixmap = Pixmap::new(
            (width * resolution).ceil().max(1.0) as u32,
            (height * resolution).ceil().max(1.0) as u32,
        )
        .ok_or_else(|| anyhow!("Failed to allocate pixmap"))?;
        if let Some(color) = background {
            pixmap.fill(color);
        }
        let scale = self.scale * resolution;
        let offset = self.border * resolution;
        let transform = Transform::from_row(scale, 0.0, 0.0, scale, offset, offset);
        resvg::render(&tree, transform, &mut pixmap.as_mut());
        Ok(pixmap)
    }
}

impl SurfaceBackend for SvgPageSurface {
    fn render(&mut self, job: RenderJob) -> Result<RenderInfo> {
        self.page = job.page as usize;
        let tree = self.tree()?;
        let bounds = tree.root().has_children().then(|| {
            let (width, height) = self.content_size(&tree);
            Bounds {
                x: 0.0,
                y: 0.0,
                width: f64::from(width),
                height: f64::from(height),
            }
        });
        Ok(RenderInfo {
            page_count: self.pages.len() as u32,
            bounds,
        })
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.viewport = Some((width, height));
        Ok(())
    }

    fn capture(&mut self) -> Result<RgbaImage> {
        let pixmap = self.rasterize(1.0, self.background)?;
        let (width, height) = (pixmap.width(), pixmap.height());
        let mut rgba = Vec::with_capacity(pixmap.data().len());
        for pixel in pixmap.pixels() {
            let color = pixel.demultiply();
            rgba.extend_from_slice(&[color.red(), color.green(), color.blue(), color.alpha()]);
        }
        RgbaImage::from_raw(width, height, rgba).ok_or_else(|| anyhow!("capture size mismatch"))
    }

    fn print_to_pdf(&mut self, options: PdfPrintOptions) -> Result<Vec<u8>> {
        self.viewport = None;
        let pixmap = self.rasterize(PRINT_RESOLUTION, Some(self.background.unwrap_or(Color::WHITE)))?;
        let (px_w, px_h) = (pixmap.width(), pixmap.height());

        let mut rgb = Vec::with_capacity((px_w * px_h * 3) as usize);
        for pixel in pixmap.pixels() {
            let color = pixel.demultiply();
            rgb.extend_from_slice(&[color.red(), color.green(), color.blue()]);
        }
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&rgb)?;
        let compressed = encoder.finish()?;

        let width_pt = px_w as f32 / PRINT_RESOLUTION * PX_TO_PT;
        let height_pt = px_h as f32 / PRINT_RESOLUTION * PX_TO_PT;
        let margin = if options.crop {
            0.0
        } else {
            options.margin as f32 * PX_TO_PT
        };

        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => i64::from(px_w),
                "Height" => i64::from(px_h),
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "FlateDecode",
            },
            compressed,
        ));
        let content = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new(
                    "cm",
                    vec![
                        width_pt.into(),
                        0.into(),
                        0.into(),
                        height_pt.into(),
                        margin.into(),
                        margin.into(),
                    ],
                ),
                Operation::new("Do", vec!["Im0".into()]),
                Operation::new("Q", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode()?));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Im0" => image_id },
            },
            "MediaBox" => vec![
                0.into(),
                0.into(),
                (width_pt + 2.0 * margin).into(),
                (height_pt + 2.0 * margin).into(),
            ],
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut out = Vec::new();
        doc.save_to(&mut out)?;
        Ok(out)
    }

    fn svg_data(&mut self) -> Result<String> {
        self.pages
            .get(self.page)
            .cloned()
            .ok_or_else(|| anyhow!("page {} out of range", self.page))
    }

    fn xml_data(&mut self) -> Result<String> {
        self.xml
            .as_deref()
            .cloned()
            .ok_or_else(|| anyhow!("no diagram source available"))
    }

    fn destroy(&mut self) {
        self.viewport = None;
        tracing::debug!(pages = self.pages.len(), "svg surface released");
    }
}

/// `#rgb`, `#rrggbb` or `#rrggbbaa`.
fn parse_color(value: &str) -> Result<Color> {
    let hex = value
        .strip_prefix('#')
        .filter(|hex| hex.is_ascii())
        .ok_or_else(|| anyhow!("unsupported background colour {value:?}"))?;
    let digit = |i: usize, len: usize| {
        u8::from_str_radix(&hex[i..i + len], 16)
            .map_err(|_| anyhow!("unsupported background colour {value:?}"))
    };
    let (r, g, b, a) = match hex.len() {
        3 => (digit(0, 1)? * 17, digit(1, 1)? * 17, digit(2, 1)? * 17, 255),
        6 => (digit(0, 2)?, digit(2, 2)?, digit(4, 2)?, 255),
        8 => (digit(0, 2)?, digit(2, 2)?, digit(4, 2)?, digit(6, 2)?),
        _ => bail!("unsupported background colour {value:?}"),
    };
    Ok(Color::from_rgba8(r, g, b, a))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="40" height="20"><rect x="0" y="0" width="40" height="20" fill="#ff0000"/></svg>"##;
    const EMPTY: &str = r#"<svg xmlns="http://www.w3.org/2000/svg" width="40" height="20"></svg>"#;

    fn surface(pages: &[&str], request: &ExportRequest) -> Box<dyn SurfaceBackend> {
        SvgPagesFactory::new(pages.iter().map(|p| p.to_string()).collect(), Some("<mxfile/>".into()))
            .create(request)
            .unwrap()
    }

    #[test]
    fn reports_bounds_and_page_count() {
        let request = ExportRequest {
            scale: 2.0,
            border: 5,
            ..ExportRequest::default()
        };
        let mut surface = surface(&[PAGE, EMPTY], &request);
        let info = surface.render(RenderJob { page: 0 }).unwrap();
        assert_eq!(info.page_count, 2);
        assert_eq!(
            info.bounds,
            Some(Bounds {
                x: 0.0,
                y: 0.0,
                width: 90.0,
                height: 50.0
            })
        );
        assert_eq!(surface.render(RenderJob { page: 1 }).unwrap().bounds, None);
        assert!(surface.render(RenderJob { page: 2 }).is_err());
    }

    #[test]
    fn capture_honours_viewport_and_background() {
        let request = ExportRequest {
            format: ExportFormat::Png,
            ..ExportRequest::default()
        };
        let mut surface = surface(&[PAGE], &request);
        surface.render(RenderJob { page: 0 }).unwrap();
        surface.resize(41, 21).unwrap();
        let image = surface.capture().unwrap();
        assert_eq!(image.dimensions(), (41, 21));
        assert_eq!(image.get_pixel(10, 10).0, [255, 0, 0, 255]);
        // Outside the page the transparent surface shows through.
        assert_eq!(image.get_pixel(40, 20).0[3], 0);
    }

    #[test]
    fn printed_page_is_a_single_page_pdf() {
        let mut surface = surface(&[PAGE], &ExportRequest::default());
        surface.render(RenderJob { page: 0 }).unwrap();
        let pdf = surface.print_to_pdf(PdfPrintOptions::default()).unwrap();
        assert!(pdf.starts_with(b"%PDF-"));
        assert_eq!(crate::pdf::page_count(&pdf).unwrap(), 1);
    }

    #[test]
    fn serialisations() {
        let mut surface = surface(&[PAGE], &ExportRequest::default());
        surface.render(RenderJob { page: 0 }).unwrap();
        assert_eq!(surface.svg_data().unwrap(), PAGE);
        assert_eq!(surface.xml_data().unwrap(), "<mxfile/>");
    }

    #[test]
    fn colours() {
        assert_eq!(parse_color("#fff").unwrap(), Color::WHITE);
        assert_eq!(parse_color("#000000").unwrap(), Color::BLACK);
        assert!(parse_color("white").is_err());
        assert!(parse_color("#12345").is_err());
    }
}
