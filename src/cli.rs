use crate::config::{Config, load_config};
use crate::export::{ExportFormat, ExportOutput, ExportRequest, Exporter, LinkTarget, PageSelection, SvgTheme};
use crate::ipc::Dispatcher;
use crate::logging::{init_logging, verbosity_filter};
use crate::model::{Encoding, FileData};
use crate::paths;
use crate::store::FileStore;
use crate::svg_surface::SvgPagesFactory;
use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Parser, Debug)]
#[command(
    name = "mxcore",
    version,
    about = "Export diagram pages to PDF, PNG, JPEG, SVG or XML"
)]
pub struct Args {
    /// Pre-rendered SVG pages of the diagram, in page order
    #[arg(required_unless_present = "ipc")]
    pub pages: Vec<PathBuf>,

    /// Diagram source (.drawio/.xml) used for XML export and diagram embedding
    #[arg(short = 'x', long = "xml")]
    pub xml: Option<PathBuf>,

    /// Output file. Defaults to the first page's name with the format's extension.
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Output format; ignored when the output file has a known extension
    #[arg(short = 'f', long = "format", value_enum, default_value = "pdf")]
    pub format: FormatArg,

    /// JPEG quality (default: 90)
    #[arg(short = 'q', long = "quality", value_parser = clap::value_parser!(u8).range(1..=100))]
    pub quality: Option<u8>,

    /// Transparent background for PNG
    #[arg(short = 't', long = "transparent")]
    pub transparent: bool,

    /// Embed a copy of the diagram (PNG and PDF)
    #[arg(short = 'e', long = "embed-diagram")]
    pub embed_diagram: bool,

    /// Embed images in SVG output
    #[arg(long = "embed-svg-images")]
    pub embed_svg_images: bool,

    /// Embed fonts in SVG output
    #[arg(long = "embed-svg-fonts", default_value_t = true, action = clap::ArgAction::Set)]
    pub embed_svg_fonts: bool,

    /// Border around the diagram (page margin for PDF)
    #[arg(short = 'b', long = "border", default_value_t = 0)]
    pub border: u32,

    /// Scales the diagram size
    #[arg(short = 's', long = "scale", default_value_t = 1.0)]
    pub scale: f64,

    /// Fit the image into this width, preserving aspect ratio
    #[arg(long = "width")]
    pub width: Option<u32>,

    /// Fit the image into this height, preserving aspect ratio (wins over --width)
    #[arg(long = "height")]
    pub height: Option<u32>,

    /// Crop PDF output to the diagram
    #[arg(long = "crop")]
    pub crop: bool,

    /// Export all pages (PDF only)
    #[arg(short = 'a', long = "all-pages")]
    pub all_pages: bool,

    /// Page to export (1-based)
    #[arg(short = 'p', long = "page-index", value_parser = clap::value_parser!(u32).range(1..))]
    pub page_index: Option<u32>,

    /// Page range `<from>..<to>` (1-based, inclusive, PDF only)
    #[arg(short = 'g', long = "page-range", value_parser = parse_page_range)]
    pub page_range: Option<(u32, u32)>,

    /// Comma separated layer indexes to export
    #[arg(short = 'l', long = "layers", value_delimiter = ',')]
    pub layers: Option<Vec<u32>>,

    /// Uncompressed XML output
    #[arg(short = 'u', long = "uncompressed")]
    pub uncompressed: bool,

    #[arg(long = "svg-theme", value_enum, default_value = "auto")]
    pub svg_theme: ThemeArg,

    #[arg(long = "svg-links-target", value_enum, default_value = "auto")]
    pub svg_links_target: LinkTargetArg,

    /// Refuse to overwrite an existing output file
    #[arg(short = 'k', long = "check")]
    pub check: bool,

    /// Serve JSON requests from stdin, one per line, instead of exporting
    #[arg(long = "ipc")]
    pub ipc: bool,

    /// Config JSON file
    #[arg(short = 'c', long = "configFile")]
    pub config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatArg {
    Pdf,
    Png,
    #[value(alias = "jpeg")]
    Jpg,
    Svg,
    Xml,
}

impl From<FormatArg> for ExportFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Pdf => Self::Pdf,
            FormatArg::Png => Self::Png,
            FormatArg::Jpg => Self::Jpg,
            FormatArg::Svg => Self::Svg,
            FormatArg::Xml => Self::Xml,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum ThemeArg {
    Auto,
    Dark,
    Light,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum LinkTargetArg {
    Auto,
    NewWin,
    SameWin,
}

fn parse_page_range(value: &str) -> std::result::Result<(u32, u32), String> {
    let (from, to) = value
        .split_once("..")
        .ok_or_else(|| format!("expected <from>..<to>, got {value:?}"))?;
    let parse = |part: &str| {
        part.trim()
            .parse::<u32>()
            .map_err(|err| format!("{part:?}: {err}"))
    };
    let (from, to) = (parse(from)?, parse(to)?);
    if from == 0 || from > to {
        return Err("page range must be 1-based with from <= to".into());
    }
    Ok((from, to))
}

pub async fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(&verbosity_filter(args.verbose));
    let config = load_config(args.config.as_deref())?;

    if args.ipc {
        return serve_ipc(&args, &config).await;
    }

    let format = resolve_format(args.output.as_deref(), args.format.into());
    let output = match &args.output {
        Some(path) => path.clone(),
        None => args
            .pages
            .first()
            .map(|page| page.with_extension(format.extension()))
            .ok_or_else(|| anyhow!("no pages given"))?,
    };
    ensure_not_input(&output, &args.pages)?;
    if args.check && tokio::fs::try_exists(&output).await.unwrap_or(false) {
        bail!("Output file already exists: {}", output.display());
    }

    let request = build_request(&args, format, read_xml(&args).await?);
    let factory = load_pages(&args, request.xml.clone()).await?;
    let exporter = Exporter::new(Arc::new(factory), config.export.clone());
    let artifact = exporter.export(&request).await?;

    let store = FileStore::new(&config.storage);
    let (data, encoding) = match artifact {
        ExportOutput::Bytes(bytes) => (FileData::Binary(bytes), None),
        ExportOutput::Text(text) => (FileData::Text(text), Some(Encoding::Utf8)),
    };
    store
        .write_file(&output, &data, encoding)
        .await
        .with_context(|| format!("writing {}", output.display()))?;
    tracing::info!(output = %output.display(), "exported");
    Ok(())
}

async fn serve_ipc(args: &Args, config: &Config) -> Result<()> {
    let exporter = if args.pages.is_empty() {
        None
    } else {
        let factory = load_pages(args, read_xml(args).await?).await?;
        Some(Exporter::new(Arc::new(factory), config.export.clone()))
    };
    let dispatcher = Dispatcher::new(config, exporter);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = dispatcher.handle_json(&line).await;
        stdout.write_all(reply.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

/// An export never replaces one of its own source pages.
fn ensure_not_input(output: &Path, pages: &[PathBuf]) -> Result<()> {
    let target = paths::normalize(output);
    if pages.iter().any(|page| paths::normalize(page) == target) {
        bail!(
            "Output file {} is one of the input pages; pass --output",
            output.display()
        );
    }
    Ok(())
}

/// Output extension wins over `--format` when it names a known format.
fn resolve_format(output: Option<&Path>, fallback: ExportFormat) -> ExportFormat {
    output
        .and_then(|path| path.extension())
        .and_then(|ext| ext.to_str())
        .and_then(ExportFormat::from_extension)
        .unwrap_or(fallback)
}

fn build_request(args: &Args, format: ExportFormat, xml: Option<String>) -> ExportRequest {
    let pages = if let Some(index) = args.page_index {
        PageSelection::Single { index: index - 1 }
    } else if let Some((from, to)) = args.page_range {
        PageSelection::Range {
            from: from - 1,
            to: to - 1,
        }
    } else if args.all_pages && format == ExportFormat::Pdf {
        PageSelection::All
    } else {
        PageSelection::default()
    };
    let is_pdf = format == ExportFormat::Pdf;

    ExportRequest {
        format,
        pages,
        scale: args.scale,
        border: if is_pdf { 0 } else { args.border },
        page_margin: if is_pdf { args.border } else { 0 },
        width: args.width.filter(|w| *w > 0),
        height: args.height.filter(|h| *h > 0),
        bg: Some(if args.transparent { "none" } else { "#ffffff" }.to_string()),
        embed_xml: args.embed_diagram,
        xml,
        jpeg_quality: args.quality,
        theme: match args.svg_theme {
            ThemeArg::Auto => SvgTheme::Auto,
            ThemeArg::Dark => SvgTheme::Dark,
            ThemeArg::Light => SvgTheme::Light,
        },
        link_target: match args.svg_links_target {
            LinkTargetArg::Auto => LinkTarget::Auto,
            LinkTargetArg::NewWin => LinkTarget::NewWin,
            LinkTargetArg::SameWin => LinkTarget::SameWin,
        },
        embed_images: args.embed_svg_images,
        embed_fonts: args.embed_svg_fonts,
        crop: args.crop && is_pdf,
        layers: args.layers.clone(),
        uncompressed: args.uncompressed,
        ..ExportRequest::default()
    }
}

async fn read_xml(args: &Args) -> Result<Option<String>> {
    match &args.xml {
        Some(path) => Ok(Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?,
        )),
        None => Ok(None),
    }
}

async fn load_pages(args: &Args, xml: Option<String>) -> Result<SvgPagesFactory> {
    let mut pages = Vec::with_capacity(args.pages.len());
    for path in &args.pages {
        let svg = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        pages.push(svg);
    }
    if pages.is_empty() {
        return Err(anyhow!("no pages given"));
    }
    Ok(SvgPagesFactory::new(pages, xml))
}
