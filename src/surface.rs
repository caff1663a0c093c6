//! Rendering-surface protocol.
//!
//! A surface is an isolated off-screen renderer owned by exactly one export. Backends are
//! synchronous and run on a blocking thread; the orchestrator talks to them through a
//! command/event channel pair and never touches the backend directly.

use crate::error::{CoreError, Result};
use crate::export::ExportRequest;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Content bounds of a rendered page, in surface pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// "Render finished" payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderInfo {
    pub page_count: u32,
    /// `None` when the page drew nothing.
    pub bounds: Option<Bounds>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderJob {
    /// Zero-based page index.
    pub page: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PdfPrintOptions {
    /// Crop the page to the content bounds instead of the page format.
    pub crop: bool,
    /// Margin around the content, in CSS pixels.
    pub margin: u32,
}

#[derive(Debug)]
pub enum SurfaceCommand {
    Render(RenderJob),
    Resize { width: u32, height: u32 },
    Capture,
    PrintToPdf(PdfPrintOptions),
    GetSvgData,
    GetXmlData,
    Destroy,
}

#[derive(Debug)]
pub enum SurfaceEvent {
    RenderFinished(RenderInfo),
    Resized,
    Captured(RgbaImage),
    Pdf(Vec<u8>),
    SvgData(String),
    XmlData(String),
    Failed(String),
}

/// One headless renderer instance. Errors are opaque to the core and surface as render errors.
pub trait SurfaceBackend: Send + 'static {
    fn render(&mut self, job: RenderJob) -> anyhow::Result<RenderInfo>;
    fn resize(&mut self, width: u32, height: u32) -> anyhow::Result<()>;
    fn capture(&mut self) -> anyhow::Result<RgbaImage>;
    fn print_to_pdf(&mut self, options: PdfPrintOptions) -> anyhow::Result<Vec<u8>>;
    fn svg_data(&mut self) -> anyhow::Result<String>;
    fn xml_data(&mut self) -> anyhow::Result<String>;
    /// Releases the surface. Called exactly once, after the last command.
    fn destroy(&mut self);
}

/// Creates a fresh surface per export request.
pub trait SurfaceFactory: Send + Sync {
    fn create(&self, request: &ExportRequest) -> anyhow::Result<Box<dyn SurfaceBackend>>;
}

fn dispatch(backend: &mut dyn SurfaceBackend, command: SurfaceCommand) -> SurfaceEvent {
    let result = match command {
        SurfaceCommand::Render(job) => backend.render(job).map(SurfaceEvent::RenderFinished),
        SurfaceCommand::Resize { width, height } => {
            backend.resize(width, height).map(|()| SurfaceEvent::Resized)
        }
        SurfaceCommand::Capture => backend.capture().map(SurfaceEvent::Captured),
        SurfaceCommand::PrintToPdf(options) => backend.print_to_pdf(options).map(SurfaceEvent::Pdf),
        SurfaceCommand::GetSvgData => backend.svg_data().map(SurfaceEvent::SvgData),
        SurfaceCommand::GetXmlData => backend.xml_data().map(SurfaceEvent::XmlData),
        SurfaceCommand::Destroy => Err(anyhow::anyhow!("surface is being destroyed")),
    };
    result.unwrap_or_else(|err| SurfaceEvent::Failed(format!("{err:#}")))
}

/// Starts `backend` on a blocking thread and returns the export's end of the channel.
pub fn spawn_surface(mut backend: Box<dyn SurfaceBackend>) -> SurfaceHandle {
    let (commands, mut command_rx) = mpsc::channel::<SurfaceCommand>(1);
    let (event_tx, events) = mpsc::channel::<SurfaceEvent>(1);
    let task = tokio::task::spawn_blocking(move || {
        while let Some(command) = command_rx.blocking_recv() {
            if matches!(command, SurfaceCommand::Destroy) {
                break;
            }
            if event_tx.blocking_send(dispatch(backend.as_mut(), command)).is_err() {
                break;
            }
        }
        backend.destroy();
        debug!("rendering surface destroyed");
    });
    SurfaceHandle {
        commands,
        events,
        task,
    }
}

/// Exclusive handle on a running surface. [`SurfaceHandle::destroy`] consumes it, so a surface
/// is torn down at most once; dropping the handle closes the channel and tears it down too.
pub struct SurfaceHandle {
    commands: mpsc::Sender<SurfaceCommand>,
    events: mpsc::Receiver<SurfaceEvent>,
    task: JoinHandle<()>,
}

impl SurfaceHandle {
    /// One round trip. A closed channel means the surface went away under us.
    pub async fn request(&mut self, command: SurfaceCommand) -> Result<SurfaceEvent> {
        let closed = || CoreError::Render("rendering surface closed".into());
        self.commands.send(command).await.map_err(|_| closed())?;
        match self.events.recv().await {
            Some(SurfaceEvent::Failed(message)) => Err(CoreError::Render(message)),
            Some(event) => Ok(event),
            None => Err(closed()),
        }
    }

    pub async fn render(&mut self, page: u32) -> Result<RenderInfo> {
        match self.request(SurfaceCommand::Render(RenderJob { page })).await? {
            SurfaceEvent::RenderFinished(info) => Ok(info),
            other => Err(unexpected("render", &other)),
        }
    }

    /// Resolves once the surface has acknowledged the new size.
    pub async fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        match self.request(SurfaceCommand::Resize { width, height }).await? {
            SurfaceEvent::Resized => Ok(()),
            other => Err(unexpected("resize", &other)),
        }
    }

    pub async fn capture(&mut self) -> Result<RgbaImage> {
        match self.request(SurfaceCommand::Capture).await? {
            SurfaceEvent::Captured(image) => Ok(image),
            other => Err(unexpected("capture", &other)),
        }
    }

    pub async fn print_to_pdf(&mut self, options: PdfPrintOptions) -> Result<Vec<u8>> {
        match self.request(SurfaceCommand::PrintToPdf(options)).await? {
            SurfaceEvent::Pdf(bytes) => Ok(bytes),
            other => Err(unexpected("print", &other)),
        }
    }

    pub async fn svg_data(&mut self) -> Result<String> {
        match self.request(SurfaceCommand::GetSvgData).await? {
            SurfaceEvent::SvgData(svg) => Ok(svg),
            other => Err(unexpected("svg data", &other)),
        }
    }

    pub async fn xml_data(&mut self) -> Result<String> {
        match self.request(SurfaceCommand::GetXmlData).await? {
            SurfaceEvent::XmlData(xml) => Ok(xml),
            other => Err(unexpected("xml data", &other)),
        }
    }

    /// Tears the surface down and waits for the backend to release it.
    pub async fn destroy(self) {
        let Self {
            commands,
            events,
            task,
        } = self;
        // A surface that already stopped has nothing left to destroy.
        let _ = commands.send(SurfaceCommand::Destroy).await;
        drop(commands);
        drop(events);
        if let Err(err) = task.await {
            warn!(error = %err, "rendering surface task ended abnormally");
        }
    }
}

fn unexpected(stage: &str, event: &SurfaceEvent) -> CoreError {
    let name = match event {
        SurfaceEvent::RenderFinished(_) => "render-finished",
        SurfaceEvent::Resized => "resized",
        SurfaceEvent::Captured(_) => "captured",
        SurfaceEvent::Pdf(_) => "pdf",
        SurfaceEvent::SvgData(_) => "svg-data",
        SurfaceEvent::XmlData(_) => "xml-data",
        SurfaceEvent::Failed(_) => "failed",
    };
    CoreError::Render(format!("unexpected {name} reply to {stage}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Echo {
        destroyed: Arc<AtomicU32>,
    }

    impl SurfaceBackend for Echo {
        fn render(&mut self, job: RenderJob) -> anyhow::Result<RenderInfo> {
            if job.page > 0 {
                anyhow::bail!("no page {}", job.page);
            }
            Ok(RenderInfo {
                page_count: 1,
                bounds: None,
            })
        }
        fn resize(&mut self, _: u32, _: u32) -> anyhow::Result<()> {
            Ok(())
        }
        fn capture(&mut self) -> anyhow::Result<RgbaImage> {
            Ok(RgbaImage::new(2, 2))
        }
        fn print_to_pdf(&mut self, _: PdfPrintOptions) -> anyhow::Result<Vec<u8>> {
            Ok(b"%PDF-".to_vec())
        }
        fn svg_data(&mut self) -> anyhow::Result<String> {
            Ok("<svg/>".into())
        }
        fn xml_data(&mut self) -> anyhow::Result<String> {
            anyhow::bail!("no source")
        }
        fn destroy(&mut self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn round_trips_and_single_teardown() {
        let destroyed = Arc::new(AtomicU32::new(0));
        let mut surface = spawn_surface(Box::new(Echo {
            destroyed: destroyed.clone(),
        }));
        assert_eq!(surface.render(0).await.unwrap().page_count, 1);
        surface.resize(10, 10).await.unwrap();
        assert_eq!(surface.capture().await.unwrap().dimensions(), (2, 2));
        assert_eq!(surface.svg_data().await.unwrap(), "<svg/>");

        let err = surface.render(3).await.unwrap_err();
        assert!(matches!(err, CoreError::Render(ref msg) if msg.contains("no page 3")));
        assert!(matches!(surface.xml_data().await, Err(CoreError::Render(_))));

        surface.destroy().await;
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropping_the_handle_still_tears_down() {
        let destroyed = Arc::new(AtomicU32::new(0));
        let surface = spawn_surface(Box::new(Echo {
            destroyed: destroyed.clone(),
        }));
        drop(surface);
        for _ in 0..100 {
            if destroyed.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }
}
