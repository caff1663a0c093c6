//! Persistence and export core of a diagram editor's desktop shell: content sniffing,
//! verified saves with backups, autosave drafts, and page-by-page export finished into
//! PDF, PNG, JPEG, SVG or XML.

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod drafts;
pub mod error;
pub mod export;
pub mod ipc;
pub mod logging;
pub mod model;
pub mod paths;
pub mod pdf;
pub mod plugins;
pub mod png;
pub mod sniff;
pub mod store;
pub mod surface;
#[cfg(feature = "svg-surface")]
pub mod svg_surface;

#[cfg(feature = "cli")]
pub use cli::run;
pub use error::{CoreError, ErrorKind, Result};
pub use export::{ExportFormat, ExportOutput, ExportRequest, Exporter};
pub use model::{DocumentHandle, Encoding, FileData, FileStat};
pub use store::FileStore;
