//! Action-tagged request/response layer between the editor and the core.
//!
//! Requests look like `{"reqId": 7, "action": "saveFile", "fileObject": {...}, ...}`. Replies
//! carry the same `reqId` and either `success` + `data` or `error` + `msg` + `kind`.

use crate::config::Config;
use crate::error::{CoreError, ErrorKind, Result};
use crate::export::{ExportOutput, ExportRequest, Exporter};
use crate::model::{DocumentHandle, Encoding, FileData, FileStat};
use crate::plugins::PluginStore;
use crate::store::{self, FileStore};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub req_id: u64,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Action {
    SaveFile {
        file_object: DocumentHandle,
        data: FileData,
        #[serde(default)]
        orig_stat: Option<FileStat>,
        #[serde(default)]
        overwrite: bool,
        #[serde(default)]
        def_enc: Option<Encoding>,
    },
    WriteFile {
        path: PathBuf,
        data: FileData,
        #[serde(default)]
        enc: Option<Encoding>,
    },
    SaveDraft {
        file_object: DocumentHandle,
        data: FileData,
    },
    GetFileDrafts {
        file_object: DocumentHandle,
    },
    DeleteFile {
        file: PathBuf,
    },
    ReadFile {
        filename: PathBuf,
        #[serde(default)]
        encoding: Option<Encoding>,
    },
    FileStat {
        file: PathBuf,
    },
    IsFileWritable {
        file: PathBuf,
    },
    CheckFileExists {
        path_parts: Vec<PathBuf>,
    },
    Dirname {
        path: PathBuf,
    },
    GetDocumentsFolder,
    InstallPlugin {
        file_path: PathBuf,
    },
    UninstallPlugin {
        plugin: String,
    },
    GetPluginFile {
        plugin: String,
    },
    IsPluginsEnabled,
    /// Byte artifacts come back base64-encoded; text artifacts as-is.
    Export(ExportRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub success: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    pub req_id: u64,
}

impl Response {
    pub fn ok(req_id: u64, data: Value) -> Self {
        Self {
            success: true,
            error: false,
            data,
            msg: None,
            kind: None,
            req_id,
        }
    }

    pub fn failed(req_id: u64, err: &CoreError) -> Self {
        Self {
            success: false,
            error: true,
            data: Value::Null,
            msg: Some(err.to_string()),
            kind: Some(err.kind()),
            req_id,
        }
    }
}

fn json<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|err| CoreError::InvalidRequest(err.to_string()))
}

/// Routes requests to the store, the plugin manager and (when configured) the exporter.
pub struct Dispatcher {
    store: FileStore,
    plugins: PluginStore,
    exporter: Option<Exporter>,
}

impl Dispatcher {
    pub fn new(config: &Config, exporter: Option<Exporter>) -> Self {
        Self::with_parts(
            FileStore::new(&config.storage),
            PluginStore::new(&config.storage),
            exporter,
        )
    }

    pub fn with_parts(store: FileStore, plugins: PluginStore, exporter: Option<Exporter>) -> Self {
        Self {
            store,
            plugins,
            exporter,
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let req_id = request.req_id;
        match self.run(request.action).await {
            Ok(data) => Response::ok(req_id, data),
            Err(err) => {
                debug!(req_id, error = %err, "request failed");
                Response::failed(req_id, &err)
            }
        }
    }

    /// Parses one JSON request and serialises the reply. Unparseable input still gets a reply,
    /// keyed by whatever `reqId` could be salvaged.
    pub async fn handle_json(&self, raw: &str) -> String {
        let response = match serde_json::from_str::<Request>(raw) {
            Ok(request) => self.handle(request).await,
            Err(err) => {
                let req_id = serde_json::from_str::<Value>(raw)
                    .ok()
                    .and_then(|value| value.get("reqId").and_then(Value::as_u64))
                    .unwrap_or(0);
                warn!(req_id, error = %err, "malformed request");
                Response::failed(req_id, &CoreError::InvalidRequest(err.to_string()))
            }
        };
        serde_json::to_string(&response).unwrap_or_else(|err| {
            format!(r#"{{"error":true,"msg":"{err}","reqId":{}}}"#, response.req_id)
        })
    }

    async fn run(&self, action: Action) -> Result<Value> {
        match action {
            Action::SaveFile {
                file_object,
                data,
                orig_stat,
                overwrite,
                def_enc,
            } => json(
                self.store
                    .save_file(&file_object, &data, orig_stat.as_ref(), overwrite, def_enc)
                    .await?,
            ),
            Action::WriteFile { path, data, enc } => {
                self.store.write_file(&path, &data, enc).await?;
                Ok(Value::Null)
            }
            Action::SaveDraft { file_object, data } => {
                json(self.store.save_draft(&file_object, &data).await?)
            }
            Action::GetFileDrafts { file_object } => {
                json(self.store.get_file_drafts(&file_object).await)
            }
            Action::DeleteFile { file } => {
                self.store.delete_file(&file).await?;
                Ok(Value::Null)
            }
            Action::ReadFile { filename, encoding } => {
                json(self.store.read_file(&filename, encoding).await?)
            }
            Action::FileStat { file } => json(self.store.file_stat(&file).await?),
            Action::IsFileWritable { file } => json(self.store.is_file_writable(&file).await),
            Action::CheckFileExists { path_parts } => {
                json(self.store.check_file_exists(&path_parts).await)
            }
            Action::Dirname { path } => json(store::dirname(&path)),
            Action::GetDocumentsFolder => json(store::documents_folder()),
            Action::InstallPlugin { file_path } => json(self.plugins.install(&file_path).await?),
            Action::UninstallPlugin { plugin } => {
                self.plugins.uninstall(&plugin).await?;
                Ok(Value::Null)
            }
            Action::GetPluginFile { plugin } => json(self.plugins.plugin_file(&plugin).await),
            Action::IsPluginsEnabled => json(self.plugins.is_enabled()),
            Action::Export(request) => {
                let exporter = self.exporter.as_ref().ok_or_else(|| {
                    CoreError::InvalidRequest("no rendering surface configured".into())
                })?;
                Ok(match exporter.export(&request).await? {
                    ExportOutput::Text(text) => Value::String(text),
                    ExportOutput::Bytes(bytes) => Value::String(STANDARD.encode(bytes)),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher(dir: &std::path::Path) -> Dispatcher {
        Dispatcher::with_parts(
            FileStore::with_base_dir(None, true),
            PluginStore::with_dir(dir.join("plugins"), false),
            None,
        )
    }

    #[tokio::test]
    async fn save_then_read_over_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.xml");
        let dispatcher = dispatcher(dir.path());

        let save = serde_json::json!({
            "reqId": 1,
            "action": "saveFile",
            "fileObject": {"path": path},
            "data": "<mxfile>x</mxfile>",
            "origStat": null,
            "overwrite": true,
            "defEnc": "utf8",
        });
        let reply: Value =
            serde_json::from_str(&dispatcher.handle_json(&save.to_string()).await).unwrap();
        assert_eq!(reply["success"], true);
        assert_eq!(reply["reqId"], 1);
        assert!(reply["data"]["mtimeMs"].as_f64().is_some());

        let read = serde_json::json!({
            "reqId": 2,
            "action": "readFile",
            "filename": path,
            "encoding": "utf8",
        });
        let reply: Value =
            serde_json::from_str(&dispatcher.handle_json(&read.to_string()).await).unwrap();
        assert_eq!(reply["data"], "<mxfile>x</mxfile>");
    }

    #[tokio::test]
    async fn failures_carry_kind_and_message() {
        let dir = tempfile::tempdir().unwrap();
        let request: Request = serde_json::from_value(serde_json::json!({
            "reqId": 9,
            "action": "writeFile",
            "path": dir.path().join("d.xml"),
            "data": "",
        }))
        .unwrap();
        let response = dispatcher(dir.path()).handle(request).await;
        assert!(response.error);
        assert_eq!(response.kind, Some(ErrorKind::InvalidContent));
        assert_eq!(response.msg.as_deref(), Some("Invalid file data"));
        assert_eq!(response.req_id, 9);
    }

    #[tokio::test]
    async fn malformed_requests_still_get_a_reply() {
        let dir = tempfile::tempdir().unwrap();
        let reply: Value = serde_json::from_str(
            &dispatcher(dir.path())
                .handle_json(r#"{"reqId":4,"action":"frobnicate"}"#)
                .await,
        )
        .unwrap();
        assert_eq!(reply["error"], true);
        assert_eq!(reply["kind"], "invalidRequest");
        assert_eq!(reply["reqId"], 4);
    }

    #[tokio::test]
    async fn export_without_surface_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let request: Request =
            serde_json::from_str(r#"{"reqId":5,"action":"export","format":"svg"}"#).unwrap();
        let response = dispatcher(dir.path()).handle(request).await;
        assert_eq!(response.kind, Some(ErrorKind::InvalidRequest));
    }

    #[tokio::test]
    async fn plugin_flag_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let request: Request =
            serde_json::from_str(r#"{"reqId":6,"action":"isPluginsEnabled"}"#).unwrap();
        let response = dispatcher(dir.path()).handle(request).await;
        assert_eq!(response.data, Value::Bool(false));
        assert!(response.success);
    }
}
