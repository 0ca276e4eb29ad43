// Ports the pipeline talks through. The core only knows these traits; the
// infra layer provides the HTTP-backed implementations and tests plug in
// in-memory fakes.

use async_trait::async_trait;
use serde_json::Value;
use std::error::Error;
use std::time::Duration;

use super::agent_models::Record;

pub type PortError = Box<dyn Error + Send + Sync>;

/// Turns free text into a parameter mapping. The output is untrusted.
#[async_trait]
pub trait ParamExtractor: Send + Sync {
    async fn extract(&self, query: &str) -> Result<Value, PortError>;
}

/// Read-only GET against the data endpoint. Errors on transport failure or a
/// non-2xx status.
#[async_trait]
pub trait RecordFetcher: Send + Sync {
    async fn get(&self, url: &str, timeout: Duration) -> Result<Vec<Record>, PortError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareTarget {
    User(String),
    Anyone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareRole {
    Reader,
    Writer,
}

impl ShareRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShareRole::Reader => "reader",
            ShareRole::Writer => "writer",
        }
    }
}

/// A newly created spreadsheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSheet {
    pub id: String,
    pub url: String,
}

#[async_trait]
pub trait FolderProvider: Send + Sync {
    /// Exact-name lookup among non-trashed folders.
    async fn find_folder(&self, name: &str) -> Result<Option<String>, PortError>;

    async fn create_folder(&self, name: &str) -> Result<String, PortError>;

    async fn share_folder(
        &self,
        folder_id: &str,
        email: &str,
        role: ShareRole,
    ) -> Result<(), PortError>;
}

#[async_trait]
pub trait SheetProvider: Send + Sync {
    async fn create_spreadsheet(&self, title: &str) -> Result<CreatedSheet, PortError>;

    async fn move_to_folder(&self, sheet_id: &str, folder_id: &str) -> Result<(), PortError>;

    async fn share(
        &self,
        sheet_id: &str,
        target: &ShareTarget,
        role: ShareRole,
    ) -> Result<(), PortError>;

    async fn append_row(
        &self,
        sheet_id: &str,
        sheet_index: usize,
        values: Vec<Value>,
    ) -> Result<(), PortError>;

    /// Called once the pipeline is done writing to a sheet, whether the
    /// writes succeeded or not. Lets implementations drop per-sheet state.
    fn release_sheet(&self, _sheet_id: &str) {}
}

/// Both document-side collaborators. The Google client implements the pair,
/// so the pipeline holds a single handle for export.
pub trait DocumentProvider: FolderProvider + SheetProvider {}

impl<T: FolderProvider + SheetProvider> DocumentProvider for T {}
