// =============================================================================
// GOOGLE WORKSPACE MODULE
// =============================================================================
//
// Drive and Sheets access for the export stage. This lives in the infra
// layer because it is all HTTP against Google APIs; the core only sees the
// `FolderProvider` / `SheetProvider` traits.
//
// **Authentication:**
// A service account key (see `service_account.rs`). Everything the agent
// creates is owned by the service account, which is why the export stage
// shares folders and sheets with a personal address afterwards.

pub mod service_account;
pub mod workspace_client;

pub use service_account::ServiceAccountAuth;
pub use workspace_client::GoogleWorkspaceClient;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GoogleApiError {
    #[error("Invalid service account credentials: {0}")]
    Credentials(String),

    #[error("Failed to sign token request: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Google API error during {context} ({status}): {body}")]
    Status {
        context: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("Unexpected Google API response: {0}")]
    Unexpected(String),
}
