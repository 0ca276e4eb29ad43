// =============================================================================
// GOOGLE DRIVE + SHEETS CLIENT
// =============================================================================
//
// Thin REST client over Drive v3 and Sheets v4, exposing only what the export
// stage needs: find/create a folder, create a spreadsheet, move it, share it
// and append rows.
//
// See:
// - https://developers.google.com/drive/api/reference/rest/v3
// - https://developers.google.com/sheets/api/reference/rest

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{GoogleApiError, ServiceAccountAuth};
use crate::core::agent::{
    CreatedSheet, FolderProvider, PortError, ShareRole, ShareTarget, SheetProvider,
};

const DRIVE_API: &str = "https://www.googleapis.com/drive/v3";
const SHEETS_API: &str = "https://sheets.googleapis.com/v4";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

// =============================================================================
// API RESPONSE STRUCTURES
// =============================================================================

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
    #[serde(default)]
    parents: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Spreadsheet {
    spreadsheet_id: String,
    spreadsheet_url: Option<String>,
    #[serde(default)]
    sheets: Vec<Sheet>,
}

#[derive(Debug, Deserialize)]
struct Sheet {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

// =============================================================================
// CLIENT
// =============================================================================

pub struct GoogleWorkspaceClient {
    client: Client,
    auth: ServiceAccountAuth,
    /// Tab titles per spreadsheet, needed to address ranges by index.
    /// Entries live from creation until `release_sheet`.
    tab_titles: DashMap<String, Vec<String>>,
}

impl GoogleWorkspaceClient {
    pub fn new(auth: ServiceAccountAuth) -> Self {
        Self {
            client: Client::new(),
            auth,
            tab_titles: DashMap::new(),
        }
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, GoogleApiError> {
        let token = self.auth.get_access_token().await?;
        Ok(request.bearer_auth(token))
    }

    async fn send(
        &self,
        context: &'static str,
        request: RequestBuilder,
    ) -> Result<Response, GoogleApiError> {
        let response = self.authorized(request).await?.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GoogleApiError::Status {
                context,
                status,
                body,
            });
        }
        Ok(response)
    }

    fn file_url(file_id: &str) -> Result<Url, GoogleApiError> {
        let mut url = Url::parse(DRIVE_API).map_err(|e| GoogleApiError::Unexpected(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| GoogleApiError::Unexpected("drive base url".into()))?
            .extend(["files", file_id]);
        Ok(url)
    }

    async fn find_folder_id(&self, name: &str) -> Result<Option<String>, GoogleApiError> {
        let request = self
            .client
            .get(format!("{}/files", DRIVE_API))
            .query(&[("q", folder_query(name).as_str()), ("fields", "files(id, name)")]);

        let list: FileList = self.send("folder lookup", request).await?.json().await?;
        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    async fn create_folder_id(&self, name: &str) -> Result<String, GoogleApiError> {
        let request = self
            .client
            .post(format!("{}/files", DRIVE_API))
            .query(&[("fields", "id")])
            .json(&json!({ "name": name, "mimeType": FOLDER_MIME_TYPE }));

        let file: DriveFile = self.send("folder creation", request).await?.json().await?;
        Ok(file.id)
    }

    async fn create_permission(
        &self,
        file_id: &str,
        target: &ShareTarget,
        role: ShareRole,
    ) -> Result<(), GoogleApiError> {
        let mut url = Self::file_url(file_id)?;
        url.path_segments_mut()
            .map_err(|_| GoogleApiError::Unexpected("drive file url".into()))?
            .push("permissions");

        let mut request = self.client.post(url).json(&permission_body(target, role));
        if matches!(target, ShareTarget::User(_)) {
            request = request.query(&[("sendNotificationEmail", "false")]);
        }

        self.send("permission creation", request).await?;
        Ok(())
    }

    async fn create_sheet(&self, title: &str) -> Result<CreatedSheet, GoogleApiError> {
        let request = self
            .client
            .post(format!("{}/spreadsheets", SHEETS_API))
            .json(&json!({ "properties": { "title": title } }));

        let sheet: Spreadsheet = self.send("spreadsheet creation", request).await?.json().await?;
        let url = sheet.spreadsheet_url.clone().unwrap_or_else(|| {
            format!(
                "https://docs.google.com/spreadsheets/d/{}",
                sheet.spreadsheet_id
            )
        });
        self.tab_titles.insert(
            sheet.spreadsheet_id.clone(),
            sheet.sheets.into_iter().map(|s| s.properties.title).collect(),
        );

        Ok(CreatedSheet {
            id: sheet.spreadsheet_id,
            url,
        })
    }

    async fn move_file(&self, file_id: &str, folder_id: &str) -> Result<(), GoogleApiError> {
        let request = self
            .client
            .get(Self::file_url(file_id)?)
            .query(&[("fields", "id, parents")]);
        let file: DriveFile = self.send("parent lookup", request).await?.json().await?;
        let previous_parents = file.parents.join(",");

        let request = self
            .client
            .patch(Self::file_url(file_id)?)
            .query(&[
                ("addParents", folder_id),
                ("removeParents", previous_parents.as_str()),
                ("fields", "id, parents"),
            ])
            .json(&json!({}));
        self.send("file move", request).await?;
        Ok(())
    }

    async fn tab_title(&self, sheet_id: &str, index: usize) -> Result<String, GoogleApiError> {
        if let Some(titles) = self.tab_titles.get(sheet_id) {
            if let Some(title) = titles.get(index) {
                return Ok(title.clone());
            }
        }

        let request = self
            .client
            .get(format!("{}/spreadsheets/{}", SHEETS_API, sheet_id))
            .query(&[("fields", "spreadsheetId,sheets.properties.title")]);
        let sheet: Spreadsheet = self.send("spreadsheet lookup", request).await?.json().await?;
        let titles: Vec<String> = sheet.sheets.into_iter().map(|s| s.properties.title).collect();
        let title = titles
            .get(index)
            .cloned()
            .ok_or_else(|| GoogleApiError::Unexpected(format!("no sheet at index {}", index)))?;
        self.tab_titles.insert(sheet_id.to_string(), titles);
        Ok(title)
    }

    async fn append_values(
        &self,
        sheet_id: &str,
        sheet_index: usize,
        values: Vec<Value>,
    ) -> Result<(), GoogleApiError> {
        let title = self.tab_title(sheet_id, sheet_index).await?;

        let mut url = Url::parse(SHEETS_API).map_err(|e| GoogleApiError::Unexpected(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| GoogleApiError::Unexpected("sheets base url".into()))?
            .extend(["spreadsheets", sheet_id, "values", append_range(&title).as_str()]);

        let request = self
            .client
            .post(url)
            .query(&[
                ("valueInputOption", "RAW"),
                ("insertDataOption", "INSERT_ROWS"),
            ])
            .json(&json!({ "values": [values] }));
        self.send("row append", request).await?;
        Ok(())
    }
}

/// Drive search expression for a non-trashed folder with exactly this name.
fn folder_query(name: &str) -> String {
    let escaped = name.replace('\\', "\\\\").replace('\'', "\\'");
    format!(
        "name='{}' and mimeType='{}' and trashed=false",
        escaped, FOLDER_MIME_TYPE
    )
}

fn permission_body(target: &ShareTarget, role: ShareRole) -> Value {
    match target {
        ShareTarget::User(email) => json!({
            "type": "user",
            "role": role.as_str(),
            "emailAddress": email,
        }),
        ShareTarget::Anyone => json!({
            "type": "anyone",
            "role": role.as_str(),
        }),
    }
}

/// `values.append` path segment for the first cell of a tab.
fn append_range(tab_title: &str) -> String {
    format!("'{}'!A1:append", tab_title.replace('\'', "''"))
}

// =============================================================================
// PORT IMPLEMENTATIONS
// =============================================================================

#[async_trait]
impl FolderProvider for GoogleWorkspaceClient {
    async fn find_folder(&self, name: &str) -> Result<Option<String>, PortError> {
        Ok(self.find_folder_id(name).await?)
    }

    async fn create_folder(&self, name: &str) -> Result<String, PortError> {
        Ok(self.create_folder_id(name).await?)
    }

    async fn share_folder(
        &self,
        folder_id: &str,
        email: &str,
        role: ShareRole,
    ) -> Result<(), PortError> {
        let target = ShareTarget::User(email.to_string());
        Ok(self.create_permission(folder_id, &target, role).await?)
    }
}

#[async_trait]
impl SheetProvider for GoogleWorkspaceClient {
    async fn create_spreadsheet(&self, title: &str) -> Result<CreatedSheet, PortError> {
        Ok(self.create_sheet(title).await?)
    }

    async fn move_to_folder(&self, sheet_id: &str, folder_id: &str) -> Result<(), PortError> {
        Ok(self.move_file(sheet_id, folder_id).await?)
    }

    async fn share(
        &self,
        sheet_id: &str,
        target: &ShareTarget,
        role: ShareRole,
    ) -> Result<(), PortError> {
        Ok(self.create_permission(sheet_id, target, role).await?)
    }

    async fn append_row(
        &self,
        sheet_id: &str,
        sheet_index: usize,
        values: Vec<Value>,
    ) -> Result<(), PortError> {
        Ok(self.append_values(sheet_id, sheet_index, values).await?)
    }

    fn release_sheet(&self, sheet_id: &str) {
        self.tab_titles.remove(sheet_id);
    }
}
