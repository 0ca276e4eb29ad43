// The five-stage agent pipeline.
//
// parse query -> fetch data -> shape data -> export sheet -> respond
//
// Stages run strictly in order over one `PipelineState`. A stage that fails
// records its error in the state instead of returning it, and every later
// stage except `Respond` sees the error and does nothing. The caller always
// gets a state back with a rendered reply appended to the conversation.

use chrono::Local;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

use super::agent_config::{AgentConfig, NUMERIC_FILTER_FIELDS};
use super::agent_models::{ChatMessage, ExtractedParams, PipelineState, Record};
use super::agent_ports::{DocumentProvider, ParamExtractor, RecordFetcher, ShareRole, ShareTarget};
use super::formatting::{format_pipeline_response, AgentStatus};
use super::param_validator::{fallback_params, validate_params};

const DRIVE_FOLDER_URL: &str = "https://drive.google.com/drive/folders/";

// ============================================================================
// ERRORS
// ============================================================================

/// Failures that end a run. The `Display` text is what lands in
/// `PipelineState::error`.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Empty user query")]
    EmptyQuery,

    #[error("API fetch failed: {0}")]
    Fetch(String),

    #[error("API fetch failed: filter value for '{field}' is not an integer: {value}")]
    InvalidFilter { field: String, value: Value },

    #[error("Google Sheets is not configured")]
    SheetsNotConfigured,

    #[error("Google Sheet creation failed: {0}")]
    Export(String),
}

/// Why the extractor's output couldn't be used. Always recovered locally.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("no extractor configured")]
    NotConfigured,

    #[error("extractor call failed: {0}")]
    Call(String),
}

// ============================================================================
// STAGES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ParseQuery,
    FetchData,
    ShapeData,
    ExportSheet,
    Respond,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::ParseQuery,
        Stage::FetchData,
        Stage::ShapeData,
        Stage::ExportSheet,
        Stage::Respond,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::ParseQuery => "parse_query",
            Stage::FetchData => "fetch_data",
            Stage::ShapeData => "shape_data",
            Stage::ExportSheet => "export_sheet",
            Stage::Respond => "respond",
        }
    }

    /// Parsing may replace a stale error and the reply always renders;
    /// everything else stands down once an error is recorded.
    fn skips_on_error(&self) -> bool {
        !matches!(self, Stage::ParseQuery | Stage::Respond)
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct AgentPipeline {
    config: Arc<AgentConfig>,
    extractor: Option<Arc<dyn ParamExtractor>>,
    fetcher: Arc<dyn RecordFetcher>,
    documents: Option<Arc<dyn DocumentProvider>>,
}

impl AgentPipeline {
    pub fn new(
        config: Arc<AgentConfig>,
        extractor: Option<Arc<dyn ParamExtractor>>,
        fetcher: Arc<dyn RecordFetcher>,
        documents: Option<Arc<dyn DocumentProvider>>,
    ) -> Self {
        Self {
            config,
            extractor,
            fetcher,
            documents,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Runs the whole pipeline for one utterance on a fresh state.
    pub async fn run(&self, utterance: &str) -> PipelineState {
        self.run_state(PipelineState::new(&self.config, utterance))
            .await
    }

    /// Runs the whole pipeline over a caller-built state.
    pub async fn run_state(&self, mut state: PipelineState) -> PipelineState {
        for stage in Stage::ALL {
            self.run_stage(stage, &mut state).await;
        }

        tracing::info!(
            error = state.error.as_deref().unwrap_or(""),
            sheets_url = %state.sheets_url,
            "Agent run finished"
        );
        state
    }

    /// Runs a single stage, honouring the skip-on-error rule.
    pub async fn run_stage(&self, stage: Stage, state: &mut PipelineState) {
        if stage.skips_on_error() && state.has_error() {
            tracing::debug!(stage = stage.name(), "Skipping stage after earlier error");
            return;
        }

        tracing::debug!(stage = stage.name(), "Entering stage");
        let result = match stage {
            Stage::ParseQuery => self.parse_query(state).await,
            Stage::FetchData => self.fetch_data(state).await,
            Stage::ShapeData => {
                self.shape_data(state);
                Ok(())
            }
            Stage::ExportSheet => self.export_sheet(state).await,
            Stage::Respond => {
                self.respond(state);
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::error!(stage = stage.name(), "{}", e);
            state.set_error(e.to_string());
        }
    }

    /// Parses and validates a query without fetching or exporting anything.
    pub async fn validate_query(&self, query: &str) -> Result<ExtractedParams, StageError> {
        let mut state = PipelineState::new(&self.config, query);
        self.parse_query(&mut state).await?;
        state.extracted_params.ok_or(StageError::EmptyQuery)
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            model: self.config.openai.model.clone(),
            extractor_configured: self.extractor.is_some(),
            sheets_configured: self.documents.is_some(),
            default_api: self.config.default_api_url.clone(),
            valid_fields: self.config.all_fields(),
            default_limit: self.config.limits.default,
        }
    }

    // ------------------------------------------------------------------------
    // Stage 1: query parsing
    // reads: messages, writes: user_query, extracted_params, error
    // ------------------------------------------------------------------------

    async fn parse_query(&self, state: &mut PipelineState) -> Result<(), StageError> {
        let query = match state.latest_human_message() {
            Some(text) if !text.trim().is_empty() => text.to_string(),
            _ => return Err(StageError::EmptyQuery),
        };

        tracing::info!(query = %query, "Parsing user query");

        let params = match self.extract(&query).await {
            Ok(raw) => validate_params(raw, &query, &self.config),
            Err(e) => {
                tracing::warn!("Extraction unusable ({}), using keyword fallback", e);
                let fallback = fallback_params(&query, &self.config);
                validate_params(fallback, &query, &self.config)
            }
        };

        tracing::debug!(
            limit = params.limit,
            fields = ?params.fields,
            "Query parameters resolved"
        );

        state.extracted_params = Some(params);
        state.user_query = query;
        state.error = None;
        Ok(())
    }

    async fn extract(&self, query: &str) -> Result<Value, ExtractionError> {
        let extractor = self
            .extractor
            .as_ref()
            .ok_or(ExtractionError::NotConfigured)?;
        extractor
            .extract(query)
            .await
            .map_err(|e| ExtractionError::Call(e.to_string()))
    }

    // ------------------------------------------------------------------------
    // Stage 2: data fetch
    // reads: api_url, extracted_params, writes: api_url, api_data
    // ------------------------------------------------------------------------

    async fn fetch_data(&self, state: &mut PipelineState) -> Result<(), StageError> {
        if state.api_url.trim().is_empty() {
            state.api_url = self.config.default_api_url.clone();
        }

        let records = self
            .fetcher
            .get(&state.api_url, self.config.api_timeout)
            .await
            .map_err(|e| StageError::Fetch(e.to_string()))?;
        let total = records.len();

        let (filters, limit) = match &state.extracted_params {
            Some(params) => (params.filters.clone(), params.limit),
            None => (Map::new(), self.config.limits.default),
        };

        let filtered = apply_filters(records, &filters)?;
        let limited: Vec<Record> = filtered.into_iter().take(limit as usize).collect();

        tracing::info!(
            url = %state.api_url,
            total,
            kept = limited.len(),
            limit,
            "Fetched records"
        );

        state.api_data = Some(limited);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Stage 3: shaping
    // reads: api_data, extracted_params, writes: processed_data
    // ------------------------------------------------------------------------

    fn shape_data(&self, state: &mut PipelineState) {
        let Some(records) = &state.api_data else {
            tracing::debug!("No fetched data to shape");
            return;
        };

        let fields = state
            .extracted_params
            .as_ref()
            .map(|p| p.fields.clone())
            .unwrap_or_else(|| self.config.all_fields());

        let shaped = project_records(records, &fields);
        tracing::info!(records = shaped.len(), fields = ?fields, "Shaped records");
        state.processed_data = Some(shaped);
    }

    // ------------------------------------------------------------------------
    // Stage 4: sheet export
    // reads: processed_data, writes: sheets_url, folder_url
    // ------------------------------------------------------------------------

    async fn export_sheet(&self, state: &mut PipelineState) -> Result<(), StageError> {
        let documents = self
            .documents
            .as_ref()
            .ok_or(StageError::SheetsNotConfigured)?;

        let rows = match &state.processed_data {
            Some(rows) if !rows.is_empty() => rows,
            _ => {
                tracing::debug!("No shaped data to export");
                return Ok(());
            }
        };

        let settings = &self.config.sheets;
        let folder_id = self.resolve_folder(documents.as_ref()).await;

        let title = format!(
            "{}_{}",
            settings.title_prefix,
            Local::now().format("%Y%m%d_%H%M%S")
        );
        let sheet = documents
            .create_spreadsheet(&title)
            .await
            .map_err(|e| StageError::Export(e.to_string()))?;
        tracing::info!(title = %title, id = %sheet.id, "Created spreadsheet");

        if let Some(folder_id) = &folder_id {
            if let Err(e) = documents.move_to_folder(&sheet.id, folder_id).await {
                tracing::warn!("Failed to move sheet into folder {}: {}", folder_id, e);
            }
        }

        if let Some(email) = &settings.personal_email {
            let target = ShareTarget::User(email.clone());
            if let Err(e) = documents.share(&sheet.id, &target, ShareRole::Writer).await {
                tracing::warn!("Failed to share sheet with {}: {}", email, e);
            }
        }

        if settings.share_publicly {
            if let Err(e) = documents
                .share(&sheet.id, &ShareTarget::Anyone, ShareRole::Reader)
                .await
            {
                tracing::warn!("Failed to share sheet publicly: {}", e);
            }
        }

        let written = write_rows(documents.as_ref(), &sheet.id, rows).await;
        documents.release_sheet(&sheet.id);
        written?;

        state.sheets_url = sheet.url;
        state.folder_url = folder_id.map(|id| format!("{}{}", DRIVE_FOLDER_URL, id));
        Ok(())
    }

    /// Finds or creates the destination folder. Any failure just means the
    /// sheet stays where it was created.
    async fn resolve_folder(&self, documents: &dyn DocumentProvider) -> Option<String> {
        let settings = &self.config.sheets;

        match documents.find_folder(&settings.folder_name).await {
            Ok(Some(id)) => {
                tracing::debug!(folder = %settings.folder_name, id = %id, "Using existing folder");
                return Some(id);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Folder lookup failed: {}", e);
                return None;
            }
        }

        let id = match documents.create_folder(&settings.folder_name).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("Folder creation failed: {}", e);
                return None;
            }
        };
        tracing::info!(folder = %settings.folder_name, id = %id, "Created folder");

        if let Some(email) = &settings.personal_email {
            if let Err(e) = documents.share_folder(&id, email, ShareRole::Writer).await {
                tracing::warn!("Failed to share folder with {}: {}", email, e);
            }
        }

        Some(id)
    }

    // ------------------------------------------------------------------------
    // Stage 5: response
    // reads: everything, writes: messages
    // ------------------------------------------------------------------------

    fn respond(&self, state: &mut PipelineState) {
        let reply = format_pipeline_response(state, &self.config);
        state.messages.push(ChatMessage::agent(reply));
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Applies equality filters on the numeric identifier fields. Filters on any
/// other key are ignored.
fn apply_filters(
    mut records: Vec<Record>,
    filters: &Map<String, Value>,
) -> Result<Vec<Record>, StageError> {
    for (field, value) in filters {
        if !NUMERIC_FILTER_FIELDS.contains(&field.as_str()) {
            tracing::debug!(field = %field, "Ignoring filter on non-identifier field");
            continue;
        }

        let wanted = as_integer(value).ok_or_else(|| StageError::InvalidFilter {
            field: field.clone(),
            value: value.clone(),
        })?;
        records.retain(|record| record.get(field).and_then(as_integer) == Some(wanted));
    }
    Ok(records)
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Keeps only the requested keys present in each record, in requested order.
fn project_records(records: &[Record], fields: &[String]) -> Vec<Record> {
    records
        .iter()
        .map(|record| {
            fields
                .iter()
                .filter_map(|f| record.get(f).map(|v| (f.clone(), v.clone())))
                .collect::<Record>()
        })
        .collect()
}

async fn write_rows(
    documents: &dyn DocumentProvider,
    sheet_id: &str,
    records: &[Record],
) -> Result<(), StageError> {
    for row in table_rows(records) {
        documents
            .append_row(sheet_id, 0, row)
            .await
            .map_err(|e| StageError::Export(e.to_string()))?;
    }
    Ok(())
}

/// Header row from the first record's keys, then one row per record.
fn table_rows(records: &[Record]) -> Vec<Vec<Value>> {
    let Some(first) = records.first() else {
        return Vec::new();
    };
    let headers: Vec<String> = first.keys().cloned().collect();

    let mut rows = Vec::with_capacity(records.len() + 1);
    rows.push(headers.iter().cloned().map(Value::String).collect());
    for record in records {
        rows.push(
            headers
                .iter()
                .map(|h| record.get(h).cloned().unwrap_or_else(|| Value::String(String::new())))
                .collect(),
        );
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent::agent_config::VALID_API_FIELDS;
    use crate::core::agent::agent_models::Role;
    use crate::core::agent::agent_ports::{CreatedSheet, FolderProvider, PortError, SheetProvider};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    // ------------------------------------------------------------------------
    // Fakes
    // ------------------------------------------------------------------------

    enum FakeExtractor {
        Returns(Value),
        Fails,
    }

    #[async_trait]
    impl ParamExtractor for FakeExtractor {
        async fn extract(&self, _query: &str) -> Result<Value, PortError> {
            match self {
                FakeExtractor::Returns(value) => Ok(value.clone()),
                FakeExtractor::Fails => Err("model unavailable".into()),
            }
        }
    }

    struct FakeFetcher {
        response: Result<Vec<Record>, String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        fn ok(records: Vec<Record>) -> Self {
            Self {
                response: Ok(records),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                response: Err(message.to_string()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RecordFetcher for FakeFetcher {
        async fn get(&self, url: &str, _timeout: Duration) -> Result<Vec<Record>, PortError> {
            self.calls.lock().unwrap().push(url.to_string());
            self.response.clone().map_err(Into::into)
        }
    }

    #[derive(Default)]
    struct RecordingDocs {
        existing_folder: Option<String>,
        fail_find_folder: bool,
        fail_create_folder: bool,
        fail_share_folder: bool,
        fail_create_sheet: bool,
        fail_append: bool,
        fail_move: bool,
        fail_share: bool,
        calls: Mutex<Vec<String>>,
        rows: Mutex<Vec<Vec<Value>>>,
    }

    impl RecordingDocs {
        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn rows(&self) -> Vec<Vec<Value>> {
            self.rows.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FolderProvider for RecordingDocs {
        async fn find_folder(&self, name: &str) -> Result<Option<String>, PortError> {
            self.log(format!("find_folder {}", name));
            if self.fail_find_folder {
                return Err("drive unavailable".into());
            }
            Ok(self.existing_folder.clone())
        }

        async fn create_folder(&self, name: &str) -> Result<String, PortError> {
            self.log(format!("create_folder {}", name));
            if self.fail_create_folder {
                return Err("storage quota exceeded".into());
            }
            Ok("folder-new".to_string())
        }

        async fn share_folder(
            &self,
            folder_id: &str,
            email: &str,
            role: ShareRole,
        ) -> Result<(), PortError> {
            self.log(format!("share_folder {} {} {}", folder_id, email, role.as_str()));
            if self.fail_share_folder {
                return Err("share denied".into());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SheetProvider for RecordingDocs {
        async fn create_spreadsheet(&self, title: &str) -> Result<CreatedSheet, PortError> {
            self.log(format!("create_spreadsheet {}", title));
            if self.fail_create_sheet {
                return Err("quota exceeded".into());
            }
            Ok(CreatedSheet {
                id: "sheet-1".to_string(),
                url: "https://docs.google.com/spreadsheets/d/sheet-1".to_string(),
            })
        }

        async fn move_to_folder(&self, sheet_id: &str, folder_id: &str) -> Result<(), PortError> {
            self.log(format!("move {} {}", sheet_id, folder_id));
            if self.fail_move {
                return Err("move denied".into());
            }
            Ok(())
        }

        async fn share(
            &self,
            sheet_id: &str,
            target: &ShareTarget,
            role: ShareRole,
        ) -> Result<(), PortError> {
            let who = match target {
                ShareTarget::User(email) => email.clone(),
                ShareTarget::Anyone => "anyone".to_string(),
            };
            self.log(format!("share {} {} {}", sheet_id, who, role.as_str()));
            if self.fail_share {
                return Err("share denied".into());
            }
            Ok(())
        }

        async fn append_row(
            &self,
            _sheet_id: &str,
            sheet_index: usize,
            values: Vec<Value>,
        ) -> Result<(), PortError> {
            assert_eq!(sheet_index, 0);
            if self.fail_append {
                return Err("range protected".into());
            }
            self.rows.lock().unwrap().push(values);
            Ok(())
        }

        fn release_sheet(&self, sheet_id: &str) {
            self.log(format!("release {}", sheet_id));
        }
    }

    // ------------------------------------------------------------------------
    // Fixtures
    // ------------------------------------------------------------------------

    fn posts(count: u64) -> Vec<Record> {
        (1..=count)
            .map(|i| {
                let value = json!({
                    "userId": (i - 1) / 10 + 1,
                    "id": i,
                    "title": format!("title {}", i),
                    "body": format!("body {}", i),
                });
                match value {
                    Value::Object(map) => map,
                    _ => unreachable!(),
                }
            })
            .collect()
    }

    struct Harness {
        pipeline: AgentPipeline,
        fetcher: Arc<FakeFetcher>,
        docs: Arc<RecordingDocs>,
    }

    fn harness_with(
        config: AgentConfig,
        extractor: Option<FakeExtractor>,
        fetcher: FakeFetcher,
        docs: RecordingDocs,
    ) -> Harness {
        let fetcher = Arc::new(fetcher);
        let docs = Arc::new(docs);
        let pipeline = AgentPipeline::new(
            Arc::new(config),
            extractor.map(|e| Arc::new(e) as Arc<dyn ParamExtractor>),
            fetcher.clone(),
            Some(docs.clone() as Arc<dyn DocumentProvider>),
        );
        Harness {
            pipeline,
            fetcher,
            docs,
        }
    }

    fn harness(extracted: Value, fetcher: FakeFetcher) -> Harness {
        harness_with(
            AgentConfig::default(),
            Some(FakeExtractor::Returns(extracted)),
            fetcher,
            RecordingDocs::default(),
        )
    }

    fn keys(record: &Record) -> Vec<&str> {
        record.keys().map(String::as_str).collect()
    }

    // ------------------------------------------------------------------------
    // End-to-end scenarios
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn restricted_fields_request_exports_projected_rows() {
        let h = harness(json!({"limit": 3, "fields": ["body"]}), FakeFetcher::ok(posts(100)));

        let state = h.pipeline.run("récupère 5 posts avec title et id").await;

        assert!(!state.has_error(), "unexpected error: {:?}", state.error);
        let params = state.extracted_params.as_ref().unwrap();
        assert_eq!(params.limit, 5);
        assert_eq!(params.fields, vec!["id".to_string(), "title".to_string()]);
        assert!(params.filters.is_empty());

        let api_data = state.api_data.as_ref().unwrap();
        assert_eq!(api_data.len(), 5);
        assert_eq!(api_data[0].get("id"), Some(&json!(1)));
        assert_eq!(api_data[4].get("id"), Some(&json!(5)));

        let processed = state.processed_data.as_ref().unwrap();
        assert_eq!(processed.len(), 5);
        for record in processed {
            assert_eq!(keys(record), vec!["id", "title"]);
        }

        let rows = h.docs.rows();
        assert_eq!(rows.len(), 6);
        assert_eq!(rows[0], vec![json!("id"), json!("title")]);
        assert_eq!(rows[1], vec![json!(1), json!("title 1")]);

        assert_eq!(
            state.sheets_url,
            "https://docs.google.com/spreadsheets/d/sheet-1"
        );
        assert_eq!(state.user_query, "récupère 5 posts avec title et id");
        let reply = state.final_response().unwrap();
        assert!(reply.starts_with("✅"));
        assert!(reply.contains("5 records processed"));
    }

    #[tokio::test]
    async fn plain_request_uses_default_limit_and_all_fields() {
        let h = harness(json!({}), FakeFetcher::ok(posts(100)));

        let state = h.pipeline.run("donne-moi des posts").await;

        assert!(!state.has_error());
        let params = state.extracted_params.as_ref().unwrap();
        assert_eq!(params.limit, 10);
        let all: Vec<String> = VALID_API_FIELDS.iter().map(|f| f.to_string()).collect();
        assert_eq!(params.fields, all);
        assert_eq!(state.processed_data.as_ref().unwrap().len(), 10);
        assert_eq!(
            keys(&state.processed_data.as_ref().unwrap()[0]),
            vec!["userId", "id", "title", "body"]
        );
    }

    #[tokio::test]
    async fn empty_utterance_short_circuits_to_error_reply() {
        let h = harness(json!({}), FakeFetcher::ok(posts(10)));

        let state = h.pipeline.run("   ").await;

        assert_eq!(state.error.as_deref(), Some("Empty user query"));
        assert!(state.extracted_params.is_none());
        assert_eq!(h.fetcher.call_count(), 0);
        assert!(state.api_data.is_none());
        assert!(state.processed_data.is_none());
        assert!(h.docs.calls().is_empty());
        assert!(state.final_response().unwrap().starts_with("❌ Error"));
    }

    #[tokio::test]
    async fn server_error_stops_before_shaping() {
        let h = harness(
            json!({}),
            FakeFetcher::failing("HTTP status server error (500 Internal Server Error)"),
        );

        let state = h.pipeline.run("donne-moi 3 posts").await;

        let error = state.error.as_deref().unwrap();
        assert!(error.starts_with("API fetch failed"));
        assert!(error.contains("500"));
        assert!(state.api_data.is_none());
        assert!(state.processed_data.is_none());
        assert!(h.docs.calls().is_empty());
        assert!(state.final_response().unwrap().contains("❌ Error"));
    }

    #[tokio::test]
    async fn extractor_failure_falls_back_to_keywords() {
        let h = harness_with(
            AgentConfig::default(),
            Some(FakeExtractor::Fails),
            FakeFetcher::ok(posts(100)),
            RecordingDocs::default(),
        );

        let state = h.pipeline.run("prends 3 posts avec seulement le titre").await;

        assert!(!state.has_error());
        let params = state.extracted_params.as_ref().unwrap();
        assert_eq!(params.limit, 3);
        assert_eq!(params.fields, vec!["title".to_string()]);
        assert!(params.description.ends_with("(fallback)"));
        assert_eq!(state.processed_data.as_ref().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn missing_extractor_is_recovered_like_a_failure() {
        let h = harness_with(
            AgentConfig::default(),
            None,
            FakeFetcher::ok(posts(20)),
            RecordingDocs::default(),
        );

        let state = h.pipeline.run("500 posts").await;

        assert!(!state.has_error());
        assert_eq!(state.extracted_params.as_ref().unwrap().limit, 100);
        assert_eq!(state.api_data.as_ref().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn garbage_extraction_is_repaired() {
        let h = harness(json!(["not", "an", "object"]), FakeFetcher::ok(posts(30)));

        let state = h.pipeline.run("7 posts avec title").await;

        assert!(!state.has_error());
        let params = state.extracted_params.as_ref().unwrap();
        assert_eq!(params.limit, 10);
        assert_eq!(params.fields.len(), VALID_API_FIELDS.len());
    }

    // ------------------------------------------------------------------------
    // Stage behaviour
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn parse_clears_a_stale_error() {
        let h = harness(json!({}), FakeFetcher::ok(posts(5)));
        let mut state = PipelineState::new(h.pipeline.config(), "posts");
        state.set_error("left over");

        h.pipeline.run_stage(Stage::ParseQuery, &mut state).await;

        assert!(!state.has_error());
        assert!(state.extracted_params.is_some());
    }

    #[tokio::test]
    async fn later_stages_leave_errored_state_alone() {
        let h = harness(json!({}), FakeFetcher::ok(posts(5)));
        let mut state = PipelineState::new(h.pipeline.config(), "posts");
        state.set_error("boom");
        state.api_data = Some(posts(2));

        for stage in [Stage::FetchData, Stage::ShapeData, Stage::ExportSheet] {
            h.pipeline.run_stage(stage, &mut state).await;
        }

        assert_eq!(state.error.as_deref(), Some("boom"));
        assert_eq!(state.api_data.as_ref().unwrap().len(), 2);
        assert!(state.processed_data.is_none());
        assert_eq!(h.fetcher.call_count(), 0);
        assert!(h.docs.calls().is_empty());
    }

    #[tokio::test]
    async fn latest_human_message_is_the_query() {
        let h = harness(json!({}), FakeFetcher::ok(posts(50)));
        let mut state = PipelineState::new(h.pipeline.config(), "2 posts");
        state.messages.push(ChatMessage::agent("noted"));
        state.messages.push(ChatMessage::human("4 posts"));
        state.messages.push(ChatMessage::agent("working"));

        let state = h.pipeline.run_state(state).await;

        assert_eq!(state.user_query, "4 posts");
        assert_eq!(state.api_data.as_ref().unwrap().len(), 4);
        assert_eq!(state.messages.last().unwrap().role, Role::Agent);
    }

    #[tokio::test]
    async fn identifier_filters_are_applied_before_truncation() {
        let h = harness(
            json!({"filters": {"userId": "2", "title": "ignored"}}),
            FakeFetcher::ok(posts(100)),
        );

        let state = h.pipeline.run("50 posts").await;

        let data = state.api_data.as_ref().unwrap();
        assert_eq!(data.len(), 10);
        assert!(data.iter().all(|r| r.get("userId") == Some(&json!(2))));
        assert_eq!(data[0].get("id"), Some(&json!(11)));
    }

    #[tokio::test]
    async fn non_integer_filter_is_a_fetch_error() {
        let h = harness(
            json!({"filters": {"id": "abc"}}),
            FakeFetcher::ok(posts(10)),
        );

        let state = h.pipeline.run("posts").await;

        assert!(state.error.as_deref().unwrap().starts_with("API fetch failed"));
        assert!(state.api_data.is_none());
    }

    #[tokio::test]
    async fn empty_fetch_shapes_to_nothing_without_error() {
        let h = harness(json!({}), FakeFetcher::ok(Vec::new()));

        let state = h.pipeline.run("posts").await;

        assert!(!state.has_error());
        assert_eq!(state.processed_data.as_ref().map(Vec::len), Some(0));
        assert!(h.docs.calls().is_empty());
        assert!(h.docs.rows().is_empty());
        assert!(state.sheets_url.is_empty());
    }

    #[test]
    fn projection_omits_missing_keys_and_follows_requested_order() {
        let records = vec![
            json!({"id": 1, "title": "a", "body": "x"}),
            json!({"id": 2}),
        ]
        .into_iter()
        .filter_map(|v| v.as_object().cloned())
        .collect::<Vec<_>>();
        let fields = vec!["title".to_string(), "id".to_string()];

        let shaped = project_records(&records, &fields);

        assert_eq!(keys(&shaped[0]), vec!["title", "id"]);
        assert_eq!(keys(&shaped[1]), vec!["id"]);
    }

    #[test]
    fn table_rows_default_missing_cells_to_empty() {
        let records = vec![json!({"id": 1, "title": "a"}), json!({"id": 2})]
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect::<Vec<_>>();

        let rows = table_rows(&records);

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2], vec![json!(2), json!("")]);
        assert!(table_rows(&[]).is_empty());
    }

    #[test]
    fn integer_coercion_accepts_numeric_strings_and_whole_floats() {
        assert_eq!(as_integer(&json!(3)), Some(3));
        assert_eq!(as_integer(&json!(" 4 ")), Some(4));
        assert_eq!(as_integer(&json!(5.0)), Some(5));
        assert_eq!(as_integer(&json!(5.5)), None);
        assert_eq!(as_integer(&json!(true)), None);
    }

    // ------------------------------------------------------------------------
    // Export
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn export_creates_and_shares_folder_when_missing() {
        let mut config = AgentConfig::default();
        config.sheets.personal_email = Some("me@example.com".to_string());
        config.sheets.share_publicly = true;
        let h = harness_with(
            config,
            Some(FakeExtractor::Returns(json!({}))),
            FakeFetcher::ok(posts(3)),
            RecordingDocs::default(),
        );

        let state = h.pipeline.run("2 posts").await;

        assert!(!state.has_error());
        let calls = h.docs.calls();
        assert_eq!(calls[0], "find_folder API_Data_Exports");
        assert_eq!(calls[1], "create_folder API_Data_Exports");
        assert_eq!(calls[2], "share_folder folder-new me@example.com writer");
        assert!(calls[3].starts_with("create_spreadsheet API_Data_"));
        assert_eq!(calls[4], "move sheet-1 folder-new");
        assert_eq!(calls[5], "share sheet-1 me@example.com writer");
        assert_eq!(calls[6], "share sheet-1 anyone reader");
        assert_eq!(calls.last().map(String::as_str), Some("release sheet-1"));
        assert_eq!(
            state.folder_url.as_deref(),
            Some("https://drive.google.com/drive/folders/folder-new")
        );
    }

    #[tokio::test]
    async fn existing_folder_is_reused() {
        let docs = RecordingDocs {
            existing_folder: Some("folder-old".to_string()),
            ..RecordingDocs::default()
        };
        let h = harness_with(
            AgentConfig::default(),
            Some(FakeExtractor::Returns(json!({}))),
            FakeFetcher::ok(posts(3)),
            docs,
        );

        h.pipeline.run("posts").await;

        let calls = h.docs.calls();
        assert!(!calls.iter().any(|c| c.starts_with("create_folder")));
        assert!(calls.contains(&"move sheet-1 folder-old".to_string()));
    }

    #[tokio::test]
    async fn move_and_share_failures_are_not_fatal() {
        let mut config = AgentConfig::default();
        config.sheets.personal_email = Some("me@example.com".to_string());
        let docs = RecordingDocs {
            fail_move: true,
            fail_share: true,
            ..RecordingDocs::default()
        };
        let h = harness_with(
            config,
            Some(FakeExtractor::Returns(json!({}))),
            FakeFetcher::ok(posts(3)),
            docs,
        );

        let state = h.pipeline.run("posts").await;

        assert!(!state.has_error());
        assert_eq!(h.docs.rows().len(), 4);
        assert!(!state.sheets_url.is_empty());
    }

    fn export_harness(config: AgentConfig, docs: RecordingDocs) -> Harness {
        harness_with(
            config,
            Some(FakeExtractor::Returns(json!({}))),
            FakeFetcher::ok(posts(3)),
            docs,
        )
    }

    #[tokio::test]
    async fn folder_lookup_failure_leaves_sheet_at_the_root() {
        let docs = RecordingDocs {
            fail_find_folder: true,
            ..RecordingDocs::default()
        };
        let h = export_harness(AgentConfig::default(), docs);

        let state = h.pipeline.run("posts").await;

        assert!(!state.has_error(), "unexpected error: {:?}", state.error);
        let calls = h.docs.calls();
        assert!(calls.iter().any(|c| c.starts_with("create_spreadsheet")));
        assert!(!calls.iter().any(|c| c.starts_with("create_folder")));
        assert!(!calls.iter().any(|c| c.starts_with("move")));
        assert!(state.folder_url.is_none());
        assert_eq!(h.docs.rows().len(), 4);
    }

    #[tokio::test]
    async fn folder_creation_failure_leaves_sheet_at_the_root() {
        let mut config = AgentConfig::default();
        config.sheets.personal_email = Some("me@example.com".to_string());
        let docs = RecordingDocs {
            fail_create_folder: true,
            ..RecordingDocs::default()
        };
        let h = export_harness(config, docs);

        let state = h.pipeline.run("posts").await;

        assert!(!state.has_error(), "unexpected error: {:?}", state.error);
        let calls = h.docs.calls();
        assert!(calls.iter().any(|c| c.starts_with("create_spreadsheet")));
        assert!(!calls.iter().any(|c| c.starts_with("share_folder")));
        assert!(!calls.iter().any(|c| c.starts_with("move")));
        assert!(state.folder_url.is_none());
        assert!(!state.sheets_url.is_empty());
    }

    #[tokio::test]
    async fn folder_share_failure_is_not_fatal() {
        let mut config = AgentConfig::default();
        config.sheets.personal_email = Some("me@example.com".to_string());
        let docs = RecordingDocs {
            fail_share_folder: true,
            ..RecordingDocs::default()
        };
        let h = export_harness(config, docs);

        let state = h.pipeline.run("posts").await;

        assert!(!state.has_error(), "unexpected error: {:?}", state.error);
        assert!(h
            .docs
            .calls()
            .contains(&"move sheet-1 folder-new".to_string()));
        assert_eq!(
            state.folder_url.as_deref(),
            Some("https://drive.google.com/drive/folders/folder-new")
        );
    }

    #[tokio::test]
    async fn row_append_failure_ends_the_export() {
        let docs = RecordingDocs {
            fail_append: true,
            ..RecordingDocs::default()
        };
        let h = export_harness(AgentConfig::default(), docs);

        let state = h.pipeline.run("posts").await;

        let error = state.error.as_deref().unwrap_or_default();
        assert!(error.starts_with("Google Sheet creation failed"), "{}", error);
        assert!(error.ends_with("range protected"));
        assert_eq!(state.processed_data.as_ref().unwrap().len(), 3);
        assert!(state.sheets_url.is_empty());
        assert!(state.final_response().unwrap().starts_with("❌ Error:"));
        assert_eq!(
            h.docs.calls().last().map(String::as_str),
            Some("release sheet-1")
        );
    }

    #[tokio::test]
    async fn sheet_creation_failure_keeps_shaped_data() {
        let docs = RecordingDocs {
            fail_create_sheet: true,
            ..RecordingDocs::default()
        };
        let h = harness_with(
            AgentConfig::default(),
            Some(FakeExtractor::Returns(json!({}))),
            FakeFetcher::ok(posts(3)),
            docs,
        );

        let state = h.pipeline.run("posts").await;

        assert_eq!(
            state.error.as_deref(),
            Some("Google Sheet creation failed: quota exceeded")
        );
        assert_eq!(state.processed_data.as_ref().unwrap().len(), 3);
        assert!(state.sheets_url.is_empty());
        assert!(h.docs.rows().is_empty());
    }

    #[tokio::test]
    async fn missing_document_provider_is_a_configuration_error() {
        let pipeline = AgentPipeline::new(
            Arc::new(AgentConfig::default()),
            Some(Arc::new(FakeExtractor::Returns(json!({})))),
            Arc::new(FakeFetcher::ok(posts(3))),
            None,
        );

        let state = pipeline.run("posts").await;

        assert_eq!(state.error.as_deref(), Some("Google Sheets is not configured"));
        assert_eq!(state.processed_data.as_ref().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn validate_query_only_parses() {
        let h = harness(json!({}), FakeFetcher::ok(posts(3)));

        let params = h
            .pipeline
            .validate_query("récupère 5 posts avec title et id")
            .await
            .unwrap();
        assert_eq!(params.limit, 5);
        assert_eq!(h.fetcher.call_count(), 0);

        assert!(matches!(
            h.pipeline.validate_query("").await,
            Err(StageError::EmptyQuery)
        ));
    }
}
