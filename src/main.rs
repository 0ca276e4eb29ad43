// This is the entry point of the API-to-Sheets agent.
//
// **Architecture Overview:**
// - `core/` = Business logic (pipeline, validation, formatting, ports)
// - `infra/` = Implementations of core traits (OpenAI, HTTP fetch, Google)
// - `server/` = JSON-RPC tool surface on stdin/stdout
//
// This file's job is to:
// 1. Load configuration
// 2. Initialize collaborators (dependency injection)
// 3. Either run one query from the command line or serve requests on stdio

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with half a dozen mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
mod core;
#[path = "infra/infra_layer.rs"]
mod infra;
#[path = "server/server_layer.rs"]
mod server;

use clap::Parser;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use crate::core::agent::{
    AgentConfig, AgentPipeline, DocumentProvider, ParamExtractor, RecordFetcher,
};
use crate::infra::ai::OpenAiExtractor;
use crate::infra::google::{GoogleWorkspaceClient, ServiceAccountAuth};
use crate::infra::http::HttpRecordFetcher;
use crate::server::AgentServer;

/// Fetch records from a JSON API and export them to Google Sheets.
///
/// With no query, serves JSON-RPC tools on stdin/stdout.
#[derive(Debug, Parser)]
#[command(name = "api_sheets_agent", version)]
struct Cli {
    /// Request to run once, e.g. "récupère 5 posts avec title et id"
    #[arg(trailing_var_arg = true)]
    query: Vec<String>,
}

impl Cli {
    /// The one-shot utterance, if any words were given.
    fn utterance(&self) -> Option<String> {
        let joined = self.query.join(" ");
        let trimmed = joined.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

async fn build_documents(config: &AgentConfig) -> Option<Arc<dyn DocumentProvider>> {
    match ServiceAccountAuth::from_settings(&config.sheets).await {
        Ok(auth) => {
            tracing::info!("Google Sheets export enabled as {}", auth.client_email());
            Some(Arc::new(GoogleWorkspaceClient::new(auth)))
        }
        Err(e) => {
            tracing::warn!("Google Sheets export disabled: {}", e);
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse first so --help and --version exit before anything is wired up.
    let cli = Cli::parse();

    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    // Logs go to stderr; stdout is reserved for protocol messages.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(AgentConfig::from_env());

    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================

    let extractor: Option<Arc<dyn ParamExtractor>> =
        match OpenAiExtractor::from_settings(&config.openai, config.api_timeout, config.max_retries)
        {
            Some(extractor) => {
                tracing::info!("Parameter extraction via {}", extractor.model());
                Some(Arc::new(extractor))
            }
            None => {
                tracing::warn!("OPENAI_API_KEY not set, using keyword extraction only");
                None
            }
        };

    let fetcher: Arc<dyn RecordFetcher> = Arc::new(HttpRecordFetcher::new(config.max_retries));
    let documents = build_documents(&config).await;

    let pipeline = Arc::new(AgentPipeline::new(
        Arc::clone(&config),
        extractor,
        fetcher,
        documents,
    ));

    // A query on the command line runs the pipeline once and prints the reply.
    if let Some(utterance) = cli.utterance() {
        let state = pipeline.run(&utterance).await;
        println!("{}", state.final_response().unwrap_or_default());
        if state.has_error() {
            std::process::exit(1);
        }
        return Ok(());
    }

    let server = AgentServer::new(pipeline);
    server
        .serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn help_and_version_are_flags_not_queries() {
        let err = Cli::try_parse_from(["api_sheets_agent", "--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);

        let err = Cli::try_parse_from(["api_sheets_agent", "--version"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayVersion);
    }

    #[test]
    fn words_are_joined_into_one_utterance() {
        let cli =
            Cli::try_parse_from(["api_sheets_agent", "récupère", "5", "posts", "avec", "title"])
                .unwrap();
        assert_eq!(cli.utterance().as_deref(), Some("récupère 5 posts avec title"));
    }

    #[test]
    fn words_after_the_query_are_kept_verbatim() {
        let cli = Cli::try_parse_from(["api_sheets_agent", "posts", "--help"]).unwrap();
        assert_eq!(cli.utterance().as_deref(), Some("posts --help"));
    }

    #[test]
    fn no_arguments_means_serve_stdio() {
        let cli = Cli::try_parse_from(["api_sheets_agent"]).unwrap();
        assert!(cli.utterance().is_none());

        let cli = Cli::try_parse_from(["api_sheets_agent", "  "]).unwrap();
        assert!(cli.utterance().is_none());
    }
}
