// Agent module - turns a natural-language request into a fetched, shaped
// and exported dataset.

pub mod agent_config;
pub mod agent_models;
pub mod agent_pipeline;
pub mod agent_ports;
pub mod formatting;
pub mod param_validator;

pub use agent_config::AgentConfig;
pub use agent_models::{PipelineState, Record};
pub use agent_pipeline::AgentPipeline;
pub use agent_ports::{
    CreatedSheet, DocumentProvider, FolderProvider, ParamExtractor, PortError, RecordFetcher,
    ShareRole, ShareTarget, SheetProvider,
};
