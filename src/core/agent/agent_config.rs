// Immutable configuration for the agent pipeline.
//
// Everything here is read once at startup (after `.env` is loaded) and then
// shared read-only between pipeline runs. Nothing in the pipeline mutates it.

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_API_URL: &str = "https://jsonplaceholder.typicode.com/posts";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_CREDENTIALS_PATH: &str = "./google-credentials.json";

// ============================================================================
// FIELD VOCABULARY
// ============================================================================
// The record fields the agent knows about, in canonical order, along with the
// words a user might type to mean each of them.

/// Valid record fields, in canonical order.
pub const VALID_API_FIELDS: [&str; 4] = ["userId", "id", "title", "body"];

/// Synonyms per field. Iteration order is the canonical field order.
pub const FIELD_KEYWORDS: [(&str, &[&str]); 4] = [
    ("userId", &["userid", "user", "utilisateur"]),
    ("id", &["id", "identifiant"]),
    ("title", &["title", "titre"]),
    ("body", &["body", "contenu", "texte"]),
];

/// Words that mean "only these fields".
pub const RESTRICTION_KEYWORDS: [&str; 4] = ["avec", "seulement", "uniquement", "juste"];

/// Fields on which equality filters are applied at fetch time.
pub const NUMERIC_FILTER_FIELDS: [&str; 2] = ["userId", "id"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Bounds applied to the number of records a single run may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitBounds {
    pub min: u32,
    pub max: u32,
    pub default: u32,
}

impl LimitBounds {
    /// Builds bounds, swapping min/max if given backwards and pulling the
    /// default inside them.
    pub fn new(min: u32, max: u32, default: u32) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            min,
            max,
            default: default.clamp(min, max),
        }
    }

    pub fn clamp(&self, value: u64) -> u32 {
        let saturated = u32::try_from(value).unwrap_or(u32::MAX);
        saturated.clamp(self.min, self.max)
    }
}

impl Default for LimitBounds {
    fn default() -> Self {
        Self::new(1, 100, 10)
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct SheetsSettings {
    pub folder_name: String,
    pub title_prefix: String,
    pub share_publicly: bool,
    pub personal_email: Option<String>,
    pub credentials_path: String,
    pub credentials_json: Option<String>,
}

/// Process-wide agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub default_api_url: String,
    pub api_timeout: Duration,
    pub max_retries: u32,
    pub limits: LimitBounds,
    pub openai: OpenAiSettings,
    pub sheets: SheetsSettings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_api_url: DEFAULT_API_URL.to_string(),
            api_timeout: Duration::from_secs(30),
            max_retries: 3,
            limits: LimitBounds::default(),
            openai: OpenAiSettings {
                api_key: None,
                model: DEFAULT_OPENAI_MODEL.to_string(),
                temperature: 0.1,
                base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            },
            sheets: SheetsSettings {
                folder_name: "API_Data_Exports".to_string(),
                title_prefix: "API_Data".to_string(),
                share_publicly: false,
                personal_email: None,
                credentials_path: DEFAULT_CREDENTIALS_PATH.to_string(),
                credentials_json: None,
            },
        }
    }
}

impl AgentConfig {
    /// Reads the configuration from the process environment.
    ///
    /// Missing variables use the defaults. Values that fail to parse are
    /// logged and replaced by their default rather than aborting startup.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`AgentConfig::from_env`] but with an injectable lookup, so
    /// tests don't have to touch the real environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let timeout_secs = parse_or_default(&lookup, "API_TIMEOUT", 30u64);
        let limits = LimitBounds::new(
            parse_or_default(&lookup, "MIN_LIMIT", defaults.limits.min),
            parse_or_default(&lookup, "MAX_LIMIT", defaults.limits.max),
            parse_or_default(&lookup, "DEFAULT_LIMIT", defaults.limits.default),
        );

        Self {
            default_api_url: non_empty("DEFAULT_API_URL").unwrap_or(defaults.default_api_url),
            api_timeout: Duration::from_secs(timeout_secs),
            max_retries: parse_or_default(&lookup, "MAX_RETRIES", defaults.max_retries),
            limits,
            openai: OpenAiSettings {
                api_key: non_empty("OPENAI_API_KEY"),
                model: non_empty("OPENAI_MODEL").unwrap_or(defaults.openai.model),
                temperature: parse_or_default(
                    &lookup,
                    "OPENAI_TEMPERATURE",
                    defaults.openai.temperature,
                ),
                base_url: non_empty("OPENAI_BASE_URL").unwrap_or(defaults.openai.base_url),
            },
            sheets: SheetsSettings {
                folder_name: non_empty("SHEETS_FOLDER_NAME")
                    .unwrap_or(defaults.sheets.folder_name),
                title_prefix: non_empty("SHEETS_DEFAULT_TITLE_PREFIX")
                    .unwrap_or(defaults.sheets.title_prefix),
                share_publicly: lookup("SHEETS_SHARE_PUBLICLY")
                    .map(|v| v.trim().eq_ignore_ascii_case("true"))
                    .unwrap_or(false),
                personal_email: non_empty("GOOGLE_PERSONAL_EMAIL"),
                credentials_path: non_empty("GOOGLE_CREDENTIALS_PATH")
                    .unwrap_or(defaults.sheets.credentials_path),
                credentials_json: non_empty("GOOGLE_SERVICE_ACCOUNT_JSON"),
            },
        }
    }

    /// The full valid-field list, canonical order.
    pub fn all_fields(&self) -> Vec<String> {
        VALID_API_FIELDS.iter().map(|f| f.to_string()).collect()
    }

    pub fn is_valid_field(&self, name: &str) -> bool {
        VALID_API_FIELDS.contains(&name)
    }
}

fn parse_value<T: FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        name,
        value: raw.to_string(),
    })
}

fn parse_or_default<F, T>(lookup: &F, name: &'static str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(raw) => parse_value(name, &raw).unwrap_or_else(|e| {
            tracing::warn!("{}, using default", e);
            default
        }),
        None => default,
    }
}
