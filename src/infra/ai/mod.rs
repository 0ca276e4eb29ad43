pub mod openai_extractor;

pub use openai_extractor::OpenAiExtractor;
