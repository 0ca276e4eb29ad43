pub mod record_fetcher;
pub mod retry;

pub use record_fetcher::HttpRecordFetcher;
pub use retry::send_with_retry;
