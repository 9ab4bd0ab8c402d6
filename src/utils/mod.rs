//! Utility modules.

pub mod clock;
pub mod file;
pub mod retry;
pub mod text;

pub use clock::{Clock, ManualClock, SystemClock};
pub use file::{calculate_checksum, document_id_for_path, is_ingestable_file, read_file_content};
pub use retry::{RetryConfig, RetryResult, Retryable, with_retry};
pub use text::{has_meaningful_content, preview};
