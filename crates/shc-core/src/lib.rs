pub mod config;
pub mod error;
pub mod types;

pub use error::{ShcError, ShcResult};
pub use types::{ChatId, FileType};
