mod error;
mod pool;

pub use error::ImapError;
pub use pool::{BodyFetch, Folder, HeaderFetch, ImapHandle, ImapPool, ImapSettings, SelectInfo};
