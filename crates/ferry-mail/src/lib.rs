mod error;
mod filter;
mod fingerprint;
mod headers;
mod labels;

pub use error::MailError;
pub use filter::AddressFilter;
pub use fingerprint::{compute_fingerprint, fingerprint_message, sha256_file_hex, sha256_hex, FingerprintResult};
pub use headers::{body_prefix, extract_addresses, normalize_message_id, parse_minimal_headers};
pub use labels::{map_folder, LabelMapping};
