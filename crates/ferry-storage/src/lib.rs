mod error;
mod evidence;
mod state_db;

pub use error::StorageError;
pub use evidence::{EvidenceStore, EvidenceWritten};
pub use state_db::{Reservation, ResetScope, StateDb};
