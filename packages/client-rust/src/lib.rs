//! `docform` client: async form sessions over a Frappe-style document API.
//!
//! A [`FormSession`] drives one document: user edits go through the
//! synchronous engine in `docform-core`, while lookups, link searches,
//! matrix regeneration and saves run against a [`DocumentBackend`].

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod session;
pub mod traits;

pub use backend::{InMemoryBackend, RestBackend};
pub use config::{ClientConfig, SessionConfig};
pub use error::{BackendError, SaveError, SessionError};
pub use session::{FormEvent, FormSession, SaveOutcome, SessionPhase};
pub use traits::{BulkDeleteReport, DocumentBackend, LinkCandidate, LinkQuery};
