//! trellis-core - Domain model for the trellis workflow state manager.
//!
//! Graph templates, run states, the dependency-string language, retry
//! policies, node schemas, and secret encryption. No I/O lives here; the
//! daemon crate owns persistence and transport.

pub mod depstr;
pub mod retry;
pub mod schema;
pub mod secrets;
pub mod template;
pub mod types;

pub use depstr::{Dependent, DependentString, ParseError, STORE_IDENTIFIER};
pub use retry::{RetryError, RetryPolicy, RetryStrategy};
pub use schema::{NodeSchema, SchemaError};
pub use secrets::{Encrypter, SecretsError, ENCRYPTION_KEY_ENV};
pub use template::{
    GraphTemplate, NodeTemplate, StoreConfig, Unites, UnitesStrategy, ValidationStatus,
};
pub use types::{new_run_id, Id, RegisteredNode, State, StateStatus};
