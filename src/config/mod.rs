//! Declaration document handling.
//!
//! This module handles all declaration-related functionality:
//! - Parsing and deserializing `halldyll.stack.yaml`
//! - Environment overrides and `.env` loading
//! - Validation of declared values
//! - Computing hashes for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    ExecutorConfig, ProviderConfig, ProviderKind, StackConfig, StackDocument, StateBackend,
    StateConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, FLAG_ENV_PREFIX, find_config_file};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub use hash::ConfigHasher;
