//! The backend consumes loop IR. At this point every tensor is a buffer and
//! every operation is a nest of scalar loads, stores and arithmetic, so a
//! target only needs to understand that small vocabulary.

use crate::frontend::intern::InternedSymbol;

pub mod targets;

#[derive(Debug, Clone, Copy)]
pub struct ExecutionOptions {
    /// Function to invoke
    pub entry: InternedSymbol,
}
