//! An ahead-of-time compiler for a small tensor language. Source text is
//! parsed, lowered to a shape-polymorphic tensor IR, specialized into a single
//! concretely shaped entry function and lowered again to loop nests over
//! buffers, which the backend executes.

pub mod backend;
pub mod driver;
pub mod error;
pub mod frontend;
pub mod index;
pub mod middle;
