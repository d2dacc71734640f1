//! Glimpse core: an interactive playground that shows, inline, the
//! runtime value produced by each expression as the user types.
//!
//! The pipeline: source → [`instrument::compile`] (parse, inject capture
//! calls, build the context table) → [`emit`] (transformed source plus a
//! source map) → the sandboxed [`runtime`] (interpreter, capture
//! function, marshalling) → [`transport`] (one-way, epoch-tagged channel)
//! → [`remap`] + [`render`] (anchored inline decorations).

pub mod emit;
pub mod error;
pub mod host;
pub mod instrument;
pub mod parser;
pub mod remap;
pub mod render;
pub mod runtime;
pub mod transport;

pub use glimpse_probe_protocol as protocol;

pub use instrument::{CAPTURE_IDENT, CompileOutput, FN_META_IDENT, compile};
