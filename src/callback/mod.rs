//! Provider callback validation.
//!
//! Turns raw provider callback parameters into a verified, normalized
//! settlement notice, or a typed rejection with an audit code.

pub mod seen_store;
pub mod validator;

pub use seen_store::TtlSeenStore;
pub use validator::{CallbackError, CallbackValidator, ValidatedCallback};
