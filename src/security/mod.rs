//! Security gate for provider-facing callback endpoints and admin
//! surfaces, plus signed admin session tokens.

pub mod gate;
pub mod token;

pub use gate::{GateError, GateRequest, SecurityGate};
pub use token::{SessionToken, TokenError, issue_token, verify_token};
