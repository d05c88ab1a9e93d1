//! Infrastructure adapters: the HTTP backend, the push transport and runtime
//! bootstrap.

pub mod backend;
pub mod error;
pub mod push;
pub mod telemetry;
