//! Types shared by the qwen proxy crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
