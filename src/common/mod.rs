pub mod crypto;
pub mod error;

pub use crypto::*;
pub use error::*;
