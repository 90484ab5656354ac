//! drift-core: wire formats and crypto primitives, plus configuration.
//! All other Drift crates depend on this one.

pub mod config;
pub mod crypto;
pub mod dns;
pub mod message;

pub use config::DriftConfig;
pub use crypto::{CryptoError, Keypair};
pub use message::{Answer, Message, MessageError, Offer};
