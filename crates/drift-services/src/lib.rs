//! drift-services: async building blocks of a Drift node. The secure
//! stream carries the transfer protocol; storage, the peer registry and
//! the prompt gateway sit around it.

pub mod gateway;
pub mod peer;
pub mod progress;
pub mod secure_stream;
pub mod storage;
pub mod transfer;

pub use gateway::{FileInfo, MemoryGateway, Prompt, PromptGateway, TransferRequest};
pub use peer::{Peer, PeerEvent, PeerRegistry};
pub use secure_stream::SecureStream;
pub use transfer::{SendOutcome, TransferError};
