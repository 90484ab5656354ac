//! driftd: the Drift daemon. Discovery and the transfer listener feed the
//! supervisor that runs transfers; the console drives it from a terminal.

pub mod acceptor;
pub mod console;
pub mod mdns;
pub mod supervisor;

pub use supervisor::Supervisor;
