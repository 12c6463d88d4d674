//! Tandem demo runtime.
//!
//! Async "glue" around [`tandem_core`]'s action-based handshake: two parties
//! in one process talk over tokio channels, look bundles up in a shared
//! in-memory directory and compare the SAS through a simulated out-of-band
//! channel.
//!
//! # Components
//!
//! - [`Peer`]: identity, cached secret store and bundle key of one party
//! - [`Link`]: one end of an in-process byte channel
//! - [`SystemEnv`]: production environment (real time, OS RNG)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod peer;
mod system_env;

pub use error::DemoError;
pub use peer::{Link, Outcome, Peer, ReadAloud, converse};
pub use system_env::SystemEnv;
