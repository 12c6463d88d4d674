//! Production Environment implementation using system time and RNG.
//!
//! Real `std::time::Instant` for handshake timeouts and the OS RNG (getrandom)
//! for session identifiers and ephemeral scalars. Nothing here is
//! reproducible; tests that need determinism use their own environment.

use tandem_core::Environment;

/// Environment backed by the system clock and the OS RNG.
///
/// # Panics
///
/// Panics if the OS RNG fails. A party without working randomness would
/// reuse ephemeral scalars, so there is no safe way to continue.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - keys would repeat");
    }
}
