//! Wall-clock time and OS randomness for the running server.

use std::time::Duration;

use parley_core::Environment;

/// Environment backed by `Instant::now`, tokio timers and `getrandom`.
///
/// # Panics
///
/// Panics if the OS RNG fails. Transfer tokens are capabilities; issuing
/// predictable ones is worse than stopping.
#[derive(Debug, Clone, Default)]
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

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_bytes_fill_the_buffer() {
        let mut buffer = [0u8; 64];
        SystemEnv::new().random_bytes(&mut buffer);
        assert!(buffer.iter().any(|&b| b != 0));
    }

    #[test]
    fn tokens_are_fresh_capabilities() {
        let env = SystemEnv::new();
        let first = env.token(16);

        assert_eq!(first.len(), 16);
        assert!(first.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(first, env.token(16));
    }

    #[tokio::test]
    async fn sleep_waits_at_least_the_duration() {
        let env = SystemEnv::new();
        let start = env.now();
        env.sleep(Duration::from_millis(20)).await;
        assert!(env.now() - start >= Duration::from_millis(20));
    }
}
