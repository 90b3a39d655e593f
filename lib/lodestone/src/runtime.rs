use magnetite::crypto;
use magnetite::logging::{self, Logger};
use magnetite::time::Clock;

/// Owns process level facilities: sodium initialization, the monotonic
/// clock, the route controller base URL and the controller master public
/// key. Every client and server borrows a runtime at construction, so
/// there is no process wide mutable state.
pub struct Runtime {
    controller_url: String,
    master_public_key: [u8; crypto::BOX_PUBLIC_KEY_SIZE],
    clock: Clock,
    log: Logger,
}

impl Runtime {
    /// Create the runtime. `controller_url` is the base URL of the route
    /// controller, e.g. `https://router.example.com`. `master_public_key`
    /// is the controller's box public key used to open sealed tokens.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        controller_url: &str,
        master_public_key: [u8; crypto::BOX_PUBLIC_KEY_SIZE],
        log: L,
    ) -> Runtime {
        crypto::init();

        Runtime {
            controller_url: controller_url.to_owned(),
            master_public_key,
            clock: Clock::new(),
            log: logging::component(log),
        }
    }

    #[inline]
    pub fn controller_url(&self) -> &str {
        &self.controller_url
    }

    #[inline]
    pub fn master_public_key(&self) -> &[u8; crypto::BOX_PUBLIC_KEY_SIZE] {
        &self.master_public_key
    }

    #[inline]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    #[inline]
    pub fn logger(&self) -> &Logger {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_construction() {
        let runtime = Runtime::new("https://router.example.com", [7u8; 32], None);

        assert_eq!(runtime.controller_url(), "https://router.example.com");
        assert_eq!(runtime.master_public_key(), &[7u8; 32]);
        assert!(runtime.clock().now() >= 0.0);
    }
}
