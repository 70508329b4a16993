//! External collaborator traits: the UDP socket and the clock.
//!
//! The DHT core never opens a socket or reads the system clock itself — both
//! are injected so the maintenance loop and protocol handlers stay testable
//! without a live network, and so a host process can multiplex one socket
//! across the DHT and other protocols sharing the same port.

use std::future::Future;
use std::net::SocketAddr;

/// Minimal async UDP transport the DHT core sends and receives through.
pub trait UdpTransport: Send + Sync {
    /// Send `data` to `to`. Errors are logged by the caller and otherwise
    /// swallowed — a dropped UDP datagram is not exceptional.
    fn udp_send(&self, to: SocketAddr, data: &[u8]) -> impl Future<Output = std::io::Result<()>> + Send;

    /// Receive the next datagram, blocking until one arrives.
    fn udp_recv(&self, buf: &mut [u8]) -> impl Future<Output = std::io::Result<(usize, SocketAddr)>> + Send;
}

/// Monotonic clock, abstracted so timeouts are deterministic in tests.
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary fixed epoch; never goes backwards.
    fn now_monotonic_ms(&self) -> u64;

    /// Seconds since the same epoch, the unit most DHT timers use.
    fn now_secs(&self) -> u64 {
        self.now_monotonic_ms() / 1000
    }
}

/// [`Clock`] backed by [`std::time::Instant`], for production use.
pub struct SystemClock {
    origin: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_monotonic_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Clock;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Clock under direct test control; advances only when told to.
    #[derive(Default)]
    pub struct FakeClock {
        millis: AtomicU64,
    }

    impl FakeClock {
        pub fn new(start_ms: u64) -> Self {
            Self {
                millis: AtomicU64::new(start_ms),
            }
        }

        pub fn advance_secs(&self, secs: u64) {
            self.millis.fetch_add(secs * 1000, Ordering::SeqCst);
        }
    }

    impl Clock for FakeClock {
        fn now_monotonic_ms(&self) -> u64 {
            self.millis.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeClock;
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now_monotonic_ms();
        let b = clock.now_monotonic_ms();
        assert!(b >= a);
    }

    #[test]
    fn test_fake_clock_advances_on_demand() {
        let clock = FakeClock::new(1000);
        assert_eq!(clock.now_secs(), 1);
        clock.advance_secs(59);
        assert_eq!(clock.now_secs(), 60);
    }
}
