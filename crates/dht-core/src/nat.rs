//! Per-friend NAT hole-punching state machine.
//!
//! A friend behind a NAT often reports a different endpoint from different
//! close-list nodes — that's the clue we punch against once
//! `NAT_PING_MIN_REPORTERS` nodes have seen them at the same IP but
//! different ports. We walk the reported port range with UDP packets tagged
//! with a rotating `ping_id`, waiting for a live pong before giving up and
//! falling back to the plain close-list endpoint.

use std::net::IpAddr;

use crate::{NAT_PING_INTERVAL_SECS, NAT_PING_MIN_REPORTERS};

/// A friend's NAT traversal phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NatState {
    /// No punching in progress; we have a working endpoint, or none at all.
    Idle,
    /// A NAT-ping request was sent; waiting for the matching response.
    AwaitingPong { ping_id: u64, sent_at: u64 },
    /// Pong received; actively trying ports against the guessed NAT.
    Punching { shared_ip: IpAddr, started_at: u64 },
}

/// Per-friend NAT bookkeeping: the reported-endpoint evidence plus the
/// current traversal phase.
pub struct NatRecord {
    state: NatState,
    last_ping_sent: u64,
    punching_index: u16,
    punching_index2: u16,
}

impl NatRecord {
    pub fn new() -> Self {
        Self {
            state: NatState::Idle,
            last_ping_sent: 0,
            punching_index: 0,
            punching_index2: 0,
        }
    }

    pub fn state(&self) -> NatState {
        self.state
    }

    pub fn last_ping_sent(&self) -> u64 {
        self.last_ping_sent
    }

    /// Whether this friend's reported endpoints (same IP, divergent ports,
    /// seen by enough distinct close-list reporters) justify starting a punch.
    pub fn should_start(same_ip_distinct_port_reporters: usize, now: u64, last_ping_sent: u64) -> bool {
        same_ip_distinct_port_reporters >= NAT_PING_MIN_REPORTERS
            && now.saturating_sub(last_ping_sent) >= NAT_PING_INTERVAL_SECS
    }

    /// Record that a NAT-ping request was just sent.
    pub fn mark_ping_sent(&mut self, ping_id: u64, now: u64) {
        self.state = NatState::AwaitingPong { ping_id, sent_at: now };
        self.last_ping_sent = now;
    }

    /// A NAT-pong arrived; transition into active punching against `shared_ip`.
    pub fn on_pong(&mut self, ping_id: u64, shared_ip: IpAddr, now: u64) -> bool {
        match self.state {
            NatState::AwaitingPong { ping_id: expected, .. } if expected == ping_id => {
                self.state = NatState::Punching {
                    shared_ip,
                    started_at: now,
                };
                self.punching_index = 0;
                self.punching_index2 = 0;
                true
            }
            _ => false,
        }
    }

    /// Next port guess to try while punching, rotating through a small
    /// spread around the index before widening.
    pub fn next_punch_port(&mut self, base_port: u16) -> Option<u16> {
        match self.state {
            NatState::Punching { .. } => {
                let offset = self.punching_index;
                self.punching_index = self.punching_index.wrapping_add(1);
                if self.punching_index % 4 == 0 {
                    self.punching_index2 = self.punching_index2.wrapping_add(1);
                }
                Some(base_port.wrapping_add(offset))
            }
            _ => None,
        }
    }

    /// A working endpoint was confirmed (directly, or via a successful punch).
    pub fn on_connected(&mut self) {
        self.state = NatState::Idle;
    }

    /// Abandon an in-flight attempt, e.g. after too many failed punch tries.
    pub fn reset(&mut self) {
        self.state = NatState::Idle;
        self.punching_index = 0;
        self.punching_index2 = 0;
    }
}

impl Default for NatRecord {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_start_requires_enough_reporters() {
        assert!(!NatRecord::should_start(NAT_PING_MIN_REPORTERS - 1, 100, 0));
        assert!(NatRecord::should_start(NAT_PING_MIN_REPORTERS, 100, 0));
    }

    #[test]
    fn test_should_start_respects_rate_limit() {
        assert!(!NatRecord::should_start(
            NAT_PING_MIN_REPORTERS,
            NAT_PING_INTERVAL_SECS - 1,
            0
        ));
        assert!(NatRecord::should_start(NAT_PING_MIN_REPORTERS, NAT_PING_INTERVAL_SECS, 0));
    }

    #[test]
    fn test_full_state_transition() {
        let mut rec = NatRecord::new();
        assert_eq!(rec.state(), NatState::Idle);

        rec.mark_ping_sent(7, 10);
        assert!(matches!(rec.state(), NatState::AwaitingPong { ping_id: 7, .. }));

        let ip = IpAddr::from([203, 0, 113, 5]);
        assert!(rec.on_pong(7, ip, 11));
        assert!(matches!(rec.state(), NatState::Punching { shared_ip, .. } if shared_ip == ip));

        rec.on_connected();
        assert_eq!(rec.state(), NatState::Idle);
    }

    #[test]
    fn test_pong_with_wrong_id_ignored() {
        let mut rec = NatRecord::new();
        rec.mark_ping_sent(7, 10);
        assert!(!rec.on_pong(8, IpAddr::from([1, 2, 3, 4]), 11));
        assert!(matches!(rec.state(), NatState::AwaitingPong { ping_id: 7, .. }));
    }

    #[test]
    fn test_punch_ports_advance() {
        let mut rec = NatRecord::new();
        rec.mark_ping_sent(1, 0);
        rec.on_pong(1, IpAddr::from([1, 2, 3, 4]), 1);

        let p1 = rec.next_punch_port(30000).expect("punching");
        let p2 = rec.next_punch_port(30000).expect("punching");
        assert_ne!(p1, p2);
    }

    #[test]
    fn test_next_punch_port_none_when_idle() {
        let mut rec = NatRecord::new();
        assert!(rec.next_punch_port(30000).is_none());
    }

    #[test]
    fn test_reset_clears_progress() {
        let mut rec = NatRecord::new();
        rec.mark_ping_sent(1, 0);
        rec.on_pong(1, IpAddr::from([1, 2, 3, 4]), 1);
        rec.next_punch_port(30000);
        rec.reset();
        assert_eq!(rec.state(), NatState::Idle);
        assert!(rec.next_punch_port(30000).is_none());
    }
}
