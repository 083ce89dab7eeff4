//! Adaptive probabilistic relay decisions

use rand::Rng;

/// Decremented TTLs at or above this value always relay
const UNCONDITIONAL_RELAY_TTL: u8 = 4;

/// Relay probability for an estimated network size. Dense meshes relay
/// less; tiny ones always flood.
pub fn relay_probability(network_size: usize) -> f64 {
    match network_size {
        0..=10 => 1.0,
        11..=30 => 0.85,
        31..=50 => 0.70,
        51..=100 => 0.55,
        _ => 0.40,
    }
}

/// Decides whether a packet is forwarded. Only consulted for packets that
/// are neither addressed to this node nor originated by it.
pub struct RelayManager;

impl RelayManager {
    pub fn new() -> Self {
        Self
    }

    /// Returns the decremented TTL to forward with, or `None` to drop.
    pub fn decide(&self, ttl: u8, network_size: usize) -> Option<u8> {
        if ttl == 0 {
            return None;
        }
        let next_ttl = ttl - 1;
        if next_ttl >= UNCONDITIONAL_RELAY_TTL {
            return Some(next_ttl);
        }
        let probability = relay_probability(network_size);
        if rand::thread_rng().gen_bool(probability) {
            Some(next_ttl)
        } else {
            None
        }
    }
}

impl Default for RelayManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ttl_drops() {
        assert_eq!(RelayManager::new().decide(0, 5), None);
    }

    #[test]
    fn ttl_always_decrements() {
        let relay = RelayManager::new();
        for ttl in 1..=7u8 {
            if let Some(next) = relay.decide(ttl, 2) {
                assert_eq!(next, ttl - 1);
            }
        }
    }

    #[test]
    fn high_ttl_relays_unconditionally() {
        let relay = RelayManager::new();
        // Decremented TTL >= 4 must relay regardless of network size
        for _ in 0..100 {
            assert_eq!(relay.decide(7, 10_000), Some(6));
            assert_eq!(relay.decide(5, 10_000), Some(4));
        }
    }

    #[test]
    fn small_network_always_relays() {
        let relay = RelayManager::new();
        for _ in 0..100 {
            assert_eq!(relay.decide(2, 3), Some(1));
        }
    }

    #[test]
    fn probability_table_matches_policy() {
        assert_eq!(relay_probability(1), 1.0);
        assert_eq!(relay_probability(10), 1.0);
        assert_eq!(relay_probability(11), 0.85);
        assert_eq!(relay_probability(30), 0.85);
        assert_eq!(relay_probability(50), 0.70);
        assert_eq!(relay_probability(100), 0.55);
        assert_eq!(relay_probability(101), 0.40);
    }
}
