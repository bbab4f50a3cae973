//! Scalar identifiers shared by every component.

/// Index of a participant process in the computation (0-based).
pub type Rank = usize;

/// Small integer identifying the semantic type of a message.
///
/// Tags are allocated by [`TagRegistry`](crate::TagRegistry) at startup and
/// index the handler table and the traffic statistics.
pub type MessageTag = u16;

/// Fixed-width unit every payload is serialized into.
pub type MessageUnit = u64;

/// Identity of a logical worker multiplexed over a [`VirtualCommunicator`](crate::VirtualCommunicator).
pub type WorkerId = u64;

/// Size of one [`MessageUnit`] in bytes.
pub const UNIT_BYTES: usize = std::mem::size_of::<MessageUnit>();

/// Convert a byte budget to a whole number of units.
pub const fn units_for_bytes(bytes: usize) -> usize {
    bytes / UNIT_BYTES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units_for_bytes_rounds_down() {
        assert_eq!(units_for_bytes(4096), 512);
        assert_eq!(units_for_bytes(4000), 500);
        assert_eq!(units_for_bytes(7), 0);
    }
}
