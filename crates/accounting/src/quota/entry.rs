//! One sender's row in a peer quota table.

/// Accounted usage one sender holds in one receiving peer's pool.
///
/// Rows are created zeroed on a sender's first charge and may return to
/// zero, but are never removed while the table lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaEntry {
    /// Bytes of the receiver's pool reserved by this sender's outstanding
    /// messages.
    pub allocated_size: u64,
    /// Outstanding messages this sender has queued into the receiver's
    /// pool.
    pub n_messages: u32,
}

impl QuotaEntry {
    /// True while the sender holds at least one outstanding message.
    pub fn is_active(&self) -> bool {
        self.n_messages > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_active_tracks_messages() {
        let mut entry = QuotaEntry::default();
        assert!(!entry.is_active());

        entry.n_messages = 1;
        assert!(entry.is_active());
    }
}
