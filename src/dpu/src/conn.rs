//! Connection slot lifecycle.

/// Slots are preallocated and reused across client sessions:
/// `Available -> Occupied` when a connect request claims the slot,
/// `Occupied -> Connected` once the connection is established, and back to
/// `Available` on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Available,
    Occupied,
    Connected,
}

impl ConnState {
    #[inline]
    pub fn is_connected(self) -> bool {
        self == ConnState::Connected
    }
}
