/// Errors produced by a [`DelayStore`](crate::DelayStore) backing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The arena has no room left for another entry.
    ///
    /// The update that triggered this is dropped; the store itself is left
    /// untouched.
    #[error("delay store arena of {capacity} bytes is exhausted; increase `arena_size`")]
    ArenaExhausted {
        /// Configured arena size in bytes.
        capacity: usize,
    },

    /// The configured arena cannot hold even a single entry.
    #[error("arena of {capacity} bytes is too small; at least {required} bytes are required")]
    ArenaTooSmall { capacity: usize, required: usize },
}
