/// Type-erased error shared across component boundaries.
pub type AnyError = anyhow::Error;

/// Result alias for [`AnyError`].
pub type AnyResult<T, E = AnyError> = std::result::Result<T, E>;
