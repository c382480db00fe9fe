use thiserror::Error;

/// Typed conditions the store distinguishes for its callers.
///
/// These are embedded in `anyhow` chains at the point of origin; the
/// predicates below recover them from a propagated error so callers never
/// have to match on error text.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The name or id prefix does not resolve to a stored image.
    #[error("no such image: {0}")]
    NotFound(String),
    /// The id prefix matches more than one stored image.
    #[error("image id prefix '{0}' is ambiguous")]
    Ambiguous(String),
    /// An image with this id is already registered or mid-registration.
    #[error("image {0} already exists")]
    AlreadyExists(String),
    /// The id does not match the 64-lowercase-hex syntax.
    #[error("invalid image id '{0}'")]
    InvalidId(String),
    /// The metadata document names a different id than its directory.
    #[error("image directory {dir} carries metadata for id {embedded}")]
    IdMismatch { dir: String, embedded: String },
    /// The on-disk entry is not a loadable image of either format.
    #[error("malformed image: {0}")]
    Malformed(String),
}

/// True when `err` carries a [`GraphError::NotFound`].
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<GraphError>(), Some(GraphError::NotFound(_)))
}

/// True when `err` carries a [`GraphError::Ambiguous`].
pub fn is_ambiguous(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<GraphError>(), Some(GraphError::Ambiguous(_)))
}

/// True when `err` carries a [`GraphError::AlreadyExists`].
pub fn is_already_exists(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<GraphError>(),
        Some(GraphError::AlreadyExists(_))
    )
}
