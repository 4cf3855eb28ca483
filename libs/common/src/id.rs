use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = banter_common::id::prefixed_ulid("gw");
/// assert!(id.starts_with("gw_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new().to_string())
}

/// Well-known ID prefixes.
pub mod prefix {
    /// Gateway sessions.
    pub const SESSION: &str = "gw";
}
