//! Canonical identifier form shared by every comparison in the client.

/// Trimmed, lower-cased form of a user-facing identifier.
///
/// Total: empty or whitespace-only input maps to the empty string.
pub fn normalize(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}
