use crate::error::TypeError;

/// A caller-supplied content-source version. Never generated internally.
pub type Revision = u64;

/// Parse a revision from untrusted input.
///
/// Only a plain decimal literal is accepted: no sign, no whitespace, no
/// exponent, and the value must fit in a `u64`.
pub fn validate_revision(input: &str) -> Result<Revision, TypeError> {
    if input.is_empty() || !input.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TypeError::InvalidRevision(input.to_string()));
    }
    input
        .parse::<u64>()
        .map_err(|_| TypeError::InvalidRevision(input.to_string()))
}
