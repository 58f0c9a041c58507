//! Determines whether an opened path falls under collective management.
//!
//! Grounded on `original_source/src/io_middle.c`'s `_myhijack_init`/`myopen`,
//! which compares the incoming path against `IOMIDDLE_CARE_PATH` with a raw
//! `strncmp`. A path is managed iff the care path is a non-empty prefix of
//! it; this intentionally does not canonicalize (`realpath`) either side,
//! matching the original's byte-for-byte comparison.

/// Returns `true` if `path` falls under the given `care_path` prefix.
///
/// An empty `care_path` never matches anything (the middleware is
/// effectively disabled), mirroring the original's refusal to hijack when
/// `IOMIDDLE_CARE_PATH` is unset.
pub fn is_managed(care_path: &str, path: &[u8]) -> bool {
    if care_path.is_empty() {
        return false;
    }
    path.starts_with(care_path.as_bytes())
}
