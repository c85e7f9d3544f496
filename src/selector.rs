//! Switch-candidate selection.
//!
//! When the active IME (or keyboard subtype) drops out of an enable list,
//! the nearest enabled successor from the previously cached ordering takes
//! over. Pure rotation algorithm, no I/O; the caller refreshes its cached
//! list in every branch.

use crate::types::ImeIdentity;

/// Outcome of a switch check against old/new enable lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// The active identity is still enabled; keep it.
    Retain,
    /// The active identity must be switched away from; the candidate is the
    /// nearest successor still present in the new list, if any.
    Switch(Option<ImeIdentity>),
}

/// Circular nearest-successor search.
///
/// `old` is the previously cached ordering, `new` the freshly read list and
/// `dropping` the identity losing its enablement. Identity equality is on
/// bundle name; legacy lists carry no reliable extension names.
pub fn next_candidate(old: &[ImeIdentity], new: &[ImeIdentity], dropping: &ImeIdentity) -> Selection {
    if new.is_empty() {
        return Selection::Switch(None);
    }
    if contains(new, dropping) {
        return Selection::Retain;
    }
    let Some(pos) = position(old, dropping) else {
        // Not in the previous list either; there is no anchor to rotate from.
        return Selection::Switch(None);
    };
    // Rotate so the element right after the dropping one comes first, then
    // take the first survivor.
    for offset in 1..=old.len() {
        let candidate = &old[(pos + offset) % old.len()];
        if contains(new, candidate) {
            return Selection::Switch(Some(candidate.clone()));
        }
    }
    Selection::Switch(None)
}

fn contains(list: &[ImeIdentity], id: &ImeIdentity) -> bool {
    list.iter().any(|x| x.bundle_name == id.bundle_name)
}

fn position(list: &[ImeIdentity], id: &ImeIdentity) -> Option<usize> {
    list.iter().position(|x| x.bundle_name == id.bundle_name)
}
