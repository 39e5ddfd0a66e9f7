//! Pairing rules for provisioning copy lists.

/// One copy operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CopyStep {
    /// Local path to copy.
    pub source: String,
    /// Remote path to copy to.
    pub destination: String,
}

/// Expands a copy list into individual copy steps.
///
/// An even-length list is read as `(source, destination)` pairs. An odd-length
/// list copies every entry but the last into the last entry, which must name
/// a directory. An empty list copies nothing.
#[must_use]
pub fn copy_plan(entries: &[String]) -> Vec<CopyStep> {
    let pairs = entries.chunks_exact(2);
    if pairs.remainder().is_empty() {
        return pairs
            .filter_map(|pair| match pair {
                [source, destination] => Some(CopyStep {
                    source: source.clone(),
                    destination: destination.clone(),
                }),
                _ => None,
            })
            .collect();
    }

    let Some((directory, sources)) = entries.split_last() else {
        return Vec::new();
    };
    sources
        .iter()
        .map(|source| CopyStep {
            source: source.clone(),
            destination: directory.clone(),
        })
        .collect()
}
