//! Slug generation for object ids

/// Turn arbitrary text into a lowercase `a-z0-9_` slug.
///
/// Non-ASCII letters are transliterated, every other run of characters
/// becomes a single underscore. Text without any usable character yields
/// `"unknown"`.
pub fn slugify(text: &str) -> String {
    let slug = ::slug::slugify(text).replace('-', "_");
    if slug.is_empty() {
        return crate::STATE_UNKNOWN.to_string();
    }
    slug
}
