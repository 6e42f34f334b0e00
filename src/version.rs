//! PostgreSQL major version parsing from container image references.
//!
//! The declared target version of a cluster is carried by its image tag:
//!
//! ```text
//! ghcr.io/example/postgresql:15.6-bookworm  -> 15
//! registry:5000/postgres:16@sha256:...      -> 16
//! postgres:9.6                              -> 9
//! ```

/// Errors raised while deriving a major version from an image reference.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("image {0:?} has no tag")]
    MissingTag(String),

    #[error("tag {tag:?} of image {image:?} does not start with a PostgreSQL version")]
    InvalidTag { image: String, tag: String },
}

/// Extract the tag of an image reference.
///
/// Any digest (`@sha256:...`) is dropped first. A `:` only separates a tag when it
/// appears after the last `/`, otherwise it belongs to a registry port.
pub fn image_tag(image: &str) -> Option<&str> {
    let without_digest = image.split('@').next().unwrap_or(image);
    let name_start = without_digest.rfind('/').map(|i| i + 1).unwrap_or(0);
    let name = &without_digest[name_start..];

    name.rfind(':')
        .map(|i| &name[i + 1..])
        .filter(|tag| !tag.is_empty())
}

/// Parse the major version from an image tag such as `16.2-1` or `17`.
pub fn major_from_tag(tag: &str) -> Option<u32> {
    let numeric: String = tag
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    numeric
        .split('.')
        .next()
        .filter(|major| !major.is_empty())
        .and_then(|major| major.parse().ok())
}

/// Derive the PostgreSQL major version from a full image reference.
pub fn major_from_image(image: &str) -> Result<u32, VersionError> {
    let tag = image_tag(image).ok_or_else(|| VersionError::MissingTag(image.to_string()))?;

    major_from_tag(tag).ok_or_else(|| VersionError::InvalidTag {
        image: image.to_string(),
        tag: tag.to_string(),
    })
}
