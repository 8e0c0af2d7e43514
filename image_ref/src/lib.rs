//! Image references as handled by a local container engine.
//!
//! Two kinds of references are supported:
//!
//! ```txt
//! name := [registry '/'] path [':' tag]
//! id   := [algorithm ':'] hex
//! ```
//!
//! The name grammar follows the `reference` package of the distribution project, without the
//! `@digest` suffix since images are only ever addressed by name or by identifier here.

use std::{ops::Range, str::FromStr, sync::LazyLock};

use regex::Regex;

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidImageName(String);

impl std::error::Error for InvalidImageName {}

impl std::fmt::Display for InvalidImageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid image name {:?}, expected `[registry/]path[:tag]`",
            self.0
        )
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidImageId(String);

impl std::error::Error for InvalidImageId {}

impl std::fmt::Display for InvalidImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid image identifier {:?}, expected `[algorithm:]hex`",
            self.0
        )
    }
}

const REGISTRY_SUFFIX: char = '/';
const TAG_PREFIX: char = ':';

/// Number of hex characters in [`ImageId::short`].
pub const SHORT_ID_LEN: usize = 12;

#[derive(Copy, Clone)]
struct NameIndices {
    path_start: usize,
    tag_start: Option<usize>,
}

impl NameIndices {
    fn parse(s: &str) -> Option<Self> {
        static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(concat!(
                r"^",
                r"(?:(?P<registry>localhost(?::[0-9]+)?|[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?(?:(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)+(?::[0-9]+)?|:[0-9]+))\/)?",
                r"(?P<path>[a-z0-9]+(?:(?:[_.]|__|[-]*)[a-z0-9]+)*(?:\/[a-z0-9]+(?:(?:[_.]|__|[-]*)[a-z0-9]+)*)*)",
                r"(?::(?P<tag>[\w][\w.-]{0,127}))?",
                r"$"
            ))
            .unwrap()
        });

        // NOTE: A leading component is only a registry if it contains a dot or a port, or equals
        // `localhost`. Otherwise it is the first path component.
        let captures = NAME_REGEX.captures(s)?;
        Some(Self {
            path_start: captures.name("path")?.start(),
            tag_start: captures.name("tag").map(|m| m.start()),
        })
    }

    fn registry_range(&self) -> Option<Range<usize>> {
        (self.path_start != 0).then(|| 0..self.path_start - REGISTRY_SUFFIX.len_utf8())
    }

    fn tag_range(&self, len: usize) -> Option<Range<usize>> {
        self.tag_start.map(|tag_start| tag_start..len)
    }
}

/// A validated image name such as `apache/solr:9.5.0` or `registry.example.com:5000/solr`.
#[derive(Clone)]
pub struct ImageName {
    buffer: String,
    indices: NameIndices,
}

impl ImageName {
    pub fn new(value: String) -> Result<Self, InvalidImageName> {
        match NameIndices::parse(&value) {
            Some(indices) => Ok(Self {
                buffer: value,
                indices,
            }),
            None => Err(InvalidImageName(value)),
        }
    }

    /// Joins a repository and a tag into `<repository>:<tag>`.
    pub fn from_repository_and_tag(repository: &str, tag: &str) -> Result<Self, InvalidImageName> {
        let mut buffer = String::with_capacity(repository.len() + TAG_PREFIX.len_utf8() + tag.len());
        buffer.push_str(repository);
        buffer.push(TAG_PREFIX);
        buffer.push_str(tag);
        Self::new(buffer)
    }

    pub fn registry(&self) -> Option<&str> {
        self.indices.registry_range().map(|range| &self.buffer[range])
    }

    pub fn tag(&self) -> Option<&str> {
        self.indices
            .tag_range(self.buffer.len())
            .map(|range| &self.buffer[range])
    }

    pub fn as_str(&self) -> &str {
        &self.buffer
    }
}

impl FromStr for ImageName {
    type Err = InvalidImageName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_owned())
    }
}

impl PartialEq for ImageName {
    fn eq(&self, other: &Self) -> bool {
        self.buffer == other.buffer
    }
}

impl Eq for ImageName {}

impl AsRef<str> for ImageName {
    fn as_ref(&self) -> &str {
        &self.buffer
    }
}

impl AsRef<std::ffi::OsStr> for ImageName {
    fn as_ref(&self) -> &std::ffi::OsStr {
        self.buffer.as_ref()
    }
}

impl std::fmt::Debug for ImageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.buffer.fmt(f)
    }
}

impl std::fmt::Display for ImageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.buffer.fmt(f)
    }
}

/// The content-derived identifier of a locally built image, as written by `docker build
/// --iidfile`, e.g. `sha256:0b1c...`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ImageId {
    buffer: String,
    hex_start: usize,
}

impl ImageId {
    pub fn new(value: String) -> Result<Self, InvalidImageId> {
        static ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(concat!(
                r"^",
                r"(?:[A-Za-z][A-Za-z0-9]*(?:[+.\-_][A-Za-z][A-Za-z0-9]*)*:)?",
                r"(?P<hex>[0-9a-fA-F]{12,})",
                r"$"
            ))
            .unwrap()
        });

        let Some(hex_start) = ID_REGEX
            .captures(&value)
            .and_then(|captures| captures.name("hex"))
            .map(|m| m.start())
        else {
            return Err(InvalidImageId(value));
        };

        Ok(Self {
            buffer: value,
            hex_start,
        })
    }

    pub fn hex(&self) -> &str {
        &self.buffer[self.hex_start..]
    }

    /// A non-authoritative, human friendly reference made of the first [`SHORT_ID_LEN`] hex
    /// characters. Only meant for display and for passing to scripts that resolve it through the
    /// engine.
    pub fn short(&self) -> &str {
        &self.hex()[..SHORT_ID_LEN]
    }

    pub fn as_str(&self) -> &str {
        &self.buffer
    }
}

impl FromStr for ImageId {
    type Err = InvalidImageId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_owned())
    }
}

impl AsRef<str> for ImageId {
    fn as_ref(&self) -> &str {
        &self.buffer
    }
}

impl AsRef<std::ffi::OsStr> for ImageId {
    fn as_ref(&self) -> &std::ffi::OsStr {
        self.buffer.as_ref()
    }
}

impl std::fmt::Debug for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.buffer.fmt(f)
    }
}

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.buffer.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_name_parsing_works() {
        {
            let name: ImageName = "apache/solr:9.5.0".parse().unwrap();
            assert_eq!(name.registry(), None);
            assert_eq!(name.tag(), Some("9.5.0"));
        }

        {
            let name: ImageName = "solr".parse().unwrap();
            assert_eq!(name.registry(), None);
            assert_eq!(name.tag(), None);
        }

        {
            let name: ImageName = "reg.io:5000/org-name/solr-slim:latest".parse().unwrap();
            assert_eq!(name.registry(), Some("reg.io:5000"));
            assert_eq!(name.tag(), Some("latest"));
        }

        {
            let name: ImageName = "localhost/solr".parse().unwrap();
            assert_eq!(name.registry(), Some("localhost"));
            assert_eq!(name.tag(), None);
        }
    }

    #[test]
    fn image_name_rejects_malformed_values() {
        for value in ["", ".", "apache/solr:", "Apache/Solr", "apache/solr:9.5.0 ", "a//b"] {
            assert_eq!(
                ImageName::new(value.to_owned()).err(),
                Some(InvalidImageName(value.to_owned())),
                "{value:?} should be rejected"
            );
        }
    }

    #[test]
    fn image_name_from_repository_and_tag() {
        let name = ImageName::from_repository_and_tag("apache/solr", "9.5.0-slim").unwrap();
        assert_eq!(name.as_str(), "apache/solr:9.5.0-slim");
        assert!(ImageName::from_repository_and_tag("apache/solr", "").is_err());
    }

    #[test]
    fn image_id_parsing_works() {
        let id: ImageId = "sha256:0b1c2d3e4f5a6b7c8d9e0f1a2b3c4d5e6f7a8b9c0d1e2f3a4b5c6d7e8f9a0b1c"
            .parse()
            .unwrap();
        assert_eq!(
            id.hex(),
            "0b1c2d3e4f5a6b7c8d9e0f1a2b3c4d5e6f7a8b9c0d1e2f3a4b5c6d7e8f9a0b1c"
        );
        assert_eq!(id.short(), "0b1c2d3e4f5a");

        let id: ImageId = "0123456789abcdef".parse().unwrap();
        assert_eq!(id.hex(), "0123456789abcdef");
        assert_eq!(id.short(), "0123456789ab");
    }

    #[test]
    fn image_id_rejects_malformed_values() {
        for value in ["", "sha256:", "sha256:xyz", "sha256:0123", "0123456789abcdef\n"] {
            assert!(value.parse::<ImageId>().is_err(), "{value:?} should be rejected");
        }
    }
}
