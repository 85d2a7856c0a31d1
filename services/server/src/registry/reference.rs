//! Image reference parsing.
//!
//! References follow `docker pull` rules:
//! - `minio` -> (registry-1.docker.io, library/minio, latest)
//! - `quay.io/minio/minio:RELEASE.2024-01-01T00-00-00Z` -> (quay.io, minio/minio, tag)
//! - `localhost:5000/app@sha256:abc...` -> (localhost:5000, app, digest)

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Registry used when the reference names none.
pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("image reference is empty")]
    Empty,

    #[error("invalid image reference {reference:?}: {reason}")]
    Invalid { reference: String, reason: String },
}

/// Tag or digest part of a reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    Tag(String),
    /// Full digest including the algorithm, e.g. `sha256:abc...`.
    Digest(String),
}

impl Selector {
    pub fn as_str(&self) -> &str {
        match self {
            Selector::Tag(tag) => tag,
            Selector::Digest(digest) => digest,
        }
    }
}

/// Canonical identity of a source image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub selector: Selector,
}

impl ImageReference {
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ReferenceError::Empty);
        }
        let invalid = |reason: &str| ReferenceError::Invalid {
            reference: input.to_string(),
            reason: reason.to_string(),
        };
        if input.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }

        let (name_part, selector) = if let Some((name, digest)) = input.rsplit_once('@') {
            let Some((algorithm, hex)) = digest.split_once(':') else {
                return Err(invalid("digest must look like <algorithm>:<hex>"));
            };
            if algorithm.is_empty() || hex.is_empty() {
                return Err(invalid("digest must look like <algorithm>:<hex>"));
            }
            (name, Selector::Digest(digest.to_string()))
        } else if let Some((name, tag)) = input.rsplit_once(':') {
            // "host:5000/app" has a port, not a tag.
            if tag.contains('/') {
                (input, Selector::Tag(DEFAULT_TAG.to_string()))
            } else {
                if tag.is_empty() {
                    return Err(invalid("empty tag"));
                }
                (name, Selector::Tag(tag.to_string()))
            }
        } else {
            (input, Selector::Tag(DEFAULT_TAG.to_string()))
        };

        let (registry, repository) = match name_part.split_once('/') {
            None => (DEFAULT_REGISTRY.to_string(), format!("library/{name_part}")),
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (DEFAULT_REGISTRY.to_string(), name_part.to_string()),
        };
        // Docker Hub aliases get the same `library/` treatment as bare names.
        let (registry, repository) = if registry == "docker.io" || registry == "index.docker.io" {
            let repository = if repository.contains('/') {
                repository
            } else {
                format!("library/{repository}")
            };
            (DEFAULT_REGISTRY.to_string(), repository)
        } else {
            (registry, repository)
        };

        if repository.split('/').any(str::is_empty) {
            return Err(invalid("empty repository path component"));
        }
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(invalid("repository must be lowercase"));
        }

        Ok(Self {
            registry,
            repository,
            selector,
        })
    }
}

impl FromStr for ImageReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.selector {
            Selector::Tag(tag) => write!(f, "{}/{}:{}", self.registry, self.repository, tag),
            Selector::Digest(digest) => {
                write!(f, "{}/{}@{}", self.registry, self.repository, digest)
            }
        }
    }
}
