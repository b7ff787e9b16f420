//! Repository names, references and content descriptors
//!
//! Names follow the distribution grammar: an optional domain component
//! (`host[:port]`) followed by one or more lowercase path components.
//! [`Reference`] is the tagged sum of the three shapes a reference can take;
//! only [`Reference::Canonical`] identifies immutable content.

use crate::digest::Digest;
use crate::error::{ProxyError, Result};
use bytes::Bytes;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

pub const NAME_TOTAL_LENGTH_MAX: usize = 255;

pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCTET_STREAM: &str = "application/octet-stream";

static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    let domain_component = r"(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])";
    let domain = format!(r"{dc}(?:\.{dc})*(?::[0-9]+)?", dc = domain_component);
    let path_component = r"[a-z0-9]+(?:(?:[._]|__|[-]+)[a-z0-9]+)*";
    let pattern = format!(
        r"^(?:{domain}/)?{pc}(?:/{pc})*$",
        domain = domain,
        pc = path_component
    );
    Regex::new(&pattern).expect("name grammar is a valid regex")
});

static TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w][\w.-]{0,127}$").expect("tag grammar is a valid regex"));

/// A validated repository name, e.g. `registry-1.docker.io/library/redis`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryName(String);

impl RepositoryName {
    pub fn parse(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(ProxyError::name_parse(name, "repository name must have at least one component"));
        }
        if name.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(ProxyError::name_parse(
                name,
                format!("repository name must not be more than {} characters", NAME_TOTAL_LENGTH_MAX),
            ));
        }
        if !NAME_REGEX.is_match(name) {
            return Err(ProxyError::name_parse(name, "invalid reference format"));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading domain component, if the first component looks like a host
    pub fn domain(&self) -> Option<&str> {
        let (first, _) = self.0.split_once('/')?;
        let is_domain = first.contains('.')
            || first.contains(':')
            || first == "localhost"
            || first.chars().any(|c| c.is_ascii_uppercase());
        is_domain.then_some(first)
    }

    /// Name without its domain component
    pub fn path(&self) -> &str {
        match self.domain() {
            Some(domain) => &self.0[domain.len() + 1..],
            None => &self.0,
        }
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Repository name plus content digest
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalReference {
    name: RepositoryName,
    digest: Digest,
}

impl CanonicalReference {
    pub fn new(name: RepositoryName, digest: Digest) -> Self {
        Self { name, digest }
    }

    pub fn name(&self) -> &RepositoryName {
        &self.name
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

/// Repository name plus tag
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaggedReference {
    name: RepositoryName,
    tag: String,
}

impl TaggedReference {
    pub fn new(name: RepositoryName, tag: &str) -> Result<Self> {
        validate_tag(tag)?;
        Ok(Self {
            name,
            tag: tag.to_string(),
        })
    }

    pub fn name(&self) -> &RepositoryName {
        &self.name
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    Canonical(CanonicalReference),
    Tagged(TaggedReference),
    Name(RepositoryName),
}

impl Reference {
    /// Parse `name@sha256:..`, `name:tag` or a bare `name`
    pub fn parse(s: &str) -> Result<Self> {
        if let Some((name, digest)) = s.split_once('@') {
            let name = RepositoryName::parse(strip_tag(name).0)?;
            return Ok(Reference::Canonical(CanonicalReference::new(
                name,
                Digest::parse(digest)?,
            )));
        }

        match strip_tag(s) {
            (name, Some(tag)) => Ok(Reference::Tagged(TaggedReference::new(
                RepositoryName::parse(name)?,
                tag,
            )?)),
            (name, None) => Ok(Reference::Name(RepositoryName::parse(name)?)),
        }
    }

    pub fn name(&self) -> &RepositoryName {
        match self {
            Reference::Canonical(r) => r.name(),
            Reference::Tagged(r) => r.name(),
            Reference::Name(name) => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Reference::Canonical(_) => "canonical",
            Reference::Tagged(_) => "tagged",
            Reference::Name(_) => "name",
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Canonical(r) => write!(f, "{}@{}", r.name, r.digest),
            Reference::Tagged(r) => write!(f, "{}:{}", r.name, r.tag),
            Reference::Name(name) => write!(f, "{}", name),
        }
    }
}

impl From<CanonicalReference> for Reference {
    fn from(reference: CanonicalReference) -> Self {
        Reference::Canonical(reference)
    }
}

/// Split a trailing `:tag`, ignoring the colon of a `host:port` domain.
fn strip_tag(s: &str) -> (&str, Option<&str>) {
    match s.rfind(':') {
        Some(pos) if !s[pos..].contains('/') => (&s[..pos], Some(&s[pos + 1..])),
        _ => (s, None),
    }
}

pub fn validate_tag(tag: &str) -> Result<()> {
    if TAG_REGEX.is_match(tag) {
        Ok(())
    } else {
        Err(ProxyError::name_parse(tag, "invalid tag format"))
    }
}

/// Media type, digest and size of a piece of content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default = "default_media_type")]
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
}

fn default_media_type() -> String {
    MEDIA_TYPE_OCTET_STREAM.to_string()
}

/// Raw manifest payload with its media type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    media_type: String,
    payload: Bytes,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestDocument {
    media_type: Option<String>,
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

impl Manifest {
    pub fn new(media_type: impl Into<String>, payload: Bytes) -> Self {
        Self {
            media_type: media_type.into(),
            payload,
        }
    }

    /// Build a manifest, taking the media type from the payload itself
    pub fn from_payload(payload: Bytes) -> Result<Self> {
        let document: ManifestDocument = serde_json::from_slice(&payload)?;
        let media_type = document
            .media_type
            .unwrap_or_else(|| MEDIA_TYPE_OCI_MANIFEST.to_string());
        Ok(Self::new(media_type, payload))
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn digest(&self) -> Digest {
        Digest::from_bytes(&self.payload)
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor {
            media_type: self.media_type.clone(),
            digest: self.digest(),
            size: self.payload.len() as u64,
        }
    }

    pub fn is_index(&self) -> bool {
        self.media_type == MEDIA_TYPE_OCI_INDEX || self.media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
    }

    /// Content this manifest points at: config and layers for an image
    /// manifest, child manifests for an index.
    pub fn references(&self) -> Result<Vec<Descriptor>> {
        let document: ManifestDocument = serde_json::from_slice(&self.payload)?;
        let mut references = Vec::new();
        references.extend(document.config);
        references.extend(document.layers);
        references.extend(document.manifests);
        Ok(references)
    }
}
