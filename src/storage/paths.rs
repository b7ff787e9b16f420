//! Storage path layout
//!
//! ```text
//! /blobs/<alg>/<hex[..2]>/<hex>/data
//! /repositories/<name>/_layers/<alg>/<hex>/link
//! /repositories/<name>/_manifests/revisions/<alg>/<hex>/link
//! /repositories/<name>/_manifests/tags/<tag>/current/link
//! ```

use crate::digest::Digest;
use crate::reference::RepositoryName;

pub const BLOBS_ROOT: &str = "/blobs";
pub const REPOSITORIES_ROOT: &str = "/repositories";
pub const LAYERS_DIR: &str = "_layers";
pub const MANIFESTS_DIR: &str = "_manifests";

pub fn blob_dir(digest: &Digest) -> String {
    format!(
        "{}/{}/{}/{}",
        BLOBS_ROOT,
        digest.algorithm(),
        &digest.hex()[..2],
        digest.hex()
    )
}

pub fn blob_data(digest: &Digest) -> String {
    format!("{}/data", blob_dir(digest))
}

pub fn repository_root(name: &RepositoryName) -> String {
    format!("{}/{}", REPOSITORIES_ROOT, name)
}

pub fn layer_link(name: &RepositoryName, digest: &Digest) -> String {
    format!(
        "{}/{}/{}/{}/link",
        repository_root(name),
        LAYERS_DIR,
        digest.algorithm(),
        digest.hex()
    )
}

pub fn manifest_revision_link(name: &RepositoryName, digest: &Digest) -> String {
    format!(
        "{}/{}/revisions/{}/{}/link",
        repository_root(name),
        MANIFESTS_DIR,
        digest.algorithm(),
        digest.hex()
    )
}

pub fn tags_dir(name: &RepositoryName) -> String {
    format!("{}/{}/tags", repository_root(name), MANIFESTS_DIR)
}

pub fn tag_dir(name: &RepositoryName, tag: &str) -> String {
    format!("{}/{}", tags_dir(name), tag)
}

pub fn tag_current_link(name: &RepositoryName, tag: &str) -> String {
    format!("{}/current/link", tag_dir(name, tag))
}

/// Final component of a storage path
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lays_out_blob_and_link_paths() {
        let digest = Digest::from_bytes(b"hello world");
        let name = RepositoryName::parse("registry-1.docker.io/library/redis").unwrap();

        assert_eq!(
            blob_data(&digest),
            format!("/blobs/sha256/b9/{}/data", digest.hex())
        );
        assert_eq!(
            layer_link(&name, &digest),
            format!(
                "/repositories/registry-1.docker.io/library/redis/_layers/sha256/{}/link",
                digest.hex()
            )
        );
        assert_eq!(base_name(&tag_dir(&name, "7.2")), "7.2");
    }
}
