//! The pluggable link namespace (§4.E): the same link-file structure represents either the
//! `_layers/` or `_manifests/revisions/` sub-namespace, selected by [`LinkNamespace`].
use depot_core::{OciDigest, PathMapper, PathSpec};
use depot_objectstore::Key;

use crate::errors::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkNamespace {
    Layers,
    ManifestRevisions,
}

impl LinkNamespace {
    pub fn link_key(&self, paths: &PathMapper, name: &str, digest: &OciDigest) -> Result<Key> {
        let s = match self {
            LinkNamespace::Layers => paths.path(&PathSpec::LayerLink { name, digest }),
            LinkNamespace::ManifestRevisions => {
                paths.path(&PathSpec::ManifestRevisionLink { name, digest })
            }
        };
        Ok(Key::try_from(s.as_str())?)
    }

    pub fn root_key(&self, paths: &PathMapper, name: &str) -> Result<Key> {
        let s = match self {
            LinkNamespace::Layers => paths.path(&PathSpec::LayersRoot { name }),
            LinkNamespace::ManifestRevisions => paths.path(&PathSpec::ManifestRevisionsRoot { name }),
        };
        Ok(Key::try_from(s.as_str())?)
    }
}
