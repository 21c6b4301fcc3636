use serde::Deserialize;

use depot_objectstore::config::Config as ObjectStoreConfig;

/// Top-level configuration file: which object store backend to drive, read once at
/// startup before constructing the repository store manager.
#[derive(Clone, Deserialize)]
pub struct Config {
    pub store: ObjectStoreConfig,
}
