use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MANIFEST_FILE: &str = "manifest.toml";
pub const LOCK_FILE: &str = "manifest.lock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub package: PackageSection,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSection {
    pub name: String,
    pub version: String,
}

impl Manifest {
    pub fn new(name: &str, version: &str, dependencies: BTreeMap<String, String>) -> Self {
        Self {
            package: PackageSection {
                name: name.to_string(),
                version: version.to_string(),
            },
            dependencies,
        }
    }

    /// The manifest file contents.
    pub fn render(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }
}
