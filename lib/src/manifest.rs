//! The project manifest model: a TOML-shaped document with four top-level
//! sections (spec.md §6). Manifest *parsing* is out of this system's core
//! scope, but its result type is not — the graph engine is built against
//! this struct, so it is implemented here rather than stubbed, grounded in
//! `examples/original_source/config.go`'s `Config`/`ReadConfig` (itself
//! `github.com/BurntSushi/toml`-based) and `bootc-lib`'s own use of the
//! `toml` crate for its own configuration files.

use std::collections::BTreeMap;
use std::path::Path;

use camino::Utf8PathBuf;
use serde::Deserialize;

use crate::error::{ChariotError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Tar,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModifierType {
    Patch,
    Merge,
    Exec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Modifier {
    #[serde(rename = "type")]
    pub kind: ModifierType,
    pub source: Option<String>,
    pub file: Option<String>,
    pub cmd: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceUnit {
    #[serde(rename = "type")]
    pub kind: SourceType,
    pub url: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub modifiers: Vec<Modifier>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StandardTarget {
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub configure: Vec<String>,
    #[serde(default)]
    pub build: Vec<String>,
    #[serde(default)]
    pub install: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostTarget {
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, rename = "runtime-dependencies")]
    pub runtime_dependencies: Vec<String>,
    #[serde(default)]
    pub configure: Vec<String>,
    #[serde(default)]
    pub build: Vec<String>,
    #[serde(default)]
    pub install: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub project: Project,
    #[serde(default, rename = "source")]
    pub sources: BTreeMap<String, SourceUnit>,
    #[serde(default, rename = "host")]
    pub hosts: BTreeMap<String, HostTarget>,
    #[serde(default, rename = "target")]
    pub targets: BTreeMap<String, StandardTarget>,
}

impl Manifest {
    /// Parse a manifest from a TOML string.
    pub fn parse(text: &str) -> Result<Self> {
        let manifest: Manifest = toml::from_str(text)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: &Utf8PathBuf) -> Result<Self> {
        Self::read(path.as_std_path())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ChariotError::io(path.display().to_string(), e))?;
        Self::parse(&text)
    }

    /// Enforce the id grammar of spec.md §3.1/§6 on every declared unit.
    fn validate(&self) -> Result<()> {
        let bad_id = |id: &str| {
            !id.is_empty() && id.chars().all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-'))
        };
        for id in self
            .sources
            .keys()
            .chain(self.hosts.keys())
            .chain(self.targets.keys())
        {
            if !bad_id(id) {
                return Err(ChariotError::ManifestSchema(format!(
                    "id {id:?} does not match ^[a-z-0-9]+$"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_manifest() {
        let text = r#"
            [project]
            name = "t"

            [source.hello]
            type = "local"
            url = "/tmp/hello"
        "#;
        let manifest = Manifest::parse(text).unwrap();
        assert_eq!(manifest.project.name, "t");
        let hello = &manifest.sources["hello"];
        assert_eq!(hello.kind, SourceType::Local);
        assert_eq!(hello.url, "/tmp/hello");
        assert!(hello.modifiers.is_empty());
    }

    #[test]
    fn test_full_target_shape() {
        let text = r#"
            [project]
            name = "t"

            [host.cmake]
            dependencies = ["source:cmake-src"]
            build = ["make"]
            install = ["make install"]

            [target.app]
            dependencies = ["host:cmake", "source:app-src"]
            build = ["cmake $SOURCE:app-src"]
        "#;
        let manifest = Manifest::parse(text).unwrap();
        assert_eq!(manifest.hosts["cmake"].dependencies, vec!["source:cmake-src"]);
        assert_eq!(manifest.targets["app"].build, vec!["cmake $SOURCE:app-src"]);
    }

    #[test]
    fn test_rejects_bad_id() {
        let text = r#"
            [project]
            name = "t"

            [source.Hello]
            type = "local"
            url = "/tmp/hello"
        "#;
        assert!(Manifest::parse(text).is_err());
    }
}
