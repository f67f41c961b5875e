//! Namespace/Repository configuration registry.
//!
//! Loaded once at mount time from a TOML file and owned for the process
//! lifetime of the mount: `PathInfo` shares it by `Arc` rather than
//! borrowing, so a handle can own its `PathInfo` without a lifetime
//! parameter.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::marfs::error::{Error, Result};
use crate::marfs::xattr::RECOVERY_INFO_SIZE;

bitflags::bitflags! {
    /// Interactive permission bits a namespace grants per-caller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IPerms: u32 {
        const R_META = 0b0000_0001;
        const W_META = 0b0000_0010;
        const R_DATA = 0b0000_0100;
        const W_DATA = 0b0000_1000;
        const T_DATA = 0b0001_0000;
    }
}

impl<'de> Deserialize<'de> for IPerms {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let names: Vec<String> = Vec::deserialize(deserializer)?;
        let mut perms = IPerms::empty();
        for name in names {
            let bit = match name.as_str() {
                "RMETA" => IPerms::R_META,
                "WMETA" => IPerms::W_META,
                "RDATA" => IPerms::R_DATA,
                "WDATA" => IPerms::W_DATA,
                "TDATA" => IPerms::T_DATA,
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "unknown interactive permission {other}"
                    )))
                }
            };
            perms |= bit;
        }
        Ok(perms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessMethod {
    Direct,
    S3,
    S3Emc,
    Sproxyd,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub name: String,
    pub access_method: AccessMethod,
    pub host_template: String,
    pub host_offset: u32,
    pub host_count: u32,
    pub bucket: String,
    #[serde(default)]
    pub tls: bool,
    pub chunk_size: u64,
}

impl Repository {
    /// `chunk_size - sizeof(RecoveryInfo) - 8`, the user-data capacity of one
    /// Uni/Multi chunk.
    pub fn data_per_chunk(&self) -> u64 {
        self.chunk_size - RECOVERY_INFO_SIZE as u64
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Namespace {
    pub name: String,
    pub mount_prefix: String,
    pub mdfs_root: PathBuf,
    pub write_repo: String,
    pub iperms: IPerms,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default, rename = "namespace")]
    namespaces: Vec<Namespace>,
    #[serde(default, rename = "repository")]
    repositories: Vec<Repository>,
}

/// Per-path bundle resolved by the Path Resolver: owning namespace, write
/// repository, and MDFS absolute path. Cheap to clone (two `Arc`s plus a
/// `PathBuf`) since a handle or single operation owns one of these.
#[derive(Debug, Clone)]
pub struct PathInfo {
    pub namespace: Arc<Namespace>,
    pub repository: Arc<Repository>,
    pub mdfs_path: PathBuf,
}

/// The parsed namespace/repository registry. Immutable after load.
#[derive(Debug)]
pub struct Config {
    namespaces: Vec<Arc<Namespace>>,
    repositories: Vec<Arc<Repository>>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config> {
        let raw: RawConfig = toml::from_str(text)
            .map_err(|_| Error::Layout("malformed marfs.toml"))?;

        let repositories: Vec<Arc<Repository>> =
            raw.repositories.into_iter().map(Arc::new).collect();
        for repo in &repositories {
            if repo.chunk_size <= RECOVERY_INFO_SIZE as u64 {
                return Err(Error::Layout(
                    "repository chunk_size must exceed sizeof(RecoveryInfo)+8",
                ));
            }
        }

        let namespaces: Vec<Arc<Namespace>> =
            raw.namespaces.into_iter().map(Arc::new).collect();

        Ok(Config {
            namespaces,
            repositories,
        })
    }

    fn find_repository(&self, name: &str) -> Option<Arc<Repository>> {
        self.repositories.iter().find(|r| r.name == name).cloned()
    }

    /// Longest-prefix match of `mount_prefix` over the registered
    /// namespaces, matched on path-segment boundaries so `/nsfoo` can't
    /// resolve into a namespace mounted at `/ns`. A path matching no
    /// namespace resolves to the artificial read-only root namespace.
    pub fn resolve(&self, mount_relative_path: &str) -> Result<PathInfo> {
        let best = self
            .namespaces
            .iter()
            .filter(|ns| match mount_relative_path.strip_prefix(ns.mount_prefix.as_str()) {
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            })
            .max_by_key(|ns| ns.mount_prefix.len());

        let namespace = match best {
            Some(ns) => ns.clone(),
            None => return Err(Error::Permission),
        };

        let repository = self
            .find_repository(&namespace.write_repo)
            .ok_or(Error::Layout("namespace references unknown repository"))?;

        let remainder = mount_relative_path
            .strip_prefix(namespace.mount_prefix.as_str())
            .unwrap_or(mount_relative_path)
            .trim_start_matches('/');
        let mdfs_path = namespace.mdfs_root.join(remainder);

        Ok(PathInfo {
            namespace,
            repository,
            mdfs_path,
        })
    }

    pub fn require_perms(&self, info: &PathInfo, required: IPerms) -> Result<()> {
        if info.namespace.iperms.contains(required) {
            Ok(())
        } else {
            Err(Error::Permission)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[namespace]]
        name = "ns"
        mount_prefix = "/ns"
        mdfs_root = "/mdfs/ns"
        write_repo = "repo1"
        iperms = ["RMETA", "WMETA", "RDATA", "WDATA"]

        [[repository]]
        name = "repo1"
        access_method = "S3"
        host_template = "10.0.0.%d"
        host_offset = 1
        host_count = 4
        bucket = "marfs-repo1"
        tls = true
        chunk_size = 1048576
    "#;

    #[test]
    fn resolves_longest_prefix() {
        let cfg = Config::parse(SAMPLE).unwrap();
        let info = cfg.resolve("/ns/a/b.txt").unwrap();
        assert_eq!(info.namespace.name, "ns");
        assert_eq!(info.mdfs_path, PathBuf::from("/mdfs/ns/a/b.txt"));
        assert_eq!(info.repository.name, "repo1");
    }

    #[test]
    fn sibling_prefix_does_not_match_shorter_namespace() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert!(matches!(cfg.resolve("/nsfoo/file"), Err(Error::Permission)));
    }

    #[test]
    fn unknown_namespace_is_permission_denied() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert!(matches!(cfg.resolve("/other/x"), Err(Error::Permission)));
    }

    #[test]
    fn rejects_undersized_chunk_size() {
        let bad = SAMPLE.replace("chunk_size = 1048576", "chunk_size = 8");
        assert!(Config::parse(&bad).is_err());
    }

    #[test]
    fn data_per_chunk_subtracts_recovery() {
        let cfg = Config::parse(SAMPLE).unwrap();
        let info = cfg.resolve("/ns/a").unwrap();
        assert_eq!(
            info.repository.data_per_chunk(),
            1048576 - RECOVERY_INFO_SIZE as u64
        );
    }
}
