//! Xattr Codec — serializes/parses the reserved `marfs_*` xattr family that
//! records the object layout of a MarFS file.

use crate::marfs::error::{Error, Result};

/// Any xattr name starting with this prefix is reserved: invisible and
/// immutable to external callers.
pub const RESERVED_PREFIX: &str = "marfs_";

pub const PRE_NAME: &str = "marfs_pre";
pub const POST_NAME: &str = "marfs_post";
pub const OBJID_NAME: &str = "marfs_objid";
pub const RESTART_NAME: &str = "marfs_restart";
pub const SLAVE_NAME: &str = "marfs_slave";

/// `sizeof(RecoveryInfo) + 8`: the fixed trailer every backing object carries.
/// The object store's actual RecoveryInfo struct is opaque to the engine;
/// only its size matters for chunk math.
pub const RECOVERY_INFO_SIZE: usize = 136;

pub fn is_reserved(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX)
}

/// Remove reserved names from a NUL-separated `listxattr` buffer in place,
/// shifting subsequent names over each filtered entry.
pub fn filter_reserved(names: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(names.len());
    for entry in names.split(|&b| b == 0) {
        if entry.is_empty() {
            continue;
        }
        if let Ok(name) = std::str::from_utf8(entry) {
            if is_reserved(name) {
                continue;
            }
        }
        out.extend_from_slice(entry);
        out.push(0);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjType {
    Uni,
    Multi,
    Packed,
    NToOne,
    Direct,
}

impl ObjType {
    fn as_str(&self) -> &'static str {
        match self {
            ObjType::Uni => "UNI",
            ObjType::Multi => "MULTI",
            ObjType::Packed => "PACKED",
            ObjType::NToOne => "N_TO_1",
            ObjType::Direct => "DIRECT",
        }
    }

    fn parse(s: &str) -> Result<ObjType> {
        match s {
            "UNI" => Ok(ObjType::Uni),
            "MULTI" => Ok(ObjType::Multi),
            "PACKED" => Ok(ObjType::Packed),
            "N_TO_1" => Ok(ObjType::NToOne),
            "DIRECT" => Ok(ObjType::Direct),
            _ => Err(Error::Layout("unrecognized obj_type in POST xattr")),
        }
    }
}

/// Object identifier (`PRE`): everything besides a chunk number needed to
/// derive a backing object's URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pre {
    pub repo_name: String,
    pub bucket: String,
    pub inode: u64,
    pub chunk_size: u64,
    pub chunk_no: u64,
    pub n_to_1: bool,
}

impl Pre {
    pub fn format(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}/{}",
            self.repo_name,
            self.bucket,
            self.inode,
            self.chunk_size,
            self.chunk_no,
            if self.n_to_1 { "N_TO_1" } else { "-" }
        )
    }

    pub fn parse(s: &str) -> Result<Pre> {
        let mut parts = s.split('/');
        let repo_name = parts.next().ok_or(Error::Layout("malformed PRE"))?.to_string();
        let bucket = parts.next().ok_or(Error::Layout("malformed PRE"))?.to_string();
        let inode: u64 = parts
            .next()
            .ok_or(Error::Layout("malformed PRE"))?
            .parse()
            .map_err(|_| Error::Layout("malformed PRE inode"))?;
        let chunk_size: u64 = parts
            .next()
            .ok_or(Error::Layout("malformed PRE"))?
            .parse()
            .map_err(|_| Error::Layout("malformed PRE chunk_size"))?;
        let chunk_no: u64 = parts
            .next()
            .ok_or(Error::Layout("malformed PRE"))?
            .parse()
            .map_err(|_| Error::Layout("malformed PRE chunk_no"))?;
        let n_to_1 = parts.next().ok_or(Error::Layout("malformed PRE"))? == "N_TO_1";
        Ok(Pre {
            repo_name,
            bucket,
            inode,
            chunk_size,
            chunk_no,
            n_to_1,
        })
    }

    /// The id and chunk suffix used in object URLs: `objid[-chunk_no]`.
    pub fn object_id(&self) -> String {
        format!("{}-{}", self.inode, self.chunk_no)
    }
}

/// `OBJID` mirrors `PRE.object_id()` so a caller that reads xattrs directly
/// (without parsing the full `PRE` record) can still recover the backing
/// object id.
pub fn format_objid(pre: &Pre) -> String {
    pre.object_id()
}

pub fn parse_objid(s: &str) -> Result<String> {
    if s.is_empty() {
        return Err(Error::Layout("malformed OBJID"));
    }
    Ok(s.to_string())
}

/// `SLAVE` names the writer (an opaque `host:seed` token) currently holding
/// the N:1 write lease on a file; cleared once the `utime` finalizer runs.
pub fn format_slave(token: &str) -> String {
    token.to_string()
}

pub fn parse_slave(s: &str) -> String {
    s.to_string()
}

/// Object layout (`POST`): records, for a closed file, the layout type, chunk
/// count, per-file physical offset (Packed only), and persisted index bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub obj_type: ObjType,
    pub chunks: u64,
    pub obj_offset: u64,
    pub chunk_info_bytes: u64,
}

impl Post {
    pub fn format(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.obj_type.as_str(),
            self.chunks,
            self.obj_offset,
            self.chunk_info_bytes
        )
    }

    pub fn parse(s: &str) -> Result<Post> {
        let mut parts = s.split('/');
        let obj_type = ObjType::parse(parts.next().ok_or(Error::Layout("malformed POST"))?)?;
        let chunks: u64 = parts
            .next()
            .ok_or(Error::Layout("malformed POST"))?
            .parse()
            .map_err(|_| Error::Layout("malformed POST chunks"))?;
        let obj_offset: u64 = parts
            .next()
            .ok_or(Error::Layout("malformed POST"))?
            .parse()
            .map_err(|_| Error::Layout("malformed POST obj_offset"))?;
        let chunk_info_bytes: u64 = parts
            .next()
            .ok_or(Error::Layout("malformed POST"))?
            .parse()
            .map_err(|_| Error::Layout("malformed POST chunk_info_bytes"))?;
        Ok(Post {
            obj_type,
            chunks,
            obj_offset,
            chunk_info_bytes,
        })
    }
}

/// Parsed snapshot of a file's MarFS xattrs, as loaded at `open` time.
/// Absence of `pre`/`post` means the file is Direct.
#[derive(Debug, Clone, Default)]
pub struct XattrSnapshot {
    pub pre: Option<Pre>,
    pub post: Option<Post>,
    pub restart: bool,
    pub objid: Option<String>,
    pub slave: Option<String>,
}

impl XattrSnapshot {
    pub fn is_direct(&self) -> bool {
        self.pre.is_none() && self.post.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_round_trips() {
        let pre = Pre {
            repo_name: "repo1".to_string(),
            bucket: "marfs-repo1".to_string(),
            inode: 42,
            chunk_size: 1 << 20,
            chunk_no: 3,
            n_to_1: false,
        };
        let formatted = pre.format();
        assert_eq!(Pre::parse(&formatted).unwrap(), pre);
    }

    #[test]
    fn post_round_trips() {
        let post = Post {
            obj_type: ObjType::Multi,
            chunks: 4,
            obj_offset: 0,
            chunk_info_bytes: 4 * 24,
        };
        assert_eq!(Post::parse(&post.format()).unwrap(), post);
    }

    #[test]
    fn listxattr_filters_reserved_names() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"user.foo\0");
        buf.extend_from_slice(b"marfs_post\0");
        buf.extend_from_slice(b"user.bar\0");
        let filtered = filter_reserved(&buf);
        let joined = String::from_utf8(filtered).unwrap();
        assert!(joined.contains("user.foo"));
        assert!(joined.contains("user.bar"));
        assert!(!joined.contains("marfs_post"));
    }

    #[test]
    fn objid_round_trips_from_pre() {
        let pre = Pre {
            repo_name: "repo1".to_string(),
            bucket: "b".to_string(),
            inode: 7,
            chunk_size: 1024,
            chunk_no: 2,
            n_to_1: false,
        };
        let formatted = format_objid(&pre);
        assert_eq!(formatted, "7-2");
        assert_eq!(parse_objid(&formatted).unwrap(), "7-2");
        assert!(parse_objid("").is_err());
    }

    #[test]
    fn slave_round_trips() {
        let formatted = format_slave("10.0.0.1:42");
        assert_eq!(parse_slave(&formatted), "10.0.0.1:42");
    }

    #[test]
    fn object_id_includes_chunk_suffix() {
        let pre = Pre {
            repo_name: "repo1".to_string(),
            bucket: "b".to_string(),
            inode: 7,
            chunk_size: 1024,
            chunk_no: 2,
            n_to_1: false,
        };
        assert_eq!(pre.object_id(), "7-2");
    }
}
