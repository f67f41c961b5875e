//! Trash Manager — atomically moves an MDFS file aside so a new file can
//! take its name while its backing object(s) remain reachable for later
//! reclamation.

use std::path::{Path, PathBuf};

use log::info;

use crate::marfs::error::Result;
use crate::marfs::xattr::Pre;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrashReason {
    Truncate,
    Unlink,
}

/// Trash directory rooted under a namespace's MDFS tree. Kept separate from
/// `Config` since not every namespace necessarily enables trash.
pub struct Trash {
    root: PathBuf,
}

impl Trash {
    pub fn new(root: PathBuf) -> Trash {
        Trash { root }
    }

    /// Name encodes the original path and the object id being retired, so a
    /// reaper can later walk trash entries back to their objects.
    fn trash_path(&self, original: &Path, pre: &Pre) -> PathBuf {
        let mangled = original.to_string_lossy().replace('/', "_");
        self.root.join(format!("{mangled}.{}", pre.object_id()))
    }

    /// Move `mdfs_path` into trash, preserving its xattrs (a rename within
    /// the same filesystem carries xattrs along for free). For
    /// `TrashReason::Truncate` the caller is responsible for leaving a fresh
    /// empty MDFS file at `mdfs_path` afterward; `Unlink` leaves nothing.
    pub fn stash(&self, mdfs_path: &Path, pre: &Pre, reason: TrashReason) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        let dest = self.trash_path(mdfs_path, pre);
        std::fs::rename(mdfs_path, &dest)?;
        info!(
            "trashed {} -> {} ({:?})",
            mdfs_path.display(),
            dest.display(),
            reason
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pre() -> Pre {
        Pre {
            repo_name: "repo1".to_string(),
            bucket: "b".to_string(),
            inode: 99,
            chunk_size: 1024,
            chunk_no: 0,
            n_to_1: false,
        }
    }

    #[test]
    fn stash_moves_file_into_trash_root() {
        let dir = tempfile::tempdir().unwrap();
        let trash_root = dir.path().join("trash");
        let original = dir.path().join("file.txt");
        std::fs::write(&original, b"payload").unwrap();

        let trash = Trash::new(trash_root.clone());
        trash.stash(&original, &sample_pre(), TrashReason::Unlink).unwrap();

        assert!(!original.exists());
        let entries: Vec<_> = std::fs::read_dir(&trash_root).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn trash_path_encodes_object_id() {
        let trash = Trash::new(PathBuf::from("/mdfs/trash"));
        let path = trash.trash_path(Path::new("/mdfs/ns/a/b.txt"), &sample_pre());
        assert!(path.to_string_lossy().ends_with("99-0"));
    }
}
