//! Directory-tree copy and removal between the plaintext and encrypted views.
//!
//! Traversals build a flat [`FileIndex`] once (entries with parent links,
//! parents always before children) and then walk it forwards to create or
//! backwards to delete.

use crate::config::MigrationCfg;
use crate::error::{EfsError, EfsResult};
use log::debug;
use std::ffi::{CString, OsString};
use std::fs::{self, DirBuilder, File, Metadata, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{
    lchown, symlink, DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const SECURITY_LABEL_XATTR: &str = "security.selinux";
const COPY_CHUNK: usize = 64 * 1024;

/// Recursive copy/remove service used by the lifecycle engine.
pub trait DataMigration {
    /// Copy everything below `src` into the existing directory `dst`,
    /// preserving mode, ownership, security label and timestamps. Entries
    /// already present in `dst` are never written through.
    fn copy_dir_content(&self, src: &Path, dst: &Path) -> EfsResult<()>;

    /// Delete everything below `dir`, keeping `dir` itself.
    fn remove_dir_content(&self, dir: &Path) -> EfsResult<()>;

    /// Delete `dir` and everything below it.
    fn remove_dir(&self, dir: &Path) -> EfsResult<()> {
        self.remove_dir_content(dir)?;
        fs::remove_dir(dir)?;
        Ok(())
    }

    /// Byte counter advanced while copying. Implementations without one
    /// report a counter that stays at zero.
    fn progress(&self) -> CopyProgress {
        CopyProgress::default()
    }
}

/// Shared count of file bytes copied so far.
#[derive(Debug, Clone, Default)]
pub struct CopyProgress(Arc<AtomicU64>);

impl CopyProgress {
    pub fn bytes(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }

    fn add(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Dir,
    File,
    Symlink,
}

#[derive(Debug)]
struct IndexEntry {
    parent: Option<usize>,
    name: OsString,
    kind: EntryKind,
    meta: Metadata,
}

/// Every entry below a root directory, parents before children.
#[derive(Debug)]
pub struct FileIndex {
    root: PathBuf,
    entries: Vec<IndexEntry>,
}

impl FileIndex {
    pub fn scan(root: &Path) -> EfsResult<Self> {
        let mut index = Self {
            root: root.to_path_buf(),
            entries: Vec::new(),
        };
        index.push_children(None)?;

        let mut cursor = 0;
        while cursor < index.entries.len() {
            if index.entries[cursor].kind == EntryKind::Dir {
                index.push_children(Some(cursor))?;
            }
            cursor += 1;
        }
        Ok(index)
    }

    fn push_children(&mut self, parent: Option<usize>) -> EfsResult<()> {
        let dir = match parent {
            Some(idx) => self.root.join(self.relative(idx)),
            None => self.root.clone(),
        };
        let mut children = Vec::new();
        for item in fs::read_dir(&dir)? {
            let item = item?;
            let meta = fs::symlink_metadata(item.path())?;
            let file_type = meta.file_type();
            let kind = if file_type.is_symlink() {
                EntryKind::Symlink
            } else if file_type.is_dir() {
                EntryKind::Dir
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                return Err(EfsError::Io(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("unsupported file type at {}", item.path().display()),
                )));
            };
            children.push(IndexEntry {
                parent,
                name: item.file_name(),
                kind,
                meta,
            });
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        self.entries.extend(children);
        Ok(())
    }

    fn relative(&self, idx: usize) -> PathBuf {
        let mut names = Vec::new();
        let mut cursor = Some(idx);
        while let Some(current) = cursor {
            names.push(&self.entries[current].name);
            cursor = self.entries[current].parent;
        }
        names.iter().rev().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apparent size of regular files and symlinks.
    pub fn total_bytes(&self) -> u64 {
        self.entries
            .iter()
            .filter(|entry| entry.kind != EntryKind::Dir)
            .map(|entry| entry.meta.len())
            .sum()
    }
}

/// Metadata-preserving implementation of [`DataMigration`] on the local
/// filesystem.
#[derive(Debug, Clone)]
pub struct TreeMigrator {
    progress: CopyProgress,
    preserve_label: bool,
}

impl Default for TreeMigrator {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TreeMigrator {
    pub fn new(preserve_label: bool) -> Self {
        Self {
            progress: CopyProgress::default(),
            preserve_label,
        }
    }

    pub fn from_config(cfg: &MigrationCfg) -> Self {
        Self::new(cfg.preserve_security_label)
    }

    fn copy_file(&self, from: &Path, to: &Path, mode: u32) -> EfsResult<()> {
        let mut reader = File::open(from)?;
        let mut writer = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .custom_flags(libc::O_NOFOLLOW)
            .open(to)?;
        let mut buf = vec![0u8; COPY_CHUNK];
        loop {
            let read = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            writer.write_all(&buf[..read])?;
            self.progress.add(read as u64);
        }
        writer.sync_all()?;
        Ok(())
    }

    fn apply_attributes(
        &self,
        from: &Path,
        to: &Path,
        meta: &Metadata,
        kind: EntryKind,
    ) -> EfsResult<()> {
        lchown(to, Some(meta.uid()), Some(meta.gid()))?;
        if kind != EntryKind::Symlink {
            fs::set_permissions(to, fs::Permissions::from_mode(meta.mode() & 0o7777))?;
        }
        if self.preserve_label {
            copy_security_label(from, to)?;
        }
        Ok(())
    }
}

impl DataMigration for TreeMigrator {
    fn progress(&self) -> CopyProgress {
        self.progress.clone()
    }

    fn copy_dir_content(&self, src: &Path, dst: &Path) -> EfsResult<()> {
        let index = FileIndex::scan(src)?;
        debug!(
            "copying {} entries ({} bytes) from {} to {}",
            index.len(),
            index.total_bytes(),
            src.display(),
            dst.display()
        );

        for (idx, entry) in index.entries.iter().enumerate() {
            let relative = index.relative(idx);
            let from = src.join(&relative);
            let to = dst.join(&relative);
            refuse_existing(&to)?;
            match entry.kind {
                EntryKind::Dir => DirBuilder::new().mode(0o700).create(&to)?,
                EntryKind::File => self.copy_file(&from, &to, 0o600)?,
                EntryKind::Symlink => {
                    let link = fs::read_link(&from)?;
                    symlink(link, &to)?;
                }
            }
            if entry.kind != EntryKind::Dir {
                self.apply_attributes(&from, &to, &entry.meta, entry.kind)?;
                set_times(&to, &entry.meta)?;
            }
        }

        // Directories keep 0700 until their children exist; restricted
        // modes and timestamps are applied deepest first.
        for (idx, entry) in index.entries.iter().enumerate().rev() {
            if entry.kind == EntryKind::Dir {
                let relative = index.relative(idx);
                let to = dst.join(&relative);
                self.apply_attributes(&src.join(&relative), &to, &entry.meta, entry.kind)?;
                set_times(&to, &entry.meta)?;
            }
        }
        Ok(())
    }

    fn remove_dir_content(&self, dir: &Path) -> EfsResult<()> {
        let index = FileIndex::scan(dir)?;
        for (idx, entry) in index.entries.iter().enumerate() {
            if entry.kind != EntryKind::Dir {
                fs::remove_file(dir.join(index.relative(idx)))?;
            }
        }
        for (idx, entry) in index.entries.iter().enumerate().rev() {
            if entry.kind == EntryKind::Dir {
                fs::remove_dir(dir.join(index.relative(idx)))?;
            }
        }
        debug!("removed {} entries below {}", index.len(), dir.display());
        Ok(())
    }
}

/// Apparent size in bytes of everything below `dir`.
pub fn dir_size(dir: &Path) -> EfsResult<u64> {
    Ok(FileIndex::scan(dir)?.total_bytes())
}

/// Free bytes on the filesystem holding `path`.
pub fn available_space(path: &Path) -> EfsResult<u64> {
    let c_path = c_path(path)?;
    let mut stat = std::mem::MaybeUninit::<libc::statvfs>::uninit();
    // SAFETY: `c_path` is NUL terminated and `stat` is a valid out pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    // SAFETY: statvfs succeeded and initialised the struct.
    let stat = unsafe { stat.assume_init() };
    Ok((stat.f_bsize as u64).saturating_mul(stat.f_bfree as u64))
}

/// Fail with [`EfsError::InsufficientSpace`] unless the filesystem holding
/// `dir` can take a second copy of its content.
pub fn check_space(dir: &Path) -> EfsResult<()> {
    let required = dir_size(dir)?;
    let available = available_space(dir)?;
    if required >= available {
        return Err(EfsError::InsufficientSpace {
            path: dir.to_path_buf(),
            required,
            available,
        });
    }
    Ok(())
}

// Never write through an entry that is already present in the destination.
fn refuse_existing(path: &Path) -> EfsResult<()> {
    match fs::symlink_metadata(path) {
        Ok(_) => Err(EfsError::AlreadyExists(path.to_path_buf())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn c_path(path: &Path) -> EfsResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        EfsError::Validation(format!("path contains a NUL byte: {}", path.display()))
    })
}

fn set_times(path: &Path, meta: &Metadata) -> EfsResult<()> {
    let c_path = c_path(path)?;
    let times = [
        libc::timespec {
            tv_sec: meta.atime() as libc::time_t,
            tv_nsec: meta.atime_nsec() as _,
        },
        libc::timespec {
            tv_sec: meta.mtime() as libc::time_t,
            tv_nsec: meta.mtime_nsec() as _,
        },
    ];
    // SAFETY: `c_path` is NUL terminated and `times` holds two timespecs.
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

fn label_unsupported(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENODATA) | Some(libc::ENOTSUP) | Some(libc::EOPNOTSUPP)
    )
}

/// Read the security label of `path` without following symlinks.
pub fn security_label(path: &Path) -> EfsResult<Option<Vec<u8>>> {
    let c_path = c_path(path)?;
    let name = c_path_str(SECURITY_LABEL_XATTR);
    // SAFETY: a NULL buffer of size 0 asks only for the value length.
    let len = unsafe {
        libc::lgetxattr(c_path.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0)
    };
    if len < 0 {
        let err = io::Error::last_os_error();
        if label_unsupported(&err) {
            return Ok(None);
        }
        return Err(err.into());
    }

    let mut value = vec![0u8; len as usize];
    // SAFETY: `value` has room for `value.len()` bytes.
    let read = unsafe {
        libc::lgetxattr(
            c_path.as_ptr(),
            name.as_ptr(),
            value.as_mut_ptr().cast(),
            value.len(),
        )
    };
    if read < 0 {
        let err = io::Error::last_os_error();
        if label_unsupported(&err) {
            return Ok(None);
        }
        return Err(err.into());
    }
    value.truncate(read as usize);
    Ok(Some(value))
}

fn copy_security_label(from: &Path, to: &Path) -> EfsResult<()> {
    let Some(label) = security_label(from)? else {
        return Ok(());
    };
    let c_path = c_path(to)?;
    let name = c_path_str(SECURITY_LABEL_XATTR);
    // SAFETY: pointers reference live, correctly sized buffers.
    let rc = unsafe {
        libc::lsetxattr(
            c_path.as_ptr(),
            name.as_ptr(),
            label.as_ptr().cast(),
            label.len(),
            0,
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if label_unsupported(&err) {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

fn c_path_str(name: &'static str) -> CString {
    CString::new(name).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn populate(root: &Path) {
        fs::create_dir_all(root.join("nested/deeper")).unwrap();
        fs::write(root.join("top.txt"), b"hello").unwrap();
        fs::write(root.join("nested/mid.bin"), vec![7u8; 2048]).unwrap();
        fs::write(root.join("nested/deeper/leaf"), b"leaf").unwrap();
        symlink("top.txt", root.join("link")).unwrap();
        fs::set_permissions(root.join("top.txt"), fs::Permissions::from_mode(0o640)).unwrap();
        fs::set_permissions(root.join("nested"), fs::Permissions::from_mode(0o751)).unwrap();
    }

    #[test]
    fn index_lists_parents_before_children() {
        let dir = tempdir().unwrap();
        populate(dir.path());
        let index = FileIndex::scan(dir.path()).unwrap();
        assert_eq!(index.len(), 6);

        for (idx, entry) in index.entries.iter().enumerate() {
            if let Some(parent) = entry.parent {
                assert!(parent < idx);
                assert_eq!(index.entries[parent].kind, EntryKind::Dir);
            }
        }
        assert_eq!(index.total_bytes(), 5 + 2048 + 4 + "top.txt".len() as u64);
    }

    #[test]
    fn copy_preserves_content_mode_and_mtime() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        populate(src.path());

        let migrator = TreeMigrator::new(false);
        migrator.copy_dir_content(src.path(), dst.path()).unwrap();

        assert_eq!(fs::read(dst.path().join("top.txt")).unwrap(), b"hello");
        assert_eq!(
            fs::read(dst.path().join("nested/deeper/leaf")).unwrap(),
            b"leaf"
        );
        assert_eq!(
            fs::read_link(dst.path().join("link")).unwrap(),
            PathBuf::from("top.txt")
        );

        for rel in ["top.txt", "nested", "nested/mid.bin"] {
            let a = fs::symlink_metadata(src.path().join(rel)).unwrap();
            let b = fs::symlink_metadata(dst.path().join(rel)).unwrap();
            assert_eq!(a.mode(), b.mode(), "{rel}");
            assert_eq!(a.mtime(), b.mtime(), "{rel}");
            assert_eq!(a.uid(), b.uid(), "{rel}");
        }
        assert_eq!(migrator.progress().bytes(), 5 + 2048 + 4);
    }

    #[test]
    fn copy_refuses_symlinked_directory_in_destination() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let outside = tempdir().unwrap();
        fs::create_dir(src.path().join("photos")).unwrap();
        fs::write(src.path().join("photos/cat.jpg"), b"decrypted").unwrap();
        symlink(outside.path(), dst.path().join("photos")).unwrap();

        let err = TreeMigrator::new(false)
            .copy_dir_content(src.path(), dst.path())
            .unwrap_err();
        assert!(matches!(err, EfsError::AlreadyExists(_)));
        assert!(!outside.path().join("cat.jpg").exists());
    }

    #[test]
    fn copy_refuses_symlinked_file_in_destination() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let victim = outside.path().join("victim");
        fs::write(&victim, b"important").unwrap();
        fs::write(src.path().join("notes.txt"), b"decrypted").unwrap();
        symlink(&victim, dst.path().join("notes.txt")).unwrap();

        let err = TreeMigrator::new(false)
            .copy_dir_content(src.path(), dst.path())
            .unwrap_err();
        assert!(matches!(err, EfsError::AlreadyExists(_)));
        assert_eq!(fs::read(&victim).unwrap(), b"important");
    }

    #[test]
    fn file_copy_does_not_follow_a_late_symlink() {
        let dir = tempdir().unwrap();
        let victim = dir.path().join("victim");
        fs::write(&victim, b"important").unwrap();
        fs::write(dir.path().join("from"), b"decrypted").unwrap();
        symlink(&victim, dir.path().join("to")).unwrap();

        assert!(TreeMigrator::new(false)
            .copy_file(&dir.path().join("from"), &dir.path().join("to"), 0o600)
            .is_err());
        assert_eq!(fs::read(&victim).unwrap(), b"important");
    }

    #[test]
    fn remove_dir_content_keeps_root() {
        let dir = tempdir().unwrap();
        populate(dir.path());
        let migrator = TreeMigrator::default();
        migrator.remove_dir_content(dir.path()).unwrap();
        assert!(dir.path().is_dir());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn remove_dir_deletes_root() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("unit");
        fs::create_dir(&target).unwrap();
        populate(&target);
        TreeMigrator::default().remove_dir(&target).unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn dir_size_and_space_check() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("f"), vec![0u8; 1000]).unwrap();
        assert_eq!(dir_size(dir.path()).unwrap(), 1000);
        check_space(dir.path()).unwrap();
        assert!(available_space(dir.path()).unwrap() > 1000);
    }

    #[test]
    fn progress_can_be_reset() {
        let progress = CopyProgress::default();
        progress.add(10);
        let shared = progress.clone();
        assert_eq!(shared.bytes(), 10);
        shared.reset();
        assert_eq!(progress.bytes(), 0);
    }
}
