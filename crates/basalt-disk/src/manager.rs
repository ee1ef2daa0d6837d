//! Disk manager for page-level file I/O.

use basalt_common::page::{FileId, PAGE_SIZE};
use basalt_common::{BasaltError, Result};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Manages reading and writing pages in disk files.
///
/// Files are addressed by `FileId` handles returned from [`DiskManager::open_file`].
/// A path may be open at most once. Page numbers are allocated by a monotonic
/// per-file counter seeded from the file length at open; deallocation is a
/// no-op (pages are never reclaimed).
pub struct DiskManager {
    inner: Mutex<DiskInner>,
    /// Enable fsync after page and log writes.
    fsync_enabled: bool,
}

struct DiskInner {
    next_fd: u32,
    files: HashMap<FileId, OpenFile>,
    path_to_fd: HashMap<PathBuf, FileId>,
    log_file: Option<File>,
}

struct OpenFile {
    file: File,
    path: PathBuf,
    /// Next page number handed out by `allocate_page`.
    next_page_no: i32,
}

impl DiskManager {
    /// Creates a new disk manager.
    pub fn new(fsync_enabled: bool) -> Self {
        Self {
            inner: Mutex::new(DiskInner {
                next_fd: 0,
                files: HashMap::new(),
                path_to_fd: HashMap::new(),
                log_file: None,
            }),
            fsync_enabled,
        }
    }

    /// Creates an empty file at `path`.
    pub fn create_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => {
                debug!("created file {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(BasaltError::FileExists(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the file at `path`. The file must not be open.
    pub fn destroy_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let inner = self.inner.lock();
        if inner.path_to_fd.contains_key(path) {
            return Err(BasaltError::FileStillOpen(path.display().to_string()));
        }
        drop(inner);
        if !path.is_file() {
            return Err(BasaltError::FileNotFound(path.display().to_string()));
        }
        std::fs::remove_file(path)?;
        debug!("destroyed file {}", path.display());
        Ok(())
    }

    /// Opens the file at `path` and returns its handle.
    ///
    /// Reopening an already-open path fails with `FileStillOpen`.
    pub fn open_file(&self, path: impl AsRef<Path>) -> Result<FileId> {
        let path = path.as_ref().to_path_buf();
        let mut inner = self.inner.lock();
        if inner.path_to_fd.contains_key(&path) {
            return Err(BasaltError::FileStillOpen(path.display().to_string()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    BasaltError::FileNotFound(path.display().to_string())
                }
                _ => e.into(),
            })?;
        let len = file.metadata()?.len();
        let fd = FileId(inner.next_fd);
        inner.next_fd += 1;
        inner.path_to_fd.insert(path.clone(), fd);
        inner.files.insert(
            fd,
            OpenFile {
                file,
                path: path.clone(),
                next_page_no: (len / PAGE_SIZE as u64) as i32,
            },
        );
        debug!("opened file {} as {fd}", path.display());
        Ok(fd)
    }

    /// Closes an open file handle.
    pub fn close_file(&self, fd: FileId) -> Result<()> {
        let mut inner = self.inner.lock();
        let open = inner
            .files
            .remove(&fd)
            .ok_or_else(|| BasaltError::Internal(format!("{fd} is not open")))?;
        inner.path_to_fd.remove(&open.path);
        open.file.sync_all()?;
        debug!("closed file {} ({fd})", open.path.display());
        Ok(())
    }

    /// Returns the handle for an open path, if any.
    pub fn fd_for_path(&self, path: impl AsRef<Path>) -> Option<FileId> {
        self.inner.lock().path_to_fd.get(path.as_ref()).copied()
    }

    /// Reads page `page_no` of file `fd` into `buf`.
    ///
    /// A read past the current end of file zero-fills the remainder, since
    /// allocated pages are not materialized until their first write-back.
    pub fn read_page(&self, fd: FileId, page_no: i32, buf: &mut [u8]) -> Result<()> {
        let inner = self.inner.lock();
        let open = inner
            .files
            .get(&fd)
            .ok_or_else(|| BasaltError::Internal(format!("{fd} is not open")))?;
        if page_no < 0 || page_no >= open.next_page_no {
            return Err(BasaltError::PageNotExist { fd: fd.0, page_no });
        }
        let offset = page_no as u64 * PAGE_SIZE as u64;
        let n = open.file.read_at(buf, offset)?;
        buf[n..].fill(0);
        Ok(())
    }

    /// Writes `buf` to page `page_no` of file `fd`.
    pub fn write_page(&self, fd: FileId, page_no: i32, buf: &[u8]) -> Result<()> {
        let inner = self.inner.lock();
        let open = inner
            .files
            .get(&fd)
            .ok_or_else(|| BasaltError::Internal(format!("{fd} is not open")))?;
        if page_no < 0 {
            return Err(BasaltError::PageNotExist { fd: fd.0, page_no });
        }
        let offset = page_no as u64 * PAGE_SIZE as u64;
        open.file.write_all_at(buf, offset)?;
        if self.fsync_enabled {
            open.file.sync_data()?;
        }
        Ok(())
    }

    /// Allocates a new page number in file `fd`.
    pub fn allocate_page(&self, fd: FileId) -> Result<i32> {
        let mut inner = self.inner.lock();
        let open = inner
            .files
            .get_mut(&fd)
            .ok_or_else(|| BasaltError::Internal(format!("{fd} is not open")))?;
        let page_no = open.next_page_no;
        open.next_page_no += 1;
        Ok(page_no)
    }

    /// Page deallocation is not supported; the allocator never reuses numbers.
    pub fn deallocate_page(&self, _fd: FileId, _page_no: i32) {}

    /// Size in bytes of the file at `path`.
    pub fn get_file_size(&self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        match std::fs::metadata(path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BasaltError::FileNotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the number of pages allocated in file `fd`.
    pub fn num_pages(&self, fd: FileId) -> Result<i32> {
        let inner = self.inner.lock();
        let open = inner
            .files
            .get(&fd)
            .ok_or_else(|| BasaltError::Internal(format!("{fd} is not open")))?;
        Ok(open.next_page_no)
    }

    // Log stream. A single append-only file, separate from the paged files.

    /// Opens (or creates) the log file backing `read_log`/`write_log`.
    pub fn open_log(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path.as_ref())?;
        self.inner.lock().log_file = Some(file);
        Ok(())
    }

    /// Reads log bytes starting at `offset`. Returns the number of bytes
    /// read, or 0 once `offset` is at or past the end.
    pub fn read_log(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let inner = self.inner.lock();
        let file = inner
            .log_file
            .as_ref()
            .ok_or_else(|| BasaltError::Internal("log file not open".into()))?;
        let len = file.metadata()?.len();
        if offset >= len {
            return Ok(0);
        }
        let n = file.read_at(buf, offset)?;
        Ok(n)
    }

    /// Appends `buf` to the log stream.
    pub fn write_log(&self, buf: &[u8]) -> Result<()> {
        let inner = self.inner.lock();
        let file = inner
            .log_file
            .as_ref()
            .ok_or_else(|| BasaltError::Internal("log file not open".into()))?;
        let len = file.metadata()?.len();
        file.write_all_at(buf, len)?;
        if self.fsync_enabled {
            file.sync_data()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (DiskManager, tempfile::TempDir) {
        (DiskManager::new(false), tempdir().unwrap())
    }

    #[test]
    fn test_create_and_destroy_file() {
        let (dm, dir) = setup();
        let path = dir.path().join("t.dat");

        dm.create_file(&path).unwrap();
        assert!(path.is_file());
        assert!(matches!(
            dm.create_file(&path),
            Err(BasaltError::FileExists(_))
        ));

        dm.destroy_file(&path).unwrap();
        assert!(!path.exists());
        assert!(matches!(
            dm.destroy_file(&path),
            Err(BasaltError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_double_open_rejected() {
        let (dm, dir) = setup();
        let path = dir.path().join("t.dat");
        dm.create_file(&path).unwrap();

        let fd = dm.open_file(&path).unwrap();
        assert!(matches!(
            dm.open_file(&path),
            Err(BasaltError::FileStillOpen(_))
        ));

        dm.close_file(fd).unwrap();
        let fd2 = dm.open_file(&path).unwrap();
        assert_ne!(fd, fd2);
    }

    #[test]
    fn test_destroy_open_file_rejected() {
        let (dm, dir) = setup();
        let path = dir.path().join("t.dat");
        dm.create_file(&path).unwrap();
        let fd = dm.open_file(&path).unwrap();

        assert!(matches!(
            dm.destroy_file(&path),
            Err(BasaltError::FileStillOpen(_))
        ));
        dm.close_file(fd).unwrap();
        dm.destroy_file(&path).unwrap();
    }

    #[test]
    fn test_page_roundtrip() {
        let (dm, dir) = setup();
        let path = dir.path().join("t.dat");
        dm.create_file(&path).unwrap();
        let fd = dm.open_file(&path).unwrap();

        let p0 = dm.allocate_page(fd).unwrap();
        let p1 = dm.allocate_page(fd).unwrap();
        assert_eq!(p0, 0);
        assert_eq!(p1, 1);

        let mut page = [0u8; PAGE_SIZE];
        page[0] = 0xAB;
        page[PAGE_SIZE - 1] = 0xCD;
        dm.write_page(fd, p1, &page).unwrap();

        let mut out = [0u8; PAGE_SIZE];
        dm.read_page(fd, p1, &mut out).unwrap();
        assert_eq!(out[0], 0xAB);
        assert_eq!(out[PAGE_SIZE - 1], 0xCD);
    }

    #[test]
    fn test_read_unwritten_page_zero_filled() {
        let (dm, dir) = setup();
        let path = dir.path().join("t.dat");
        dm.create_file(&path).unwrap();
        let fd = dm.open_file(&path).unwrap();

        let p = dm.allocate_page(fd).unwrap();
        let mut out = [0xFFu8; PAGE_SIZE];
        dm.read_page(fd, p, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_unallocated_page_rejected() {
        let (dm, dir) = setup();
        let path = dir.path().join("t.dat");
        dm.create_file(&path).unwrap();
        let fd = dm.open_file(&path).unwrap();

        let mut out = [0u8; PAGE_SIZE];
        assert!(matches!(
            dm.read_page(fd, 0, &mut out),
            Err(BasaltError::PageNotExist { .. })
        ));
    }

    #[test]
    fn test_allocator_seeded_from_file_length() {
        let (dm, dir) = setup();
        let path = dir.path().join("t.dat");
        dm.create_file(&path).unwrap();
        let fd = dm.open_file(&path).unwrap();
        for _ in 0..3 {
            let p = dm.allocate_page(fd).unwrap();
            dm.write_page(fd, p, &[0u8; PAGE_SIZE]).unwrap();
        }
        dm.close_file(fd).unwrap();

        let fd = dm.open_file(&path).unwrap();
        assert_eq!(dm.num_pages(fd).unwrap(), 3);
        assert_eq!(dm.allocate_page(fd).unwrap(), 3);
    }

    #[test]
    fn test_log_stream_append_and_read() {
        let (dm, dir) = setup();
        dm.open_log(dir.path().join("db.log")).unwrap();

        dm.write_log(b"hello ").unwrap();
        dm.write_log(b"world").unwrap();

        let mut buf = [0u8; 32];
        let n = dm.read_log(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"hello world");

        let n = dm.read_log(&mut buf, 6).unwrap();
        assert_eq!(&buf[..n], b"world");

        assert_eq!(dm.read_log(&mut buf, 100).unwrap(), 0);
    }
}
