//! Disk manager for page-level file I/O.

use marten_common::page::{PageId, PAGE_SIZE};
use marten_common::{MartenError, Result, StorageConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Manages reading and writing pages to named data files.
///
/// Files are created and opened by name inside the data directory and
/// addressed afterwards through `u32` handles; a `PageId` combines the
/// handle with a page number. Page numbers are dense from 0, and page 0 of
/// every file is reserved for that file's header record.
pub struct DiskManager {
    /// Base directory for data files.
    data_dir: PathBuf,
    /// Enable fsync after writes.
    fsync_enabled: bool,
    /// Open file state.
    inner: Mutex<DiskManagerInner>,
}

struct DiskManagerInner {
    /// File name to handle mapping.
    by_name: HashMap<String, u32>,
    /// Open file handles.
    files: HashMap<u32, FileHandle>,
    /// Next handle to assign.
    next_file_id: u32,
}

/// Handle for an open data file.
struct FileHandle {
    /// The file handle.
    file: File,
    /// Name the file was opened under.
    name: String,
    /// Number of pages in the file.
    num_pages: u32,
}

impl DiskManager {
    /// Creates a new disk manager rooted at the configured data directory.
    pub fn new(config: &StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(Self {
            data_dir: config.data_dir.clone(),
            fsync_enabled: config.fsync_enabled,
            inner: Mutex::new(DiskManagerInner {
                by_name: HashMap::new(),
                files: HashMap::new(),
                next_file_id: 0,
            }),
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Generates the on-disk path for a file name.
    fn path_for(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    /// Returns true if a file with the given name exists.
    pub fn exists(&self, name: &str) -> bool {
        self.inner.lock().by_name.contains_key(name) || self.path_for(name).exists()
    }

    /// Creates a new empty file and returns its handle.
    ///
    /// Fails with `FileAlreadyExists` if the name is taken.
    pub fn create(&self, name: &str) -> Result<u32> {
        if self.exists(name) {
            return Err(MartenError::FileAlreadyExists(name.to_string()));
        }

        let path = self.path_for(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        Ok(self.register(name, file, 0))
    }

    /// Opens an existing file and returns its handle.
    ///
    /// Re-opening a file that is already open returns the existing handle.
    /// Fails with `FileNotFound` if no file with the name exists.
    pub fn open(&self, name: &str) -> Result<u32> {
        if let Some(&file_id) = self.inner.lock().by_name.get(name) {
            return Ok(file_id);
        }

        let path = self.path_for(name);
        if !path.exists() {
            return Err(MartenError::FileNotFound(name.to_string()));
        }

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;

        Ok(self.register(name, file, num_pages))
    }

    fn register(&self, name: &str, file: File, num_pages: u32) -> u32 {
        let mut inner = self.inner.lock();
        let file_id = inner.next_file_id;
        inner.next_file_id += 1;
        inner.by_name.insert(name.to_string(), file_id);
        inner.files.insert(
            file_id,
            FileHandle {
                file,
                name: name.to_string(),
                num_pages,
            },
        );
        file_id
    }

    /// Reads a page from disk.
    pub fn read_page(&self, page_id: PageId) -> Result<[u8; PAGE_SIZE]> {
        let mut inner = self.inner.lock();
        let handle = inner
            .files
            .get_mut(&page_id.file_id)
            .ok_or(MartenError::FileNotOpen(page_id.file_id))?;

        if page_id.page_num >= handle.num_pages {
            return Err(MartenError::PageNotFound { page_id });
        }

        let offset = (page_id.page_num as u64) * (PAGE_SIZE as u64);
        handle.file.seek(SeekFrom::Start(offset))?;

        let mut buffer = [0u8; PAGE_SIZE];
        handle.file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// Writes a page to disk.
    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut inner = self.inner.lock();
        let handle = inner
            .files
            .get_mut(&page_id.file_id)
            .ok_or(MartenError::FileNotOpen(page_id.file_id))?;

        let offset = (page_id.page_num as u64) * (PAGE_SIZE as u64);
        handle.file.seek(SeekFrom::Start(offset))?;
        handle.file.write_all(data)?;

        if self.fsync_enabled {
            handle.file.sync_all()?;
        }

        // Update page count if the file was extended
        if page_id.page_num >= handle.num_pages {
            handle.num_pages = page_id.page_num + 1;
        }

        Ok(())
    }

    /// Allocates a new zero-filled page at the end of the file.
    ///
    /// Returns the PageId of the newly allocated page.
    pub fn allocate_page(&self, file_id: u32) -> Result<PageId> {
        let mut inner = self.inner.lock();
        let handle = inner
            .files
            .get_mut(&file_id)
            .ok_or(MartenError::FileNotOpen(file_id))?;

        let page_num = handle.num_pages;
        let page_id = PageId::new(file_id, page_num);

        let offset = (page_num as u64) * (PAGE_SIZE as u64);
        handle.file.seek(SeekFrom::Start(offset))?;
        handle.file.write_all(&[0u8; PAGE_SIZE])?;

        if self.fsync_enabled {
            handle.file.sync_all()?;
        }

        handle.num_pages = page_num + 1;

        Ok(page_id)
    }

    /// Returns the number of pages in a file.
    pub fn num_pages(&self, file_id: u32) -> Result<u32> {
        let inner = self.inner.lock();
        let handle = inner
            .files
            .get(&file_id)
            .ok_or(MartenError::FileNotOpen(file_id))?;
        Ok(handle.num_pages)
    }

    /// Flushes a file's pending writes to stable storage.
    pub fn flush_file(&self, file_id: u32) -> Result<()> {
        let inner = self.inner.lock();
        let handle = inner
            .files
            .get(&file_id)
            .ok_or(MartenError::FileNotOpen(file_id))?;
        handle.file.sync_all()?;
        Ok(())
    }

    /// Closes a specific file.
    pub fn close_file(&self, file_id: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.files.remove(&file_id) {
            inner.by_name.remove(&handle.name);
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Closes all open files.
    pub fn close_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.by_name.clear();
        for (_, handle) in inner.files.drain() {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Deletes a data file by name, closing it first if open.
    pub fn delete_file(&self, name: &str) -> Result<()> {
        let file_id = self.inner.lock().by_name.get(name).copied();
        if let Some(file_id) = file_id {
            self.close_file(file_id)?;
        }
        let path = self.path_for(name);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.close_all();
    }
}
