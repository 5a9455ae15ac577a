//! Named shared-memory segments.
//!
//! A segment is a file in a shared directory (normally `/dev/shm`) mapped with
//! `MAP_SHARED`, so every process that attaches by name sees the same bytes.
//! The creator owns the name and unlinks the file when dropped; attachers only
//! drop their mapping.

use std::fs::{self, File, OpenOptions};
use std::path::{Component, Path, PathBuf};

use log::{debug, warn};
use memmap2::{MmapMut, MmapOptions};

use crate::{TransportError, TransportResult};

/// Directory used for segments when none is configured.
pub fn default_segment_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// A file-backed shared mapping identified by name.
#[derive(Debug)]
pub struct SharedSegment {
    name: String,
    path: PathBuf,
    map: MmapMut,
    owner: bool,
}

impl SharedSegment {
    /// Creates a new segment of `size` bytes. Fails if `name` already exists.
    pub fn create(dir: &Path, name: &str, size: usize) -> TransportResult<Self> {
        let path = segment_path(dir, name)?;
        if size == 0 {
            return Err(TransportError::EmptySegment {
                name: name.to_owned(),
            });
        }
        let create_err = |source| TransportError::SegmentCreate {
            path: path.clone(),
            size,
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(create_err)?;
        let mapped = file
            .set_len(size as u64)
            .and_then(|()| Self::map(&file, size));
        let map = match mapped {
            Ok(map) => map,
            Err(source) => {
                let _ = fs::remove_file(&path);
                return Err(create_err(source));
            }
        };
        debug!("created shared segment {name} ({size} bytes)");
        Ok(Self {
            name: name.to_owned(),
            path,
            map,
            owner: true,
        })
    }

    /// Maps an existing segment created by another party.
    /// Names that would resolve outside `dir` are refused.
    pub fn attach(dir: &Path, name: &str) -> TransportResult<Self> {
        let path = segment_path(dir, name)?;
        let attach_err = |source| TransportError::SegmentAttach {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(attach_err)?;
        let size = file.metadata().map_err(attach_err)?.len() as usize;
        if size == 0 {
            return Err(TransportError::EmptySegment {
                name: name.to_owned(),
            });
        }
        let map = Self::map(&file, size).map_err(attach_err)?;
        Ok(Self {
            name: name.to_owned(),
            path,
            map,
            owner: false,
        })
    }

    fn map(file: &File, size: usize) -> std::io::Result<MmapMut> {
        // SAFETY: the file is only resized by its creator before anyone maps it.
        unsafe { MmapOptions::new().len(size).map_mut(file) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Whether dropping this handle unlinks the segment.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Address of the first byte in this process.
    pub fn base_addr(&self) -> usize {
        self.map.as_ptr() as usize
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }
}

fn segment_path(dir: &Path, name: &str) -> TransportResult<PathBuf> {
    let mut parts = Path::new(name).components();
    let single = matches!(
        (parts.next(), parts.next()),
        (Some(Component::Normal(_)), None)
    );
    if !single || name.contains(['/', '\\']) {
        return Err(TransportError::InvalidSegmentName {
            name: name.to_owned(),
        });
    }
    Ok(dir.join(name))
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if self.owner {
            if let Err(err) = fs::remove_file(&self.path) {
                warn!("failed to unlink shared segment {}: {err}", self.name);
            } else {
                debug!("unlinked shared segment {}", self.name);
            }
        }
    }
}
