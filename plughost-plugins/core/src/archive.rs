// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Plugin package archives
//!
//! A package is a ZIP file with `manifest.json` at its root. The archive is
//! indexed once on open; file contents are decompressed on demand.

use crate::error::{PluginError, PluginResult};
use crate::manifest::PluginManifest;
use crate::MANIFEST_FILENAME;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// One entry of the archive's central directory
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Name as stored in the archive
    pub name: String,
    /// Uncompressed size in bytes
    pub size: u64,
    pub is_dir: bool,
    pub is_symlink: bool,
    /// Sanitized relative path, `None` if the name escapes the archive root
    pub enclosed: Option<PathBuf>,
}

impl ArchiveEntry {
    /// Lower-cased extension of the entry, if any
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }
}

/// An opened plugin package
pub struct PluginArchive {
    bytes: Vec<u8>,
    entries: Vec<ArchiveEntry>,
}

impl PluginArchive {
    /// Open and index a ZIP package held in memory
    pub fn from_bytes(bytes: Vec<u8>) -> PluginResult<Self> {
        let entries = Self::index(&bytes)?;
        Ok(Self { bytes, entries })
    }

    fn index(bytes: &[u8]) -> PluginResult<Vec<ArchiveEntry>> {
        let mut zip = zip::ZipArchive::new(Cursor::new(bytes))?;

        let mut entries = Vec::with_capacity(zip.len());
        for i in 0..zip.len() {
            let file = zip.by_index(i)?;
            let is_symlink = file
                .unix_mode()
                .map(|mode| mode & S_IFMT == S_IFLNK)
                .unwrap_or(false);
            entries.push(ArchiveEntry {
                name: file.name().to_string(),
                size: file.size(),
                is_dir: file.is_dir(),
                is_symlink,
                enclosed: file.enclosed_name().map(|p| p.to_path_buf()),
            });
        }

        Ok(entries)
    }

    /// Read a package from disk
    pub fn from_file(path: &Path) -> PluginResult<Self> {
        Self::from_bytes(std::fs::read(path)?)
    }

    /// Package the regular files under `dir` into ZIP bytes. Blocking.
    pub fn pack_dir(dir: &Path) -> PluginResult<Vec<u8>> {
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let mut files = 0;

        for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(dir) else {
                continue;
            };
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            writer.start_file(name, options)?;
            let mut source = std::fs::File::open(entry.path())?;
            std::io::copy(&mut source, &mut writer)?;
            files += 1;
        }

        let bytes = writer.finish()?.into_inner();
        debug!(dir = %dir.display(), files, bytes = bytes.len(), "Packed plugin directory");
        Ok(bytes)
    }

    /// Compressed archive size in bytes
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Whether a regular file exists at `path` (leading `./` ignored)
    pub fn contains(&self, path: &str) -> bool {
        self.find(path).is_some()
    }

    fn find(&self, path: &str) -> Option<&ArchiveEntry> {
        let wanted = normalize(path);
        self.entries
            .iter()
            .find(|e| !e.is_dir && normalize(&e.name) == wanted)
    }

    /// Decompress a single file
    pub fn read_file(&self, path: &str) -> PluginResult<Vec<u8>> {
        let entry = self
            .find(path)
            .ok_or_else(|| PluginError::InvalidArchive(format!("No such entry: {}", path)))?;

        let mut zip = zip::ZipArchive::new(Cursor::new(self.bytes.as_slice()))?;
        let mut file = zip.by_name(&entry.name)?;
        let mut buf = Vec::with_capacity(entry.size.min(16 * 1024 * 1024) as usize);
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Read and parse the root `manifest.json`
    pub fn manifest(&self) -> PluginResult<PluginManifest> {
        if !self.contains(MANIFEST_FILENAME) {
            return Err(PluginError::ManifestNotFound(MANIFEST_FILENAME.to_string()));
        }
        let bytes = self.read_file(MANIFEST_FILENAME)?;
        PluginManifest::parse(&bytes)
    }

    /// Extract every regular file under `dest`, returning the file count.
    ///
    /// Entries escaping `dest` and symlinks are skipped. Blocking.
    pub fn extract_to(&self, dest: &Path) -> PluginResult<usize> {
        std::fs::create_dir_all(dest)?;
        let dest = dest.canonicalize()?;

        let mut zip = zip::ZipArchive::new(Cursor::new(self.bytes.as_slice()))?;
        let mut written = 0;

        for i in 0..zip.len() {
            let mut file = zip.by_index(i)?;
            let Some(rel_path) = file.enclosed_name().map(|p| p.to_path_buf()) else {
                debug!(entry = file.name(), "Skipping entry outside archive root");
                continue;
            };

            if let Some(mode) = file.unix_mode() {
                if mode & S_IFMT == S_IFLNK {
                    debug!(entry = file.name(), "Skipping symlink entry");
                    continue;
                }
            }

            let outpath = dest.join(&rel_path);
            if !outpath.starts_with(&dest) {
                continue;
            }

            if file.is_dir() {
                std::fs::create_dir_all(&outpath)?;
            } else {
                if let Some(parent) = outpath.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut outfile = std::fs::File::create(&outpath)?;
                std::io::copy(&mut file, &mut outfile)?;
                written += 1;
            }
        }

        Ok(written)
    }
}

fn normalize(path: &str) -> &str {
    let mut path = path;
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    path.trim_start_matches('/')
}

impl std::fmt::Debug for PluginArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginArchive")
            .field("size", &self.bytes.len())
            .field("entries", &self.entries.len())
            .finish()
    }
}
