// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::exchange::wire::hash_bytes;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DiskType {
    Local,
    S3,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WriteMode {
    Rewrite,
    Append,
}

/// Metadata document an object-store disk keeps in place of file contents.
/// The bytes themselves live in the shared object namespace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub object_id: String,
    pub size: u64,
}

/// File handle that must be finalized before the contents are durable.
pub trait DiskFile: Write {
    fn finalize(&mut self) -> std::io::Result<()>;
    fn sync(&mut self) -> std::io::Result<()>;
}

struct LocalFile {
    file: fs::File,
}

impl Write for LocalFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl DiskFile for LocalFile {
    fn finalize(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_all()
    }
}

struct S3File {
    disk: Arc<Disk>,
    relative_path: PathBuf,
    buf: Vec<u8>,
    append: bool,
    finalized: bool,
}

impl Write for S3File {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl DiskFile for S3File {
    fn finalize(&mut self) -> std::io::Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        let mut contents = Vec::new();
        if self.append {
            if let Ok(existing) = self.disk.read_all(&self.relative_path) {
                contents = existing;
            }
        }
        contents.extend_from_slice(&self.buf);
        self.disk.put_object(&self.relative_path, &contents)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.finalize()
    }
}

static OBJECT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Lexical path normalization: resolves `.` and `..` without touching the
/// filesystem, so escape attempts are visible before anything exists.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Single disk; either plain local storage or an object-store disk whose
/// files are metadata documents pointing into a shared object namespace.
#[derive(Debug)]
pub struct Disk {
    pub name: String,
    kind: DiskType,
    root: PathBuf,
    objects_root: Option<PathBuf>,
    capacity_bytes: Option<u64>,
}

impl Disk {
    pub fn local(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind: DiskType::Local,
            root: root.into(),
            objects_root: None,
            capacity_bytes: None,
        }
    }

    pub fn s3(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        objects_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: DiskType::S3,
            root: root.into(),
            objects_root: Some(objects_root.into()),
            capacity_bytes: None,
        }
    }

    pub fn with_capacity(mut self, capacity_bytes: u64) -> Self {
        self.capacity_bytes = Some(capacity_bytes);
        self
    }

    pub fn disk_type(&self) -> DiskType {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn absolute_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    pub fn available_space(&self) -> u64 {
        self.capacity_bytes.unwrap_or(u64::MAX)
    }

    pub fn exists(&self, relative: impl AsRef<Path>) -> bool {
        self.absolute_path(relative).exists()
    }

    pub fn create_directories(&self, relative: impl AsRef<Path>) -> std::io::Result<()> {
        fs::create_dir_all(self.absolute_path(relative))
    }

    pub fn remove_recursive(&self, relative: impl AsRef<Path>) -> std::io::Result<()> {
        let path = self.absolute_path(relative);
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    pub fn list_files(&self, relative: impl AsRef<Path>) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.absolute_path(relative))? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    pub fn file_size(&self, relative: impl AsRef<Path>) -> std::io::Result<u64> {
        match self.kind {
            DiskType::Local => Ok(fs::metadata(self.absolute_path(relative))?.len()),
            DiskType::S3 => {
                let metadata = self.read_object_metadata(relative.as_ref())?;
                Ok(metadata.size)
            }
        }
    }

    pub fn read_file(&self, relative: impl AsRef<Path>) -> std::io::Result<Box<dyn Read>> {
        match self.kind {
            DiskType::Local => Ok(Box::new(fs::File::open(self.absolute_path(relative))?)),
            DiskType::S3 => {
                let metadata = self.read_object_metadata(relative.as_ref())?;
                let objects = self.objects_root.as_ref().expect("s3 disk has objects root");
                Ok(Box::new(fs::File::open(objects.join(metadata.object_id))?))
            }
        }
    }

    pub fn read_all(&self, relative: impl AsRef<Path>) -> std::io::Result<Vec<u8>> {
        let mut reader = self.read_file(relative)?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    pub fn write_file(
        self: &Arc<Self>,
        relative: impl AsRef<Path>,
        mode: WriteMode,
    ) -> std::io::Result<Box<dyn DiskFile>> {
        match self.kind {
            DiskType::Local => {
                let file = fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(mode == WriteMode::Append)
                    .truncate(mode == WriteMode::Rewrite)
                    .open(self.absolute_path(relative))?;
                Ok(Box::new(LocalFile { file }))
            }
            DiskType::S3 => Ok(Box::new(S3File {
                disk: Arc::clone(self),
                relative_path: relative.as_ref().to_path_buf(),
                buf: Vec::new(),
                append: mode == WriteMode::Append,
                finalized: false,
            })),
        }
    }

    pub fn hard_link(&self, source: &Path, destination: &Path) -> std::io::Result<()> {
        fs::hard_link(source, destination)
    }

    /// Flush directory metadata so freshly created entries survive a crash.
    pub fn sync_directory(&self, relative: impl AsRef<Path>) -> std::io::Result<()> {
        fs::File::open(self.absolute_path(relative))?.sync_all()
    }

    fn read_object_metadata(&self, relative: &Path) -> std::io::Result<ObjectMetadata> {
        let bytes = fs::read(self.absolute_path(relative))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad object metadata: {}", e),
            )
        })
    }

    fn put_object(&self, relative: &Path, contents: &[u8]) -> std::io::Result<()> {
        let objects = self.objects_root.as_ref().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Unsupported, "disk has no object store")
        })?;
        fs::create_dir_all(objects)?;
        let seq = OBJECT_SEQ.fetch_add(1, Ordering::Relaxed);
        let object_id = format!("{:032x}-{}", hash_bytes(contents), seq);
        fs::write(objects.join(&object_id), contents)?;
        let metadata = ObjectMetadata {
            object_id,
            size: contents.len() as u64,
        };
        fs::write(
            self.absolute_path(relative),
            serde_json::to_vec(&metadata).expect("serialize object metadata"),
        )
    }

    /// Raw metadata document of a file on an object-store disk.
    pub fn read_metadata(&self, relative: impl AsRef<Path>) -> std::io::Result<Vec<u8>> {
        fs::read(self.absolute_path(relative))
    }

    /// Install a metadata document verbatim; used by zero-copy fetch, where
    /// the receiver points at the sender's objects instead of copying them.
    pub fn write_metadata(&self, relative: impl AsRef<Path>, bytes: &[u8]) -> std::io::Result<()> {
        let metadata: ObjectMetadata = serde_json::from_slice(bytes).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad object metadata: {}", e),
            )
        })?;
        let objects = self.objects_root.as_ref().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Unsupported, "disk has no object store")
        })?;
        if !objects.join(&metadata.object_id).exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("object {} does not exist", metadata.object_id),
            ));
        }
        fs::write(self.absolute_path(relative), bytes)
    }

    /// Whether this disk's object namespace already holds `object_id`.
    pub fn check_unique_id(&self, object_id: &str) -> bool {
        match &self.objects_root {
            Some(objects) => objects.join(object_id).exists(),
            None => false,
        }
    }

    /// Record shared ownership of a part's objects.
    pub fn lock_shared_data(&self, object_id: &str, part_name: &str) -> std::io::Result<()> {
        let objects = self.objects_root.as_ref().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Unsupported, "disk has no object store")
        })?;
        let refs = objects.join(".refs").join(object_id);
        fs::create_dir_all(&refs)?;
        fs::write(refs.join(part_name), b"")
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_path;
    use std::path::Path;

    #[test]
    fn normalize_resolves_dot_and_dotdot() {
        assert_eq!(
            normalize_path(Path::new("/data/tmp-fetch_p/./a/../b.bin")),
            Path::new("/data/tmp-fetch_p/b.bin")
        );
    }

    #[test]
    fn escape_via_dotdot_leaves_the_prefix() {
        let normalized = normalize_path(Path::new("/data/tmp-fetch_p/../../etc/passwd"));
        assert!(!normalized.starts_with("/data/tmp-fetch_p"));
    }
}
