//! Raw input files referenced by a saved analysis.

use anyhow::{Context, Result};
use sc_types::PipelineError;
use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::container::Storage;
use crate::document::Group;

/// Where a file's bytes can be found after saving.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileRecord {
    /// A byte range of the container's embedded section.
    Embedded { offset: u64, size: u64 },
    /// A path on the local filesystem.
    Linked { id: String },
}

impl FileRecord {
    pub fn write(&self, group: &mut Group) {
        match self {
            FileRecord::Embedded { offset, size } => {
                group.write("offset", *offset as i64);
                group.write("size", *size as i64);
            }
            FileRecord::Linked { id } => group.write("id", id.as_str()),
        }
    }

    pub fn read(group: &Group) -> Result<Self> {
        if let Some(id) = group.read_opt::<String>("id")? {
            return Ok(FileRecord::Linked { id });
        }
        let offset = group.read::<usize>("offset")? as u64;
        let size = group.read::<usize>("size")? as u64;
        Ok(FileRecord::Embedded { offset, size })
    }
}

/// Collects the files of an analysis being saved.
#[derive(Debug)]
pub struct FileSink {
    storage: Storage,
    files: Vec<(PathBuf, u64)>,
    offset: u64,
}

impl FileSink {
    pub fn new(storage: Storage) -> Self {
        FileSink {
            storage,
            files: Vec::new(),
            offset: 0,
        }
    }

    pub fn storage(&self) -> Storage {
        self.storage
    }

    /// Register a file and return the record to store for it.
    pub fn add(&mut self, path: &Path) -> Result<FileRecord> {
        match self.storage {
            Storage::Linked => Ok(FileRecord::Linked {
                id: path.to_string_lossy().into_owned(),
            }),
            Storage::Embedded => {
                let size = std::fs::metadata(path)
                    .with_context(|| format!("unable to stat {}", path.display()))?
                    .len();
                let record = FileRecord::Embedded {
                    offset: self.offset,
                    size,
                };
                self.offset += size;
                self.files.push((path.to_path_buf(), size));
                Ok(record)
            }
        }
    }

    /// Files to stream into the container, with their recorded sizes.
    pub fn into_files(self) -> Vec<(PathBuf, u64)> {
        self.files
    }
}

/// The embedded-file section of a container on disk.
#[derive(Clone, Debug)]
pub struct EmbeddedSection {
    path: PathBuf,
    start: u64,
}

impl EmbeddedSection {
    pub fn new(path: &Path, start: u64) -> Self {
        EmbeddedSection {
            path: path.to_path_buf(),
            start,
        }
    }

    /// Copy `size` bytes at `offset` into a new file at `dest`.
    pub fn extract(&self, offset: u64, size: u64, dest: &Path) -> Result<()> {
        let mut source = File::open(&self.path)
            .with_context(|| format!("unable to open {}", self.path.display()))?;
        source.seek(SeekFrom::Start(self.start + offset))?;
        let mut writer = BufWriter::new(
            File::create(dest).with_context(|| format!("unable to create {}", dest.display()))?,
        );
        let copied = io::copy(&mut source.take(size), &mut writer)?;
        writer.flush()?;
        if copied != size {
            return Err(PipelineError::format(format!(
                "embedded file at offset {offset} is truncated ({copied} of {size} bytes)"
            ))
            .into());
        }
        Ok(())
    }
}

/// Turns stored file records back into local paths when loading.
pub trait FileResolver {
    fn resolve(
        &mut self,
        name: &str,
        record: &FileRecord,
        embedded: Option<&EmbeddedSection>,
    ) -> Result<PathBuf>;
}

/// Extracts embedded files into a directory; linked files resolve to their
/// recorded path.
#[derive(Debug)]
pub struct ExtractToDirectory {
    dir: PathBuf,
    count: usize,
}

impl ExtractToDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ExtractToDirectory {
            dir: dir.into(),
            count: 0,
        }
    }
}

impl FileResolver for ExtractToDirectory {
    fn resolve(
        &mut self,
        name: &str,
        record: &FileRecord,
        embedded: Option<&EmbeddedSection>,
    ) -> Result<PathBuf> {
        match record {
            FileRecord::Linked { id } => Ok(PathBuf::from(id)),
            FileRecord::Embedded { offset, size } => {
                let section = embedded.ok_or_else(|| {
                    PipelineError::format(format!(
                        "{name:?} is embedded but the container has no embedded files"
                    ))
                })?;
                std::fs::create_dir_all(&self.dir)?;
                // keep the original name so format detection by name still works
                let dest = self.dir.join(format!("{}_{name}", self.count));
                self.count += 1;
                section.extract(*offset, *size, &dest)?;
                Ok(dest)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_roundtrip() -> Result<()> {
        for record in [
            FileRecord::Embedded { offset: 5, size: 7 },
            FileRecord::Linked {
                id: "/data/matrix.mtx".into(),
            },
        ] {
            let mut g = Group::new();
            record.write(&mut g);
            assert_eq!(FileRecord::read(&g)?, record);
        }
        Ok(())
    }

    #[test]
    fn test_sink_offsets() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"1234")?;
        std::fs::write(&b, b"56")?;
        let mut sink = FileSink::new(Storage::Embedded);
        assert_eq!(sink.add(&a)?, FileRecord::Embedded { offset: 0, size: 4 });
        assert_eq!(sink.add(&b)?, FileRecord::Embedded { offset: 4, size: 2 });
        assert_eq!(sink.into_files(), vec![(a.clone(), 4), (b, 2)]);

        let mut linked = FileSink::new(Storage::Linked);
        assert!(matches!(linked.add(&a)?, FileRecord::Linked { .. }));
        assert!(linked.into_files().is_empty());
        Ok(())
    }

    #[test]
    fn test_embedded_without_section() {
        let mut resolver = ExtractToDirectory::new("/nonexistent");
        let record = FileRecord::Embedded { offset: 0, size: 1 };
        assert!(resolver.resolve("matrix.mtx", &record, None).is_err());
    }
}
