//! Container framing.
//!
//! ```text
//! u64 LE  storage flag (0 = embedded files, 1 = linked files)
//! u64 LE  version (major * 1_000_000 + minor * 1_000 + patch)
//! u64 LE  length of the state document
//! ...     bincode-encoded state document
//! ...     embedded files, back to back, when the flag is 0
//! ```

use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::info;
use sc_types::PipelineError;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::document::Group;
use crate::files::EmbeddedSection;

/// Version written by this crate.
pub const CURRENT_VERSION: u64 = 3_001_000;
/// Documents older than this are upgraded before use.
pub const LEGACY_THRESHOLD: u64 = 3_000_000;
/// Size of the fixed preamble in bytes.
pub const PREAMBLE_SIZE: u64 = 24;

/// Where the raw input files live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Storage {
    /// Copied into the container after the state document.
    Embedded,
    /// Referenced by path.
    Linked,
}

impl Storage {
    fn flag(self) -> u64 {
        match self {
            Storage::Embedded => 0,
            Storage::Linked => 1,
        }
    }

    fn from_flag(flag: u64) -> Result<Self> {
        match flag {
            0 => Ok(Storage::Embedded),
            1 => Ok(Storage::Linked),
            _ => Err(PipelineError::format(format!("unknown storage flag {flag}")).into()),
        }
    }
}

/// The fixed-size container header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Preamble {
    pub storage: Storage,
    pub version: u64,
    pub state_len: u64,
}

impl Preamble {
    pub fn read(reader: &mut impl Read) -> Result<Self> {
        let mut fields = [0u64; 3];
        for f in &mut fields {
            *f = reader
                .read_u64::<LittleEndian>()
                .map_err(|_| PipelineError::format("truncated container preamble"))?;
        }
        Ok(Preamble {
            storage: Storage::from_flag(fields[0])?,
            version: fields[1],
            state_len: fields[2],
        })
    }

    pub fn write(&self, writer: &mut impl Write) -> Result<()> {
        writer.write_u64::<LittleEndian>(self.storage.flag())?;
        writer.write_u64::<LittleEndian>(self.version)?;
        writer.write_u64::<LittleEndian>(self.state_len)?;
        Ok(())
    }

    /// Offset of the embedded-file section.
    pub fn embedded_start(&self) -> u64 {
        PREAMBLE_SIZE + self.state_len
    }
}

/// Split a version code into `(major, minor, patch)`.
pub fn version_parts(version: u64) -> (u64, u64, u64) {
    (
        version / 1_000_000,
        (version / 1_000) % 1_000,
        version % 1_000,
    )
}

/// Write a container. With [`Storage::Embedded`], `files` are streamed after
/// the document in order; their sizes must match what the document recorded.
pub fn write_container(
    path: &Path,
    document: &Group,
    storage: Storage,
    files: &[(PathBuf, u64)],
) -> Result<()> {
    let state = bincode::serialize(document).context("failed to encode state document")?;
    let preamble = Preamble {
        storage,
        version: CURRENT_VERSION,
        state_len: state.len() as u64,
    };
    let mut writer = BufWriter::new(
        File::create(path).with_context(|| format!("unable to create {}", path.display()))?,
    );
    preamble.write(&mut writer)?;
    writer.write_all(&state)?;
    if storage == Storage::Embedded {
        for (source, expected) in files {
            let mut reader = File::open(source)
                .with_context(|| format!("unable to open {}", source.display()))?;
            let copied = io::copy(&mut reader, &mut writer)?;
            if copied != *expected {
                return Err(PipelineError::consistency(format!(
                    "{} changed size while saving ({copied} bytes, expected {expected})",
                    source.display()
                ))
                .into());
            }
        }
    }
    writer.flush()?;
    info!(
        "wrote {} ({} byte state, {} files {})",
        path.display(),
        state.len(),
        files.len(),
        if storage == Storage::Embedded {
            "embedded"
        } else {
            "linked"
        }
    );
    Ok(())
}

/// A decoded container: its header, the state document, and a handle on the
/// embedded files when there are any.
#[derive(Debug)]
pub struct Container {
    pub preamble: Preamble,
    pub document: Group,
    pub embedded: Option<EmbeddedSection>,
}

/// Read the preamble and state document. The document is returned as stored;
/// see [`crate::upgrade`] for legacy versions.
pub fn read_container(path: &Path) -> Result<Container> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("unable to open {}", path.display()))?,
    );
    let preamble = Preamble::read(&mut reader)
        .with_context(|| format!("failed to read header of {}", path.display()))?;
    if preamble.version > CURRENT_VERSION {
        let (major, minor, patch) = version_parts(preamble.version);
        return Err(PipelineError::format(format!(
            "{} was written by a newer version ({major}.{minor}.{patch})",
            path.display()
        ))
        .into());
    }
    let mut state = Vec::new();
    (&mut reader)
        .take(preamble.state_len)
        .read_to_end(&mut state)?;
    if state.len() as u64 != preamble.state_len {
        return Err(PipelineError::format("truncated state document").into());
    }
    let document: Group = bincode::deserialize(&state)
        .map_err(|e| PipelineError::format(format!("corrupt state document: {e}")))?;
    let embedded = (preamble.storage == Storage::Embedded)
        .then(|| EmbeddedSection::new(path, preamble.embedded_start()));
    Ok(Container {
        preamble,
        document,
        embedded,
    })
}
