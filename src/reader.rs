//! Everything related to reading newly available content from a file.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::events::{file_id, FileId};

/// Text captured for a given source path.
///
/// Either the whole content present when a tail (re)started, or everything
/// appended since the previous chunk. Chunks always end on a character
/// boundary.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Chunk {
    /// The path from where the text was read.
    source: PathBuf,
    text: String,
}

impl Chunk {
    pub(crate) fn new(source: PathBuf, text: String) -> Self {
        Chunk { source, text }
    }

    /// Returns a reference to the file from where the text was read.
    pub fn source(&self) -> &Path {
        self.source.as_path()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Returns the length of the text in bytes.
    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Returns the internal components that make up a `Chunk`.
    pub fn into_inner(self) -> (PathBuf, String) {
        let Chunk { source, text } = self;

        (source, text)
    }
}

/// Opens `path` for reading without preventing other processes from
/// writing, renaming or deleting it.
async fn open_shared(path: &Path) -> io::Result<File> {
    let mut options = std::fs::OpenOptions::new();
    options.read(true);

    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;

        // FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE
        options.share_mode(0x1 | 0x2 | 0x4);
    }

    tokio::fs::OpenOptions::from(options).open(path).await
}

/// An open file plus the number of bytes already delivered from it.
#[derive(Debug)]
pub(crate) struct ChunkReader {
    path: PathBuf,
    file: File,
    id: Option<FileId>,
    offset: u64,
}

impl ChunkReader {
    /// Opens `path`, positioned to continue after `resume_from` bytes
    /// delivered from the file identified by `resume_id`.
    ///
    /// Starts over from 0 if the file is shorter than that, or if it is not
    /// the same file anymore.
    pub async fn open(
        path: impl Into<PathBuf>,
        resume_from: u64,
        resume_id: Option<FileId>,
    ) -> io::Result<Self> {
        let path = path.into();
        let file = open_shared(&path).await?;
        let metadata = file.metadata().await?;
        let id = file_id(&metadata);

        let replaced = resume_id.is_some() && id.is_some() && resume_id != id;
        let offset = if replaced || metadata.len() < resume_from {
            0
        } else {
            resume_from
        };

        Ok(ChunkReader {
            path,
            file,
            id,
            offset,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Identity of the open file, if the platform has one.
    pub fn file_id(&self) -> Option<FileId> {
        self.id
    }

    /// Current length of the open file.
    pub async fn file_len(&self) -> io::Result<u64> {
        Ok(self.file.metadata().await?.len())
    }

    /// Drops the current handle and opens the path again from the start.
    pub async fn reopen(&mut self) -> io::Result<()> {
        self.file = open_shared(&self.path).await?;
        self.id = file_id(&self.file.metadata().await?);
        self.offset = 0;

        Ok(())
    }

    /// Reads everything between the offset and end-of-file.
    ///
    /// An incomplete character at the end is left unread, so it is picked up
    /// whole by the next call.
    pub async fn read_available(&mut self) -> io::Result<String> {
        self.file.seek(io::SeekFrom::Start(self.offset)).await?;

        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf).await?;

        let (text, consumed) = decode_aligned(&buf);
        self.offset += consumed as u64;

        Ok(text)
    }
}

/// Decodes the longest prefix of `buf` that does not end inside a UTF-8
/// sequence. Invalid bytes become U+FFFD.
///
/// Returns the text and the number of bytes it covers.
fn decode_aligned(buf: &[u8]) -> (String, usize) {
    let mut text = String::with_capacity(buf.len());
    let mut rest = buf;
    let mut consumed = 0;

    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                text.push_str(valid);
                consumed += rest.len();
                break;
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&rest[..valid_up_to]) {
                    text.push_str(valid);
                }
                consumed += valid_up_to;

                match e.error_len() {
                    // Truncated sequence at the end; wait for the rest
                    None => break,
                    Some(invalid) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        consumed += invalid;
                        rest = &rest[valid_up_to + invalid..];
                    }
                }
            }
        }
    }

    (text, consumed)
}
