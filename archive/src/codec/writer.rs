//! Streaming archive writer.

use std::io::{self, Read, Write};

use a3s_image_core::error::Result;
use a3s_image_core::{ArchiveManifest, ImageId, LayerRecord};

use super::{
    FORMAT_VERSION, LAYER_PAYLOAD_FILE, LAYER_RECORD_FILE, MANIFEST_FILE, REPOSITORIES_FILE,
    VERSION_FILE,
};
use crate::tags::TagIndex;

/// Writes archive records to a tar stream.
///
/// Payloads are copied straight through; nothing is buffered beyond the
/// tar block being written.
pub struct ArchiveWriter<W: Write> {
    builder: tar::Builder<CountingWriter<W>>,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(destination: W) -> Self {
        Self {
            builder: tar::Builder::new(CountingWriter {
                inner: destination,
                written: 0,
            }),
        }
    }

    /// Write a layer group: directory, `VERSION`, `json` and `layer.tar`.
    ///
    /// `payload` must yield exactly `size` bytes.
    pub fn write_layer(
        &mut self,
        record: &LayerRecord,
        payload: &mut dyn Read,
        size: u64,
    ) -> Result<()> {
        let id = &record.id;

        let mut dir = deterministic_header(tar::EntryType::Directory, 0, 0o755);
        self.builder
            .append_data(&mut dir, format!("{id}/"), io::empty())?;

        self.append_file(&format!("{id}/{VERSION_FILE}"), FORMAT_VERSION.as_bytes())?;
        self.append_file(
            &format!("{id}/{LAYER_RECORD_FILE}"),
            &serde_json::to_vec(record)?,
        )?;

        let mut header = deterministic_header(tar::EntryType::Regular, size, 0o644);
        let exact = ExactReader {
            inner: payload,
            remaining: size,
        };
        self.builder
            .append_data(&mut header, format!("{id}/{LAYER_PAYLOAD_FILE}"), exact)?;
        Ok(())
    }

    /// Write an image metadata document verbatim as `<id>.json`.
    pub fn write_image(&mut self, id: &ImageId, metadata: &[u8]) -> Result<()> {
        self.append_file(&format!("{id}.json"), metadata)
    }

    pub fn write_manifest(&mut self, manifest: &ArchiveManifest) -> Result<()> {
        self.append_file(MANIFEST_FILE, &serde_json::to_vec(manifest)?)
    }

    pub fn write_repositories(&mut self, tags: &TagIndex) -> Result<()> {
        self.append_file(REPOSITORIES_FILE, &serde_json::to_vec(tags)?)
    }

    /// Write the end-of-archive marker and flush. Returns the destination and
    /// the total number of bytes written to it.
    pub fn finish(self) -> Result<(W, u64)> {
        let mut counting = self.builder.into_inner()?;
        counting.flush()?;
        Ok((counting.inner, counting.written))
    }

    fn append_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let mut header = deterministic_header(tar::EntryType::Regular, data.len() as u64, 0o644);
        self.builder.append_data(&mut header, path, data)?;
        Ok(())
    }
}

fn deterministic_header(entry_type: tar::EntryType, size: u64, mode: u32) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header
}

/// Counts bytes that reach the destination.
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Yields exactly `remaining` bytes from `inner`; a short source is an error.
struct ExactReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("layer payload ended {} bytes early", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}
