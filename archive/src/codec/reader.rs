//! Streaming archive reader.
//!
//! Wraps a non-seekable source. Entries come out in stream order exactly
//! once; a layer's payload must be read (or dropped) before asking for the
//! next entry, and whatever is left unread is skipped.

use std::fmt;
use std::io::{self, Read};

use a3s_image_core::error::{ImageError, Result};
use a3s_image_core::{ArchiveManifest, ImageId, LayerRecord};

use super::{read_error, EntryPath, FORMAT_VERSION};
use crate::tags::TagIndex;

/// Kind of a logical archive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Layer,
    Image,
    Manifest,
    Repositories,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Layer => "layer",
            Self::Image => "image",
            Self::Manifest => "manifest",
            Self::Repositories => "repositories",
        })
    }
}

/// One logical record of an archive.
#[derive(Debug)]
pub enum ArchiveEntry<'a, R: Read> {
    Layer {
        record: LayerRecord,
        payload: LayerStream<'a, R>,
    },
    Image {
        id: ImageId,
        metadata: Vec<u8>,
    },
    Manifest(ArchiveManifest),
    Repositories(TagIndex),
}

impl<R: Read> ArchiveEntry<'_, R> {
    pub fn kind(&self) -> EntryKind {
        match self {
            Self::Layer { .. } => EntryKind::Layer,
            Self::Image { .. } => EntryKind::Image,
            Self::Manifest(_) => EntryKind::Manifest,
            Self::Repositories(_) => EntryKind::Repositories,
        }
    }
}

/// Layer payload handle, positioned inside the archive stream.
///
/// Ending before the size declared in the tar header is reported as
/// `UnexpectedEof`.
pub struct LayerStream<'a, R: Read> {
    entry: tar::Entry<'a, R>,
    remaining: u64,
}

impl<R: Read> fmt::Debug for LayerStream<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerStream")
            .field("remaining", &self.remaining)
            .finish_non_exhaustive()
    }
}

impl<R: Read> LayerStream<'_, R> {
    /// Size declared in the archive.
    pub fn size(&self) -> u64 {
        self.entry.size()
    }
}

impl<R: Read> Read for LayerStream<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self.entry.read(buf)?;
        if n == 0 && self.remaining > 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("layer payload truncated, {} bytes missing", self.remaining),
            ));
        }
        self.remaining = self.remaining.saturating_sub(n as u64);
        Ok(n)
    }
}

/// A layer whose group has started but whose payload has not arrived yet.
#[derive(Debug)]
struct PendingLayer {
    id: ImageId,
    record: Option<LayerRecord>,
}

/// Single-pass iterator over the logical entries of an archive.
pub struct ArchiveReader<'a, R: Read> {
    entries: tar::Entries<'a, R>,
    max_metadata_size: u64,
    pending: Option<PendingLayer>,
    finished: bool,
}

impl<'a, R: Read> ArchiveReader<'a, R> {
    /// Start reading `archive`. Metadata entries larger than
    /// `max_metadata_size` are rejected as corrupt.
    pub fn new(archive: &'a mut tar::Archive<R>, max_metadata_size: u64) -> Result<Self> {
        let entries = archive
            .entries()
            .map_err(|e| read_error("failed to read archive", e))?;
        Ok(Self {
            entries,
            max_metadata_size,
            pending: None,
            finished: false,
        })
    }

    fn next_entry(&mut self) -> Result<Option<ArchiveEntry<'a, R>>> {
        loop {
            let Some(entry) = self.entries.next() else {
                if let Some(pending) = self.pending.take() {
                    return Err(ImageError::CorruptArchive(format!(
                        "layer {} has no payload",
                        pending.id
                    )));
                }
                return Ok(None);
            };
            let mut entry = entry.map_err(|e| read_error("failed to read entry header", e))?;

            let path = entry
                .path()
                .map_err(|e| read_error("invalid entry path", e))?
                .to_str()
                .ok_or_else(|| ImageError::CorruptArchive("non UTF-8 entry path".to_string()))?
                .to_string();
            let entry_type = entry.header().entry_type();

            if entry_type.is_dir() {
                let id = ImageId::parse(path.trim_start_matches("./").trim_end_matches('/'))
                    .map_err(|_| {
                        ImageError::CorruptArchive(format!("unexpected directory '{path}'"))
                    })?;
                self.start_layer(&id)?;
                continue;
            }
            if !entry_type.is_file() {
                return Err(ImageError::CorruptArchive(format!(
                    "entry '{path}' is not a regular file"
                )));
            }

            match EntryPath::classify(&path)? {
                EntryPath::LayerDir(id) => {
                    return Err(ImageError::CorruptArchive(format!(
                        "entry '{id}/' is not a directory"
                    )))
                }
                EntryPath::LayerVersion(id) => {
                    self.start_layer(&id)?;
                    let version = self.read_metadata(&mut entry, &path)?;
                    if String::from_utf8_lossy(&version).trim() != FORMAT_VERSION {
                        return Err(ImageError::CorruptArchive(format!(
                            "layer {id} has unsupported format version {:?}",
                            String::from_utf8_lossy(&version)
                        )));
                    }
                }
                EntryPath::LayerRecord(id) => {
                    match &self.pending {
                        Some(PendingLayer { id: p, record: None }) if *p == id => {}
                        None => self.start_layer(&id)?,
                        _ => {
                            return Err(ImageError::CorruptArchive(format!(
                                "layer record for {id} is out of order"
                            )))
                        }
                    }
                    let data = self.read_metadata(&mut entry, &path)?;
                    let record: LayerRecord = serde_json::from_slice(&data).map_err(|e| {
                        ImageError::CorruptArchive(format!("invalid layer record for {id}: {e}"))
                    })?;
                    if record.id != id {
                        return Err(ImageError::CorruptArchive(format!(
                            "layer record in {id}/ names a different layer {}",
                            record.id
                        )));
                    }
                    if let Some(pending) = self.pending.as_mut() {
                        pending.record = Some(record);
                    }
                }
                EntryPath::LayerPayload(id) => {
                    let record = match self.pending.take() {
                        Some(PendingLayer {
                            id: pending,
                            record: Some(record),
                        }) if pending == id => record,
                        _ => {
                            return Err(ImageError::CorruptArchive(format!(
                                "payload for layer {id} precedes its record"
                            )))
                        }
                    };
                    let remaining = entry.size();
                    return Ok(Some(ArchiveEntry::Layer {
                        record,
                        payload: LayerStream { entry, remaining },
                    }));
                }
                EntryPath::Image(id) => {
                    self.expect_no_pending(&path)?;
                    let metadata = self.read_metadata(&mut entry, &path)?;
                    return Ok(Some(ArchiveEntry::Image { id, metadata }));
                }
                EntryPath::Manifest => {
                    self.expect_no_pending(&path)?;
                    let data = self.read_metadata(&mut entry, &path)?;
                    let manifest = serde_json::from_slice(&data).map_err(|e| {
                        ImageError::CorruptArchive(format!("invalid manifest: {e}"))
                    })?;
                    return Ok(Some(ArchiveEntry::Manifest(manifest)));
                }
                EntryPath::Repositories => {
                    self.expect_no_pending(&path)?;
                    let data = self.read_metadata(&mut entry, &path)?;
                    let tags = serde_json::from_slice(&data).map_err(|e| {
                        ImageError::CorruptArchive(format!("invalid repositories file: {e}"))
                    })?;
                    return Ok(Some(ArchiveEntry::Repositories(tags)));
                }
            }
        }
    }

    /// Open a layer group, or continue the one already open for `id`.
    fn start_layer(&mut self, id: &ImageId) -> Result<()> {
        match &self.pending {
            None => {
                self.pending = Some(PendingLayer {
                    id: id.clone(),
                    record: None,
                });
                Ok(())
            }
            Some(pending) if pending.id == *id && pending.record.is_none() => Ok(()),
            Some(pending) => Err(ImageError::CorruptArchive(format!(
                "layer {} is incomplete before {}",
                pending.id, id
            ))),
        }
    }

    fn expect_no_pending(&self, path: &str) -> Result<()> {
        match &self.pending {
            Some(pending) => Err(ImageError::CorruptArchive(format!(
                "layer {} is incomplete before '{path}'",
                pending.id
            ))),
            None => Ok(()),
        }
    }

    fn read_metadata(&self, entry: &mut tar::Entry<'a, R>, path: &str) -> Result<Vec<u8>> {
        let size = entry.size();
        if size > self.max_metadata_size {
            return Err(ImageError::CorruptArchive(format!(
                "'{path}' is {size} bytes, over the {} byte limit",
                self.max_metadata_size
            )));
        }
        let mut data = Vec::with_capacity(size as usize);
        entry
            .read_to_end(&mut data)
            .map_err(|e| read_error(&format!("failed to read '{path}'"), e))?;
        if data.len() as u64 != size {
            return Err(ImageError::CorruptArchive(format!(
                "'{path}' truncated: {} of {size} bytes",
                data.len()
            )));
        }
        Ok(data)
    }
}

impl<'a, R: Read> Iterator for ArchiveReader<'a, R> {
    type Item = Result<ArchiveEntry<'a, R>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ArchiveWriter;
    use std::io::Cursor;

    const LIMIT: u64 = 1024 * 1024;

    fn layer(payload: &[u8], parent: Option<&ImageId>) -> LayerRecord {
        LayerRecord {
            id: ImageId::digest_of(payload),
            parent: parent.cloned(),
        }
    }

    fn sample_archive() -> (Vec<u8>, LayerRecord, LayerRecord) {
        let base = layer(b"base", None);
        let top = layer(b"top", Some(&base.id));
        let mut writer = ArchiveWriter::new(Vec::new());
        writer
            .write_layer(&base, &mut Cursor::new(b"base".to_vec()), 4)
            .unwrap();
        writer
            .write_layer(&top, &mut Cursor::new(b"top".to_vec()), 3)
            .unwrap();
        writer.write_image(&ImageId::digest_of(b"{}"), b"{}").unwrap();
        writer
            .write_manifest(&ArchiveManifest {
                layers: vec![base.id.clone(), top.id.clone()],
                images: vec![ImageId::digest_of(b"{}")],
            })
            .unwrap();
        (writer.finish().unwrap().0, base, top)
    }

    /// Raw tar with arbitrary entries, for malformed-input tests.
    fn raw_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn collect_kinds(data: &[u8]) -> Result<Vec<EntryKind>> {
        let mut archive = tar::Archive::new(data);
        let reader = ArchiveReader::new(&mut archive, LIMIT)?;
        reader.map(|e| e.map(|e| e.kind())).collect()
    }

    #[test]
    fn test_reads_entries_in_order() {
        let (data, base, top) = sample_archive();
        let mut archive = tar::Archive::new(data.as_slice());
        let mut reader = ArchiveReader::new(&mut archive, LIMIT).unwrap();

        match reader.next().unwrap().unwrap() {
            ArchiveEntry::Layer {
                record,
                mut payload,
            } => {
                assert_eq!(record, base);
                assert_eq!(payload.size(), 4);
                let mut buf = Vec::new();
                payload.read_to_end(&mut buf).unwrap();
                assert_eq!(buf, b"base");
            }
            _ => panic!("expected base layer"),
        }

        // Skip the second payload without reading it.
        match reader.next().unwrap().unwrap() {
            ArchiveEntry::Layer { record, .. } => assert_eq!(record, top),
            _ => panic!("expected top layer"),
        }

        match reader.next().unwrap().unwrap() {
            ArchiveEntry::Image { id, metadata } => {
                assert_eq!(metadata, b"{}");
                assert_eq!(id, ImageId::digest_of(b"{}"));
            }
            _ => panic!("expected image"),
        }

        assert!(matches!(
            reader.next().unwrap().unwrap(),
            ArchiveEntry::Manifest(_)
        ));
        assert!(reader.next().is_none());
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_trailing_garbage_after_end_marker_is_ignored() {
        let (mut data, _, _) = sample_archive();
        data.extend_from_slice(b"garbage that is not a tar header at all");
        let kinds = collect_kinds(&data).unwrap();
        assert_eq!(kinds.len(), 4);
    }

    #[test]
    fn test_empty_stream_has_no_entries() {
        assert!(collect_kinds(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_entry_is_corrupt() {
        let data = raw_archive(&[("hooks/post-load.sh", b"#!/bin/sh\nrm -rf /\n")]);
        let err = collect_kinds(&data).unwrap_err();
        assert!(matches!(err, ImageError::CorruptArchive(_)));
    }

    #[test]
    fn test_payload_without_record_is_corrupt() {
        let id = ImageId::digest_of(b"x");
        let data = raw_archive(&[(&format!("{id}/layer.tar"), b"x")]);
        let err = collect_kinds(&data).unwrap_err();
        assert!(err.to_string().contains("precedes its record"));
    }

    #[test]
    fn test_missing_payload_is_corrupt() {
        let record = layer(b"x", None);
        let json = serde_json::to_vec(&record).unwrap();
        let data = raw_archive(&[(&format!("{}/json", record.id), &json)]);
        let err = collect_kinds(&data).unwrap_err();
        assert!(err.to_string().contains("has no payload"));
    }

    #[test]
    fn test_record_naming_other_layer_is_corrupt() {
        let record = layer(b"x", None);
        let other = ImageId::digest_of(b"y");
        let json = serde_json::to_vec(&record).unwrap();
        let data = raw_archive(&[(&format!("{other}/json"), &json)]);
        assert!(matches!(
            collect_kinds(&data),
            Err(ImageError::CorruptArchive(_))
        ));
    }

    #[test]
    fn test_unsupported_version_is_corrupt() {
        let id = ImageId::digest_of(b"x");
        let data = raw_archive(&[(&format!("{id}/VERSION"), b"9.9")]);
        let err = collect_kinds(&data).unwrap_err();
        assert!(err.to_string().contains("unsupported format version"));
    }

    #[test]
    fn test_oversized_metadata_is_corrupt() {
        let doc = vec![b' '; 64];
        let id = ImageId::digest_of(&doc);
        let data = raw_archive(&[(&format!("{id}.json"), &doc)]);
        let mut archive = tar::Archive::new(data.as_slice());
        let mut reader = ArchiveReader::new(&mut archive, 16).unwrap();
        let err = reader.next().unwrap().unwrap_err();
        assert!(err.to_string().contains("byte limit"));
    }

    #[test]
    fn test_truncated_stream_is_corrupt() {
        let (data, _, _) = sample_archive();
        // Cut inside the second layer's directory header.
        let cut = &data[..512 * 7 + 2];
        let err = collect_kinds(cut).unwrap_err();
        assert!(matches!(err, ImageError::CorruptArchive(_)), "{err}");
    }

    #[test]
    fn test_truncated_payload_read_is_unexpected_eof() {
        let (data, _, _) = sample_archive();
        // Blocks: dir 0, VERSION 1-2, json 3-4, payload header 5, payload data 6.
        let cut = &data[..512 * 6 + 2];
        let mut archive = tar::Archive::new(cut);
        let mut reader = ArchiveReader::new(&mut archive, LIMIT).unwrap();
        match reader.next().unwrap().unwrap() {
            ArchiveEntry::Layer { mut payload, .. } => {
                let mut buf = Vec::new();
                let err = payload.read_to_end(&mut buf).unwrap_err();
                assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
            }
            _ => panic!("expected layer"),
        }
    }

    #[test]
    fn test_bad_header_checksum_is_corrupt() {
        let (mut data, _, _) = sample_archive();
        data[0] ^= 0xff;
        let err = collect_kinds(&data).unwrap_err();
        assert!(matches!(err, ImageError::CorruptArchive(_)), "{err}");
    }
}
