//! Disk-backed buffering of projected rows between the transform pass and the bulk load.
//!
//! Each category gets its own append-only file inside a private working directory. Rows are
//! stored as length-prefixed little-endian frames and replayed per category in write order.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bail;
use crate::error::{ErrorKind, MarctError, MarctResult};
use crate::marct_error;
use crate::types::{CATEGORY_COUNT, Category, ProjectedRow};

/// Outcome of [`StagingStore::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The row was not stored; the message says why.
    Skipped(String),
}

#[derive(Debug)]
enum Sink {
    Unused,
    Open(BufWriter<File>),
    Closed,
    Taken,
}

/// Per-category row files in a private directory, removed on drop.
#[derive(Debug)]
pub struct StagingStore {
    dir: PathBuf,
    sinks: Vec<Sink>,
    counts: Vec<u64>,
    finished: bool,
}

impl StagingStore {
    /// Creates an empty store in a new directory under `parent`.
    pub fn create(parent: &Path) -> MarctResult<StagingStore> {
        let dir = parent.join(format!("marct-staging-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir)?;

        debug!(dir = %dir.display(), "created staging directory");

        Ok(StagingStore {
            dir,
            sinks: (0..CATEGORY_COUNT).map(|_| Sink::Unused).collect(),
            counts: vec![0; CATEGORY_COUNT],
            finished: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn sink_path(&self, category: Category) -> PathBuf {
        self.dir.join(format!("{category}.rows"))
    }

    /// Appends `row` to the file of its category, opening the file on first use.
    ///
    /// A row whose field is not one of the 1000 categories is not an error; it is reported back
    /// as [`WriteOutcome::Skipped`].
    pub fn write(&mut self, row: &ProjectedRow) -> MarctResult<WriteOutcome> {
        if self.finished {
            bail!(
                ErrorKind::InvalidState,
                "Staging store is read-only",
                "rows cannot be written after finish_writing"
            );
        }

        let Some(category) = row.category() else {
            return Ok(WriteOutcome::Skipped(format!(
                "skipping row {} of record {}: unknown field {:?}",
                row.line, row.srs_id, row.field
            )));
        };

        let index = category.index();
        if matches!(self.sinks[index], Sink::Unused) {
            let file = File::create(self.sink_path(category))?;
            self.sinks[index] = Sink::Open(BufWriter::new(file));
        }

        let Sink::Open(writer) = &mut self.sinks[index] else {
            bail!(
                ErrorKind::InvalidState,
                "Staging sink is not writable",
                format!("sink of category {category} is closed")
            );
        };

        let frame = encode_row(row);
        writer.write_all(&(frame.len() as u32).to_le_bytes())?;
        writer.write_all(&frame)?;
        self.counts[index] += 1;

        Ok(WriteOutcome::Written)
    }

    /// Flushes and closes every sink. May be called once.
    pub fn finish_writing(&mut self) -> MarctResult<()> {
        if self.finished {
            bail!(
                ErrorKind::InvalidState,
                "Staging store already finished",
                "finish_writing was called more than once"
            );
        }
        self.finished = true;

        for sink in &mut self.sinks {
            if !matches!(sink, Sink::Open(_)) {
                continue;
            }

            if let Sink::Open(writer) = std::mem::replace(sink, Sink::Closed) {
                writer.into_inner().map_err(|err| MarctError::from(err.into_error()))?;
            }
        }

        Ok(())
    }

    /// Number of rows written to `category`.
    pub fn row_count(&self, category: Category) -> u64 {
        self.counts[category.index()]
    }

    pub fn total_rows(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Categories that received at least one row, in ascending order.
    pub fn categories(&self) -> Vec<Category> {
        Category::all()
            .filter(|category| self.counts[category.index()] > 0)
            .collect()
    }

    /// Opens the single reader of `category`.
    ///
    /// Returns [`None`] for a category without rows. Each category can be read once; dropping
    /// the reader deletes its file.
    pub fn reader(&mut self, category: Category) -> MarctResult<Option<StagedRowReader>> {
        if !self.finished {
            bail!(
                ErrorKind::InvalidState,
                "Staging store is still being written",
                "finish_writing must be called before reading"
            );
        }

        let index = category.index();
        match std::mem::replace(&mut self.sinks[index], Sink::Taken) {
            Sink::Closed => {
                let path = self.sink_path(category);
                let file = File::open(&path)?;

                Ok(Some(StagedRowReader {
                    path,
                    reader: BufReader::new(file),
                    error: None,
                    done: false,
                }))
            }
            Sink::Unused => {
                self.sinks[index] = Sink::Unused;
                Ok(None)
            }
            Sink::Taken => bail!(
                ErrorKind::InvalidState,
                "Staging reader already taken",
                format!("category {category} can only be read once")
            ),
            Sink::Open(_) => bail!(
                ErrorKind::InvalidState,
                "Staging sink is still open",
                format!("category {category}")
            ),
        }
    }
}

impl Drop for StagingStore {
    fn drop(&mut self) {
        // Writers must be closed before their files go away.
        self.sinks.clear();

        if let Err(err) = fs::remove_dir_all(&self.dir) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), error = %err, "failed to remove staging directory");
            }
        }
    }
}

/// Replays the rows of one category in write order.
///
/// Iteration stops at the end of the file or at the first undecodable frame; in the latter case
/// [`StagedRowReader::error`] returns the failure.
#[derive(Debug)]
pub struct StagedRowReader {
    path: PathBuf,
    reader: BufReader<File>,
    error: Option<MarctError>,
    done: bool,
}

impl StagedRowReader {
    /// The error that ended iteration early, if any.
    pub fn error(&self) -> Option<&MarctError> {
        self.error.as_ref()
    }

    /// Consumes the reader, returning the terminal error if iteration ended early.
    pub fn finish(mut self) -> MarctResult<()> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn read_frame(&mut self) -> MarctResult<Option<ProjectedRow>> {
        let len = match self.reader.read_u32::<LittleEndian>() {
            Ok(len) => len,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        // The length prefix is untrusted, so only what the file actually holds is buffered.
        let mut frame = Vec::new();
        (&mut self.reader).take(u64::from(len)).read_to_end(&mut frame)?;
        if frame.len() != len as usize {
            bail!(
                ErrorKind::StagingIoError,
                "Staged frame is truncated",
                format!("expected {len} bytes, found {}", frame.len())
            );
        }

        decode_row(&frame).map(Some)
    }
}

impl Iterator for StagedRowReader {
    type Item = ProjectedRow;

    fn next(&mut self) -> Option<ProjectedRow> {
        if self.done {
            return None;
        }

        match self.read_frame() {
            Ok(Some(row)) => Some(row),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                self.error = Some(marct_error!(
                    ErrorKind::StagingIoError,
                    "Staged rows could not be decoded",
                    self.path.display(),
                    source: err
                ));
                None
            }
        }
    }
}

impl Drop for StagedRowReader {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove staging file");
            }
        }
    }
}

fn put_str(buf: &mut BytesMut, value: &str) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn encode_row(row: &ProjectedRow) -> BytesMut {
    let mut buf = BytesMut::with_capacity(96 + row.instance_hrid.len() + row.content.len());
    buf.put_slice(row.srs_id.as_bytes());
    buf.put_i32_le(row.line);
    buf.put_slice(row.matched_id.as_bytes());
    put_str(&mut buf, &row.instance_hrid);
    buf.put_slice(row.instance_id.as_bytes());
    put_str(&mut buf, &row.field);
    put_str(&mut buf, &row.ind1);
    put_str(&mut buf, &row.ind2);
    buf.put_i32_le(row.ord);
    put_str(&mut buf, &row.sf);
    put_str(&mut buf, &row.content);
    buf
}

fn read_uuid(frame: &mut &[u8]) -> MarctResult<Uuid> {
    let mut bytes = [0u8; 16];
    frame.read_exact(&mut bytes)?;
    Ok(Uuid::from_bytes(bytes))
}

fn read_str(frame: &mut &[u8]) -> MarctResult<String> {
    let len = frame.read_u32::<LittleEndian>()? as usize;
    if len > frame.len() {
        bail!(
            ErrorKind::StagingIoError,
            "Staged string exceeds its frame",
            format!("length {len}, {} bytes left", frame.len())
        );
    }

    let mut bytes = vec![0; len];
    frame.read_exact(&mut bytes)?;
    Ok(String::from_utf8(bytes)?)
}

fn decode_row(mut frame: &[u8]) -> MarctResult<ProjectedRow> {
    let frame = &mut frame;
    let row = ProjectedRow {
        srs_id: read_uuid(frame)?,
        line: frame.read_i32::<LittleEndian>()?,
        matched_id: read_uuid(frame)?,
        instance_hrid: read_str(frame)?,
        instance_id: read_uuid(frame)?,
        field: read_str(frame)?,
        ind1: read_str(frame)?,
        ind2: read_str(frame)?,
        ord: frame.read_i32::<LittleEndian>()?,
        sf: read_str(frame)?,
        content: read_str(frame)?,
    };

    if !frame.is_empty() {
        bail!(
            ErrorKind::StagingIoError,
            "Staged frame has trailing bytes",
            format!("{} bytes left", frame.len())
        );
    }

    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(field: &str, line: i32, content: &str) -> ProjectedRow {
        ProjectedRow {
            srs_id: Uuid::from_u128(7),
            line,
            matched_id: Uuid::from_u128(8),
            instance_hrid: "in00000001".to_owned(),
            instance_id: Uuid::nil(),
            field: field.to_owned(),
            ind1: "1".to_owned(),
            ind2: " ".to_owned(),
            ord: 1,
            sf: "a".to_owned(),
            content: content.to_owned(),
        }
    }

    fn category(code: &str) -> Category {
        Category::parse(code).unwrap()
    }

    #[test]
    fn rows_round_trip_per_category_in_order() {
        let mut store = StagingStore::create(&std::env::temp_dir()).unwrap();
        let written = vec![
            row("245", 1, "Title"),
            row("100", 2, "Author"),
            row("245", 3, "Другой заглавие"),
            row("245", 4, ""),
        ];
        for row in &written {
            assert_eq!(store.write(row).unwrap(), WriteOutcome::Written);
        }
        store.finish_writing().unwrap();

        assert_eq!(store.categories(), vec![category("100"), category("245")]);
        assert_eq!(store.row_count(category("245")), 3);
        assert_eq!(store.total_rows(), 4);

        let mut reader = store.reader(category("245")).unwrap().unwrap();
        let read: Vec<_> = reader.by_ref().collect();
        assert!(reader.error().is_none());
        assert_eq!(read, vec![written[0].clone(), written[2].clone(), written[3].clone()]);

        let read: Vec<_> = store.reader(category("100")).unwrap().unwrap().collect();
        assert_eq!(read, vec![written[1].clone()]);
    }

    #[test]
    fn unknown_category_is_skipped_with_message() {
        let mut store = StagingStore::create(&std::env::temp_dir()).unwrap();

        let outcome = store.write(&row("LDR", 1, "leader")).unwrap();

        let WriteOutcome::Skipped(message) = outcome else {
            panic!("expected the row to be skipped");
        };
        assert!(message.contains("LDR"));
        assert_eq!(store.total_rows(), 0);
    }

    #[test]
    fn finish_writing_twice_fails_and_store_becomes_read_only() {
        let mut store = StagingStore::create(&std::env::temp_dir()).unwrap();
        store.finish_writing().unwrap();

        let err = store.finish_writing().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let err = store.write(&row("245", 1, "late")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn reading_before_finish_fails() {
        let mut store = StagingStore::create(&std::env::temp_dir()).unwrap();
        store.write(&row("245", 1, "Title")).unwrap();

        assert!(store.reader(category("245")).is_err());
    }

    #[test]
    fn readers_are_single_use_and_delete_their_file() {
        let mut store = StagingStore::create(&std::env::temp_dir()).unwrap();
        store.write(&row("245", 1, "Title")).unwrap();
        store.finish_writing().unwrap();

        let path = store.sink_path(category("245"));
        assert!(path.exists());

        let reader = store.reader(category("245")).unwrap().unwrap();
        drop(reader);
        assert!(!path.exists());

        assert!(store.reader(category("245")).is_err());
        assert!(store.reader(category("500")).unwrap().is_none());
    }

    #[test]
    fn categories_without_rows_have_no_reader() {
        let mut store = StagingStore::create(&std::env::temp_dir()).unwrap();
        store.write(&row("245", 1, "Title")).unwrap();
        store.finish_writing().unwrap();

        assert!(store.reader(category("500")).unwrap().is_none());
        assert!(store.reader(category("000")).unwrap().is_none());
        // Asking again is still not an error.
        assert!(store.reader(category("500")).unwrap().is_none());
        assert!(store.reader(category("245")).unwrap().is_some());
    }

    #[test]
    fn dropping_the_store_removes_its_directory() {
        let store = StagingStore::create(&std::env::temp_dir()).unwrap();
        let dir = store.dir().to_path_buf();
        assert!(dir.exists());

        drop(store);

        assert!(!dir.exists());
    }

    #[test]
    fn corrupt_frame_ends_iteration_with_error() {
        let mut store = StagingStore::create(&std::env::temp_dir()).unwrap();
        store.write(&row("245", 1, "Title")).unwrap();
        store.finish_writing().unwrap();

        let path = store.sink_path(category("245"));
        let mut bytes = fs::read(&path).unwrap();
        // Claim a longer frame than the file holds.
        bytes[0] = 0xff;
        bytes[1] = 0xff;
        fs::write(&path, bytes).unwrap();

        let mut reader = store.reader(category("245")).unwrap().unwrap();
        assert_eq!(reader.next(), None);
        assert_eq!(reader.error().map(MarctError::kind), Some(ErrorKind::StagingIoError));
        assert!(reader.finish().is_err());
    }

    #[test]
    fn oversized_length_prefix_is_reported_not_allocated() {
        let mut store = StagingStore::create(&std::env::temp_dir()).unwrap();
        store.write(&row("245", 1, "Title")).unwrap();
        store.finish_writing().unwrap();

        let path = store.sink_path(category("245"));
        let mut bytes = u32::MAX.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 8]);
        fs::write(&path, bytes).unwrap();

        let mut reader = store.reader(category("245")).unwrap().unwrap();
        assert_eq!(reader.next(), None);

        let err = reader.finish().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StagingIoError);
        assert!(err.to_string().contains("Staged rows could not be decoded"));
    }
}
