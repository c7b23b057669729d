//! Tab-separated output of projected rows, used instead of loading into the database.
//!
//! Values are escaped like Postgres `COPY` text format, so the file can be loaded back with
//! `COPY ... FROM` without further processing.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::MarctResult;
use crate::types::ProjectedRow;

#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
    rows: u64,
}

impl FileSink {
    /// Creates or truncates the file at `path`.
    pub fn create(path: &Path) -> MarctResult<FileSink> {
        let file = File::create(path)?;

        Ok(FileSink {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            rows: 0,
        })
    }

    pub fn write_row(&mut self, row: &ProjectedRow) -> MarctResult<()> {
        let line = [
            row.srs_id.to_string(),
            row.line.to_string(),
            row.matched_id.to_string(),
            escape(&row.instance_hrid),
            row.instance_id.to_string(),
            escape(&row.field),
            escape(&row.ind1),
            escape(&row.ind2),
            row.ord.to_string(),
            escape(&row.sf),
            escape(&row.content),
        ]
        .join("\t");

        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.rows += 1;

        Ok(())
    }

    /// Flushes the file and returns the number of rows written.
    pub fn finish(mut self) -> MarctResult<u64> {
        self.writer.flush()?;
        info!(path = %self.path.display(), rows = self.rows, "wrote projection file");

        Ok(self.rows)
    }
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\t' => escaped.push_str("\\t"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn escapes_copy_text_specials() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("a\tb\nc\\d\r"), "a\\tb\\nc\\\\d\\r");
    }

    #[test]
    fn writes_one_line_per_row() {
        let path = std::env::temp_dir().join(format!("marct-file-sink-{}.tsv", Uuid::new_v4()));
        let row = ProjectedRow {
            srs_id: Uuid::from_u128(1),
            line: 3,
            matched_id: Uuid::from_u128(2),
            instance_hrid: "in1".to_owned(),
            instance_id: Uuid::nil(),
            field: "245".to_owned(),
            ind1: "1".to_owned(),
            ind2: "0".to_owned(),
            ord: 1,
            sf: "a".to_owned(),
            content: "Moby\tDick".to_owned(),
        };

        let mut sink = FileSink::create(&path).unwrap();
        sink.write_row(&row).unwrap();
        sink.write_row(&row).unwrap();
        assert_eq!(sink.finish().unwrap(), 2);

        let written = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let lines: Vec<_> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "00000000-0000-0000-0000-000000000001\t3\t00000000-0000-0000-0000-000000000002\tin1\t\
             00000000-0000-0000-0000-000000000000\t245\t1\t0\t1\ta\tMoby\\tDick"
        );
    }
}
