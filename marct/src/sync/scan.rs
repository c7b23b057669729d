use std::vec;

use tokio_postgres::Row;

use crate::client::{PgClient, PgCursor};
use crate::error::MarctResult;
use crate::types::SourceRecord;

/// Record-at-a-time iteration over a source cursor, fetching in batches.
#[derive(Debug)]
pub struct SourceScan<'a> {
    cursor: PgCursor<'a>,
    batch: vec::IntoIter<Row>,
}

impl<'a> SourceScan<'a> {
    /// Declares the cursor `name` over `query` in the reader's open transaction.
    pub async fn open(
        reader: &'a PgClient,
        name: &str,
        query: &str,
        fetch_size: u32,
    ) -> MarctResult<SourceScan<'a>> {
        let cursor = reader.declare_cursor(name, query, fetch_size).await?;

        Ok(SourceScan {
            cursor,
            batch: Vec::new().into_iter(),
        })
    }

    /// Returns the next raw row.
    pub async fn next_row(&mut self) -> MarctResult<Option<Row>> {
        loop {
            if let Some(row) = self.batch.next() {
                return Ok(Some(row));
            }

            match self.cursor.next_batch().await? {
                Some(rows) => self.batch = rows.into_iter(),
                None => return Ok(None),
            }
        }
    }

    /// Returns the next row decoded as a [`SourceRecord`].
    pub async fn next_record(&mut self) -> MarctResult<Option<SourceRecord>> {
        match self.next_row().await? {
            Some(row) => SourceRecord::from_row(&row).map(Some),
            None => Ok(None),
        }
    }

    pub async fn close(self) -> MarctResult<()> {
        self.cursor.close().await
    }
}
