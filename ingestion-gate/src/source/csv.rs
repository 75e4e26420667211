use std::{borrow::Cow, io::Cursor};

use bytes::Bytes;
use encoding_rs::WINDOWS_1252;
use futures::{stream, StreamExt};
use serde_json::Value;

use crate::{error::SourceError, types::Fields};

use super::{RecordStream, SourceRecord};

/// Header row gives the keys, every cell is kept verbatim as a string. Cells
/// that are not UTF-8 are read as Windows-1252, which county exports often
/// are. A row with the wrong number of cells ends the stream.
pub fn records(body: Bytes) -> Result<RecordStream, SourceError> {
    let mut reader = ::csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(Cursor::new(body));

    let headers: Vec<String> = reader
        .byte_headers()
        .map_err(|e| SourceError::Format {
            format: "csv".to_owned(),
            reason: e.to_string(),
        })?
        .iter()
        .map(|cell| decode_cell(cell).into_owned())
        .collect();

    if headers.is_empty() {
        return Err(SourceError::Format {
            format: "csv".to_owned(),
            reason: "missing header row".to_owned(),
        });
    }

    let rows = CsvRows {
        headers,
        rows: reader.into_byte_records(),
        index: 0,
        done: false,
    };
    Ok(stream::iter(rows).boxed())
}

fn decode_cell(cell: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(cell) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => WINDOWS_1252.decode_without_bom_handling(cell).0,
    }
}

struct CsvRows {
    headers: Vec<String>,
    rows: ::csv::ByteRecordsIntoIter<Cursor<Bytes>>,
    index: u64,
    done: bool,
}

impl Iterator for CsvRows {
    type Item = Result<SourceRecord, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let index = self.index;
        match self.rows.next()? {
            Ok(row) => {
                self.index += 1;
                let fields: Fields = self
                    .headers
                    .iter()
                    .zip(row.iter())
                    .map(|(key, cell)| {
                        (key.clone(), Value::String(decode_cell(cell).into_owned()))
                    })
                    .collect();
                Some(Ok(SourceRecord { index, fields }))
            }
            Err(e) => {
                self.done = true;
                Some(Err(SourceError::Read {
                    index,
                    reason: e.to_string(),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json::json;

    use super::*;

    async fn collect(body: &'static str) -> Vec<Result<SourceRecord, SourceError>> {
        records(Bytes::from_static(body.as_bytes()))
            .unwrap()
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_rows_become_string_fields() {
        let rows = collect("STATEID,CNTASSDVALUE\nWI-1,\"150,000\"\nWI-2,\n").await;

        assert_eq!(rows.len(), 2);
        let first = rows[0].as_ref().unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.fields["STATEID"], json!("WI-1"));
        assert_eq!(first.fields["CNTASSDVALUE"], json!("150,000"));
        let second = rows[1].as_ref().unwrap();
        assert_eq!(second.index, 1);
        assert_eq!(second.fields["CNTASSDVALUE"], json!(""));
    }

    #[tokio::test]
    async fn test_ragged_row_is_fatal_and_ends_stream() {
        let rows = collect("A,B\n1,2\n3\n4,5\n").await;

        assert_eq!(rows.len(), 2);
        assert!(rows[0].is_ok());
        assert!(matches!(rows[1], Err(SourceError::Read { index: 1, .. })));
    }

    #[tokio::test]
    async fn test_latin1_cells_are_decoded() {
        let body = Bytes::from_static(b"STATEID,OWNERNME1\nWI-1,Jos\xe9 Garc\xeda\nWI-2,Jane\n");
        let rows: Vec<_> = records(body).unwrap().collect().await;

        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0].as_ref().unwrap().fields["OWNERNME1"],
            json!("Jos\u{e9} Garc\u{ed}a")
        );
        assert_eq!(rows[1].as_ref().unwrap().fields["OWNERNME1"], json!("Jane"));
    }

    #[tokio::test]
    async fn test_utf8_and_windows_1252_cells_mix() {
        let body = Bytes::from_static(b"ID,NAME,NOTE\n1,Jos\xc3\xa9,\x93quoted\x94\n");
        let rows: Vec<_> = records(body).unwrap().collect().await;

        let fields = &rows[0].as_ref().unwrap().fields;
        assert_eq!(fields["NAME"], json!("Jos\u{e9}"));
        assert_eq!(fields["NOTE"], json!("\u{201c}quoted\u{201d}"));
    }

    #[test]
    fn test_empty_body_has_no_header() {
        assert!(matches!(
            records(Bytes::new()),
            Err(SourceError::Format { .. })
        ));
    }
}
