//! Parser input: forward-only, non-restartable sequences of field mappings.
use std::{fmt::Display, str::FromStr};

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};

use crate::{error::SourceError, types::Fields};

pub mod csv;
pub mod jsonl;

/// One item pulled from a source, tagged with its position in that source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub index: u64,
    pub fields: Fields,
}

/// A single forward pass over one uploaded source. An `Err` item is a fatal
/// read error; nothing after it is meaningful.
pub type RecordStream = BoxStream<'static, Result<SourceRecord, SourceError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Csv,
    JsonLines,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Csv => "csv",
            SourceFormat::JsonLines => "jsonl",
        }
    }

    /// Opens the body for reading. Header problems surface here, everything
    /// after the header is read lazily.
    pub fn open(&self, body: Bytes) -> Result<RecordStream, SourceError> {
        match self {
            SourceFormat::Csv => csv::records(body),
            SourceFormat::JsonLines => Ok(jsonl::records(body)),
        }
    }
}

impl Display for SourceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SourceFormat {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(SourceFormat::Csv),
            "jsonl" | "json_lines" | "ndjson" => Ok(SourceFormat::JsonLines),
            other => Err(SourceError::Format {
                format: other.to_owned(),
                reason: "unsupported format, expected csv or jsonl".to_owned(),
            }),
        }
    }
}

/// Wraps an in-memory sequence, numbering items from zero.
pub fn records_from_iter<I>(items: I) -> RecordStream
where
    I: IntoIterator<Item = Result<Fields, SourceError>>,
    I::IntoIter: Send + 'static,
{
    stream::iter(
        items
            .into_iter()
            .zip(0u64..)
            .map(|(item, index)| item.map(|fields| SourceRecord { index, fields })),
    )
    .boxed()
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_records_from_iter_numbers_items() {
        let mut a = Fields::new();
        a.insert("A".into(), json!(1));
        let b = Fields::new();

        let records: Vec<SourceRecord> = records_from_iter(vec![Ok(a.clone()), Ok(b.clone())])
            .try_collect()
            .await
            .unwrap();

        assert_eq!(
            records,
            vec![
                SourceRecord { index: 0, fields: a },
                SourceRecord { index: 1, fields: b }
            ]
        );
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("CSV".parse::<SourceFormat>().unwrap(), SourceFormat::Csv);
        assert_eq!(
            "ndjson".parse::<SourceFormat>().unwrap(),
            SourceFormat::JsonLines
        );
        assert!("shp".parse::<SourceFormat>().is_err());
    }
}
