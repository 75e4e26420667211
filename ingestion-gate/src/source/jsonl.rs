use bytes::Bytes;
use futures::{stream, StreamExt};
use serde_json::Value;

use crate::error::SourceError;

use super::{RecordStream, SourceRecord};

/// One JSON object per line. Blank lines are skipped and do not advance the
/// index; any other line that is not an object ends the stream.
pub fn records(body: Bytes) -> RecordStream {
    stream::iter(JsonLines {
        body,
        pos: 0,
        index: 0,
        done: false,
    })
    .boxed()
}

struct JsonLines {
    body: Bytes,
    pos: usize,
    index: u64,
    done: bool,
}

impl JsonLines {
    fn next_line(&mut self) -> Option<Bytes> {
        while self.pos < self.body.len() {
            let rest = &self.body[self.pos..];
            let len = rest.iter().position(|b| *b == b'\n').unwrap_or(rest.len());
            let line = self.body.slice(self.pos..self.pos + len);
            self.pos += len + 1;
            if !line.trim_ascii().is_empty() {
                return Some(line);
            }
        }
        None
    }
}

impl Iterator for JsonLines {
    type Item = Result<SourceRecord, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let line = self.next_line()?;
        let index = self.index;
        self.index += 1;

        match serde_json::from_slice::<Value>(&line) {
            Ok(Value::Object(fields)) => Some(Ok(SourceRecord { index, fields })),
            Ok(_) => {
                self.done = true;
                Some(Err(SourceError::Read {
                    index,
                    reason: "line is not a JSON object".to_owned(),
                }))
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
    use serde_json::json;

    use super::*;

    async fn collect(body: &'static str) -> Vec<Result<SourceRecord, SourceError>> {
        records(Bytes::from_static(body.as_bytes())).collect().await
    }

    #[tokio::test]
    async fn test_objects_are_read_and_blanks_skipped() {
        let rows = collect("{\"ENTITY_ID\":\"E1\",\"n\":1}\n\n   \r\n{\"ENTITY_ID\":null}").await;

        assert_eq!(rows.len(), 2);
        let first = rows[0].as_ref().unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.fields["n"], json!(1));
        let second = rows[1].as_ref().unwrap();
        assert_eq!(second.index, 1);
        assert_eq!(second.fields["ENTITY_ID"], Value::Null);
    }

    #[tokio::test]
    async fn test_crlf_line_endings() {
        let rows = collect("{\"A\":\"x\"}\r\n{\"A\":\"y\"}\r\n").await;

        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn test_truncated_line_is_fatal() {
        let rows = collect("{\"A\":1}\n{\"A\":\n{\"A\":3}\n").await;

        assert_eq!(rows.len(), 2);
        assert!(matches!(rows[1], Err(SourceError::Read { index: 1, .. })));
    }

    #[tokio::test]
    async fn test_non_object_line_is_fatal() {
        let rows = collect("[1,2]\n").await;

        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_err());
    }
}
