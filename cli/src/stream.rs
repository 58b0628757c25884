//! JSON-lines capture of a state-history stream: one `StreamMessage` per line.

use std::path::Path;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

use shipindex_core::error::IndexerError;
use shipindex_core::sequencer::ShipStream;
use shipindex_core::types::StreamMessage;

pub struct JsonLinesStream<R> {
    lines: Lines<R>,
    line: usize,
}

impl JsonLinesStream<BufReader<File>> {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, IndexerError> {
        let path = path.as_ref();
        let file = File::open(path)
            .await
            .map_err(|e| IndexerError::Stream(format!("cannot open {}: {e}", path.display())))?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: AsyncBufRead + Unpin> JsonLinesStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> ShipStream for JsonLinesStream<R> {
    async fn next(&mut self) -> Result<Option<StreamMessage>, IndexerError> {
        loop {
            let Some(text) = self
                .lines
                .next_line()
                .await
                .map_err(|e| IndexerError::Stream(format!("line {}: {e}", self.line + 1)))?
            else {
                return Ok(None);
            };
            self.line += 1;
            let text = text.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            return serde_json::from_str(text)
                .map(Some)
                .map_err(|e| IndexerError::Stream(format!("line {}: {e}", self.line)));
        }
    }
}
