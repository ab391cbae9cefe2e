//! Incremental response decoding
//!
//! The chat endpoint answers with newline-delimited records, each line
//! `data: <json>`, optionally closed by `data: [DONE]`. Chunks arrive with
//! arbitrary boundaries, so the decoder buffers raw bytes and only looks at a
//! line once its terminator has arrived. Buffering bytes rather than text
//! keeps multi-byte characters split across chunks intact.
//!
//! A line that fails to parse is counted and skipped; the rest of the stream
//! still contributes. Decoding stops at the first terminal marker (a delta
//! with `status: "finished"` or the `[DONE]` sentinel) or at end of stream.

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{ByteStream, ProviderError, Result};

const RECORD_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";
const FINISHED_STATUS: &str = "finished";

/// Token counters reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, alias = "input_tokens")]
    pub prompt_tokens: u64,
    #[serde(default, alias = "output_tokens")]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    fn normalized(mut self) -> Self {
        if self.total_tokens == 0 {
            self.total_tokens = self.prompt_tokens + self.completion_tokens;
        }
        self
    }
}

/// One decoded unit of an incremental response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRecord {
    Created { response_id: String },
    Delta { text: Option<String>, terminal: bool },
    Usage(Usage),
}

#[derive(Deserialize)]
struct RawRecord {
    #[serde(rename = "response.created")]
    created: Option<RawCreated>,
    choices: Option<Vec<RawChoice>>,
    usage: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawCreated {
    response_id: Option<String>,
}

#[derive(Deserialize)]
struct RawChoice {
    delta: Option<RawDelta>,
}

#[derive(Deserialize)]
struct RawDelta {
    content: Option<String>,
    status: Option<String>,
}

/// Result of looking at one complete line.
#[derive(Debug, PartialEq, Eq)]
enum Line {
    /// Blank or not a record line
    Ignored,
    /// `data: [DONE]`
    Done,
    Records(Vec<StreamRecord>),
    Malformed,
}

fn parse_line(line: &str) -> Line {
    let line = line.trim();
    let Some(payload) = line.strip_prefix(RECORD_PREFIX) else {
        return Line::Ignored;
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return Line::Ignored;
    }
    if payload == DONE_SENTINEL {
        return Line::Done;
    }

    let raw: RawRecord = match serde_json::from_str(payload) {
        Ok(raw) => raw,
        Err(_) => return Line::Malformed,
    };

    let mut records = Vec::new();
    if let Some(response_id) = raw.created.and_then(|c| c.response_id) {
        records.push(StreamRecord::Created { response_id });
    }
    if let Some(delta) = raw
        .choices
        .and_then(|choices| choices.into_iter().next())
        .and_then(|choice| choice.delta)
    {
        let terminal = delta.status.as_deref() == Some(FINISHED_STATUS);
        let text = delta.content.filter(|c| !c.is_empty());
        if text.is_some() || terminal {
            records.push(StreamRecord::Delta { text, terminal });
        }
    }
    // Counters are optional; a malformed usage block must not cost the text.
    if let Some(usage) = raw
        .usage
        .and_then(|u| serde_json::from_value::<Usage>(u).ok())
    {
        records.push(StreamRecord::Usage(usage.normalized()));
    }
    Line::Records(records)
}

/// Reassembled response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedResponse {
    /// Response id observed in the stream, or a generated `chatcmpl-` id
    pub id: String,
    /// Response id exactly as the provider reported it
    pub response_id: Option<String>,
    pub text: String,
    pub usage: Usage,
    pub finish_reason: &'static str,
    /// Whether a terminal marker was seen before the stream ended
    pub finished: bool,
    /// Record lines that could not be parsed
    pub skipped_records: usize,
}

/// Buffering decoder for record-framed byte streams.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    response_id: Option<String>,
    text: String,
    usage: Option<Usage>,
    finished: bool,
    skipped: usize,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk. Returns `true` once a terminal marker has been seen;
    /// further input is ignored after that.
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        if self.finished {
            return true;
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.apply(&String::from_utf8_lossy(&line));
            if self.finished {
                self.buffer.clear();
                break;
            }
        }
        self.finished
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Text accumulated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    fn apply(&mut self, line: &str) {
        match parse_line(line) {
            Line::Ignored => {}
            Line::Done => self.finished = true,
            Line::Malformed => {
                self.skipped += 1;
                debug!(skipped = self.skipped, "skipping unparsable stream record");
            }
            Line::Records(records) => {
                for record in records {
                    match record {
                        StreamRecord::Created { response_id } => {
                            self.response_id = Some(response_id);
                        }
                        StreamRecord::Delta { text, terminal } => {
                            if let Some(text) = text {
                                self.text.push_str(&text);
                            }
                            if terminal {
                                self.finished = true;
                            }
                        }
                        StreamRecord::Usage(usage) => self.usage = Some(usage),
                    }
                }
            }
        }
    }

    /// Produce the final value. An unterminated trailing line is discarded.
    pub fn finish(self) -> DecodedResponse {
        if !self.buffer.is_empty() {
            debug!(
                bytes = self.buffer.len(),
                "discarding unterminated trailing stream line"
            );
        }
        let id = self.response_id.clone().unwrap_or_else(|| {
            format!("chatcmpl-{}", chrono::Utc::now().timestamp_millis())
        });
        DecodedResponse {
            id,
            response_id: self.response_id,
            text: self.text,
            usage: self.usage.unwrap_or_default(),
            finish_reason: "stop",
            finished: self.finished,
            skipped_records: self.skipped,
        }
    }

    /// Drain a byte stream until a terminal marker, end of stream, or cancellation.
    pub async fn decode(mut stream: ByteStream, cancel: &CancellationToken) -> Result<DecodedResponse> {
        let mut decoder = StreamDecoder::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    if decoder.feed(&chunk) {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "stream interrupted");
                    return Err(e);
                }
                None => break,
            }
        }
        Ok(decoder.finish())
    }
}
