//! Server-Sent Events decoding for streamed model replies

use anyhow::{anyhow, Result};
use futures::stream::{self, Stream, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;

/// Splits a byte stream into SSE `data:` payloads.
///
/// Lines may be split across chunk boundaries (including inside a multi-byte
/// character), so raw bytes are buffered until a newline arrives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect the payloads of every completed line
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some(newline_pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            if let Some(payload) = Self::payload(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Flush a trailing line that was not terminated by a newline
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        Self::payload(&line)
    }

    fn payload(line: &[u8]) -> Option<String> {
        let line = String::from_utf8_lossy(line);
        let data = line.trim().strip_prefix("data:")?.trim_start();
        if data.is_empty() {
            None
        } else {
            Some(data.to_string())
        }
    }
}

struct DecodeState<S, F> {
    bytes: S,
    decoder: SseDecoder,
    parse: F,
    pending: VecDeque<Result<String>>,
    finished: bool,
    idle_timeout: Duration,
}

impl<S, F> DecodeState<S, F>
where
    F: FnMut(&str) -> Option<Result<String>>,
{
    fn queue(&mut self, payloads: impl IntoIterator<Item = String>) {
        for payload in payloads {
            if let Some(item) = (self.parse)(&payload) {
                self.pending.push_back(item);
            }
        }
    }
}

/// Turn an HTTP body stream into text deltas.
///
/// `parse` maps each `data:` payload to a delta, `None` to skip it, or an error.
/// The returned stream ends after the first error. There is no deadline on the
/// whole body; only a gap longer than `idle_timeout` between chunks fails it.
pub fn sse_deltas<S, B, E, F>(bytes: S, parse: F, idle_timeout: Duration) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
    F: FnMut(&str) -> Option<Result<String>> + Send + 'static,
{
    let state = DecodeState {
        bytes,
        decoder: SseDecoder::new(),
        parse,
        pending: VecDeque::new(),
        finished: false,
        idle_timeout,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                if item.is_err() {
                    state.pending.clear();
                    state.finished = true;
                }
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            let Ok(next) = tokio::time::timeout(state.idle_timeout, state.bytes.next()).await else {
                state
                    .pending
                    .push_back(Err(anyhow!("stream stalled: no data for {:?}", state.idle_timeout)));
                continue;
            };

            match next {
                Some(Ok(chunk)) => {
                    let payloads = state.decoder.push(chunk.as_ref());
                    state.queue(payloads);
                }
                Some(Err(e)) => {
                    state.pending.push_back(Err(e.into()));
                }
                None => {
                    state.finished = true;
                    let trailing = state.decoder.finish();
                    state.queue(trailing);
                }
            }
        }
    })
}
