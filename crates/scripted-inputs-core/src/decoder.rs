//! Stream Decoder: pipe bytes in, records out.
//!
//! [`FrameReader`] is the lazy frame sequence over an async reader.
//! [`StreamDecoder`] drives one to end-of-stream, decodes each frame and
//! hands the resulting [`OutputRecord`]s to the sink.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, warn};

use crate::decode::TextDecoder;
use crate::framing::{FrameOutcome, Framer, FramingPolicy};
use crate::sink::{OutputRecord, RecordSink};
use crate::stats::JobStats;

const READ_CHUNK: usize = 8 * 1024;

/// Finite, non-restartable sequence of frames read from `R`.
pub struct FrameReader<R> {
    reader: R,
    framer: Framer,
    pending: VecDeque<FrameOutcome>,
    buf: Box<[u8]>,
    eof: bool,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, policy: FramingPolicy, max_size: usize) -> Self {
        Self {
            reader,
            framer: Framer::new(policy, max_size),
            pending: VecDeque::new(),
            buf: vec![0; READ_CHUNK].into_boxed_slice(),
            eof: false,
            bytes_read: 0,
        }
    }

    /// Next frame, or `None` once the writer side has closed and every
    /// buffered frame was returned. A read error ends the sequence after
    /// the frames already assembled are handed out.
    pub async fn next_frame(&mut self) -> io::Result<Option<FrameOutcome>> {
        loop {
            if let Some(outcome) = self.pending.pop_front() {
                return Ok(Some(outcome));
            }
            if self.eof {
                return Ok(None);
            }

            match self.reader.read(&mut self.buf).await {
                Ok(0) => {
                    self.eof = true;
                    self.pending.extend(self.framer.finish());
                }
                Ok(n) => {
                    self.bytes_read += n as u64;
                    self.pending.extend(self.framer.push(&self.buf[..n]));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    self.eof = true;
                    self.pending.extend(self.framer.finish());
                    return Err(err);
                }
            }
        }
    }

    #[must_use]
    pub const fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

/// Totals for one decoder run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecodeSummary {
    pub frames_emitted: u64,
    pub frames_dropped: u64,
    pub frames_truncated: u64,
    pub bytes_read: u64,
}

/// Decodes frames and emits records for one job.
#[derive(Clone)]
pub struct StreamDecoder {
    policy: FramingPolicy,
    max_size: usize,
    decoder: Arc<dyn TextDecoder>,
    sink: Arc<dyn RecordSink>,
    attributes: Vec<(String, String)>,
    stats: Arc<JobStats>,
}

impl StreamDecoder {
    pub fn new(
        policy: FramingPolicy,
        max_size: usize,
        decoder: Arc<dyn TextDecoder>,
        sink: Arc<dyn RecordSink>,
        stats: Arc<JobStats>,
    ) -> Self {
        Self {
            policy,
            max_size,
            decoder,
            sink,
            attributes: Vec::new(),
            stats,
        }
    }

    /// Attach `key=value` to every emitted record. Empty values are skipped.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.attributes.push((key.into(), value));
        }
        self
    }

    /// Read `reader` to end-of-stream.
    pub async fn run<R: AsyncRead + Unpin>(&self, reader: R) -> DecodeSummary {
        let mut frames = FrameReader::new(reader, self.policy.clone(), self.max_size);
        let mut summary = DecodeSummary::default();

        loop {
            let outcome = match frames.next_frame().await {
                Ok(Some(outcome)) => outcome,
                Ok(None) => break,
                Err(err) => {
                    error!(error = %err, "Failed to read script output");
                    continue;
                }
            };

            match outcome {
                FrameOutcome::Oversized { size } => {
                    warn!(
                        frame_bytes = size,
                        max_log_size = self.max_size,
                        "Dropping frame larger than max_log_size"
                    );
                    summary.frames_dropped += 1;
                    self.stats.record_frame_dropped();
                }
                FrameOutcome::Complete(frame) => {
                    if frame.truncated {
                        warn!(
                            max_log_size = self.max_size,
                            "Script output exceeded max_log_size; truncating"
                        );
                        summary.frames_truncated += 1;
                        self.stats.record_frame_truncated();
                    }

                    match self.decoder.decode(&frame.bytes) {
                        Ok(text) => {
                            let mut record = OutputRecord::new(text);
                            for (key, value) in &self.attributes {
                                record.add_attribute(key.clone(), value.clone());
                            }
                            self.sink.emit(record);
                            summary.frames_emitted += 1;
                            self.stats.record_frame_emitted();
                        }
                        Err(err) => {
                            error!(error = %err, frame_bytes = frame.bytes.len(), "Failed to decode data");
                            summary.frames_dropped += 1;
                            self.stats.record_frame_dropped();
                        }
                    }
                }
            }
        }

        summary.bytes_read = frames.bytes_read();
        debug!(
            frames = summary.frames_emitted,
            dropped = summary.frames_dropped,
            bytes = summary.bytes_read,
            "Script output drained"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Encoding;
    use crate::sink::{MemorySink, SOURCE_ATTRIBUTE, SOURCETYPE_ATTRIBUTE};
    use regex::bytes::Regex;
    use tokio::io::AsyncWriteExt;

    fn decoder(policy: FramingPolicy, max: usize, encoding: Encoding) -> (StreamDecoder, MemorySink, Arc<JobStats>) {
        let sink = MemorySink::new();
        let stats = Arc::new(JobStats::new());
        let decoder = StreamDecoder::new(
            policy,
            max,
            Arc::new(encoding),
            Arc::new(sink.clone()),
            Arc::clone(&stats),
        );
        (decoder, sink, stats)
    }

    #[tokio::test]
    async fn single_record_without_patterns() {
        let (decoder, sink, _) = decoder(FramingPolicy::NoSplit, 1024, Encoding::Utf8);
        let summary = decoder.run(&b"lineA\nlineB\n"[..]).await;

        assert_eq!(summary.frames_emitted, 1);
        assert_eq!(summary.bytes_read, 12);
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].body, "lineA\nlineB\n");
        assert!(records[0].attributes.is_empty());
    }

    #[tokio::test]
    async fn line_start_pattern_groups_records() {
        let policy = FramingPolicy::LineStart(Regex::new(r"^\d").unwrap());
        let (decoder, sink, stats) = decoder(policy, 1024, Encoding::Utf8);
        decoder
            .run(&b"1 start\n  detail1\n  detail2\n2 start\n  detail3\n"[..])
            .await;

        let bodies: Vec<_> = sink.records().into_iter().map(|r| r.body).collect();
        assert_eq!(
            bodies,
            vec!["1 start\n  detail1\n  detail2", "2 start\n  detail3"]
        );
        assert_eq!(stats.snapshot().frames_emitted, 2);
    }

    #[tokio::test]
    async fn decode_failure_drops_only_that_frame() {
        let policy = FramingPolicy::LineStart(Regex::new(r"^#").unwrap());
        let (decoder, sink, stats) = decoder(policy, 1024, Encoding::Ascii);
        let summary = decoder.run(&b"#1 ok\n#2 caf\xc3\xa9\n#3 ok\n"[..]).await;

        assert_eq!(summary.frames_emitted, 2);
        assert_eq!(summary.frames_dropped, 1);
        let bodies: Vec<_> = sink.records().into_iter().map(|r| r.body).collect();
        assert_eq!(bodies, vec!["#1 ok", "#3 ok"]);
        assert_eq!(stats.snapshot().frames_dropped, 1);
    }

    #[tokio::test]
    async fn truncation_is_counted_not_fatal() {
        let (decoder, sink, stats) = decoder(FramingPolicy::NoSplit, 4, Encoding::Utf8);
        let summary = decoder.run(&b"abcdefgh"[..]).await;

        assert_eq!(summary.frames_truncated, 1);
        assert_eq!(sink.records()[0].body, "abcd");
        assert_eq!(stats.snapshot().frames_truncated, 1);
    }

    #[tokio::test]
    async fn attributes_attached_and_empty_values_skipped() {
        let (decoder, sink, _) = decoder(FramingPolicy::NoSplit, 64, Encoding::Utf8);
        let decoder = decoder
            .with_attribute(SOURCE_ATTRIBUTE, "cpu")
            .with_attribute(SOURCETYPE_ATTRIBUTE, "");
        decoder.run(&b"x"[..]).await;

        let record = &sink.records()[0];
        assert_eq!(record.attributes.len(), 1);
        assert_eq!(record.attributes[SOURCE_ATTRIBUTE], "cpu");
    }

    #[tokio::test]
    async fn frame_reader_is_not_restartable() {
        let mut reader = FrameReader::new(&b"only"[..], FramingPolicy::NoSplit, 64);
        assert!(matches!(
            reader.next_frame().await.unwrap(),
            Some(FrameOutcome::Complete(_))
        ));
        assert!(reader.next_frame().await.unwrap().is_none());
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reads_incrementally_from_a_live_pipe() {
        let policy = FramingPolicy::LineStart(Regex::new(r"^\d").unwrap());
        let (decoder, sink, _) = decoder(policy, 1024, Encoding::Utf8);
        let (mut writer, reader) = tokio::io::duplex(16);

        let task = tokio::spawn(async move { decoder.run(reader).await });
        writer.write_all(b"1 first\n cont\n").await.unwrap();
        writer.write_all(b"2 second\n").await.unwrap();
        drop(writer);

        let summary = task.await.unwrap();
        assert_eq!(summary.frames_emitted, 2);
        assert_eq!(sink.records()[1].body, "2 second");
    }
}
