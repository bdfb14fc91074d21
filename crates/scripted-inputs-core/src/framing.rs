//! Incremental framing of script output.
//!
//! A [`Framer`] is fed raw chunks as they arrive from the pipe and hands
//! back complete frames. It never looks at text; patterns match raw line
//! bytes, and decoding happens per frame afterwards.
//!
//! ```text
//! NoSplit    | whole stream ............................. | one frame, truncated at max
//! LineStart  | 1 start | detail | detail | 2 start | ... | a match opens a frame
//! LineEnd    | a | b | END | c | END | tail              | a match closes a frame
//! ```

use regex::bytes::Regex;

/// How the output stream is cut into frames.
#[derive(Debug, Clone, Default)]
pub enum FramingPolicy {
    /// The whole stream is one frame.
    #[default]
    NoSplit,
    /// A line matching the pattern begins a new frame.
    LineStart(Regex),
    /// A line matching the pattern ends the current frame.
    LineEnd(Regex),
}

impl FramingPolicy {
    #[must_use]
    pub const fn is_multiline(&self) -> bool {
        !matches!(self, Self::NoSplit)
    }
}

/// Raw bytes of one frame, prior to decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub bytes: Vec<u8>,
    /// Set when trailing bytes past the size limit were discarded.
    pub truncated: bool,
}

/// What the framer produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Complete(Frame),
    /// A multi-line group grew past the size limit and was discarded.
    Oversized { size: usize },
}

#[derive(Debug, Default)]
struct OpenFrame {
    bytes: Vec<u8>,
    size: usize,
    overflowed: bool,
}

/// Incremental frame splitter.
#[derive(Debug)]
pub struct Framer {
    policy: FramingPolicy,
    max_size: usize,
    /// Bytes of the line currently being assembled (pattern modes).
    line: Vec<u8>,
    /// The current line already blew past the limit; drop until newline.
    discarding_line: bool,
    open: Option<OpenFrame>,
    truncated: bool,
    finished: bool,
}

impl Framer {
    #[must_use]
    pub fn new(policy: FramingPolicy, max_size: usize) -> Self {
        Self {
            policy,
            max_size: max_size.max(1),
            line: Vec::new(),
            discarding_line: false,
            open: None,
            truncated: false,
            finished: false,
        }
    }

    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    /// Feed a chunk; returns every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<FrameOutcome> {
        let mut out = Vec::new();
        if self.finished || chunk.is_empty() {
            return out;
        }

        if !self.policy.is_multiline() {
            self.push_unsplit(chunk);
            return out;
        }

        let mut rest = chunk;
        while !rest.is_empty() {
            match rest.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    let (head, tail) = rest.split_at(pos + 1);
                    rest = tail;
                    if self.discarding_line {
                        self.discarding_line = false;
                        self.account_discarded(head.len());
                        continue;
                    }
                    let mut line = std::mem::take(&mut self.line);
                    line.extend_from_slice(head);
                    out.extend(self.process_line(line));
                }
                None => {
                    if self.discarding_line {
                        self.account_discarded(rest.len());
                    } else {
                        self.line.extend_from_slice(rest);
                        if self.line.len() > self.max_size {
                            let line = std::mem::take(&mut self.line);
                            out.extend(self.begin_discard(&line));
                        }
                    }
                    rest = &[];
                }
            }
        }

        out
    }

    /// Signal end-of-stream and flush whatever is still open.
    pub fn finish(&mut self) -> Vec<FrameOutcome> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.finished = true;

        if !self.policy.is_multiline() {
            if let Some(open) = self.open.take() {
                if !open.bytes.is_empty() {
                    out.push(FrameOutcome::Complete(Frame {
                        bytes: open.bytes,
                        truncated: self.truncated,
                    }));
                }
            }
            return out;
        }

        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            out.extend(self.process_line(line));
        }
        out.extend(self.close_open());
        out
    }

    fn push_unsplit(&mut self, chunk: &[u8]) {
        let open = self.open.get_or_insert_with(OpenFrame::default);
        let room = self.max_size.saturating_sub(open.bytes.len());
        let take = room.min(chunk.len());
        open.bytes.extend_from_slice(&chunk[..take]);
        open.size += chunk.len();
        if take < chunk.len() {
            self.truncated = true;
        }
    }

    fn process_line(&mut self, line: Vec<u8>) -> Vec<FrameOutcome> {
        let mut out = Vec::new();
        let content = trim_line_terminator(&line);

        match &self.policy {
            FramingPolicy::NoSplit => unreachable!("unsplit input never reaches line processing"),
            FramingPolicy::LineStart(pattern) => {
                if pattern.is_match(content) {
                    out.extend(self.close_open());
                }
                self.append(&line);
            }
            FramingPolicy::LineEnd(pattern) => {
                let closes = pattern.is_match(content);
                self.append(&line);
                if closes {
                    out.extend(self.close_open());
                }
            }
        }

        out
    }

    fn append(&mut self, line: &[u8]) {
        let max_size = self.max_size;
        let open = self.open.get_or_insert_with(OpenFrame::default);
        open.size += line.len();
        if open.overflowed {
            return;
        }
        if open.bytes.len() + line.len() > max_size {
            open.overflowed = true;
            open.bytes = Vec::new();
        } else {
            open.bytes.extend_from_slice(line);
        }
    }

    /// A line outgrew the limit before its newline arrived. A start match
    /// on its prefix still closes the previous frame.
    fn begin_discard(&mut self, partial: &[u8]) -> Option<FrameOutcome> {
        let starts = matches!(&self.policy, FramingPolicy::LineStart(p) if p.is_match(partial));
        let closed = if starts { self.close_open() } else { None };
        self.discarding_line = true;
        self.account_discarded(partial.len());
        closed
    }

    fn account_discarded(&mut self, len: usize) {
        let open = self.open.get_or_insert_with(OpenFrame::default);
        open.size += len;
        open.overflowed = true;
        open.bytes = Vec::new();
    }

    fn close_open(&mut self) -> Option<FrameOutcome> {
        let open = self.open.take()?;
        if open.overflowed {
            return Some(FrameOutcome::Oversized { size: open.size });
        }
        let mut bytes = open.bytes;
        let keep = trim_line_terminator(&bytes).len();
        bytes.truncate(keep);
        if bytes.is_empty() {
            return None;
        }
        Some(FrameOutcome::Complete(Frame {
            bytes,
            truncated: false,
        }))
    }
}

fn trim_line_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
