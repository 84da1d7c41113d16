//! Incremental scanner for extraction markers embedded in model output.
//!
//! The scanner owns an append-only buffer of raw output. Each `push`
//! resumes from the last resolved position, so a marker split across any
//! number of chunks is recognised exactly once. Text that might still turn
//! out to be a marker is withheld from the visible output until it resolves.
//!
//! Recognised forms, for every [`TagKind`]:
//!
//! - inline: `[NAME: payload]`, closed by the first `]` on the same line
//! - block: `[NAME]payload[/NAME]`, payload may span lines

use crate::types::{ExtractedSignal, SignalFlags, TagKind};

/// What one `push` (or `finish`) produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanStep {
    /// Newly displayable text, markers removed.
    pub visible: String,
    /// Tags that completed with a non-empty payload, in output order.
    pub completed: Vec<TagKind>,
}

enum Resolution {
    /// The `[` is ordinary text.
    Literal,
    /// Not enough input yet to decide. `searched` bytes of the candidate
    /// have been checked for a block close already.
    Pending { searched: usize },
    /// A complete marker spanning `len` bytes.
    Tag {
        kind: TagKind,
        payload: String,
        len: usize,
    },
    /// A closing marker with no opener, spanning `len` bytes.
    StrayClose { len: usize },
}

/// Incremental tag scanner over one stream of output.
#[derive(Debug, Clone, Default)]
pub struct TagScanner {
    buffer: String,
    cursor: usize,
    /// How far past `cursor` a pending block body has been searched.
    searched: usize,
    visible: String,
    signals: Vec<ExtractedSignal>,
    finished: bool,
}

impl TagScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of raw output and resolve as much as possible.
    pub fn push(&mut self, chunk: &str) -> ScanStep {
        let mut step = ScanStep::default();
        if self.finished {
            return step;
        }
        self.buffer.push_str(chunk);

        loop {
            let rest = &self.buffer[self.cursor..];
            match rest.find('[') {
                None => {
                    step.visible.push_str(rest);
                    self.cursor = self.buffer.len();
                    break;
                }
                Some(offset) => {
                    step.visible.push_str(&rest[..offset]);
                    if offset > 0 {
                        self.cursor += offset;
                        self.searched = 0;
                    }
                }
            }

            let resolution = resolve(&self.buffer[self.cursor..], self.searched);
            if let Resolution::Pending { searched } = resolution {
                self.searched = searched;
                break;
            }
            self.searched = 0;
            match resolution {
                Resolution::Literal => {
                    step.visible.push('[');
                    self.cursor += 1;
                }
                Resolution::Pending { .. } => break,
                Resolution::Tag { kind, payload, len } => {
                    let validated = !payload.is_empty();
                    if validated {
                        step.completed.push(kind);
                    }
                    self.signals.push(ExtractedSignal {
                        tag: kind,
                        raw_payload: payload,
                        validated,
                    });
                    self.cursor += len;
                }
                Resolution::StrayClose { len } => self.cursor += len,
            }
        }

        self.visible.push_str(&step.visible);
        step
    }

    /// Resolve whatever is still withheld at end of stream.
    ///
    /// An opened but unclosed marker is never displayed; its payload is
    /// kept as an unvalidated signal. Withheld text that never got as far
    /// as a full marker name is released as ordinary text.
    pub fn finish(&mut self) -> ScanStep {
        let mut step = ScanStep::default();
        if self.finished {
            return step;
        }
        self.finished = true;

        let rest = &self.buffer[self.cursor..];
        if !rest.is_empty() {
            match unclosed_marker(rest) {
                Some((kind, salvage)) => self.signals.push(ExtractedSignal {
                    tag: kind,
                    raw_payload: salvage,
                    validated: false,
                }),
                None => step.visible.push_str(rest),
            }
            self.cursor = self.buffer.len();
        }

        self.visible.push_str(&step.visible);
        step
    }

    /// Everything pushed so far, markers included.
    pub fn raw(&self) -> &str {
        &self.buffer
    }

    /// Display text resolved so far, markers removed.
    pub fn visible(&self) -> &str {
        &self.visible
    }

    pub fn signals(&self) -> &[ExtractedSignal] {
        &self.signals
    }

    pub fn flags(&self) -> SignalFlags {
        SignalFlags::from_signals(&self.signals)
    }

    /// Whether some text is being withheld pending more input.
    pub fn is_holding(&self) -> bool {
        self.cursor < self.buffer.len()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Strip every marker from a complete text.
pub fn strip_tags(text: &str) -> (String, Vec<ExtractedSignal>) {
    let mut scanner = TagScanner::new();
    scanner.push(text);
    scanner.finish();
    (scanner.visible, scanner.signals)
}

fn openers(kind: TagKind) -> (String, String, String) {
    let name = kind.marker();
    (
        format!("[{}:", name),
        format!("[{}]", name),
        format!("[/{}]", name),
    )
}

/// Largest char boundary of `text` at or below `index`.
fn floor_boundary(text: &str, index: usize) -> usize {
    let mut index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Classify the text starting at a `[`.
///
/// `searched` is how much of `rest` an earlier call already scanned for a
/// block close; only the tail after it (plus room for a split close) is
/// searched again.
fn resolve(rest: &str, searched: usize) -> Resolution {
    for kind in TagKind::ALL {
        let (inline, block, close) = openers(kind);

        if let Some(body) = rest.strip_prefix(inline.as_str()) {
            return match body.find([']', '\n']) {
                Some(i) if body[i..].starts_with(']') => Resolution::Tag {
                    kind,
                    payload: body[..i].trim().to_string(),
                    len: inline.len() + i + 1,
                },
                Some(_) => Resolution::Literal,
                None => Resolution::Pending { searched: 0 },
            };
        }

        if let Some(body) = rest.strip_prefix(block.as_str()) {
            let from = floor_boundary(
                body,
                searched.saturating_sub(block.len() + close.len() - 1),
            );
            return match body[from..].find(close.as_str()) {
                Some(i) => Resolution::Tag {
                    kind,
                    payload: body[..from + i].trim().to_string(),
                    len: block.len() + from + i + close.len(),
                },
                None => Resolution::Pending {
                    searched: rest.len(),
                },
            };
        }

        if rest.starts_with(close.as_str()) {
            return Resolution::StrayClose { len: close.len() };
        }
    }

    let could_become_marker = TagKind::ALL.into_iter().any(|kind| {
        let (inline, block, close) = openers(kind);
        inline.starts_with(rest) || block.starts_with(rest) || close.starts_with(rest)
    });
    if could_become_marker {
        Resolution::Pending { searched: 0 }
    } else {
        Resolution::Literal
    }
}

/// An opened marker left unclosed at end of stream, with its partial body.
fn unclosed_marker(rest: &str) -> Option<(TagKind, String)> {
    TagKind::ALL.into_iter().find_map(|kind| {
        let (inline, block, _) = openers(kind);
        rest.strip_prefix(inline.as_str())
            .or_else(|| rest.strip_prefix(block.as_str()))
            .map(|body| (kind, body.trim().to_string()))
    })
}
