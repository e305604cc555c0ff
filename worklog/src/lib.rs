//! Worklog domain library.
//! Markdown worklogs are parsed into header and fence blocks, headers carry an optional
//! TODO/DONE keyword, and finished sections can be sunk below unfinished ones.
//! Every query re-derives its blocks from the current text; nothing survives an edit.

pub mod core {
    use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
    use serde::{Deserialize, Serialize};
    use std::{fmt, path::PathBuf};

    /* ------------------------------ Blocks ------------------------------ */

    /// Inclusive line range covered by a block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct LineSpan {
        pub start: usize,
        pub end: usize,
    }

    impl LineSpan {
        pub fn new(start: usize, end: usize) -> Self {
            Self { start, end }
        }

        pub fn contains(&self, line: usize) -> bool {
            self.start <= line && line <= self.end
        }

        #[allow(clippy::len_without_is_empty)]
        pub fn len(&self) -> usize {
            self.end - self.start + 1
        }
    }

    /// Block-level construct reported by the parser.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    pub enum BlockKind {
        /// ATX heading; `level` is the marker count (1..=6).
        Heading { level: u8 },
        /// Fenced code block. `content` is the body without the marker lines.
        Fence {
            info: String,
            content: String,
            closed: bool,
        },
        Other,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Block {
        pub kind: BlockKind,
        /// Number of open containers (list, item, blockquote, footnote) around the block.
        pub nesting_depth: usize,
        pub span: LineSpan,
    }

    impl Block {
        pub fn is_top_level(&self) -> bool {
            self.nesting_depth == 0
        }

        pub fn heading_level(&self) -> Option<u8> {
            match self.kind {
                BlockKind::Heading { level } => Some(level),
                _ => None,
            }
        }

        pub fn is_fence(&self) -> bool {
            matches!(self.kind, BlockKind::Fence { .. })
        }

        /// First word of a fence's info string.
        pub fn language(&self) -> Option<&str> {
            match &self.kind {
                BlockKind::Fence { info, .. } => info.split_whitespace().next(),
                _ => None,
            }
        }
    }

    /* ------------------------------ Headers ------------------------------ */

    /// TODO keyword state; cycles `"" -> TODO -> DONE -> ""`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub enum TodoState {
        #[default]
        #[serde(rename = "")]
        None,
        #[serde(rename = "TODO")]
        Todo,
        #[serde(rename = "DONE")]
        Done,
    }

    impl TodoState {
        pub const CYCLE: [TodoState; 3] = [TodoState::None, TodoState::Todo, TodoState::Done];

        pub fn from_keyword(word: &str) -> Self {
            match word {
                "TODO" => TodoState::Todo,
                "DONE" => TodoState::Done,
                _ => TodoState::None,
            }
        }

        pub fn keyword(self) -> &'static str {
            match self {
                TodoState::None => "",
                TodoState::Todo => "TODO",
                TodoState::Done => "DONE",
            }
        }

        pub fn index(self) -> usize {
            match self {
                TodoState::None => 0,
                TodoState::Todo => 1,
                TodoState::Done => 2,
            }
        }

        /// Step `delta` positions around the cycle, wrapping in both directions.
        pub fn cycle(self, delta: i32) -> Self {
            let len = Self::CYCLE.len() as i32;
            let next = (self.index() as i32 + delta).rem_euclid(len);
            Self::CYCLE[next as usize]
        }

        pub fn is_done(self) -> bool {
            self == TodoState::Done
        }
    }

    impl fmt::Display for TodoState {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.keyword())
        }
    }

    /// What a single header line says about itself.
    ///
    /// A line without marker characters yields the default value (`level == 0`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct HeaderInfo {
        pub leading_space_width: usize,
        /// Number of `#` markers.
        pub level: usize,
        pub trailing_space_width: usize,
        pub todo_state: TodoState,
    }

    impl HeaderInfo {
        pub fn is_header(&self) -> bool {
            self.level > 0
        }

        pub fn todo_state_index(&self) -> usize {
            self.todo_state.index()
        }

        /// Column where the first word (and so the TODO keyword) starts.
        pub fn keyword_column(&self) -> usize {
            self.leading_space_width + self.level + self.trailing_space_width
        }

        /// Indentation used for the `CLOSED:` line under this header.
        pub fn annotation_indent(&self) -> usize {
            self.leading_space_width + self.level + 1
        }
    }

    /// Completion timestamp as written in a `CLOSED: [Y-M-D H:M]` line.
    ///
    /// Fields are kept as written; `to_datetime` validates them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ClosedStamp {
        pub year: i32,
        pub month: u32,
        pub day: u32,
        pub hour: u32,
        pub minute: u32,
    }

    impl ClosedStamp {
        pub fn from_datetime(at: NaiveDateTime) -> Self {
            Self {
                year: at.year(),
                month: at.month(),
                day: at.day(),
                hour: at.hour(),
                minute: at.minute(),
            }
        }

        pub fn to_datetime(&self) -> Option<NaiveDateTime> {
            NaiveDate::from_ymd_opt(self.year, self.month, self.day)?
                .and_hms_opt(self.hour, self.minute, 0)
        }

        /// The annotation text without indentation.
        pub fn annotation(&self) -> String {
            format!("CLOSED: {self}")
        }
    }

    impl fmt::Display for ClosedStamp {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "[{}-{}-{} {}:{}]",
                self.year, self.month, self.day, self.hour, self.minute
            )
        }
    }

    /* ------------------------------ Queries ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Direction {
        Forward,
        Backward,
    }

    /// Level predicate for header lookups. One predicate per query.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum LevelFilter {
        #[default]
        Any,
        AtLeast(u8),
        Exactly(u8),
    }

    impl LevelFilter {
        pub fn matches(self, level: u8) -> bool {
            match self {
                LevelFilter::Any => true,
                LevelFilter::AtLeast(min) => level >= min,
                LevelFilter::Exactly(exact) => level == exact,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct HeaderQuery {
        pub direction: Direction,
        pub from_line: usize,
        pub include_from_line: bool,
        #[serde(default)]
        pub level: LevelFilter,
        pub lower_bound: Option<usize>,
        pub upper_bound: Option<usize>,
    }

    impl HeaderQuery {
        pub fn forward(from_line: usize) -> Self {
            Self::new(Direction::Forward, from_line)
        }

        pub fn backward(from_line: usize) -> Self {
            Self::new(Direction::Backward, from_line)
        }

        pub fn new(direction: Direction, from_line: usize) -> Self {
            Self {
                direction,
                from_line,
                include_from_line: false,
                level: LevelFilter::Any,
                lower_bound: None,
                upper_bound: None,
            }
        }

        pub fn including_current(mut self) -> Self {
            self.include_from_line = true;
            self
        }

        pub fn with_level(mut self, level: LevelFilter) -> Self {
            self.level = level;
            self
        }

        pub fn within(mut self, lower: Option<usize>, upper: Option<usize>) -> Self {
            self.lower_bound = lower;
            self.upper_bound = upper;
            self
        }

        pub fn in_bounds(&self, line: usize) -> bool {
            self.lower_bound.is_none_or(|lower| line >= lower)
                && self.upper_bound.is_none_or(|upper| line <= upper)
        }
    }

    /* ------------------------------- Edits ------------------------------- */

    /// Zero-based position; `character` counts Unicode scalar values.
    #[derive(
        Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    )]
    pub struct Position {
        pub line: usize,
        pub character: usize,
    }

    impl Position {
        pub fn new(line: usize, character: usize) -> Self {
            Self { line, character }
        }
    }

    /// Half-open range `[start, end)`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct TextRange {
        pub start: Position,
        pub end: Position,
    }

    impl TextRange {
        pub fn new(start: Position, end: Position) -> Self {
            Self { start, end }
        }

        pub fn empty(at: Position) -> Self {
            Self { start: at, end: at }
        }
    }

    /// One text edit. A batch of edits always refers to a single snapshot.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "kind", rename_all = "lowercase")]
    pub enum Edit {
        Insert { at: Position, text: String },
        Delete { range: TextRange },
        Replace { range: TextRange, text: String },
    }

    impl Edit {
        pub fn range(&self) -> TextRange {
            match self {
                Edit::Insert { at, .. } => TextRange::empty(*at),
                Edit::Delete { range } | Edit::Replace { range, .. } => *range,
            }
        }

        pub fn text(&self) -> &str {
            match self {
                Edit::Insert { text, .. } | Edit::Replace { text, .. } => text,
                Edit::Delete { .. } => "",
            }
        }
    }

    /* ------------------------------ Errors ------------------------------ */

    /// Integration failures. Lookups that find nothing are `None`, not errors.
    #[derive(Debug, thiserror::Error)]
    pub enum WorklogError {
        #[error("no active document")]
        NoActiveEditor,
        #[error("cursor line {line} is outside the document ({line_count} lines)")]
        CursorOutOfBounds { line: usize, line_count: usize },
        #[error("edit range {start:?}..{end:?} is inverted")]
        InvertedRange { start: Position, end: Position },
        #[error("edit at {at:?} overlaps another edit in the same batch")]
        OverlappingEdits { at: Position },
        #[error("reading config {path:?}")]
        ConfigIo {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("parsing config {path:?}")]
        ConfigFormat {
            path: PathBuf,
            #[source]
            source: serde_json::Error,
        },
    }
}

pub mod config {
    //! Read-only settings consumed by the TODO state machine.

    use crate::core::WorklogError;
    use serde::{Deserialize, Serialize};
    use std::{fs, path::Path};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(default)]
    pub struct WorklogConfig {
        /// Write a `CLOSED: [...]` line under headers entering DONE.
        pub insert_closed_timestamp: bool,
    }

    impl WorklogConfig {
        /// Load settings from a JSON file; missing keys take their defaults.
        pub fn load(path: &Path) -> Result<Self, WorklogError> {
            let text = fs::read_to_string(path).map_err(|source| WorklogError::ConfigIo {
                path: path.to_path_buf(),
                source,
            })?;
            serde_json::from_str(&text).map_err(|source| WorklogError::ConfigFormat {
                path: path.to_path_buf(),
                source,
            })
        }

        pub fn with_timestamps(mut self, enabled: bool) -> Self {
            self.insert_closed_timestamp = enabled;
            self
        }
    }

}

pub mod editor {
    //! Text snapshots, edit application, and the seam to the host editor.

    use crate::core::*;

    /* ---------------------------- Line index ---------------------------- */

    /// Line lookups over one text snapshot.
    ///
    /// A text with `n` newlines has `n + 1` lines; a trailing `\r` is not part of a line.
    #[derive(Debug, Clone)]
    pub struct LineIndex<'a> {
        text: &'a str,
        starts: Vec<usize>,
    }

    impl<'a> LineIndex<'a> {
        pub fn new(text: &'a str) -> Self {
            let mut starts = vec![0];
            starts.extend(text.match_indices('\n').map(|(at, _)| at + 1));
            Self { text, starts }
        }

        pub fn text(&self) -> &'a str {
            self.text
        }

        pub fn line_count(&self) -> usize {
            self.starts.len()
        }

        pub fn last_line(&self) -> usize {
            self.starts.len() - 1
        }

        pub fn ends_with_newline(&self) -> bool {
            self.text.ends_with('\n')
        }

        /// Last line that holds content; the empty line after a final newline does not count.
        pub fn last_content_line(&self) -> usize {
            if self.ends_with_newline() {
                self.last_line() - 1
            } else {
                self.last_line()
            }
        }

        /// Line containing byte `offset`.
        pub fn line_of(&self, offset: usize) -> usize {
            self.starts.partition_point(|start| *start <= offset) - 1
        }

        /// Byte offset where `line` starts; past the end this is the text length.
        pub fn line_start(&self, line: usize) -> usize {
            self.starts.get(line).copied().unwrap_or(self.text.len())
        }

        fn content_end(&self, line: usize) -> usize {
            let end = match self.starts.get(line + 1) {
                Some(next) => next - 1,
                None => self.text.len(),
            };
            let start = self.line_start(line);
            if end > start && self.text.as_bytes()[end - 1] == b'\r' {
                end - 1
            } else {
                end
            }
        }

        /// Terminator of `line` as written: `"\r\n"`, `"\n"`, or empty for the last line.
        pub fn line_ending(&self, line: usize) -> &'a str {
            if line >= self.last_line() {
                return "";
            }
            &self.text[self.content_end(line)..self.line_start(line + 1)]
        }

        /// The document's newline style, taken from its first line break.
        pub fn newline(&self) -> &'static str {
            match self.line_ending(0) {
                "\r\n" => "\r\n",
                _ => "\n",
            }
        }

        pub fn line(&self, line: usize) -> Option<&'a str> {
            if line >= self.line_count() {
                return None;
            }
            Some(&self.text[self.line_start(line)..self.content_end(line)])
        }

        pub fn line_end(&self, line: usize) -> Position {
            let width = self.line(line).map(|s| s.chars().count()).unwrap_or(0);
            Position::new(line, width)
        }

        pub fn end_position(&self) -> Position {
            self.line_end(self.last_line())
        }

        /// Byte offset of `pos`, clamped to the line end and to the document end.
        pub fn offset_of(&self, pos: Position) -> usize {
            let Some(content) = self.line(pos.line) else {
                return self.text.len();
            };
            let start = self.line_start(pos.line);
            let within = content
                .char_indices()
                .nth(pos.character)
                .map(|(at, _)| at)
                .unwrap_or(content.len());
            start + within
        }

        /// Raw text of the inclusive line span, including the newline after its last line.
        pub fn slice_lines(&self, span: LineSpan) -> &'a str {
            &self.text[self.line_start(span.start)..self.line_start(span.end + 1)]
        }
    }

    /* ------------------------------ Batches ------------------------------ */

    /// Apply a batch of edits that all refer to `text`.
    ///
    /// Edits may not overlap; inserts at the same position land in batch order.
    pub fn apply_edits(text: &str, edits: &[Edit]) -> Result<String, WorklogError> {
        let index = LineIndex::new(text);
        let mut resolved = Vec::with_capacity(edits.len());
        for edit in edits {
            let range = edit.range();
            let start = index.offset_of(range.start);
            let end = index.offset_of(range.end);
            if end < start {
                return Err(WorklogError::InvertedRange {
                    start: range.start,
                    end: range.end,
                });
            }
            resolved.push((start, end, range.start, edit.text()));
        }
        resolved.sort_by_key(|(start, end, _, _)| (*start, *end));
        for pair in resolved.windows(2) {
            if pair[1].0 < pair[0].1 {
                return Err(WorklogError::OverlappingEdits { at: pair[1].2 });
            }
        }

        let mut out = String::with_capacity(text.len());
        let mut copied = 0;
        for (start, end, _, replacement) in resolved {
            out.push_str(&text[copied..start]);
            out.push_str(replacement);
            copied = end;
        }
        out.push_str(&text[copied..]);
        Ok(out)
    }

    /* ------------------------------ Editor seam ------------------------------ */

    /// What the core needs from the host editor.
    pub trait TextEditor {
        /// Current document text. Callers re-read it after every applied edit.
        fn text(&self) -> String;

        fn cursor_line(&self) -> usize;

        fn set_cursor_line(&mut self, line: usize);

        fn select(&mut self, range: TextRange);

        /// Apply a batch atomically: either every edit lands or none does.
        fn apply(&mut self, edits: &[Edit]) -> Result<(), WorklogError>;
    }

    /// In-memory document with a cursor and an optional selection.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct Buffer {
        text: String,
        cursor: Position,
        selection: Option<TextRange>,
    }

    impl Buffer {
        pub fn new(text: impl Into<String>) -> Self {
            Self {
                text: text.into(),
                cursor: Position::default(),
                selection: None,
            }
        }

        pub fn with_cursor_line(mut self, line: usize) -> Self {
            self.cursor = Position::new(line, 0);
            self
        }

        pub fn as_str(&self) -> &str {
            &self.text
        }

        pub fn into_text(self) -> String {
            self.text
        }

        pub fn cursor(&self) -> Position {
            self.cursor
        }

        pub fn selection(&self) -> Option<TextRange> {
            self.selection
        }
    }

    impl TextEditor for Buffer {
        fn text(&self) -> String {
            self.text.clone()
        }

        fn cursor_line(&self) -> usize {
            self.cursor.line
        }

        fn set_cursor_line(&mut self, line: usize) {
            self.cursor = Position::new(line, 0);
            self.selection = None;
        }

        fn select(&mut self, range: TextRange) {
            self.cursor = range.end;
            self.selection = Some(range);
        }

        fn apply(&mut self, edits: &[Edit]) -> Result<(), WorklogError> {
            self.text = apply_edits(&self.text, edits)?;
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn line_count_follows_editor_conventions() {
            assert_eq!(LineIndex::new("").line_count(), 1);
            assert_eq!(LineIndex::new("a").line_count(), 1);
            assert_eq!(LineIndex::new("a\n").line_count(), 2);
            let index = LineIndex::new("a\r\nb\n");
            assert_eq!(index.line(0), Some("a"));
            assert_eq!(index.line(1), Some("b"));
            assert_eq!(index.line(2), Some(""));
            assert_eq!(index.line(3), None);
            assert_eq!(index.line_of(3), 1);
        }

        #[test]
        fn new_buffers_start_at_the_origin() {
            assert_eq!(Buffer::default().cursor(), Position::new(0, 0));
            assert_eq!(Buffer::default().as_str(), "");
            let buffer = Buffer::new("a\nb");
            assert_eq!(buffer.cursor(), Position::default());
            assert_eq!(buffer.selection(), None);
        }

        #[test]
        fn line_endings_are_reported_as_written() {
            let crlf = LineIndex::new("a\r\nb\r\nc");
            assert_eq!(crlf.line_ending(0), "\r\n");
            assert_eq!(crlf.line_ending(2), "");
            assert_eq!(crlf.newline(), "\r\n");
            assert_eq!(crlf.line_end(0), Position::new(0, 1));

            let lf = LineIndex::new("a\nb");
            assert_eq!(lf.line_ending(0), "\n");
            assert_eq!(lf.newline(), "\n");
            assert_eq!(LineIndex::new("single").newline(), "\n");
        }

        #[test]
        fn slice_lines_keeps_trailing_newline() {
            let index = LineIndex::new("one\ntwo\nthree");
            assert_eq!(index.slice_lines(LineSpan::new(0, 1)), "one\ntwo\n");
            assert_eq!(index.slice_lines(LineSpan::new(2, 2)), "three");
        }

        #[test]
        fn batch_positions_refer_to_the_original_snapshot() {
            let text = "# TODO a\nbody\n";
            let edits = vec![
                Edit::Replace {
                    range: TextRange::new(Position::new(0, 2), Position::new(0, 7)),
                    text: "DONE ".into(),
                },
                Edit::Insert {
                    at: Position::new(0, 8),
                    text: "\n  CLOSED: [2024-1-2 3:4]".into(),
                },
                Edit::Insert {
                    at: Position::new(1, 4),
                    text: "!".into(),
                },
            ];
            let out = apply_edits(text, &edits).expect("apply");
            assert_eq!(out, "# DONE a\n  CLOSED: [2024-1-2 3:4]\nbody!\n");
        }

        #[test]
        fn positions_clamp_to_line_and_document_end() {
            let out = apply_edits(
                "ab\ncd",
                &[
                    Edit::Insert {
                        at: Position::new(0, 40),
                        text: "X".into(),
                    },
                    Edit::Insert {
                        at: Position::new(9, 0),
                        text: "Y".into(),
                    },
                ],
            )
            .expect("apply");
            assert_eq!(out, "abX\ncdY");
        }

        #[test]
        fn characters_count_scalar_values() {
            let out = apply_edits(
                "# héllo\n",
                &[Edit::Delete {
                    range: TextRange::new(Position::new(0, 3), Position::new(0, 4)),
                }],
            )
            .expect("apply");
            assert_eq!(out, "# hllo\n");
        }

        #[test]
        fn overlapping_edits_are_rejected_without_changes() {
            let mut buffer = Buffer::new("abcdef");
            let err = buffer
                .apply(&[
                    Edit::Delete {
                        range: TextRange::new(Position::new(0, 0), Position::new(0, 3)),
                    },
                    Edit::Replace {
                        range: TextRange::new(Position::new(0, 2), Position::new(0, 4)),
                        text: "z".into(),
                    },
                ])
                .expect_err("overlap");
            assert!(matches!(err, WorklogError::OverlappingEdits { .. }));
            assert_eq!(buffer.as_str(), "abcdef");
        }
    }
}

pub mod parser {
    //! Block parser on `pulldown-cmark`, plus `nom` parsers for header lines and
    //! `CLOSED:` annotations.
    //!
    //! Only block structure matters here: headings, fences, and the line ranges they span.
    //! Anything inside a list item, blockquote or footnote reports a nonzero nesting depth,
    //! and fence bodies never produce headings.

    use crate::core::*;
    use crate::editor::LineIndex;
    use nom::{
        IResult,
        bytes::complete::{tag, take_while, take_while_m_n, take_while1},
        character::complete::{char, space0, space1},
        combinator::{eof, map_res},
        error::VerboseError,
        sequence::tuple,
    };
    use pulldown_cmark::{
        CodeBlockKind, Event, HeadingLevel, Options, Parser as CmarkParser, Tag, TagEnd,
    };
    use std::ops::Range;

    /* ------------------------------ Blocks ------------------------------ */

    struct OpenFence {
        range: Range<usize>,
        info: String,
        content: String,
        depth: usize,
    }

    /// Parse `text` into blocks in document order.
    ///
    /// Unterminated fences run to the end of the document.
    pub fn parse_blocks(text: &str) -> Vec<Block> {
        let index = LineIndex::new(text);
        let options = Options::ENABLE_TABLES
            | Options::ENABLE_STRIKETHROUGH
            | Options::ENABLE_TASKLISTS
            | Options::ENABLE_FOOTNOTES;

        let mut blocks = Vec::new();
        // End offsets of the containers enclosing the current event.
        let mut containers: Vec<usize> = Vec::new();
        let mut fence: Option<OpenFence> = None;

        for (event, range) in CmarkParser::new_ext(text, options).into_offset_iter() {
            while containers.last().is_some_and(|end| *end <= range.start) {
                containers.pop();
            }
            let depth = containers.len();

            match event {
                Event::Start(Tag::Heading { level, .. }) => {
                    let span = span_of(&index, &range);
                    // Container markers (`>`, `-`) precede the heading's own range.
                    let is_atx = text
                        .get(range.start..)
                        .map(|rest| header_info_from_line(rest).is_header())
                        .unwrap_or(false);
                    let kind = if is_atx {
                        BlockKind::Heading {
                            level: heading_level_to_u8(level),
                        }
                    } else {
                        BlockKind::Other
                    };
                    blocks.push(Block {
                        kind,
                        nesting_depth: depth,
                        span,
                    });
                }
                Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) => {
                    fence = Some(OpenFence {
                        range,
                        info: info.to_string(),
                        content: String::new(),
                        depth,
                    });
                }
                Event::Start(Tag::CodeBlock(CodeBlockKind::Indented))
                | Event::Start(Tag::Paragraph)
                | Event::Start(Tag::Table(_))
                | Event::Start(Tag::HtmlBlock)
                | Event::Rule => {
                    blocks.push(Block {
                        kind: BlockKind::Other,
                        nesting_depth: depth,
                        span: span_of(&index, &range),
                    });
                }
                Event::Start(Tag::BlockQuote(_)) | Event::Start(Tag::List(_)) => {
                    blocks.push(Block {
                        kind: BlockKind::Other,
                        nesting_depth: depth,
                        span: span_of(&index, &range),
                    });
                    containers.push(range.end);
                }
                Event::Start(Tag::Item) | Event::Start(Tag::FootnoteDefinition(_)) => {
                    containers.push(range.end);
                }
                Event::Text(body) => {
                    if let Some(open) = fence.as_mut() {
                        open.content.push_str(&body);
                    }
                }
                Event::End(TagEnd::CodeBlock) => {
                    if let Some(open) = fence.take() {
                        blocks.push(close_fence(&index, open));
                    }
                }
                _ => {}
            }
        }

        blocks
    }

    fn close_fence(index: &LineIndex<'_>, open: OpenFence) -> Block {
        let span = span_of(index, &open.range);
        let closed = span.end > span.start
            && index
                .line(span.end)
                .map(is_fence_marker_line)
                .unwrap_or(false);
        Block {
            kind: BlockKind::Fence {
                info: open.info,
                content: open.content,
                closed,
            },
            nesting_depth: open.depth,
            span,
        }
    }

    /// A bare closing fence: three or more backticks or tildes and nothing else.
    fn is_fence_marker_line(line: &str) -> bool {
        let trimmed = line.trim();
        let Some(marker) = trimmed.chars().next() else {
            return false;
        };
        (marker == '`' || marker == '~')
            && trimmed.len() >= 3
            && trimmed.chars().all(|c| c == marker)
    }

    fn span_of(index: &LineIndex<'_>, range: &Range<usize>) -> LineSpan {
        let start = index.line_of(range.start);
        let last_byte = range.end.saturating_sub(1).max(range.start);
        LineSpan::new(start, index.line_of(last_byte).max(start))
    }

    fn heading_level_to_u8(level: HeadingLevel) -> u8 {
        match level {
            HeadingLevel::H1 => 1,
            HeadingLevel::H2 => 2,
            HeadingLevel::H3 => 3,
            HeadingLevel::H4 => 4,
            HeadingLevel::H5 => 5,
            HeadingLevel::H6 => 6,
        }
    }

    /* ---------------------------- Header lines ---------------------------- */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// leading whitespace, markers, whitespace, first word
    fn header_prefix(i: &str) -> PResult<'_, (&str, &str, &str, &str)> {
        tuple((
            space0,
            take_while1(|c: char| c == '#'),
            space0,
            take_while(|c: char| !c.is_whitespace()),
        ))(i)
    }

    /// Describe a raw header line. Non-header lines yield `HeaderInfo::default()`.
    pub fn header_info_from_line(line: &str) -> HeaderInfo {
        match header_prefix(line) {
            Ok((_, (leading, markers, trailing, word))) => HeaderInfo {
                leading_space_width: leading.chars().count(),
                level: markers.len(),
                trailing_space_width: trailing.chars().count(),
                todo_state: TodoState::from_keyword(word),
            },
            Err(_) => HeaderInfo::default(),
        }
    }

    /* -------------------------- Completion stamps -------------------------- */

    fn number<'a>(min: usize, max: usize) -> impl FnMut(&'a str) -> PResult<'a, u32> {
        map_res(
            take_while_m_n(min, max, |c: char| c.is_ascii_digit()),
            |digits: &str| digits.parse::<u32>(),
        )
    }

    fn closed_stamp(i: &str) -> PResult<'_, ClosedStamp> {
        let (i, _) = space0(i)?;
        let (i, _) = tag("CLOSED:")(i)?;
        let (i, _) = space1(i)?;
        let (i, _) = char('[')(i)?;
        let (i, year) = map_res(
            take_while_m_n(4, 4, |c: char| c.is_ascii_digit()),
            |digits: &str| digits.parse::<i32>(),
        )(i)?;
        let (i, _) = char('-')(i)?;
        let (i, month) = number(1, 2)(i)?;
        let (i, _) = char('-')(i)?;
        let (i, day) = number(1, 2)(i)?;
        let (i, _) = space1(i)?;
        let (i, hour) = number(1, 2)(i)?;
        let (i, _) = char(':')(i)?;
        let (i, minute) = number(1, 2)(i)?;
        let (i, _) = char(']')(i)?;
        let (i, _) = space0(i)?;
        let (i, _) = eof(i)?;
        Ok((
            i,
            ClosedStamp {
                year,
                month,
                day,
                hour,
                minute,
            },
        ))
    }

    /// Parse a whole line as a completion annotation (`  CLOSED: [2024-3-5 9:07]`).
    pub fn parse_closed_line(line: &str) -> Option<ClosedStamp> {
        closed_stamp(line).ok().map(|(_, stamp)| stamp)
    }

}

pub mod navigator {
    //! Header lookups over a parsed block sequence.
    //!
    //! `find_header` is the single lookup every navigation and state-changing
    //! command goes through.

    use crate::core::*;

    /// Nearest top-level header matching `query`, or `None`.
    pub fn find_header(blocks: &[Block], query: &HeaderQuery) -> Option<usize> {
        let candidates = blocks
            .iter()
            .filter(|block| block.is_top_level())
            .filter_map(|block| block.heading_level().map(|level| (block.span.start, level)))
            .filter(|(line, level)| {
                query.level.matches(*level)
                    && query.in_bounds(*line)
                    && (query.include_from_line || *line != query.from_line)
            })
            .map(|(line, _)| line);

        match query.direction {
            Direction::Forward => candidates.filter(|line| *line >= query.from_line).min(),
            Direction::Backward => candidates.filter(|line| *line <= query.from_line).max(),
        }
    }

    /// The header governing `line`: the nearest one at or above it.
    pub fn enclosing_header(blocks: &[Block], line: usize) -> Option<usize> {
        find_header(blocks, &HeaderQuery::backward(line).including_current())
    }

    /// Level of the top-level header starting at `line`.
    pub fn header_level_at(blocks: &[Block], line: usize) -> Option<u8> {
        blocks
            .iter()
            .filter(|block| block.is_top_level() && block.span.start == line)
            .find_map(Block::heading_level)
    }

    /// Lines strictly inside the header at `header_line`: up to the next header of the
    /// same or a shallower level, or `last_line`.
    pub fn section_interior(
        blocks: &[Block],
        header_line: usize,
        last_line: usize,
    ) -> Option<LineSpan> {
        let level = header_level_at(blocks, header_line)?;
        let next = (1..=level)
            .filter_map(|l| {
                find_header(
                    blocks,
                    &HeaderQuery::forward(header_line).with_level(LevelFilter::Exactly(l)),
                )
            })
            .min();
        let lower = header_line + 1;
        let upper = next.map(|line| line - 1).unwrap_or(last_line);
        (lower <= upper).then(|| LineSpan::new(lower, upper))
    }

}

pub mod todo {
    //! TODO keyword cycling and the matching `CLOSED:` bookkeeping.

    use crate::config::WorklogConfig;
    use crate::core::*;
    use crate::editor::LineIndex;
    use crate::parser::parse_closed_line;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Serialize};

    /// A state transition and the edits that perform it, all against one snapshot.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TodoChange {
        pub header_line: usize,
        pub from: TodoState,
        pub to: TodoState,
        pub edits: Vec<Edit>,
    }

    /// Plan the edits that move the header at `header_line` by `delta` around the cycle.
    pub fn compute_state_change(
        snapshot: &LineIndex<'_>,
        header_line: usize,
        info: &HeaderInfo,
        delta: i32,
        config: &WorklogConfig,
        now: NaiveDateTime,
    ) -> TodoChange {
        let from = info.todo_state;
        let to = from.cycle(delta);
        let column = info.keyword_column();
        let header_width = snapshot.line_end(header_line).character;
        let mut edits = Vec::new();

        if from == TodoState::None {
            let mut text = String::new();
            if info.trailing_space_width == 0 {
                text.push(' ');
            }
            text.push_str(to.keyword());
            if info.trailing_space_width > 0 || header_width > column {
                text.push(' ');
            }
            edits.push(Edit::Insert {
                at: Position::new(header_line, column),
                text,
            });
        } else {
            let end = column + from.keyword().chars().count() + 1;
            let replacement = match to {
                TodoState::None => String::new(),
                // Keyword is the whole title; no space to carry over.
                _ if end > header_width => to.keyword().to_string(),
                _ => format!("{} ", to.keyword()),
            };
            edits.push(Edit::Replace {
                range: TextRange::new(
                    Position::new(header_line, column),
                    Position::new(header_line, end.min(header_width)),
                ),
                text: replacement,
            });
        }

        let below = header_line + 1;
        let eol = match snapshot.line_ending(header_line) {
            "" => snapshot.newline(),
            ending => ending,
        };
        let existing = snapshot.line(below).and_then(parse_closed_line);
        if to.is_done() {
            if config.insert_closed_timestamp {
                let annotation = format!(
                    "{}{}",
                    " ".repeat(info.annotation_indent()),
                    ClosedStamp::from_datetime(now).annotation()
                );
                match existing {
                    Some(_) => edits.push(Edit::Replace {
                        range: TextRange::new(Position::new(below, 0), snapshot.line_end(below)),
                        text: annotation,
                    }),
                    None => edits.push(Edit::Insert {
                        at: snapshot.line_end(header_line),
                        text: format!("{eol}{annotation}"),
                    }),
                }
            }
        } else if existing.is_some() {
            edits.push(Edit::Delete {
                range: TextRange::new(snapshot.line_end(header_line), snapshot.line_end(below)),
            });
        }

        TodoChange {
            header_line,
            from,
            to,
            edits,
        }
    }

}

pub mod sections {
    //! Sinks DONE sections below unfinished ones.
    //!
    //! A section is a header at the partition level plus every line up to the next
    //! header at that level (or the end of the range). DONE sections that sit above the
    //! last unfinished section are cut and re-inserted right after it, bottom-most first,
    //! so the line numbers of the sections still waiting to move never change.
    //! Each move is its own edit against the text as it stands after the previous one.

    use crate::core::*;
    use crate::editor::{LineIndex, TextEditor};
    use crate::parser::{header_info_from_line, parse_blocks};
    use serde::{Deserialize, Serialize};
    use tracing::{debug, trace};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ReorganizeScope {
        pub lower_bound: usize,
        /// Inclusive.
        pub upper_bound: usize,
        /// Partition at level 1 instead of the shallowest level in range.
        pub force_top_level: bool,
    }

    impl ReorganizeScope {
        pub fn whole_document(last_line: usize) -> Self {
            Self {
                lower_bound: 0,
                upper_bound: last_line,
                force_top_level: true,
            }
        }

        pub fn within(span: LineSpan) -> Self {
            Self {
                lower_bound: span.start,
                upper_bound: span.end,
                force_top_level: false,
            }
        }

        fn contains(&self, line: usize) -> bool {
            self.lower_bound <= line && line <= self.upper_bound
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Section {
        pub span: LineSpan,
        pub level: u8,
        pub state: TodoState,
    }

    /// DONE sections in document order and the line they sink below.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct MovePlan {
        /// End line of the last non-DONE section; `None` when every section is DONE.
        pub anchor: Option<usize>,
        pub done: Vec<LineSpan>,
    }

    pub fn partition_level(blocks: &[Block], scope: &ReorganizeScope) -> u8 {
        if scope.force_top_level {
            return 1;
        }
        top_level_headers(blocks, scope)
            .map(|(_, level)| level)
            .min()
            .unwrap_or(1)
    }

    fn top_level_headers<'a>(
        blocks: &'a [Block],
        scope: &'a ReorganizeScope,
    ) -> impl Iterator<Item = (usize, u8)> + 'a {
        blocks
            .iter()
            .filter(|block| block.is_top_level())
            .filter_map(|block| block.heading_level().map(|level| (block.span.start, level)))
            .filter(|(line, _)| scope.contains(*line))
    }

    pub fn collect_sections(
        blocks: &[Block],
        snapshot: &LineIndex<'_>,
        scope: &ReorganizeScope,
    ) -> Vec<Section> {
        let level = partition_level(blocks, scope);
        let upper = scope.upper_bound.min(snapshot.last_content_line());
        let starts: Vec<usize> = top_level_headers(blocks, scope)
            .filter(|(_, l)| *l == level)
            .map(|(line, _)| line)
            .collect();

        let mut sections = Vec::with_capacity(starts.len());
        for (idx, start) in starts.iter().enumerate() {
            let Some(line) = snapshot.line(*start) else {
                debug!(line = start, "header line not found in snapshot; skipping");
                continue;
            };
            let end = starts
                .get(idx + 1)
                .map(|next| next - 1)
                .unwrap_or(upper)
                .max(*start);
            sections.push(Section {
                span: LineSpan::new(*start, end),
                level,
                state: header_info_from_line(line).todo_state,
            });
        }
        sections
    }

    pub fn plan_moves(sections: &[Section]) -> MovePlan {
        MovePlan {
            anchor: sections
                .iter()
                .filter(|section| !section.state.is_done())
                .map(|section| section.span.end)
                .last(),
            done: sections
                .iter()
                .filter(|section| section.state.is_done())
                .map(|section| section.span)
                .collect(),
        }
    }

    /// Cut `section` and paste it right after line `anchor`, as one batch.
    pub fn move_edits(snapshot: &LineIndex<'_>, section: LineSpan, anchor: usize) -> Vec<Edit> {
        let body = snapshot.slice_lines(section);
        let cut = Edit::Delete {
            range: TextRange::new(
                Position::new(section.start, 0),
                Position::new(section.end + 1, 0),
            ),
        };
        let target = anchor + 1;
        let paste = if target >= snapshot.line_count() && !snapshot.ends_with_newline() {
            Edit::Insert {
                at: snapshot.end_position(),
                text: format!(
                    "{}{}",
                    snapshot.newline(),
                    body.strip_suffix(snapshot.newline()).unwrap_or(body)
                ),
            }
        } else {
            Edit::Insert {
                at: Position::new(target, 0),
                text: body.to_string(),
            }
        };
        vec![cut, paste]
    }

    /// Sink DONE sections inside `scope`. Returns the number of sections moved.
    pub fn reorganize<E: TextEditor + ?Sized>(
        editor: &mut E,
        scope: ReorganizeScope,
    ) -> Result<usize, WorklogError> {
        let text = editor.text();
        let snapshot = LineIndex::new(&text);
        let blocks = parse_blocks(&text);
        let sections = collect_sections(&blocks, &snapshot, &scope);
        let plan = plan_moves(&sections);
        let Some(mut anchor) = plan.anchor else {
            debug!(
                sections = sections.len(),
                "no unfinished section in range; nothing to sink"
            );
            return Ok(0);
        };

        let mut moved = 0;
        for span in plan.done.iter().rev() {
            if span.start >= anchor {
                continue;
            }
            let current = editor.text();
            let edits = move_edits(&LineIndex::new(&current), *span, anchor);
            editor.apply(&edits)?;
            anchor -= span.len();
            moved += 1;
            trace!(start = span.start, end = span.end, anchor, "sank DONE section");
        }
        debug!(moved, "reorganize finished");
        Ok(moved)
    }

}

pub mod fence {
    //! Locating the fenced code block under a line.

    use crate::core::*;

    pub fn find_enclosing_fence(blocks: &[Block], line: usize) -> Option<&Block> {
        blocks
            .iter()
            .find(|block| block.is_fence() && block.span.contains(line))
    }

    /// Interior lines of a fence, without the marker lines. `None` for an empty fence.
    pub fn selectable_range(block: &Block) -> Option<LineSpan> {
        let BlockKind::Fence { closed, .. } = &block.kind else {
            return None;
        };
        let start = block.span.start + 1;
        let end = if *closed {
            block.span.end.checked_sub(1)?
        } else {
            block.span.end
        };
        (start <= end).then(|| LineSpan::new(start, end))
    }

    pub fn content(block: &Block) -> Option<&str> {
        match &block.kind {
            BlockKind::Fence { content, .. } => Some(content),
            _ => None,
        }
    }

}

pub mod session {
    //! User-level commands over the host editor's current document.
    //!
    //! Each command re-reads the document, answers from a fresh parse, and applies at
    //! most one batch of edits (sorting applies one batch per moved section).

    use crate::config::WorklogConfig;
    use crate::core::*;
    use crate::editor::{LineIndex, TextEditor};
    use crate::fence;
    use crate::navigator::{enclosing_header, find_header, header_level_at, section_interior};
    use crate::parser::{header_info_from_line, parse_blocks};
    use crate::sections::{ReorganizeScope, reorganize};
    use crate::todo::{TodoChange, compute_state_change};
    use chrono::NaiveDateTime;
    use tracing::debug;

    pub struct Session<E> {
        editor: Option<E>,
        config: WorklogConfig,
    }

    struct Snapshot {
        text: String,
        cursor: usize,
    }

    impl<E: TextEditor> Session<E> {
        pub fn new(editor: E, config: WorklogConfig) -> Self {
            Self {
                editor: Some(editor),
                config,
            }
        }

        /// A session with no document attached; every command fails.
        pub fn detached(config: WorklogConfig) -> Self {
            Self {
                editor: None,
                config,
            }
        }

        pub fn config(&self) -> &WorklogConfig {
            &self.config
        }

        pub fn editor(&self) -> Option<&E> {
            self.editor.as_ref()
        }

        pub fn into_editor(self) -> Option<E> {
            self.editor
        }

        fn editor_mut(&mut self) -> Result<&mut E, WorklogError> {
            self.editor.as_mut().ok_or(WorklogError::NoActiveEditor)
        }

        fn snapshot(&self) -> Result<Snapshot, WorklogError> {
            let editor = self.editor.as_ref().ok_or(WorklogError::NoActiveEditor)?;
            let text = editor.text();
            let line_count = LineIndex::new(&text).line_count();
            let cursor = editor.cursor_line();
            if cursor >= line_count {
                return Err(WorklogError::CursorOutOfBounds {
                    line: cursor,
                    line_count,
                });
            }
            Ok(Snapshot { text, cursor })
        }

        /* ----------------------------- TODO state ----------------------------- */

        /// Plan a state change for the header governing the cursor without applying it.
        pub fn plan_todo_change(
            &self,
            delta: i32,
            now: NaiveDateTime,
        ) -> Result<Option<TodoChange>, WorklogError> {
            let snap = self.snapshot()?;
            let blocks = parse_blocks(&snap.text);
            let Some(header_line) = enclosing_header(&blocks, snap.cursor) else {
                debug!(cursor = snap.cursor, "no header above cursor");
                return Ok(None);
            };
            let index = LineIndex::new(&snap.text);
            let Some(line) = index.line(header_line) else {
                return Ok(None);
            };
            let info = header_info_from_line(line);
            if !info.is_header() {
                debug!(header_line, "header block without markers; skipping");
                return Ok(None);
            }
            Ok(Some(compute_state_change(
                &index,
                header_line,
                &info,
                delta,
                &self.config,
                now,
            )))
        }

        pub fn change_todo(
            &mut self,
            delta: i32,
            now: NaiveDateTime,
        ) -> Result<Option<TodoChange>, WorklogError> {
            let Some(change) = self.plan_todo_change(delta, now)? else {
                return Ok(None);
            };
            self.editor_mut()?.apply(&change.edits)?;
            debug!(
                line = change.header_line,
                from = %change.from,
                to = %change.to,
                "changed TODO state"
            );
            Ok(Some(change))
        }

        pub fn increase_todo(
            &mut self,
            now: NaiveDateTime,
        ) -> Result<Option<TodoChange>, WorklogError> {
            self.change_todo(1, now)
        }

        pub fn decrease_todo(
            &mut self,
            now: NaiveDateTime,
        ) -> Result<Option<TodoChange>, WorklogError> {
            self.change_todo(-1, now)
        }

        /* ----------------------------- Navigation ----------------------------- */

        pub fn find_header(&self, query: &HeaderQuery) -> Result<Option<usize>, WorklogError> {
            let snap = self.snapshot()?;
            Ok(find_header(&parse_blocks(&snap.text), query))
        }

        fn goto(&mut self, target: Option<usize>) -> Result<Option<usize>, WorklogError> {
            if let Some(line) = target {
                self.editor_mut()?.set_cursor_line(line);
            }
            Ok(target)
        }

        pub fn goto_next_header(&mut self) -> Result<Option<usize>, WorklogError> {
            let snap = self.snapshot()?;
            let target = find_header(&parse_blocks(&snap.text), &HeaderQuery::forward(snap.cursor));
            self.goto(target)
        }

        pub fn goto_previous_header(&mut self) -> Result<Option<usize>, WorklogError> {
            let snap = self.snapshot()?;
            let target =
                find_header(&parse_blocks(&snap.text), &HeaderQuery::backward(snap.cursor));
            self.goto(target)
        }

        pub fn goto_next_sibling(&mut self) -> Result<Option<usize>, WorklogError> {
            self.goto_sibling(Direction::Forward)
        }

        pub fn goto_previous_sibling(&mut self) -> Result<Option<usize>, WorklogError> {
            self.goto_sibling(Direction::Backward)
        }

        fn goto_sibling(&mut self, direction: Direction) -> Result<Option<usize>, WorklogError> {
            let snap = self.snapshot()?;
            let blocks = parse_blocks(&snap.text);
            let target = enclosing_header(&blocks, snap.cursor).and_then(|current| {
                let level = header_level_at(&blocks, current)?;
                find_header(
                    &blocks,
                    &HeaderQuery::new(direction, current).with_level(LevelFilter::Exactly(level)),
                )
            });
            self.goto(target)
        }

        /// Nearest header one level shallower than the header governing the cursor.
        pub fn goto_parent_header(&mut self) -> Result<Option<usize>, WorklogError> {
            let snap = self.snapshot()?;
            let blocks = parse_blocks(&snap.text);
            let target = enclosing_header(&blocks, snap.cursor).and_then(|current| {
                let level = header_level_at(&blocks, current)?;
                if level <= 1 {
                    return None;
                }
                find_header(
                    &blocks,
                    &HeaderQuery::backward(current).with_level(LevelFilter::Exactly(level - 1)),
                )
            });
            self.goto(target)
        }

        /* ------------------------------ Sorting ------------------------------ */

        pub fn sort_done_to_bottom(&mut self) -> Result<usize, WorklogError> {
            let snap = self.snapshot()?;
            let scope = ReorganizeScope::whole_document(LineIndex::new(&snap.text).last_line());
            reorganize(self.editor_mut()?, scope)
        }

        /// Sort the sections directly under the header governing the cursor.
        pub fn sort_current_section(&mut self) -> Result<usize, WorklogError> {
            let snap = self.snapshot()?;
            let blocks = parse_blocks(&snap.text);
            let last_line = LineIndex::new(&snap.text).last_line();
            let Some(interior) = enclosing_header(&blocks, snap.cursor)
                .and_then(|header| section_interior(&blocks, header, last_line))
            else {
                debug!(cursor = snap.cursor, "no section to sort under cursor");
                return Ok(0);
            };
            reorganize(self.editor_mut()?, ReorganizeScope::within(interior))
        }

        /* ----------------------------- Code fences ----------------------------- */

        /// Select the interior of the fence under the cursor.
        pub fn select_current_codeblock(&mut self) -> Result<Option<TextRange>, WorklogError> {
            let snap = self.snapshot()?;
            let blocks = parse_blocks(&snap.text);
            let Some(interior) = fence::find_enclosing_fence(&blocks, snap.cursor)
                .and_then(fence::selectable_range)
            else {
                return Ok(None);
            };
            let index = LineIndex::new(&snap.text);
            let range = TextRange::new(Position::new(interior.start, 0), index.line_end(interior.end));
            self.editor_mut()?.select(range);
            Ok(Some(range))
        }

        /// Body text of the fence under the cursor, for the host to put on the clipboard.
        pub fn copy_current_codeblock(&self) -> Result<Option<String>, WorklogError> {
            let snap = self.snapshot()?;
            let blocks = parse_blocks(&snap.text);
            Ok(fence::find_enclosing_fence(&blocks, snap.cursor)
                .and_then(fence::content)
                .map(str::to_string))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::editor::Buffer;
        use chrono::NaiveDate;

        fn now() -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2024, 3, 5)
                .and_then(|d| d.and_hms_opt(9, 7, 0))
                .expect("valid date")
        }

        fn session(text: &str, line: usize, timestamps: bool) -> Session<Buffer> {
            Session::new(
                Buffer::new(text).with_cursor_line(line),
                WorklogConfig::default().with_timestamps(timestamps),
            )
        }

        fn text(session: &Session<Buffer>) -> &str {
            session.editor().expect("editor").as_str()
        }

        fn state_at(session: &Session<Buffer>, line: usize) -> TodoState {
            let text = text(session);
            let index = LineIndex::new(text);
            header_info_from_line(index.line(line).expect("line")).todo_state
        }

        #[test]
        fn increase_cycles_through_every_state() {
            let mut s = session("# TODO foo\nbody\n", 0, true);

            s.increase_todo(now()).expect("increase");
            assert_eq!(text(&s), "# DONE foo\n  CLOSED: [2024-3-5 9:7]\nbody\n");

            s.increase_todo(now()).expect("increase");
            assert_eq!(text(&s), "# foo\nbody\n");

            s.increase_todo(now()).expect("increase");
            assert_eq!(text(&s), "# TODO foo\nbody\n");
        }

        #[test]
        fn decrease_cycles_backwards() {
            let mut s = session("# TODO foo\nbody\n", 0, false);
            s.decrease_todo(now()).expect("decrease");
            assert_eq!(state_at(&s, 0), TodoState::None);
            s.decrease_todo(now()).expect("decrease");
            assert_eq!(state_at(&s, 0), TodoState::Done);
            s.decrease_todo(now()).expect("decrease");
            assert_eq!(state_at(&s, 0), TodoState::Todo);
        }

        #[test]
        fn state_changes_act_on_the_governing_header() {
            let mut s = session("# TODO foo\n\nsome notes\n", 2, false);
            let change = s.increase_todo(now()).expect("increase").expect("change");
            assert_eq!(change.header_line, 0);
            assert_eq!(text(&s), "# DONE foo\n\nsome notes\n");
        }

        #[test]
        fn no_header_above_cursor_is_a_no_op() {
            let mut s = session("intro\n# TODO a\n", 0, true);
            assert_eq!(s.increase_todo(now()).expect("increase"), None);
            assert_eq!(text(&s), "intro\n# TODO a\n");
        }

        #[test]
        fn detached_session_reports_missing_document() {
            let mut s: Session<Buffer> = Session::detached(WorklogConfig::default());
            assert!(matches!(
                s.increase_todo(now()),
                Err(WorklogError::NoActiveEditor)
            ));
            assert!(matches!(
                s.sort_done_to_bottom(),
                Err(WorklogError::NoActiveEditor)
            ));
        }

        #[test]
        fn cursor_past_the_end_is_rejected() {
            let s = session("# a\n", 5, false);
            assert!(matches!(
                s.copy_current_codeblock(),
                Err(WorklogError::CursorOutOfBounds {
                    line: 5,
                    line_count: 2
                })
            ));
        }

        const OUTLINE: &str = "\
# Week
## Monday
notes
```
# fenced
```
## Tuesday
### Standup
## Wednesday
";

        #[test]
        fn header_navigation_moves_the_cursor() {
            let mut s = session(OUTLINE, 4, false);
            assert_eq!(s.goto_previous_header().expect("goto"), Some(1));
            assert_eq!(s.editor().expect("editor").cursor().line, 1);
            assert_eq!(s.goto_next_header().expect("goto"), Some(6));
            assert_eq!(s.goto_next_header().expect("goto"), Some(7));
        }

        #[test]
        fn sibling_and_parent_navigation() {
            let mut s = session(OUTLINE, 2, false);
            assert_eq!(s.goto_next_sibling().expect("goto"), Some(6));
            assert_eq!(s.goto_next_sibling().expect("goto"), Some(8));
            assert_eq!(s.goto_next_sibling().expect("goto"), None);
            assert_eq!(s.editor().expect("editor").cursor().line, 8);
            assert_eq!(s.goto_previous_sibling().expect("goto"), Some(6));

            let mut s = session(OUTLINE, 7, false);
            assert_eq!(s.goto_parent_header().expect("goto"), Some(6));
            assert_eq!(s.goto_parent_header().expect("goto"), Some(0));
            assert_eq!(s.goto_parent_header().expect("goto"), None);
        }

        #[test]
        fn raw_queries_use_the_current_snapshot() {
            let s = session(OUTLINE, 0, false);
            let query = HeaderQuery::forward(0).with_level(LevelFilter::AtLeast(3));
            assert_eq!(s.find_header(&query).expect("find"), Some(7));
        }

        #[test]
        fn sort_commands_cover_document_and_section() {
            let mut s = session("# TODO a\n# DONE b\n# TODO c\n", 0, false);
            assert_eq!(s.sort_done_to_bottom().expect("sort"), 1);
            assert_eq!(text(&s), "# TODO a\n# TODO c\n# DONE b\n");

            let doc = "# Day\n## DONE x\n## TODO y\n# Next\n## DONE z\n## TODO w\n";
            let mut s = session(doc, 0, false);
            assert_eq!(s.sort_current_section().expect("sort"), 1);
            assert_eq!(
                text(&s),
                "# Day\n## TODO y\n## DONE x\n# Next\n## DONE z\n## TODO w\n"
            );
        }

        #[test]
        fn sort_current_section_leaves_outer_headers_alone() {
            let doc = "# W1\n## Mon\n### x\n# DONE W2\n# TODO W3\n";
            let mut s = session(doc, 1, false);
            assert_eq!(s.sort_current_section().expect("sort"), 0);
            assert_eq!(text(&s), doc);
        }

        #[test]
        fn sort_current_section_sorts_children_before_a_shallower_header() {
            let doc = "# W1\n## Mon\n### DONE a\n### TODO b\n# W2\n## Tue\n";
            let mut s = session(doc, 1, false);
            assert_eq!(s.sort_current_section().expect("sort"), 1);
            assert_eq!(
                text(&s),
                "# W1\n## Mon\n### TODO b\n### DONE a\n# W2\n## Tue\n"
            );
        }

        #[test]
        fn sort_current_section_without_header_is_a_no_op() {
            let mut s = session("plain\n# DONE a\n# TODO b\n", 0, false);
            assert_eq!(s.sort_current_section().expect("sort"), 0);
            assert_eq!(text(&s), "plain\n# DONE a\n# TODO b\n");
        }

        const CODE: &str = "# Code\n\n```ruby\ndef foo\n  \"foo\"\nend\n```\n";

        #[test]
        fn select_codeblock_selects_only_the_interior() {
            let mut s = session(CODE, 4, false);
            let range = s.select_current_codeblock().expect("select").expect("range");
            assert_eq!(range.start, Position::new(3, 0));
            assert_eq!(range.end, Position::new(5, 3));
            assert_eq!(s.editor().expect("editor").selection(), Some(range));
        }

        #[test]
        fn codeblock_commands_outside_a_fence_do_nothing() {
            let mut s = session(CODE, 0, false);
            assert_eq!(s.select_current_codeblock().expect("select"), None);
            assert_eq!(s.editor().expect("editor").selection(), None);
            assert_eq!(s.copy_current_codeblock().expect("copy"), None);
        }

        #[test]
        fn copy_codeblock_returns_the_body() {
            let s = session(CODE, 4, false);
            assert_eq!(
                s.copy_current_codeblock().expect("copy").as_deref(),
                Some("def foo\n  \"foo\"\nend\n")
            );
        }
    }
}

pub use editor::{Buffer, TextEditor};
pub use parser::{header_info_from_line, parse_blocks};
pub use session::Session;
