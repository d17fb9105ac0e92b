//! SGR decoder for difftastic output
//!
//! Turns raw process output into styled spans. The decoder is fed one
//! fragment at a time and carries any unterminated escape sequence or
//! incomplete UTF-8 character over to the next fragment, so the spans do
//! not depend on where the OS happened to split the stream.

use crate::palette::ColorFaceTable;
use ratatui::style::{Color, Modifier, Style};
use std::collections::HashMap;
use std::sync::Arc;

const ESC: u8 = 0x1b;

/// Longest CSI sequence accepted before it is treated as literal text.
const MAX_CSI_LEN: usize = 64;

/// A colour as requested by the escape stream, before palette lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorRef {
    Palette { index: u8, bright: bool },
    Indexed(u8),
    Rgb(u8, u8, u8),
}

impl ColorRef {
    fn from_index(n: u16) -> Option<Self> {
        match n {
            0..=7 => Some(Self::Palette {
                index: n as u8,
                bright: false,
            }),
            8..=15 => Some(Self::Palette {
                index: (n - 8) as u8,
                bright: true,
            }),
            16..=255 => Some(Self::Indexed(n as u8)),
            _ => None,
        }
    }

    fn resolve(self, table: &ColorFaceTable) -> Color {
        match self {
            Self::Palette { index, bright } => table
                .palette_face(index, bright)
                .map(|face| face.fg)
                .unwrap_or(Color::Indexed(index + if bright { 8 } else { 0 })),
            Self::Indexed(n) => Color::Indexed(n),
            Self::Rgb(r, g, b) => Color::Rgb(r, g, b),
        }
    }
}

/// The set of SGR attributes active at a point in the stream.
///
/// Compared and hashed by value; this is the decode cache key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AttrSet {
    pub fg: Option<ColorRef>,
    pub bg: Option<ColorRef>,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
}

impl AttrSet {
    /// Apply the parameters of one `ESC [ ... m` sequence. Unknown codes are skipped.
    pub fn apply_sgr(&mut self, params: &[u16]) {
        if params.is_empty() {
            *self = Self::default();
            return;
        }

        let mut i = 0;
        while i < params.len() {
            match params[i] {
                0 => *self = Self::default(),
                1 => self.bold = true,
                3 => self.italic = true,
                4 => self.underline = true,
                22 => self.bold = false,
                23 => self.italic = false,
                24 => self.underline = false,
                code @ 30..=37 => self.fg = ColorRef::from_index(code - 30),
                38 => {
                    let (color, used) = parse_extended(&params[i + 1..]);
                    if color.is_some() {
                        self.fg = color;
                    }
                    i += used;
                }
                39 => self.fg = None,
                code @ 40..=47 => self.bg = ColorRef::from_index(code - 40),
                48 => {
                    let (color, used) = parse_extended(&params[i + 1..]);
                    if color.is_some() {
                        self.bg = color;
                    }
                    i += used;
                }
                49 => self.bg = None,
                code @ 90..=97 => self.fg = ColorRef::from_index(code - 90 + 8),
                code @ 100..=107 => self.bg = ColorRef::from_index(code - 100 + 8),
                _ => {}
            }
            i += 1;
        }
    }
}

/// Parse the tail of a 38/48 sequence, returning the colour and how many
/// parameters it consumed.
fn parse_extended(rest: &[u16]) -> (Option<ColorRef>, usize) {
    match rest {
        [5, n, ..] => (ColorRef::from_index(*n), 2),
        [2, r, g, b, ..] => {
            let channel = |c: u16| u8::try_from(c).ok();
            match (channel(*r), channel(*g), channel(*b)) {
                (Some(r), Some(g), Some(b)) => (Some(ColorRef::Rgb(r, g, b)), 4),
                _ => (None, 4),
            }
        }
        _ => (None, rest.len()),
    }
}

/// Final style of a span. Underline has no field here: by the time a
/// style is built it has been folded into the colours.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SpanStyle {
    pub fg: Option<Color>,
    pub bg: Option<Color>,
    pub bold: bool,
    pub italic: bool,
}

impl SpanStyle {
    pub fn to_style(&self) -> Style {
        let mut style = Style::default();
        if let Some(fg) = self.fg {
            style = style.fg(fg);
        }
        if let Some(bg) = self.bg {
            style = style.bg(bg);
        }
        if self.bold {
            style = style.add_modifier(Modifier::BOLD);
        }
        if self.italic {
            style = style.add_modifier(Modifier::ITALIC);
        }
        style
    }
}

/// A run of text sharing one style
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleSpan {
    pub text: String,
    pub style: SpanStyle,
}

/// Resolve an attribute set against the face table.
///
/// Foreground colours that match a palette face lend that face's
/// background; underlined text whose face has a highlighted counterpart
/// takes the counterpart's colours instead and loses its bold.
pub fn resolve_style(table: &ColorFaceTable, attrs: &AttrSet) -> SpanStyle {
    let mut style = SpanStyle {
        fg: attrs.fg.map(|c| c.resolve(table)),
        bg: attrs.bg.map(|c| c.resolve(table)),
        bold: attrs.bold,
        italic: attrs.italic,
    };

    let Some(face) = style.fg.and_then(|fg| table.match_foreground(fg)) else {
        return style;
    };

    if attrs.underline {
        if let Some(highlight) = table.highlight_for(&face.name) {
            style.fg = Some(highlight.fg);
            style.bg = Some(highlight.bg);
            style.bold = false;
            return style;
        }
    }

    if style.bg.is_none() {
        style.bg = Some(face.bg);
    }
    style
}

/// Escape state carried between fragments
#[derive(Debug, Clone, Default)]
pub struct DecodeState {
    pending: Vec<u8>,
    attrs: AttrSet,
}

impl DecodeState {
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

enum Escape {
    Incomplete,
    Malformed,
    Sgr { params: Vec<u16>, len: usize },
    Other { len: usize },
}

/// Classify the escape sequence at the start of `bytes` (which begins with ESC)
fn scan_escape(bytes: &[u8]) -> Escape {
    match bytes.get(1) {
        None => return Escape::Incomplete,
        Some(b'[') => {}
        Some(_) => return Escape::Malformed,
    }

    let mut sgr_params = true;
    let mut j = 2;
    loop {
        if j > MAX_CSI_LEN {
            return Escape::Malformed;
        }
        let Some(&b) = bytes.get(j) else {
            return Escape::Incomplete;
        };
        match b {
            b'0'..=b'9' | b';' | b':' => {}
            0x20..=0x2f | b'<'..=b'?' => sgr_params = false,
            0x40..=0x7e => {
                let len = j + 1;
                if b == b'm' && sgr_params {
                    return Escape::Sgr {
                        params: parse_params(&bytes[2..j]),
                        len,
                    };
                }
                return Escape::Other { len };
            }
            _ => return Escape::Malformed,
        }
        j += 1;
    }
}

fn parse_params(raw: &[u8]) -> Vec<u16> {
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split(|b| *b == b';' || *b == b':')
        .map(|p| {
            if p.is_empty() {
                0
            } else {
                std::str::from_utf8(p)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(u16::MAX)
            }
        })
        .collect()
}

/// Length of the trailing bytes that form an incomplete UTF-8 character
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => 0,
        Err(err) if err.error_len().is_none() => bytes.len() - err.valid_up_to(),
        Err(err) => {
            // Invalid bytes earlier on; only the tail after them matters.
            let rest = &bytes[err.valid_up_to() + err.error_len().unwrap_or(1)..];
            incomplete_utf8_tail(rest)
        }
    }
}

/// Stateful, memoizing decoder owned by one output surface
#[derive(Debug)]
pub struct Decoder {
    table: Arc<ColorFaceTable>,
    state: DecodeState,
    cache: HashMap<AttrSet, SpanStyle>,
}

impl Decoder {
    pub fn new(table: Arc<ColorFaceTable>) -> Self {
        Self {
            table,
            state: DecodeState::default(),
            cache: HashMap::new(),
        }
    }

    pub fn state(&self) -> &DecodeState {
        &self.state
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Forget escape state and cached styles (surface cleared for reuse)
    pub fn reset(&mut self) {
        self.state = DecodeState::default();
        self.cache.clear();
    }

    /// Decode one fragment. Anything that cannot be decided yet stays in
    /// the state until the next call.
    pub fn decode(&mut self, fragment: &[u8]) -> Vec<StyleSpan> {
        let mut buf = std::mem::take(&mut self.state.pending);
        buf.extend_from_slice(fragment);

        let mut spans = Vec::new();
        let mut text: Vec<u8> = Vec::new();
        let mut i = 0;

        while i < buf.len() {
            if buf[i] != ESC {
                let end = buf[i..]
                    .iter()
                    .position(|b| *b == ESC)
                    .map_or(buf.len(), |p| i + p);
                text.extend_from_slice(&buf[i..end]);
                i = end;
                continue;
            }

            match scan_escape(&buf[i..]) {
                Escape::Incomplete => {
                    self.flush(&mut spans, &mut text);
                    self.state.pending = buf[i..].to_vec();
                    return spans;
                }
                Escape::Malformed => {
                    text.push(ESC);
                    i += 1;
                }
                Escape::Sgr { params, len } => {
                    self.flush(&mut spans, &mut text);
                    self.state.attrs.apply_sgr(&params);
                    i += len;
                }
                Escape::Other { len } => i += len,
            }
        }

        let tail = incomplete_utf8_tail(&text);
        if tail > 0 {
            self.state.pending = text.split_off(text.len() - tail);
        }
        self.flush(&mut spans, &mut text);
        spans
    }

    /// End of stream: whatever is still pending is emitted as literal text.
    pub fn finish(&mut self) -> Vec<StyleSpan> {
        let mut text = std::mem::take(&mut self.state.pending);
        let mut spans = Vec::new();
        self.flush(&mut spans, &mut text);
        spans
    }

    fn style_for(&mut self, attrs: AttrSet) -> SpanStyle {
        if let Some(style) = self.cache.get(&attrs) {
            return *style;
        }
        let style = resolve_style(&self.table, &attrs);
        tracing::trace!(target: "decode", ?attrs, ?style, "style_resolved");
        self.cache.insert(attrs, style);
        style
    }

    fn flush(&mut self, spans: &mut Vec<StyleSpan>, text: &mut Vec<u8>) {
        if text.is_empty() {
            return;
        }
        let style = self.style_for(self.state.attrs);
        let decoded = String::from_utf8_lossy(text).into_owned();
        text.clear();
        push_span(spans, decoded, style);
    }
}

/// Append text to a span list, extending the last span when the style matches
pub fn push_span(spans: &mut Vec<StyleSpan>, text: String, style: SpanStyle) {
    if text.is_empty() {
        return;
    }
    match spans.last_mut() {
        Some(last) if last.style == style => last.text.push_str(&text),
        _ => spans.push(StyleSpan { text, style }),
    }
}

/// Strip every escape sequence and return the plain text
pub fn plain_text(bytes: &[u8]) -> String {
    let mut decoder = Decoder::new(Arc::new(ColorFaceTable::default()));
    let mut spans = decoder.decode(bytes);
    spans.extend(decoder.finish());
    spans.into_iter().map(|span| span.text).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> Decoder {
        Decoder::new(Arc::new(ColorFaceTable::default()))
    }

    fn decode_all(fragments: &[&[u8]]) -> Vec<StyleSpan> {
        let mut decoder = decoder();
        let mut spans = Vec::new();
        for fragment in fragments {
            for span in decoder.decode(fragment) {
                push_span(&mut spans, span.text, span.style);
            }
        }
        for span in decoder.finish() {
            push_span(&mut spans, span.text, span.style);
        }
        spans
    }

    const SAMPLE: &[u8] = b"\x1b[1;33msrc/main.rs\x1b[0m --- Rust\n\
        \x1b[31m1 \x1b[0mfn \x1b[31;1mold\x1b[0m() {}\n\
        \x1b[92m2 \x1b[0mlet s = \"h\xc3\xa9llo \xe2\x9c\x82\";\x1b[4;32mnew\x1b[24m tail\x1b[0m\n\
        \x1b[38;5;1mext\x1b[m \x1b[2Kdone\x1bXraw\n";

    #[test]
    fn test_plain_text_passthrough() {
        let spans = decode_all(&[b"hello world\n"]);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text, "hello world\n");
        assert_eq!(spans[0].style, SpanStyle::default());
    }

    #[test]
    fn test_every_split_decodes_identically() {
        let whole = decode_all(&[SAMPLE]);
        for split in 0..=SAMPLE.len() {
            let (a, b) = SAMPLE.split_at(split);
            assert_eq!(decode_all(&[a, b]), whole, "split at {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time_decodes_identically() {
        let whole = decode_all(&[SAMPLE]);
        let bytes: Vec<&[u8]> = SAMPLE.chunks(1).collect();
        assert_eq!(decode_all(&bytes), whole);

        let threes: Vec<&[u8]> = SAMPLE.chunks(3).collect();
        assert_eq!(decode_all(&threes), whole);
    }

    #[test]
    fn test_multibyte_split_is_carried_over() {
        let mut decoder = decoder();
        assert!(decoder.decode(b"caf\xc3").iter().all(|s| s.text == "caf"));
        assert!(decoder.state().has_pending());
        let spans = decoder.decode(b"\xa9!");
        assert_eq!(spans[0].text, "\u{e9}!");
    }

    #[test]
    fn test_foreground_match_synthesizes_background() {
        let table = ColorFaceTable::default();
        let spans = decode_all(&[b"\x1b[31mgone\x1b[0m"]);
        assert_eq!(spans[0].style.fg, Some(Color::Red));
        assert_eq!(spans[0].style.bg, Some(table.normal[1].bg));
    }

    #[test]
    fn test_underline_takes_highlight_counterpart() {
        let table = ColorFaceTable::default();
        let highlight = table.highlight_for("added").unwrap().clone();
        let spans = decode_all(&[b"\x1b[1;4;32mnew\x1b[0m"]);
        assert_eq!(spans[0].style.fg, Some(highlight.fg));
        assert_eq!(spans[0].style.bg, Some(highlight.bg));
        assert!(!spans[0].style.bold);
    }

    #[test]
    fn test_underline_without_counterpart_uses_synthesized_background() {
        let table = ColorFaceTable::default();
        let spans = decode_all(&[b"\x1b[4;35mstr\x1b[0m"]);
        assert_eq!(spans[0].style.fg, Some(Color::Magenta));
        assert_eq!(spans[0].style.bg, Some(table.normal[5].bg));
    }

    #[test]
    fn test_endpoint_colors_get_no_background() {
        let spans = decode_all(&[b"\x1b[30mdark\x1b[97mlight"]);
        assert_eq!(spans[0].style.bg, None);
        assert_eq!(spans[1].style.bg, None);
    }

    #[test]
    fn test_explicit_background_is_kept() {
        let spans = decode_all(&[b"\x1b[31;44mx"]);
        assert_eq!(spans[0].style.bg, Some(Color::Blue));
    }

    #[test]
    fn test_unknown_codes_ignored_and_reset_clears() {
        let spans = decode_all(&[b"\x1b[5;53;31ma\x1b[0mb\x1b[1mc\x1b[22md"]);
        assert_eq!(spans[0].style.fg, Some(Color::Red));
        assert_eq!(spans[1].text, "b");
        assert_eq!(spans[1].style, SpanStyle::default());
        assert!(spans[2].style.bold);
        assert_eq!(spans[3].style, SpanStyle::default());
    }

    #[test]
    fn test_malformed_sequences_are_literal() {
        let spans = decode_all(&[b"a\x1bXb"]);
        assert_eq!(spans[0].text, "a\u{1b}Xb");

        let spans = decode_all(&[b"a\x1b[3\x01b"]);
        assert_eq!(spans[0].text, "a\u{1b}[3\u{1}b");

        let long = format!("\x1b[{}m", "1;".repeat(40));
        let spans = decode_all(&[long.as_bytes()]);
        assert!(spans[0].text.starts_with('\u{1b}'));
    }

    #[test]
    fn test_non_sgr_csi_is_dropped() {
        let spans = decode_all(&[b"a\x1b[2Kb\x1b[?25hc"]);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text, "abc");
    }

    #[test]
    fn test_unterminated_escape_flushed_on_finish() {
        let spans = decode_all(&[b"tail\x1b[31"]);
        assert_eq!(spans[0].text, "tail\u{1b}[31");
    }

    #[test]
    fn test_extended_palette_index_resolves_through_table() {
        let spans = decode_all(&[b"\x1b[38;5;2mx\x1b[38;2;1;2;3my"]);
        assert_eq!(spans[0].style.fg, Some(Color::Green));
        assert!(spans[0].style.bg.is_some());
        assert_eq!(spans[1].style.fg, Some(Color::Rgb(1, 2, 3)));
        assert_eq!(spans[1].style.bg, None);
    }

    #[test]
    fn test_cache_hit_matches_fresh_resolution() {
        let table = ColorFaceTable::default();
        let mut decoder = decoder();
        let first = decoder.decode(b"\x1b[4;31mx\x1b[0m\x1b[32my\x1b[0m");
        let misses = decoder.cache_len();
        let second = decoder.decode(b"\x1b[4;31mx\x1b[0m\x1b[32my\x1b[0m");
        assert_eq!(first, second);
        assert_eq!(decoder.cache_len(), misses);

        let mut attrs = AttrSet::default();
        attrs.apply_sgr(&[4, 31]);
        assert_eq!(first[0].style, resolve_style(&table, &attrs));
    }

    #[test]
    fn test_reset_drops_cache_and_state() {
        let mut decoder = decoder();
        decoder.decode(b"\x1b[31mx\x1b[");
        assert!(decoder.cache_len() > 0);
        decoder.reset();
        assert_eq!(decoder.cache_len(), 0);
        assert!(!decoder.state().has_pending());
        assert_eq!(decoder.decode(b"y")[0].style, SpanStyle::default());
    }

    #[test]
    fn test_plain_text_strips_escapes() {
        assert_eq!(plain_text(b"\x1b[1mRust\x1b[0m\n *.rs\n"), "Rust\n *.rs\n");
    }
}
