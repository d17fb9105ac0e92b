//! Output surfaces
//!
//! A surface is the text a single invocation renders into: decoded text,
//! the style runs over it, a line index and the invocation currently
//! writing to it. Surfaces are kept in a registry keyed by name so that
//! re-running a request refreshes the same surface.

use crate::ansi::{Decoder, SpanStyle, StyleSpan};
use crate::navigate::BoundaryGrammar;
use crate::palette::ColorFaceTable;
use crate::process::{Exit, PipelineEvent, RunningInvocation};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use unicode_width::UnicodeWidthStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceMode {
    /// Output is (or may still be) arriving
    Streaming,
    /// Finished with output; read-only and navigable
    Viewing,
}

/// Outcome of an invocation once its process has exited
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Nothing was written; the normal result of comparing equal inputs
    NoOutput { exit: Exit },
    Ready { exit: Exit },
}

impl Completion {
    pub fn had_output(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn exit(&self) -> &Exit {
        match self {
            Self::NoOutput { exit } | Self::Ready { exit } => exit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StyleRun {
    range: Range<usize>,
    style: SpanStyle,
}

#[derive(Debug)]
pub struct Surface {
    name: String,
    text: String,
    runs: Vec<StyleRun>,
    line_starts: Vec<usize>,
    decoder: Decoder,
    grammar: Option<Arc<BoundaryGrammar>>,
    mode: SurfaceMode,
    read_only: bool,
    invocation: Option<RunningInvocation>,
}

impl Surface {
    pub fn new(name: impl Into<String>, table: Arc<ColorFaceTable>) -> Self {
        Self {
            name: name.into(),
            text: String::new(),
            runs: Vec::new(),
            line_starts: vec![0],
            decoder: Decoder::new(table),
            grammar: None,
            mode: SurfaceMode::Streaming,
            read_only: false,
            invocation: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn mode(&self) -> SurfaceMode {
        self.mode
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_running(&self) -> bool {
        self.invocation.is_some()
    }

    pub fn decode_cache_len(&self) -> usize {
        self.decoder.cache_len()
    }

    /// Drop all content for reuse. A previous invocation is detached, not killed.
    pub fn clear(&mut self) {
        if let Some(previous) = self.invocation.take() {
            previous.detach();
        }
        self.text.clear();
        self.runs.clear();
        self.line_starts = vec![0];
        self.decoder.reset();
        self.mode = SurfaceMode::Streaming;
        self.read_only = false;
    }

    /// Clear the surface and make `invocation` its only writer
    pub fn attach(&mut self, invocation: RunningInvocation) {
        self.clear();
        tracing::debug!(target: "surface", surface = %self.name, id = invocation.id(), "attached");
        self.invocation = Some(invocation);
    }

    pub fn append_bytes(&mut self, fragment: &[u8]) {
        let spans = self.decoder.decode(fragment);
        self.append_spans(spans);
    }

    pub fn append_spans(&mut self, spans: Vec<StyleSpan>) {
        for span in spans {
            if span.text.is_empty() {
                continue;
            }
            let start = self.text.len();
            self.text.push_str(&span.text);
            let end = self.text.len();

            for (i, b) in span.text.bytes().enumerate() {
                if b == b'\n' {
                    self.line_starts.push(start + i + 1);
                }
            }

            match self.runs.last_mut() {
                Some(last) if last.style == span.style && last.range.end == start => {
                    last.range.end = end;
                }
                _ => self.runs.push(StyleRun {
                    range: start..end,
                    style: span.style,
                }),
            }
        }
    }

    /// Drain whatever the attached invocation has produced so far.
    /// Returns the completion once the process has exited.
    pub fn pump(&mut self) -> Option<Completion> {
        loop {
            let event = self.invocation.as_ref()?.try_event()?;
            if let Some(completion) = self.apply(event) {
                return Some(completion);
            }
        }
    }

    /// Block until the attached invocation exits.
    pub fn wait(&mut self) -> Option<Completion> {
        loop {
            let event = self.invocation.as_ref()?.wait_event();
            if let Some(completion) = self.apply(event) {
                return Some(completion);
            }
        }
    }

    fn apply(&mut self, event: PipelineEvent) -> Option<Completion> {
        match event {
            PipelineEvent::Output(bytes) => {
                self.append_bytes(&bytes);
                None
            }
            PipelineEvent::Exited(exit) => {
                self.invocation = None;
                Some(self.complete(exit))
            }
        }
    }

    /// Flush the decoder and settle the surface's mode for `exit`.
    pub fn complete(&mut self, exit: Exit) -> Completion {
        if self.decoder.state().has_pending() {
            tracing::debug!(target: "decode", surface = %self.name, "flushing_incomplete_tail");
        }
        let tail = self.decoder.finish();
        self.append_spans(tail);

        if self.is_empty() {
            tracing::info!(target: "surface", surface = %self.name, "no_output");
            return Completion::NoOutput { exit };
        }

        self.mode = SurfaceMode::Viewing;
        self.read_only = true;
        tracing::info!(
            target: "surface",
            surface = %self.name,
            lines = self.line_count(),
            styles = self.decode_cache_len(),
            code = ?exit.code,
            "ready"
        );
        Completion::Ready { exit }
    }

    pub fn line_count(&self) -> usize {
        if self.text.ends_with('\n') {
            self.line_starts.len() - 1
        } else {
            self.line_starts.len()
        }
    }

    pub fn line_start(&self, line: usize) -> usize {
        self.line_starts
            .get(line)
            .copied()
            .unwrap_or(self.text.len())
    }

    /// Line containing byte offset `offset`
    pub fn line_of(&self, offset: usize) -> usize {
        self.line_starts
            .partition_point(|start| *start <= offset)
            .saturating_sub(1)
    }

    fn line_range(&self, line: usize) -> Range<usize> {
        let start = self.line_start(line);
        let end = self
            .line_starts
            .get(line + 1)
            .map_or(self.text.len(), |next| next - 1);
        start..end.max(start)
    }

    pub fn line(&self, line: usize) -> &str {
        &self.text[self.line_range(line)]
    }

    /// Styled pieces of one line, in order
    pub fn line_spans(&self, line: usize) -> Vec<(&str, SpanStyle)> {
        let range = self.line_range(line);
        let first = self.runs.partition_point(|run| run.range.end <= range.start);
        self.runs[first..]
            .iter()
            .take_while(|run| run.range.start < range.end)
            .map(|run| {
                let start = run.range.start.max(range.start);
                let end = run.range.end.min(range.end);
                (&self.text[start..end], run.style)
            })
            .filter(|(text, _)| !text.is_empty())
            .collect()
    }

    /// Widest line in display columns; the width a display policy should grant
    pub fn requested_width(&self) -> usize {
        (0..self.line_count())
            .map(|line| self.line(line).width())
            .max()
            .unwrap_or(0)
    }

    /// Boundary grammar for this surface, built from `build` on first use
    pub fn grammar_or_init<F>(&mut self, build: F) -> anyhow::Result<Arc<BoundaryGrammar>>
    where
        F: FnOnce() -> anyhow::Result<Arc<BoundaryGrammar>>,
    {
        if let Some(grammar) = &self.grammar {
            return Ok(grammar.clone());
        }
        let grammar = build()?;
        self.grammar = Some(grammar.clone());
        Ok(grammar)
    }

    pub fn invalidate_grammar(&mut self) {
        self.grammar = None;
    }
}

/// Surfaces by name
#[derive(Debug, Default)]
pub struct SurfaceRegistry {
    surfaces: HashMap<String, Surface>,
}

impl SurfaceRegistry {
    pub fn get(&self, name: &str) -> Option<&Surface> {
        self.surfaces.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Surface> {
        self.surfaces.get_mut(name)
    }

    pub fn get_or_create(&mut self, name: &str, table: &Arc<ColorFaceTable>) -> &mut Surface {
        self.surfaces
            .entry(name.to_string())
            .or_insert_with(|| Surface::new(name, table.clone()))
    }

    /// Destroy a surface; any invocation still writing to it is detached
    pub fn remove(&mut self, name: &str) -> Option<Surface> {
        self.surfaces.remove(name)
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Surface> {
        self.surfaces.values_mut()
    }

    pub fn invalidate_grammars(&mut self) {
        for surface in self.surfaces.values_mut() {
            surface.invalidate_grammar();
        }
    }
}
