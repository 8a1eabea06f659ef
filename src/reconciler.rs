//! Incremental interpretation of one turn's growing reply text.
//!
//! The reconciler is an estimator: it gives the UI early feedback (prose preview, product cards as
//! soon as their reference line completes) and never revisits what it already emitted. The
//! authoritative trailing prose comes from [`crate::finalizer::finalize`] once the stream closes.

use crate::detector;
use crate::line_buffer::{newline_count, LineBuffer};
use crate::types::*;
use std::collections::HashMap;

/// Products announced during a turn, in arrival order, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ProductCatalog {
    items: Vec<ProductRecord>,
    index: HashMap<String, usize>,
}

impl ProductCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds a record. Returns `false` if the id was already held; the first record wins.
    pub fn insert(&mut self, record: ProductRecord) -> bool {
        if self.index.contains_key(&record.product_id) {
            return false;
        }
        self.index
            .insert(record.product_id.clone(), self.items.len());
        self.items.push(record);
        true
    }

    pub fn get(&self, product_id: &str) -> Option<&ProductRecord> {
        self.index.get(product_id).map(|&i| &self.items[i])
    }

    fn get_mut(&mut self, product_id: &str) -> Option<&mut ProductRecord> {
        match self.index.get(product_id) {
            Some(&i) => self.items.get_mut(i),
            None => None,
        }
    }

    pub fn as_slice(&self) -> &[ProductRecord] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A reference line seen by the detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSlot {
    pub product_id: String,
    pub line: usize,
    /// The line has been terminated by a newline (or flushed at close).
    pub complete: bool,
    pub displayed: bool,
}

/// Everything one turn owns. A fresh instance is built per turn and never reused.
#[derive(Debug, Clone)]
pub struct ChatTurnState {
    pub turn_id: TurnId,
    buffer: LineBuffer,
    cursor: ParseCursor,
    products: ProductCatalog,
    references: Vec<ReferenceSlot>,
    displayed: Vec<String>,
    fragments: usize,
}

impl ChatTurnState {
    pub fn new(turn_id: TurnId) -> Self {
        Self {
            turn_id,
            buffer: LineBuffer::new(),
            cursor: ParseCursor::default(),
            products: ProductCatalog::new(),
            references: Vec::new(),
            displayed: Vec::new(),
            fragments: 0,
        }
    }

    pub fn text(&self) -> &str {
        self.buffer.text()
    }

    pub fn cursor(&self) -> &ParseCursor {
        &self.cursor
    }

    pub fn products(&self) -> &ProductCatalog {
        &self.products
    }

    pub fn references(&self) -> &[ReferenceSlot] {
        &self.references
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments
    }

    /// Products shown so far, in display order, with back-filled descriptions.
    pub fn displayed_products(&self) -> Vec<ProductRecord> {
        self.displayed
            .iter()
            .filter_map(|id| self.products.get(id).cloned())
            .collect()
    }
}

pub struct StreamReconciler {
    turn: ChatTurnState,
}

impl StreamReconciler {
    pub fn new(turn_id: TurnId) -> Self {
        Self {
            turn: ChatTurnState::new(turn_id),
        }
    }

    pub fn turn(&self) -> &ChatTurnState {
        &self.turn
    }

    pub fn state(&self) -> ReconcilerState {
        self.turn.cursor.state
    }

    /// Applies one `chat_token` fragment.
    pub fn on_fragment(&mut self, fragment: &str) -> TranscriptDelta {
        let mut delta = TranscriptDelta::default();
        let delta_lines = newline_count(fragment);
        let previous_line = self.turn.cursor.current_line;

        self.turn.buffer.append(fragment);
        self.turn.fragments += 1;

        if delta_lines > 0 {
            // Every line this fragment terminated, including whole lines carried inside it.
            for index in previous_line..previous_line + delta_lines {
                self.scan_line(index, &mut delta);
                self.complete_line(index, &mut delta);
            }
            self.turn.cursor.current_line = previous_line + delta_lines;
        }

        let current = self.turn.cursor.current_line;
        self.scan_line(current, &mut delta);

        delta.preview = Some(self.preview());
        tracing::trace!(
            "[RECONCILER] fragment {} (+{} lines) -> line {} state {:?}",
            self.turn.fragments,
            delta_lines,
            current,
            self.turn.cursor.state
        );
        delta
    }

    /// Holds a `product` record; shows it right away if its reference line already completed.
    pub fn on_product(&mut self, record: ProductRecord) -> TranscriptDelta {
        let mut delta = TranscriptDelta::default();
        let product_id = record.product_id.clone();

        if !self.turn.products.insert(record) {
            tracing::debug!("[RECONCILER] Duplicate product {} ignored", product_id);
            return delta;
        }

        let waiting = self
            .turn
            .references
            .iter()
            .position(|r| r.product_id == product_id && r.complete && !r.displayed);
        if let Some(slot) = waiting {
            tracing::debug!(
                "[RECONCILER] Product {} arrived after its reference line",
                product_id
            );
            self.display(slot, &mut delta);
        }
        delta
    }

    /// Completes a reference line the stream ended on without a newline.
    pub fn flush(&mut self) -> TranscriptDelta {
        let mut delta = TranscriptDelta::default();
        if let Some(last) = self.turn.cursor.last_line_with_product_ref {
            self.complete_line(last, &mut delta);
        }
        delta
    }

    fn scan_line(&mut self, index: usize, delta: &mut TranscriptDelta) {
        let product_id = match self
            .turn
            .buffer
            .line(index)
            .and_then(detector::match_reference)
        {
            Some(id) => id.to_string(),
            None => return,
        };
        if !self.turn.cursor.is_new_reference_line(index) {
            return;
        }

        tracing::debug!(
            "[RECONCILER] Reference to {} on line {}",
            product_id,
            index
        );
        self.turn.cursor.pending_product_id = Some(product_id.clone());
        self.turn.cursor.last_line_with_product_ref = Some(index);
        self.turn.references.push(ReferenceSlot {
            product_id,
            line: index,
            complete: false,
            displayed: false,
        });

        if self.turn.cursor.state == ReconcilerState::ScanningProse {
            self.turn.cursor.state = ReconcilerState::InsideProductBlock;
            let end = self.turn.buffer.line_start(index).unwrap_or(0);
            let prose = self.turn.buffer.text()[..end].trim();
            if !prose.is_empty() {
                delta.committed_prose = Some(prose.to_string());
            }
        }
    }

    fn complete_line(&mut self, index: usize, delta: &mut TranscriptDelta) {
        if self.turn.cursor.last_line_with_product_ref != Some(index) {
            return;
        }
        let slot = match self
            .turn
            .references
            .iter()
            .rposition(|r| r.line == index && !r.complete)
        {
            Some(s) => s,
            None => return,
        };
        self.turn.references[slot].complete = true;
        self.turn.cursor.pending_product_id = None;
        self.display(slot, delta);
    }

    fn display(&mut self, slot: usize, delta: &mut TranscriptDelta) {
        let turn = &mut self.turn;
        let reference = &mut turn.references[slot];
        if reference.displayed || !reference.complete {
            return;
        }
        if turn.displayed.contains(&reference.product_id) {
            tracing::debug!(
                "[RECONCILER] Product {} already shown, skipping repeat reference",
                reference.product_id
            );
            reference.displayed = true;
            return;
        }
        let record = match turn.products.get_mut(&reference.product_id) {
            Some(r) => r,
            None => {
                tracing::debug!(
                    "[RECONCILER] No product held for reference {} (yet)",
                    reference.product_id
                );
                return;
            }
        };

        let line = turn.buffer.line(reference.line).unwrap_or_default();
        if let Some(description) =
            detector::extract_description(line, Some(record.title.as_str()))
        {
            record.description = Some(description);
        }
        reference.displayed = true;
        turn.displayed.push(reference.product_id.clone());
        delta.products.push(record.clone());
    }

    fn preview(&self) -> String {
        let buffer = &self.turn.buffer;
        let text = buffer.text();
        let cursor = &self.turn.cursor;
        let from = match cursor.last_line_with_product_ref {
            Some(last) if cursor.is_inside_product_block() => {
                buffer.line_start(last + 1).unwrap_or(text.len())
            }
            _ => 0,
        };
        // Only the last line can still be growing.
        let growing = buffer.last_line_start().max(from);

        let mut preview = String::with_capacity(text.len() - from);
        preview.push_str(&text[from..growing]);
        preview.push_str(detector::mask_dangling_marker(&text[growing..]));
        preview
    }
}
