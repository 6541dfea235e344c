//! Code buffer for building JIT code.
//!
//! Machine code is assembled into a plain byte vector; the target method
//! builder later copies it into the code cache. Labels are small handles
//! that may be referenced before they are bound.

/// A position in the code that may not be known yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(u32);

impl Label {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Size of a reference to patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceSize {
    /// 32-bit offset relative to the end of the field.
    Rel32,
}

/// A buffer for building machine code.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
    /// Bound position of each label, `None` while unbound.
    labels: Vec<Option<u32>>,
    /// Field offsets waiting for their label to be resolved.
    forward_refs: Vec<(usize, Label, ReferenceSize)>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Current emission offset.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Bind `label` to the current offset.
    pub fn bind(&mut self, label: Label) {
        debug_assert!(
            self.labels[label.0 as usize].is_none(),
            "label {} bound twice",
            label.0
        );
        self.labels[label.0 as usize] = Some(self.code.len() as u32);
    }

    pub fn label_offset(&self, label: Label) -> Option<u32> {
        self.labels.get(label.0 as usize).copied().flatten()
    }

    pub fn is_bound(&self, label: Label) -> bool {
        self.label_offset(label).is_some()
    }

    /// Labels that some reference uses but nobody bound, each once, in
    /// creation order.
    pub fn unbound_references(&self) -> Vec<Label> {
        let mut unbound: Vec<Label> = self
            .forward_refs
            .iter()
            .map(|(_, label, _)| *label)
            .filter(|label| !self.is_bound(*label))
            .collect();
        unbound.sort_unstable();
        unbound.dedup();
        unbound
    }

    /// Emit a reference to a label; resolved by `patch_forward_refs`.
    pub fn emit_label_ref(&mut self, label: Label, size: ReferenceSize) {
        let offset = self.code.len();
        self.forward_refs.push((offset, label, size));
        match size {
            ReferenceSize::Rel32 => self.emit_u32(0),
        }
    }

    /// Resolve every label reference. Fails if any label is unbound.
    pub fn patch_forward_refs(&mut self) -> Result<(), String> {
        for (offset, label, size) in std::mem::take(&mut self.forward_refs) {
            let target = self
                .label_offset(label)
                .ok_or_else(|| format!("unbound label L{}", label.0))?;

            match size {
                ReferenceSize::Rel32 => {
                    let rel_offset = target as i64 - (offset as i64 + 4);
                    let rel = i32::try_from(rel_offset)
                        .map_err(|_| format!("relative offset out of range for label L{}", label.0))?;
                    self.code[offset..offset + 4].copy_from_slice(&rel.to_le_bytes());
                }
            }
        }
        Ok(())
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Overwrite a 32-bit field already emitted.
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.code[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Consume the buffer. Label references must already be resolved.
    pub fn into_code(self) -> Vec<u8> {
        debug_assert!(self.forward_refs.is_empty(), "unresolved label references");
        self.code
    }

    /// Pad with `fill` up to the given power-of-two boundary.
    pub fn align_with(&mut self, alignment: usize, fill: u8) {
        let current = self.code.len();
        let aligned = (current + alignment - 1) & !(alignment - 1);
        self.code.resize(aligned, fill);
    }
}
