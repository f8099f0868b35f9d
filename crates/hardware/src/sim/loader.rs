//! Program image assembly.
//!
//! Thread code is laid out in control blocks: the first word of each block
//! is a control word carrying two annotation bits per following
//! instruction slot. The assembler hides the layout: callers emit words
//! and instructions linearly, attach annotations to the most recent one,
//! and receive a flat image plus the addresses they asked for.

use crate::common::MemAddr;
use crate::isa::{self, Annotation, Instr};

/// An incremental program image builder.
#[derive(Debug)]
pub struct Assembler {
    base: MemAddr,
    slots_per_block: usize,
    words: Vec<u32>,
    annotations: Vec<(usize, Annotation)>,
}

impl Assembler {
    /// Starts an image at `base`, which must be aligned to the control
    /// block size.
    pub fn new(base: MemAddr, control_block_size: usize) -> Self {
        debug_assert!(base % control_block_size as u64 == 0);
        Self {
            base,
            slots_per_block: control_block_size / 4,
            words: Vec::new(),
            annotations: Vec::new(),
        }
    }

    /// Address the next emitted word will land on.
    pub fn here(&mut self) -> MemAddr {
        self.reserve_control_slot();
        self.base + self.words.len() as u64 * 4
    }

    fn reserve_control_slot(&mut self) {
        if self.words.len() % self.slots_per_block == 0 {
            self.words.push(0);
        }
    }

    /// Emits a raw word, returning its address.
    pub fn word(&mut self, word: u32) -> MemAddr {
        self.reserve_control_slot();
        let addr = self.base + self.words.len() as u64 * 4;
        self.words.push(word);
        addr
    }

    /// Emits an instruction, returning its address.
    pub fn instr(&mut self, instr: Instr) -> MemAddr {
        self.word(isa::encode(instr))
    }

    /// Emits an instruction with annotation bits, returning its address.
    pub fn instr_annotated(&mut self, instr: Instr, annotation: Annotation) -> MemAddr {
        let addr = self.word(isa::encode(instr));
        self.annotations.push((self.words.len() - 1, annotation));
        addr
    }

    /// Emits the register-count word for a family entry point. The entry
    /// PC is the address following this word.
    pub fn reg_counts(&mut self, counts: [(usize, usize, usize); 2]) -> MemAddr {
        let addr = self.word(isa::pack_reg_counts(counts));
        addr + 4
    }

    /// Finalizes the image: fills in the control words and returns the
    /// base address and bytes.
    pub fn finish(mut self) -> (MemAddr, Vec<u8>) {
        for &(index, annotation) in &self.annotations {
            let block = index / self.slots_per_block;
            let slot = index % self.slots_per_block;
            let control = block * self.slots_per_block;
            self.words[control] |= isa::pack_annotations(&[(slot, annotation)]);
        }
        let bytes = self
            .words
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        (self.base, bytes)
    }
}
