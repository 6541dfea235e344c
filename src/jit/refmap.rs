//! Reference maps for precise GC in compiled code.
//!
//! Each stop owns a frame map (one bit per frame word) followed by a register
//! map (one bit per general-purpose register), packed back to back in a
//! single byte vector in stop-index order.

use std::fmt::Write as _;

use super::lir::DebugInfo;
use super::operand::Register;

/// Number of registers a register map covers.
pub const REGISTER_MAP_BITS: usize = 16;

/// Live references at one stop, as recorded during emission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReferences {
    pub frame_slots: Vec<u32>,
    pub registers: Vec<Register>,
}

impl StopReferences {
    pub fn from_debug_info(info: Option<&DebugInfo>) -> Self {
        match info {
            Some(info) => StopReferences {
                frame_slots: info.reference_slots().collect(),
                registers: info.reference_registers().collect(),
            },
            None => StopReferences::default(),
        }
    }
}

/// Packed reference maps of every stop in a target method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceMaps {
    frame_words: usize,
    bytes: Vec<u8>,
}

impl ReferenceMaps {
    pub fn new(frame_words: u32) -> Self {
        Self {
            frame_words: frame_words as usize,
            bytes: Vec::new(),
        }
    }

    pub fn frame_map_size(&self) -> usize {
        self.frame_words.div_ceil(8)
    }

    pub fn register_map_size(&self) -> usize {
        REGISTER_MAP_BITS / 8
    }

    fn stop_size(&self) -> usize {
        self.frame_map_size() + self.register_map_size()
    }

    /// Append the maps of the next stop.
    ///
    /// Slots beyond the frame and non-CPU registers are rejected.
    pub fn push(&mut self, refs: &StopReferences) -> Result<(), String> {
        let start = self.bytes.len();
        self.bytes.resize(start + self.stop_size(), 0);

        for &slot in &refs.frame_slots {
            let slot = slot as usize;
            if slot >= self.frame_words {
                return Err(format!(
                    "reference in frame slot {slot} outside a {}-word frame",
                    self.frame_words
                ));
            }
            self.bytes[start + slot / 8] |= 1 << (slot % 8);
        }

        let register_base = start + self.frame_map_size();
        for reg in &refs.registers {
            if !reg.is_cpu() {
                return Err(format!("reference held in non-CPU register {reg}"));
            }
            let bit = reg.reference_map_index();
            self.bytes[register_base + bit / 8] |= 1 << (bit % 8);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        if self.stop_size() == 0 {
            0
        } else {
            self.bytes.len() / self.stop_size()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn frame_map(&self, stop: usize) -> &[u8] {
        let start = stop * self.stop_size();
        &self.bytes[start..start + self.frame_map_size()]
    }

    pub fn register_map(&self, stop: usize) -> &[u8] {
        let start = stop * self.stop_size() + self.frame_map_size();
        &self.bytes[start..start + self.register_map_size()]
    }

    pub fn is_frame_ref(&self, stop: usize, slot: usize) -> bool {
        slot < self.frame_words && self.frame_map(stop)[slot / 8] & (1 << (slot % 8)) != 0
    }

    pub fn is_register_ref(&self, stop: usize, register: usize) -> bool {
        register < REGISTER_MAP_BITS
            && self.register_map(stop)[register / 8] & (1 << (register % 8)) != 0
    }

    /// Frame slots holding references at `stop`.
    pub fn frame_refs(&self, stop: usize) -> Vec<usize> {
        (0..self.frame_words)
            .filter(|&slot| self.is_frame_ref(stop, slot))
            .collect()
    }

    /// Register numbers holding references at `stop`.
    pub fn register_refs(&self, stop: usize) -> Vec<usize> {
        (0..REGISTER_MAP_BITS)
            .filter(|&reg| self.is_register_ref(stop, reg))
            .collect()
    }

    /// One-line rendering, e.g. `frame{0,3} regs{rbx}`.
    pub fn describe(&self, stop: usize) -> String {
        let mut out = String::from("frame{");
        let frame: Vec<String> = self.frame_refs(stop).iter().map(|s| s.to_string()).collect();
        out.push_str(&frame.join(","));
        out.push_str("} regs{");
        let registers: Vec<String> = self
            .register_refs(stop)
            .iter()
            .map(|r| Register::cpu(*r as u8).to_string())
            .collect();
        let _ = write!(out, "{}}}", registers.join(","));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::x86_64::regs;

    #[test]
    fn test_push_and_query() {
        let mut maps = ReferenceMaps::new(10);
        maps.push(&StopReferences {
            frame_slots: vec![0, 9],
            registers: vec![regs::RBX],
        })
        .unwrap();
        maps.push(&StopReferences::default()).unwrap();

        assert_eq!(maps.len(), 2);
        assert_eq!(maps.frame_map_size(), 2);
        assert_eq!(maps.frame_refs(0), vec![0, 9]);
        assert_eq!(maps.register_refs(0), vec![3]);
        assert!(maps.is_frame_ref(0, 9));
        assert!(!maps.is_frame_ref(1, 9));
        assert!(maps.frame_refs(1).is_empty());
        assert_eq!(maps.describe(0), "frame{0,9} regs{rbx}");
    }

    #[test]
    fn test_packed_layout() {
        let mut maps = ReferenceMaps::new(8);
        maps.push(&StopReferences {
            frame_slots: vec![1],
            registers: vec![regs::R8],
        })
        .unwrap();
        assert_eq!(maps.frame_map(0), &[0b10]);
        assert_eq!(maps.register_map(0), &[0, 1]);
    }

    #[test]
    fn test_out_of_frame_slot_is_rejected() {
        let mut maps = ReferenceMaps::new(2);
        let refs = StopReferences {
            frame_slots: vec![2],
            registers: Vec::new(),
        };
        assert!(maps.push(&refs).is_err());
    }

    #[test]
    fn test_zero_word_frame_keeps_register_maps() {
        let mut maps = ReferenceMaps::new(0);
        maps.push(&StopReferences {
            frame_slots: Vec::new(),
            registers: vec![regs::RAX],
        })
        .unwrap();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps.register_refs(0), vec![0]);
    }
}
