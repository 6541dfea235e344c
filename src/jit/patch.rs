//! In-place rewriting of installed code.
//!
//! Other threads may be executing the bytes being rewritten, so every patch
//! is a single aligned store: x86-64 guarantees that aligned 4- and 8-byte
//! stores are observed whole by instruction fetch on every core. Callers
//! serialize writers per target method; readers need no lock.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::x86_64::{ENTRY_PATCH_SIZE, JMP_REL32};
use crate::error::PatchError;

/// `target - next`, if it fits a rel32 field.
pub fn rel32(next_instruction: usize, target: usize) -> Option<i32> {
    i32::try_from(target as i64 - next_instruction as i64).ok()
}

/// Rewrite the 4-byte displacement field at `field`.
///
/// # Safety
/// `field` must point at the rel32 field of an instruction inside live,
/// writable code.
pub unsafe fn store_rel32(field: usize, displacement: i32) -> Result<(), PatchError> {
    if field % 4 != 0 {
        return Err(PatchError::Misaligned(field));
    }
    let cell = unsafe { AtomicU32::from_ptr(field as *mut u32) };
    cell.store(displacement as u32, Ordering::Release);
    Ok(())
}

/// # Safety
/// `field` must point at four readable bytes.
pub unsafe fn load_rel32(field: usize) -> i32 {
    unsafe { (field as *const i32).read_unaligned() }
}

/// Replace the first five bytes of the 8-byte aligned word at `entry` with
/// `jmp target`, leaving the other three untouched.
///
/// # Safety
/// `entry` must be an entry point inside live, writable code whose first
/// instruction spans at least five bytes.
pub unsafe fn store_entry_jump(entry: usize, target: usize) -> Result<(), PatchError> {
    if entry % 8 != 0 {
        return Err(PatchError::Misaligned(entry));
    }
    let displacement = rel32(entry + ENTRY_PATCH_SIZE, target).ok_or(PatchError::OutOfRange {
        site: entry,
        target,
    })?;

    let cell = unsafe { AtomicU64::from_ptr(entry as *mut u64) };
    let keep = cell.load(Ordering::Acquire) & !0xFF_FFFF_FFFFu64;
    let jump = JMP_REL32 as u64 | ((displacement as u32 as u64) << 8);
    cell.store(keep | jump, Ordering::Release);
    Ok(())
}
