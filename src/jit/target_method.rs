//! Installed compiled code and the metadata the runtime queries about it.
//!
//! A [`TargetMethod`] owns one code-cache region laid out as
//!
//! ```text
//! [code][pad to 16][scalar literals, 16 bytes each][pad to 8][reference literals, 8 bytes each]
//! ```
//!
//! Object references only ever live in the reference pool, so a moving
//! collector rewrites one slot per reference instead of scanning code.
//! Apart from the two patch operations the artifact is immutable.

use std::fmt::Write as _;
use std::mem;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{debug, trace};

use super::code_cache::{CodeCache, CodeRegion};
use super::codegen::{AssembledMethod, CallRecord, Callee, ExceptionHandlerEntry, TrapKind, TrapSite};
use super::lir::{ClassId, MethodId};
use super::masm::{CallSite, EntryOffsets};
use super::operand::{Constant, ObjectRef, Register};
use super::patch;
use super::refmap::ReferenceMaps;
use crate::adaptive::Tier;
use crate::error::{CompileError, PatchError};

/// Length of a `call rel32`.
const CALL_SIZE: usize = 5;

const SCALAR_SLOT_SIZE: usize = 16;
const REFERENCE_SLOT_SIZE: usize = 8;

static NEXT_TARGET_METHOD_ID: AtomicU64 = AtomicU64::new(1);

/// Subtype queries answered by the embedding runtime's class hierarchy.
pub trait TypeHierarchy {
    fn is_subtype(&self, sub: ClassId, sup: ClassId) -> bool;
}

impl<F> TypeHierarchy for F
where
    F: Fn(ClassId, ClassId) -> bool,
{
    fn is_subtype(&self, sub: ClassId, sup: ClassId) -> bool {
        self(sub, sup)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Baseline,
    Optimized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    DirectCall,
    IndirectCall,
    Safepoint,
}

impl StopKind {
    fn name(self) -> &'static str {
        match self {
            StopKind::DirectCall => "direct_call",
            StopKind::IndirectCall => "indirect_call",
            StopKind::Safepoint => "safepoint",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSiteState {
    /// Still calls the resolution trampoline.
    Unpatched,
    Patched,
}

/// Stop positions in three consecutive sections: direct calls, indirect
/// calls, safepoints. Each section is sorted.
#[derive(Debug)]
struct StopTable {
    positions: Vec<u32>,
    callees: Vec<Option<Callee>>,
    direct: usize,
    indirect: usize,
}

impl StopTable {
    fn section(&self, kind: StopKind) -> Range<usize> {
        match kind {
            StopKind::DirectCall => 0..self.direct,
            StopKind::IndirectCall => self.direct..self.direct + self.indirect,
            StopKind::Safepoint => self.direct + self.indirect..self.positions.len(),
        }
    }

    fn kind(&self, index: usize) -> StopKind {
        if index < self.direct {
            StopKind::DirectCall
        } else if index < self.direct + self.indirect {
            StopKind::IndirectCall
        } else {
            StopKind::Safepoint
        }
    }

    fn lookup_in(&self, kind: StopKind, offset: u32) -> Option<usize> {
        let range = self.section(kind);
        let start = range.start;
        self.positions[range].binary_search(&offset).ok().map(|i| start + i)
    }

    /// Sections are searched in table order, so a call whose return offset
    /// is also the start of the next safepoint resolves to the call.
    fn lookup(&self, offset: u32) -> Option<usize> {
        [StopKind::DirectCall, StopKind::IndirectCall, StopKind::Safepoint]
            .into_iter()
            .find_map(|kind| self.lookup_in(kind, offset))
    }
}

/// A linkable `call rel32` to another managed method.
#[derive(Debug)]
struct DirectCallSite {
    call_offset: u32,
    callee: MethodId,
    patched: AtomicBool,
}

/// An installed, immutable compiled method.
pub struct TargetMethod {
    id: u64,
    method: MethodId,
    name: String,
    tier: Tier,
    region: CodeRegion,
    code_size: usize,
    frame_size: u32,
    entries: EntryOffsets,
    scalar_literals: Range<usize>,
    reference_literals_offset: usize,
    reference_literals: Vec<ObjectRef>,
    stops: StopTable,
    reference_maps: ReferenceMaps,
    call_sites: Vec<DirectCallSite>,
    exception_handlers: Vec<ExceptionHandlerEntry>,
    traps: Vec<TrapSite>,
    /// Serializes the writers of `patch_call_site` and `forward_to`.
    patch_lock: Mutex<()>,
    forwarded_to: AtomicU64,
}

impl TargetMethod {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> MethodId {
        self.method
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn code_start(&self) -> usize {
        self.region.address()
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }

    /// Live code bytes, including any patches applied so far.
    pub fn code(&self) -> &[u8] {
        &self.region.bytes()[..self.code_size]
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    pub fn entries(&self) -> EntryOffsets {
        self.entries
    }

    pub fn entry_address(&self, kind: EntryKind) -> usize {
        let offset = match kind {
            EntryKind::Baseline => self.entries.baseline,
            EntryKind::Optimized => self.entries.optimized,
        };
        self.code_start() + offset as usize
    }

    /// The entry point as a typed function pointer.
    ///
    /// # Safety
    /// `F` must be an `extern "C"` function pointer type matching the
    /// compiled method's signature, and the artifact must outlive every call.
    pub unsafe fn entry_fn<F: Copy>(&self, kind: EntryKind) -> F {
        assert_eq!(mem::size_of::<F>(), mem::size_of::<usize>());
        let address = self.entry_address(kind);
        unsafe { mem::transmute_copy::<usize, F>(&address) }
    }

    /// Code offset of `address`, if it lies in this method's code.
    pub fn offset_of(&self, address: usize) -> Option<u32> {
        let start = self.code_start();
        (address >= start && address < start + self.code_size).then(|| (address - start) as u32)
    }

    // ==================== Stops ====================

    pub fn stop_count(&self) -> usize {
        self.stops.positions.len()
    }

    pub fn stop_offset(&self, stop: usize) -> u32 {
        self.stops.positions[stop]
    }

    pub fn stop_kind(&self, stop: usize) -> StopKind {
        self.stops.kind(stop)
    }

    pub fn stop_callee(&self, stop: usize) -> Option<Callee> {
        self.stops.callees[stop]
    }

    /// The stop recorded at `offset`: a call's return address, or the start
    /// of a safepoint poll or trapping instruction.
    ///
    /// A call immediately followed by a safepoint shares its offset with
    /// it. Direct calls take precedence, then indirect calls, then
    /// safepoints; a frame whose return address is `offset` is inside the
    /// call. A stopped thread that knows it is polling asks
    /// [`Self::stop_index_of_kind`] instead.
    pub fn stop_index_for(&self, offset: u32) -> Option<usize> {
        self.stops.lookup(offset)
    }

    pub fn stop_index_of_kind(&self, kind: StopKind, offset: u32) -> Option<usize> {
        self.stops.lookup_in(kind, offset)
    }

    pub fn reference_maps(&self) -> &ReferenceMaps {
        &self.reference_maps
    }

    pub fn frame_references(&self, stop: usize) -> Vec<usize> {
        self.reference_maps.frame_refs(stop)
    }

    pub fn register_references(&self, stop: usize) -> Vec<usize> {
        self.reference_maps.register_refs(stop)
    }

    // ==================== Exceptions and traps ====================

    pub fn exception_handlers(&self) -> &[ExceptionHandlerEntry] {
        &self.exception_handlers
    }

    /// Handler for an exception of type `exception` raised at `offset`.
    ///
    /// Entries are searched in table order, so an inner handler wins over an
    /// outer one. Catch-all entries match without asking `hierarchy`.
    pub fn catch_handler_for(
        &self,
        offset: u32,
        exception: ClassId,
        hierarchy: &dyn TypeHierarchy,
    ) -> Option<u32> {
        self.exception_handlers
            .iter()
            .filter(|entry| entry.covers(offset))
            .find(|entry| match entry.catch_type {
                None => true,
                Some(catch_type) => {
                    catch_type == exception || hierarchy.is_subtype(exception, catch_type)
                }
            })
            .map(|entry| entry.handler)
    }

    pub fn traps(&self) -> &[TrapSite] {
        &self.traps
    }

    pub fn trap_at(&self, offset: u32) -> Option<TrapKind> {
        self.traps
            .binary_search_by_key(&offset, |trap| trap.offset)
            .ok()
            .map(|i| self.traps[i].kind)
    }

    // ==================== Literals ====================

    pub fn scalar_literals(&self) -> &[u8] {
        &self.region.bytes()[self.scalar_literals.clone()]
    }

    pub fn reference_literals(&self) -> &[ObjectRef] {
        &self.reference_literals
    }

    /// Address of a reference pool slot, the one place a collector has to
    /// update when it moves the object.
    pub fn reference_slot_address(&self, index: usize) -> usize {
        self.code_start() + self.reference_literals_offset + index * REFERENCE_SLOT_SIZE
    }

    // ==================== Patching ====================

    fn call_site(&self, call_offset: u32) -> Result<&DirectCallSite, PatchError> {
        self.call_sites
            .binary_search_by_key(&call_offset, |site| site.call_offset)
            .map(|i| &self.call_sites[i])
            .map_err(|_| PatchError::NotACallSite(call_offset))
    }

    pub fn call_site_offsets(&self) -> Vec<u32> {
        self.call_sites.iter().map(|site| site.call_offset).collect()
    }

    /// Method the direct call at `call_offset` was emitted for.
    pub fn call_site_callee(&self, call_offset: u32) -> Option<MethodId> {
        self.call_site(call_offset).ok().map(|site| site.callee)
    }

    pub fn call_site_state(&self, call_offset: u32) -> Option<CallSiteState> {
        let site = self.call_site(call_offset).ok()?;
        Some(if site.patched.load(Ordering::Acquire) {
            CallSiteState::Patched
        } else {
            CallSiteState::Unpatched
        })
    }

    /// Absolute address the call at `call_offset` currently reaches.
    pub fn call_site_target(&self, call_offset: u32) -> Option<usize> {
        self.call_site(call_offset).ok()?;
        let site = self.code_start() + call_offset as usize;
        // The field lies inside this region.
        let displacement = unsafe { patch::load_rel32(site + 1) };
        Some((site + CALL_SIZE).wrapping_add_signed(displacement as isize))
    }

    /// Point the direct call at `call_offset` to `target`.
    ///
    /// Used both for first linking and for forwarding to a newer version.
    /// A patched site never goes back to the unpatched state.
    pub fn patch_call_site(&self, call_offset: u32, target: usize) -> Result<(), PatchError> {
        let site = self.call_site(call_offset)?;
        let address = self.code_start() + call_offset as usize;
        let displacement = patch::rel32(address + CALL_SIZE, target).ok_or(PatchError::OutOfRange {
            site: address,
            target,
        })?;

        let _guard = self.patch_lock.lock().unwrap_or_else(PoisonError::into_inner);
        // The field belongs to a call emitted by `patchable_direct_call`.
        unsafe { patch::store_rel32(address + 1, displacement)? };
        site.patched.store(true, Ordering::Release);
        trace!(
            method = %self.name,
            call_offset,
            "patched call site to {target:#x}"
        );
        Ok(())
    }

    /// Link every unpatched call site whose callee `resolve` maps to an
    /// entry address. The others stay on the resolution trampoline.
    /// Returns how many sites were linked.
    pub fn link_direct_calls(&self, resolve: &dyn Fn(MethodId) -> Option<usize>) -> Result<usize, PatchError> {
        let mut linked = 0;
        for site in &self.call_sites {
            if site.patched.load(Ordering::Acquire) {
                continue;
            }
            if let Some(target) = resolve(site.callee) {
                self.patch_call_site(site.call_offset, target)?;
                linked += 1;
            }
        }
        Ok(linked)
    }

    /// Make both entry points jump into `newer`. Frames already running in
    /// this artifact are unaffected; new calls land in `newer`.
    pub fn forward_to(&self, newer: &TargetMethod) -> Result<(), PatchError> {
        if std::ptr::eq(self, newer) {
            return Ok(());
        }
        let _guard = self.patch_lock.lock().unwrap_or_else(PoisonError::into_inner);
        for kind in [EntryKind::Baseline, EntryKind::Optimized] {
            // Both entries start with a five-byte instruction in an aligned word.
            unsafe { patch::store_entry_jump(self.entry_address(kind), newer.entry_address(kind))? };
        }
        self.forwarded_to.store(newer.id, Ordering::Release);
        debug!(
            method = %self.name,
            from = self.id,
            to = newer.id,
            "forwarded entry points"
        );
        Ok(())
    }

    /// Id of the artifact this one forwards to.
    pub fn forwarded_to(&self) -> Option<u64> {
        match self.forwarded_to.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    // ==================== Diagnostics ====================

    /// Human-readable dump of the code and every table.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "target method #{} {} ({}) tier={} at {:#x}: {} bytes code, frame {} bytes",
            self.id,
            self.name,
            self.method,
            self.tier,
            self.code_start(),
            self.code_size,
            self.frame_size
        );
        let _ = writeln!(
            out,
            "  entries: baseline=+{:#x} optimized=+{:#x}",
            self.entries.baseline, self.entries.optimized
        );
        if let Some(id) = self.forwarded_to() {
            let _ = writeln!(out, "  forwarded to #{id}");
        }

        let _ = writeln!(out, "  code:");
        for (line, chunk) in self.code().chunks(16).enumerate() {
            let bytes: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
            let _ = writeln!(out, "    {:04x}: {}", line * 16, bytes.join(" "));
        }

        if self.stop_count() > 0 {
            let _ = writeln!(out, "  stops:");
        }
        for stop in 0..self.stop_count() {
            let _ = write!(
                out,
                "    #{stop:<3} {:<13} +{:#06x}",
                self.stop_kind(stop).name(),
                self.stop_offset(stop)
            );
            if let Some(callee) = self.stop_callee(stop) {
                let _ = write!(out, " -> {callee}");
            }
            let _ = writeln!(out, " {}", self.reference_maps.describe(stop));
        }

        if !self.exception_handlers.is_empty() {
            let _ = writeln!(out, "  exception handlers:");
        }
        for entry in &self.exception_handlers {
            let catch = entry
                .catch_type
                .map_or_else(|| "any".to_string(), |class| format!("class {}", class.0));
            let _ = writeln!(
                out,
                "    [{:#06x}, {:#06x}) -> {:#06x} catch {catch}",
                entry.start, entry.end, entry.handler
            );
        }

        if !self.traps.is_empty() {
            let _ = writeln!(out, "  traps:");
        }
        for trap in &self.traps {
            let _ = writeln!(out, "    +{:#06x} {}", trap.offset, trap.kind);
        }

        let _ = writeln!(
            out,
            "  literals: {} scalar bytes, {} references",
            self.scalar_literals.len(),
            self.reference_literals.len()
        );
        for (i, reference) in self.reference_literals.iter().enumerate() {
            let _ = writeln!(out, "    ref[{i}] = {:#x}", reference.0);
        }
        out
    }

    pub fn summary(&self) -> TargetMethodSummary {
        let stops = (0..self.stop_count())
            .map(|stop| StopSummary {
                index: stop,
                kind: self.stop_kind(stop),
                offset: self.stop_offset(stop),
                callee: self.stop_callee(stop).map(|callee| callee.to_string()),
                frame_refs: self.frame_references(stop),
                register_refs: self
                    .register_references(stop)
                    .into_iter()
                    .map(|index| Register::cpu(index as u8).to_string())
                    .collect(),
            })
            .collect();
        let exception_handlers = self
            .exception_handlers
            .iter()
            .map(|entry| HandlerSummary {
                start: entry.start,
                end: entry.end,
                handler: entry.handler,
                catch_type: entry.catch_type.map(|class| class.0),
            })
            .collect();

        TargetMethodSummary {
            id: self.id,
            method: self.method.0,
            name: self.name.clone(),
            tier: self.tier,
            address: format!("{:#x}", self.code_start()),
            code_size: self.code_size,
            frame_size: self.frame_size,
            baseline_entry: self.entries.baseline,
            optimized_entry: self.entries.optimized,
            stops,
            exception_handlers,
            traps: self.traps.iter().map(|t| TrapSummary { offset: t.offset, kind: t.kind }).collect(),
            scalar_literal_bytes: self.scalar_literals.len(),
            reference_literals: self.reference_literals.iter().map(|r| format!("{:#x}", r.0)).collect(),
            code: self.code().iter().map(|b| format!("{b:02x}")).collect(),
        }
    }
}

impl std::fmt::Debug for TargetMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetMethod")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("tier", &self.tier)
            .field("address", &format_args!("{:#x}", self.code_start()))
            .field("code_size", &self.code_size)
            .finish()
    }
}

/// Serializable view of a target method.
#[derive(Debug, Clone, Serialize)]
pub struct TargetMethodSummary {
    pub id: u64,
    pub method: u32,
    pub name: String,
    pub tier: Tier,
    pub address: String,
    pub code_size: usize,
    pub frame_size: u32,
    pub baseline_entry: u32,
    pub optimized_entry: u32,
    pub stops: Vec<StopSummary>,
    pub exception_handlers: Vec<HandlerSummary>,
    pub traps: Vec<TrapSummary>,
    pub scalar_literal_bytes: usize,
    pub reference_literals: Vec<String>,
    pub code: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopSummary {
    pub index: usize,
    pub kind: StopKind,
    pub offset: u32,
    pub callee: Option<String>,
    pub frame_refs: Vec<usize>,
    pub register_refs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandlerSummary {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    pub catch_type: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrapSummary {
    pub offset: u32,
    pub kind: TrapKind,
}

// ==================== Builder ====================

enum PoolSlot {
    Scalar(usize),
    Reference(usize),
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

fn check_sorted(what: &str, positions: impl Iterator<Item = u32>) -> Result<(), CompileError> {
    let mut last = 0;
    for position in positions {
        if position < last {
            return Err(CompileError::internal(format!(
                "{what} stop at {position:#x} recorded after {last:#x}"
            )));
        }
        last = position;
    }
    Ok(())
}

fn write_rel32(code: &mut [u8], field: usize, value: i32) -> Result<(), CompileError> {
    let bytes = code
        .get_mut(field..field + 4)
        .ok_or_else(|| CompileError::internal(format!("relocation at {field:#x} outside the code")))?;
    bytes.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Lays out assembled methods in the code cache.
pub struct TargetMethodBuilder {
    cache: Arc<CodeCache>,
}

impl TargetMethodBuilder {
    pub fn new(cache: Arc<CodeCache>) -> Self {
        TargetMethodBuilder { cache }
    }

    pub fn cache(&self) -> &Arc<CodeCache> {
        &self.cache
    }

    pub fn build(&self, method: MethodId, assembled: AssembledMethod) -> Result<TargetMethod, CompileError> {
        let AssembledMethod {
            name,
            tier,
            mut code,
            data_patches,
            entries,
            frame_size,
            frame_words,
            direct_calls,
            indirect_calls,
            safepoints,
            traps,
            exception_handlers,
        } = assembled;

        check_sorted("direct call", direct_calls.iter().map(|c| c.site.return_offset))?;
        check_sorted("indirect call", indirect_calls.iter().map(|c| c.site.return_offset))?;
        check_sorted("safepoint", safepoints.iter().map(|s| s.offset))?;
        check_sorted("trap", traps.iter().map(|t| t.offset))?;

        // Literal pools, one slot per distinct constant.
        let mut scalars: Vec<Constant> = Vec::new();
        let mut references: Vec<ObjectRef> = Vec::new();
        let mut slots = Vec::with_capacity(data_patches.len());
        for patch in &data_patches {
            let slot = match patch.constant {
                Constant::Object(object) if !object.is_null() => {
                    let index = references.iter().position(|r| *r == object).unwrap_or_else(|| {
                        references.push(object);
                        references.len() - 1
                    });
                    PoolSlot::Reference(index)
                }
                constant => {
                    let index = scalars.iter().position(|c| *c == constant).unwrap_or_else(|| {
                        scalars.push(constant);
                        scalars.len() - 1
                    });
                    PoolSlot::Scalar(index)
                }
            };
            slots.push(slot);
        }

        let code_size = code.len();
        let scalar_offset = align_up(code_size, SCALAR_SLOT_SIZE);
        let scalar_end = scalar_offset + scalars.len() * SCALAR_SLOT_SIZE;
        let reference_offset = align_up(scalar_end, REFERENCE_SLOT_SIZE);
        let total = reference_offset + references.len() * REFERENCE_SLOT_SIZE;

        let mut region = self.cache.allocate(total)?;
        let base = region.address();

        for (patch, slot) in data_patches.iter().zip(&slots) {
            let target = match slot {
                PoolSlot::Scalar(i) => scalar_offset + i * SCALAR_SLOT_SIZE,
                PoolSlot::Reference(i) => reference_offset + i * REFERENCE_SLOT_SIZE,
            };
            let displacement = i32::try_from(target as i64 - patch.instruction_end as i64)
                .map_err(|_| CompileError::internal("literal pool out of rel32 range"))?;
            write_rel32(&mut code, patch.disp_offset as usize, displacement)?;
        }

        // Managed calls start out at the resolution trampoline.
        let trampoline = self.cache.trampoline_address();
        let mut call_sites = Vec::new();
        for call in &direct_calls {
            if let Callee::Method(callee) = call.callee {
                let CallSite {
                    call_offset,
                    return_offset,
                } = call.site;
                let displacement = patch::rel32(base + return_offset as usize, trampoline)
                    .ok_or_else(|| CompileError::internal("trampoline out of rel32 range"))?;
                write_rel32(&mut code, call_offset as usize + 1, displacement)?;
                call_sites.push(DirectCallSite {
                    call_offset,
                    callee,
                    patched: AtomicBool::new(false),
                });
            }
        }

        let mut image = vec![0u8; total];
        image[..code_size].copy_from_slice(&code);
        // int3 between the code and the pools
        image[code_size..scalar_offset].fill(0xCC);
        for (i, constant) in scalars.iter().enumerate() {
            let at = scalar_offset + i * SCALAR_SLOT_SIZE;
            image[at..at + 8].copy_from_slice(&constant.bits().to_le_bytes());
        }
        for (i, reference) in references.iter().enumerate() {
            let at = reference_offset + i * REFERENCE_SLOT_SIZE;
            image[at..at + 8].copy_from_slice(&reference.0.to_le_bytes());
        }
        region.write(0, &image)?;

        let calls: Vec<&CallRecord> = direct_calls.iter().chain(&indirect_calls).collect();
        let mut reference_maps = ReferenceMaps::new(frame_words);
        let mut positions = Vec::with_capacity(calls.len() + safepoints.len());
        let mut callees = Vec::with_capacity(positions.capacity());
        for call in &calls {
            reference_maps.push(&call.refs).map_err(CompileError::internal)?;
            positions.push(call.site.return_offset);
            callees.push(Some(call.callee));
        }
        for safepoint in &safepoints {
            reference_maps.push(&safepoint.refs).map_err(CompileError::internal)?;
            positions.push(safepoint.offset);
            callees.push(None);
        }

        let target_method = TargetMethod {
            id: NEXT_TARGET_METHOD_ID.fetch_add(1, Ordering::Relaxed),
            method,
            name,
            tier,
            region,
            code_size,
            frame_size,
            entries,
            scalar_literals: scalar_offset..scalar_end,
            reference_literals_offset: reference_offset,
            reference_literals: references,
            stops: StopTable {
                positions,
                callees,
                direct: direct_calls.len(),
                indirect: indirect_calls.len(),
            },
            reference_maps,
            call_sites,
            exception_handlers,
            traps,
            patch_lock: Mutex::new(()),
            forwarded_to: AtomicU64::new(0),
        };
        debug!(
            method = %target_method.name,
            id = target_method.id,
            tier = %tier,
            bytes = total,
            "built target method at {base:#x}"
        );
        Ok(target_method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JitConfig;
    use crate::jit::codegen::{CodeGenerator, CodegenOptions, SafepointRecord};
    use crate::jit::lir::{
        ArithOp, Block, DebugInfo, FrameLayout, LirList, LirOp, MethodLir,
    };
    use crate::jit::operand::{Kind, Operand};
    use crate::jit::refmap::StopReferences;
    use crate::jit::runtime_calls::RuntimeCallTable;
    use crate::jit::x86_64::{JMP_REL32, X86_64Assembler, regs};
    use pretty_assertions::assert_eq;
    use std::cell::Cell;

    fn builder() -> TargetMethodBuilder {
        TargetMethodBuilder::new(CodeCache::new(64 * 1024, &RuntimeCallTable::host()).unwrap())
    }

    fn assemble(ops: Vec<(LirOp, Option<Arc<DebugInfo>>)>, tier: Tier) -> AssembledMethod {
        let mut lir = LirList::new();
        for (op, info) in ops {
            match info {
                Some(info) => lir.append_with_info(op, info),
                None => lir.append(op),
            };
        }
        let method = MethodLir {
            name: "sample".to_string(),
            blocks: vec![Block::new(0).with_lir(lir)],
            frame: FrameLayout::new(2),
        };
        let runtime = RuntimeCallTable::host();
        CodeGenerator::<X86_64Assembler>::new(&runtime, CodegenOptions::for_tier(tier, &JitConfig::default()))
            .generate(&method)
            .unwrap()
    }

    fn ret(kind: Kind) -> (LirOp, Option<Arc<DebugInfo>>) {
        (
            LirOp::Return {
                value: Operand::register(regs::RAX, kind),
            },
            None,
        )
    }

    fn calls_and_safepoints() -> AssembledMethod {
        let info = DebugInfo::new(0, vec![
            Operand::stack_slot(0, Kind::Object),
            Operand::register(regs::RBX, Kind::Object),
        ]);
        assemble(
            vec![
                (LirOp::StdEntry, None),
                (
                    LirOp::DirectCall {
                        callee: MethodId(1),
                        result: Operand::ILLEGAL,
                    },
                    Some(info.clone()),
                ),
                (LirOp::Safepoint, Some(info.clone())),
                (
                    LirOp::DirectCall {
                        callee: MethodId(2),
                        result: Operand::ILLEGAL,
                    },
                    None,
                ),
                (
                    LirOp::IndirectCall {
                        callee: MethodId(3),
                        target: Operand::register(regs::RBX, Kind::Word),
                        result: Operand::ILLEGAL,
                    },
                    Some(info),
                ),
                (LirOp::Safepoint, None),
                ret(Kind::Int),
            ],
            Tier::Optimized,
        )
    }

    #[test]
    fn test_layout_and_entry_bytes() {
        let builder = builder();
        let used_before = builder.cache().used();
        let assembled = assemble(vec![ret(Kind::Int)], Tier::Baseline);
        let code = assembled.code.clone();
        let tm = builder.build(MethodId(0), assembled).unwrap();

        assert_eq!(tm.code(), &code[..]);
        assert_eq!(tm.code_start() % 16, 0);
        assert_eq!(tm.entry_address(EntryKind::Optimized), tm.code_start() + 8);
        assert!(builder.cache().used() > used_before);

        drop(tm);
        assert_eq!(builder.cache().used(), used_before);
    }

    #[test]
    fn test_stop_table_is_sectioned_and_searchable() {
        let assembled = calls_and_safepoints();
        let direct: Vec<u32> = assembled.direct_calls.iter().map(|c| c.site.return_offset).collect();
        let indirect = assembled.indirect_calls[0].site.return_offset;
        let safepoints: Vec<u32> = assembled.safepoints.iter().map(|s| s.offset).collect();
        let tm = builder().build(MethodId(0), assembled).unwrap();

        assert_eq!(tm.stop_count(), 5);
        let kinds: Vec<StopKind> = (0..5).map(|i| tm.stop_kind(i)).collect();
        assert_eq!(
            kinds,
            vec![
                StopKind::DirectCall,
                StopKind::DirectCall,
                StopKind::IndirectCall,
                StopKind::Safepoint,
                StopKind::Safepoint,
            ]
        );
        for section in [0..2, 3..5] {
            let offsets: Vec<u32> = section.map(|i| tm.stop_offset(i)).collect();
            assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
        }

        assert_eq!(tm.stop_index_for(direct[0]), Some(0));
        assert_eq!(tm.stop_index_for(direct[1]), Some(1));
        assert_eq!(tm.stop_index_for(indirect), Some(2));
        assert_eq!(tm.stop_index_for(safepoints[0]), Some(3));
        assert_eq!(tm.stop_index_for(safepoints[1]), Some(4));
        assert_eq!(tm.stop_index_for(0), None);
        assert_eq!(tm.stop_index_for(direct[0] - 1), None);

        assert_eq!(tm.stop_callee(1), Some(Callee::Method(MethodId(2))));
        assert_eq!(tm.frame_references(0), vec![0]);
        assert_eq!(tm.register_references(0), vec![3]);
        assert!(tm.frame_references(1).is_empty());
        assert_eq!(tm.register_references(2), vec![3]);
    }

    #[test]
    fn test_unsorted_stops_are_internal_errors() {
        let mut assembled = assemble(vec![ret(Kind::Int)], Tier::Optimized);
        assembled.safepoints = vec![
            SafepointRecord {
                offset: 9,
                refs: StopReferences::default(),
            },
            SafepointRecord {
                offset: 4,
                refs: StopReferences::default(),
            },
        ];
        assert!(matches!(
            builder().build(MethodId(0), assembled),
            Err(CompileError::Internal(_))
        ));
    }

    #[test]
    fn test_literal_loads_point_into_pools() {
        let assembled = assemble(
            vec![
                (
                    LirOp::Arith {
                        op: ArithOp::Div,
                        left: Operand::register(regs::RDI, Kind::Long),
                        right: Operand::register(regs::RSI, Kind::Long),
                        result: Operand::register(regs::RAX, Kind::Long),
                    },
                    None,
                ),
                (
                    LirOp::Move {
                        src: Operand::constant(Constant::Object(ObjectRef(0xABCD))),
                        dst: Operand::register(regs::RCX, Kind::Object),
                    },
                    None,
                ),
                ret(Kind::Long),
            ],
            Tier::Optimized,
        );
        let patches = assembled.data_patches.clone();
        assert_eq!(patches.len(), 2);
        let tm = builder().build(MethodId(0), assembled).unwrap();

        let resolve = |i: usize| {
            let patch = patches[i];
            let field = patch.disp_offset as usize;
            let displacement = i32::from_le_bytes(tm.code()[field..field + 4].try_into().unwrap());
            (patch.instruction_end as i64 + displacement as i64) as usize
        };

        let min = resolve(0);
        assert_eq!(min % 16, 0);
        let bytes = tm.region.bytes();
        assert_eq!(&bytes[min..min + 8], &i64::MIN.to_le_bytes());

        let reference = resolve(1);
        assert_eq!(tm.code_start() + reference, tm.reference_slot_address(0));
        assert_eq!(&bytes[reference..reference + 8], &0xABCDu64.to_le_bytes());
        assert_eq!(tm.reference_literals(), &[ObjectRef(0xABCD)]);
        // The raw reference never appears in the instruction stream.
        assert!(!tm.code().windows(8).any(|w| w == 0xABCDu64.to_le_bytes()));
    }

    #[test]
    fn test_catch_all_matches_without_type_check() {
        let mut assembled = assemble(vec![ret(Kind::Int)], Tier::Optimized);
        assembled.exception_handlers = vec![
            ExceptionHandlerEntry {
                start: 4,
                end: 10,
                handler: 100,
                catch_type: Some(ClassId(1)),
            },
            ExceptionHandlerEntry {
                start: 4,
                end: 10,
                handler: 200,
                catch_type: None,
            },
        ];
        let tm = builder().build(MethodId(0), assembled).unwrap();

        let queries = Cell::new(0);
        let hierarchy = |_sub: ClassId, _sup: ClassId| {
            queries.set(queries.get() + 1);
            false
        };
        assert_eq!(tm.catch_handler_for(9, ClassId(7), &hierarchy), Some(200));
        assert_eq!(queries.get(), 1);

        assert_eq!(tm.catch_handler_for(5, ClassId(1), &hierarchy), Some(100));
        assert_eq!(queries.get(), 1);

        assert_eq!(tm.catch_handler_for(10, ClassId(7), &hierarchy), None);

        let subclass_of_one = |sub: ClassId, sup: ClassId| sub == ClassId(2) && sup == ClassId(1);
        assert_eq!(tm.catch_handler_for(4, ClassId(2), &subclass_of_one), Some(100));
    }

    #[test]
    fn test_catch_all_first_never_consults_hierarchy() {
        let mut assembled = assemble(vec![ret(Kind::Int)], Tier::Optimized);
        assembled.exception_handlers = vec![ExceptionHandlerEntry {
            start: 0,
            end: 4,
            handler: 50,
            catch_type: None,
        }];
        let tm = builder().build(MethodId(0), assembled).unwrap();
        let never = |_: ClassId, _: ClassId| -> bool { panic!("catch-all must not be type-checked") };
        assert_eq!(tm.catch_handler_for(2, ClassId(3), &never), Some(50));
    }

    #[test]
    fn test_trap_lookup() {
        let assembled = assemble(
            vec![
                (
                    LirOp::NullCheck {
                        object: Operand::register(regs::RDI, Kind::Object),
                    },
                    None,
                ),
                ret(Kind::Int),
            ],
            Tier::Optimized,
        );
        let offset = assembled.traps[0].offset;
        let tm = builder().build(MethodId(0), assembled).unwrap();
        assert_eq!(tm.trap_at(offset), Some(TrapKind::NullPointer));
        assert_eq!(tm.trap_at(offset + 1), None);
        assert_eq!(tm.stop_kind(tm.stop_index_for(offset).unwrap()), StopKind::Safepoint);
    }

    #[test]
    fn test_call_sites_start_at_trampoline_and_patch_once() {
        let builder = builder();
        let tm = builder.build(MethodId(0), calls_and_safepoints()).unwrap();
        let callee = builder.build(MethodId(1), assemble(vec![ret(Kind::Int)], Tier::Optimized)).unwrap();

        let sites = tm.call_site_offsets();
        assert_eq!(sites.len(), 2);
        for &site in &sites {
            assert_eq!(tm.call_site_state(site), Some(CallSiteState::Unpatched));
            assert_eq!(tm.call_site_target(site), Some(builder.cache().trampoline_address()));
        }

        let target = callee.entry_address(EntryKind::Optimized);
        tm.patch_call_site(sites[0], target).unwrap();
        assert_eq!(tm.call_site_state(sites[0]), Some(CallSiteState::Patched));
        assert_eq!(tm.call_site_target(sites[0]), Some(target));
        assert_eq!(tm.call_site_state(sites[1]), Some(CallSiteState::Unpatched));

        // Patching again is allowed and stays patched.
        tm.patch_call_site(sites[0], target).unwrap();
        assert_eq!(tm.call_site_state(sites[0]), Some(CallSiteState::Patched));

        assert_eq!(tm.patch_call_site(sites[0] + 1, target), Err(PatchError::NotACallSite(sites[0] + 1)));
    }

    #[test]
    fn test_link_direct_calls_patches_only_resolved_callees() {
        let builder = builder();
        let tm = builder.build(MethodId(0), calls_and_safepoints()).unwrap();
        let callee = builder.build(MethodId(1), assemble(vec![ret(Kind::Int)], Tier::Optimized)).unwrap();
        let sites = tm.call_site_offsets();
        assert_eq!(tm.call_site_callee(sites[0]), Some(MethodId(1)));
        assert_eq!(tm.call_site_callee(sites[1]), Some(MethodId(2)));

        let target = callee.entry_address(EntryKind::Optimized);
        let resolve = |id: MethodId| (id == MethodId(1)).then_some(target);
        assert_eq!(tm.link_direct_calls(&resolve), Ok(1));
        assert_eq!(tm.call_site_target(sites[0]), Some(target));
        assert_eq!(tm.call_site_state(sites[1]), Some(CallSiteState::Unpatched));
        assert_eq!(tm.call_site_target(sites[1]), Some(builder.cache().trampoline_address()));

        // Already linked sites are left alone.
        assert_eq!(tm.link_direct_calls(&resolve), Ok(0));
    }

    #[test]
    fn test_call_return_offset_shared_with_safepoint() {
        let mut assembled = calls_and_safepoints();
        let return_offset = assembled.direct_calls[0].site.return_offset;
        assembled.safepoints[0].offset = return_offset;
        let tm = builder().build(MethodId(0), assembled).unwrap();

        let call = tm.stop_index_for(return_offset).unwrap();
        assert_eq!(tm.stop_kind(call), StopKind::DirectCall);
        assert_eq!(tm.stop_callee(call), Some(Callee::Method(MethodId(1))));

        let poll = tm.stop_index_of_kind(StopKind::Safepoint, return_offset).unwrap();
        assert_ne!(poll, call);
        assert_eq!(tm.stop_kind(poll), StopKind::Safepoint);
        assert_eq!(tm.stop_offset(poll), return_offset);
        assert_eq!(tm.stop_index_of_kind(StopKind::IndirectCall, return_offset), None);
    }

    #[test]
    fn test_forwarding_rewrites_both_entries() {
        let builder = builder();
        let old = builder.build(MethodId(0), assemble(vec![ret(Kind::Int)], Tier::Baseline)).unwrap();
        let new = builder.build(MethodId(0), assemble(vec![ret(Kind::Int)], Tier::Optimized)).unwrap();

        old.forward_to(&new).unwrap();
        assert_eq!(old.forwarded_to(), Some(new.id()));

        for kind in [EntryKind::Baseline, EntryKind::Optimized] {
            let entry = old.entry_address(kind);
            let at = entry - old.code_start();
            let code = old.code();
            assert_eq!(code[at], JMP_REL32);
            let displacement = i32::from_le_bytes(code[at + 1..at + 5].try_into().unwrap());
            assert_eq!(
                (entry + 5).wrapping_add_signed(displacement as isize),
                new.entry_address(kind)
            );
        }

        // Forwarding again to the same target is a no-op rewrite.
        old.forward_to(&new).unwrap();
        new.forward_to(&new).unwrap();
        assert_eq!(new.forwarded_to(), None);
    }

    #[test]
    fn test_describe_and_summary() {
        let tm = builder().build(MethodId(4), calls_and_safepoints()).unwrap();
        let text = tm.describe();
        assert!(text.contains("sample (m4) tier=optimized"));
        assert!(text.contains("direct_call"));
        assert!(text.contains("frame{0} regs{rbx}"));

        let summary = tm.summary();
        assert_eq!(summary.stops.len(), 5);
        assert_eq!(summary.stops[0].register_refs, vec!["rbx".to_string()]);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["tier"], "optimized");
        assert_eq!(json["stops"][2]["kind"], "indirect_call");
    }
}
