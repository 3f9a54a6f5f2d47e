//! The profiler: consumes the instrumented run's event stream.
//!
//! Single-threaded by construction (the instrumented program calls in on
//! one thread); all state is owned here, nothing is global.

use crate::errors::{Result, SpecloomError};
use crate::features::profile::domain::samples::{
    PtrResidueSet, Sample, SampleSet, MAX_INT_OBS, MAX_OBJ_OBS,
};
use crate::features::profile::infrastructure::lifetime::{EscapeTable, ShortLivedSets, SiteKey};
use crate::features::profile::infrastructure::live::{
    AddCollision, AllocationUnitTable, LiveObjId, PAuType,
};
use crate::features::profile::infrastructure::pctx::{PCtxArena, PCtxId, PCtxStep};
use crate::features::profile::infrastructure::shadow::{create_ts, ts_invoc, ts_iter, ShadowMemory};
use crate::features::profile::infrastructure::writer;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Sentinel for a load site whose observed values disagree. Never cleared.
pub const MAGIC_INVALID: u64 = u64::MAX;

/// An underlying-object / pointer-prediction sample in profiler terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PObjSample {
    pub ty: PAuType,
    pub name: String,
    pub ctx: PCtxId,
    pub offset: u64,
    pub frequency: u64,
}

impl Sample for PObjSample {
    fn same(&self, other: &Self) -> bool {
        self.ty == other.ty
            && self.name == other.name
            && self.ctx == other.ctx
            && self.offset == other.offset
    }
    fn frequency(&self) -> u64 {
        self.frequency
    }
    fn bump(&mut self, other: &Self) {
        self.frequency += other.frequency;
    }
}

/// An integer observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PIntSample {
    pub value: u64,
    pub frequency: u64,
}

impl Sample for PIntSample {
    fn same(&self, other: &Self) -> bool {
        self.value == other.value
    }
    fn frequency(&self) -> u64 {
        self.frequency
    }
    fn bump(&mut self, other: &Self) {
        self.frequency += other.frequency;
    }
}

pub type IntSamples = SampleSet<PIntSample, MAX_INT_OBS>;
pub type ObjSamples = SampleSet<PObjSample, MAX_OBJ_OBS>;

/// Dynamic event counters, reported as profile header comments.
#[derive(Debug, Default, Clone)]
pub struct EventCounters {
    pub malloc: u64,
    pub realloc: u64,
    pub free: u64,
    pub constant: u64,
    pub global: u64,
    pub stack: u64,
    pub begin_fcn: u64,
    pub end_fcn: u64,
    pub loop_entry: u64,
    pub loop_exit: u64,
    pub loop_iter: u64,
    pub fuo: u64,
    pub pred_int: u64,
    pub pred_ptr: u64,
    pub pred_val: u64,
    pub ptr_residue: u64,
    pub ignored_out_of_range: u64,
}

pub struct Profiler {
    pub(crate) arena: PCtxArena,
    pub(crate) current: PCtxId,
    pub(crate) live: AllocationUnitTable,
    pub(crate) shadow: ShadowMemory,
    pub(crate) escapes: EscapeTable,
    pub(crate) short_lived: ShortLivedSets,
    pub(crate) counters: EventCounters,

    /// (fcn, header) of the loop whose iterations classify lifetimes.
    target_loop: Option<(String, String)>,
    pub(crate) iteration: u64,
    pub(crate) invocation: u64,
    pub(crate) in_loop: bool,

    pub(crate) int_predictions: FxHashMap<(String, PCtxId), IntSamples>,
    pub(crate) obj_predictions: FxHashMap<(String, PCtxId), ObjSamples>,
    pub(crate) residues: FxHashMap<(String, PCtxId), PtrResidueSet>,
    pub(crate) value_predictions: FxHashMap<String, u64>,
    pub(crate) possible_allocation_leaks: BTreeSet<String>,

    /// Live stack objects per function context, freed at function exit.
    frame_objects: FxHashMap<PCtxId, Vec<LiveObjId>>,

    warn_free_heap_as_stack_once: bool,
    warn_free_stack_as_heap_once: bool,
}

fn hash16(s: &str) -> u16 {
    let mut h: u32 = 5381;
    for b in s.bytes() {
        h = h.wrapping_mul(33) ^ b as u32;
    }
    (h ^ (h >> 16)) as u16
}

impl Profiler {
    pub fn new() -> Self {
        let arena = PCtxArena::new();
        let top = arena.top();
        Profiler {
            live: AllocationUnitTable::new(top),
            current: top,
            arena,
            shadow: ShadowMemory::new(),
            escapes: EscapeTable::default(),
            short_lived: ShortLivedSets::default(),
            counters: EventCounters::default(),
            target_loop: None,
            iteration: 0,
            invocation: 0,
            in_loop: false,
            int_predictions: FxHashMap::default(),
            obj_predictions: FxHashMap::default(),
            residues: FxHashMap::default(),
            value_predictions: FxHashMap::default(),
            possible_allocation_leaks: BTreeSet::new(),
            frame_objects: FxHashMap::default(),
            warn_free_heap_as_stack_once: false,
            warn_free_stack_as_heap_once: false,
        }
    }

    pub fn arena(&self) -> &PCtxArena {
        &self.arena
    }

    /// Select the loop whose iteration boundaries classify lifetimes.
    pub fn set_target_loop(&mut self, fcn: impl Into<String>, header: impl Into<String>) {
        self.target_loop = Some((fcn.into(), header.into()));
    }

    // ---- context events ------------------------------------------------

    pub fn func_entry(&mut self, name: &str) {
        self.counters.begin_fcn += 1;
        self.current =
            self.arena.intern(PCtxStep::Fcn { name: name.to_string() }, Some(self.current));
    }

    pub fn func_exit(&mut self, name: &str) {
        self.counters.end_fcn += 1;
        self.free_stacks();
        match self.arena.step(self.current) {
            PCtxStep::Fcn { name: cur } if cur == name => {}
            other => warn!(got = ?other, expected = name, "unbalanced func_exit"),
        }
        self.current = self.arena.parent(self.current).unwrap_or(self.arena.top());
    }

    pub fn loop_entry(&mut self, fcn: &str, header: &str, depth: u32) {
        self.counters.loop_entry += 1;
        self.current = self.arena.intern(
            PCtxStep::Loop { fcn: fcn.to_string(), header: header.to_string(), depth },
            Some(self.current),
        );
        if self.is_target(fcn, header) {
            self.invocation += 1;
            self.iteration = 0;
            self.in_loop = true;
        }
    }

    pub fn loop_iter(&mut self) {
        self.counters.loop_iter += 1;
        if self.in_loop {
            self.iteration += 1;
        }
    }

    pub fn loop_exit(&mut self, fcn: &str, header: &str) {
        self.counters.loop_exit += 1;
        if let PCtxStep::Loop { .. } = self.arena.step(self.current) {
            self.current = self.arena.parent(self.current).unwrap_or(self.arena.top());
        }
        if self.is_target(fcn, header) {
            self.in_loop = false;
        }
    }

    fn is_target(&self, fcn: &str, header: &str) -> bool {
        self.target_loop
            .as_ref()
            .map(|(f, h)| f == fcn && h == header)
            .unwrap_or(false)
    }

    // ---- allocation lifecycle -----------------------------------------

    pub fn malloc(&mut self, name: &str, addr: u64, size: u64) -> Result<()> {
        self.counters.malloc += 1;
        self.add_temporary(PAuType::Heap, name, addr, size)?;
        Ok(())
    }

    pub fn realloc(&mut self, name: &str, old: u64, new: u64, size: u64) -> Result<()> {
        self.counters.realloc += 1;
        if old != 0 {
            let au = self.live.lookup_pointer(old);
            let (old_name, old_creation, old_size) = {
                let o = self.live.get(au);
                (o.name.clone(), o.creation, o.size())
            };
            self.free_object(au, false);

            // When realloc shrinks in place, keep a dummy object over the
            // freed tail: some programs hold pointers into that excess.
            if old == new && size > 0 && old_size > size {
                let base = old + size;
                self.live.add_shrink_excess(
                    old_name,
                    old_creation,
                    self.current,
                    base,
                    old_size - size,
                );
            }
        }
        if size != 0 {
            self.malloc(name, new, size)?;
        }
        Ok(())
    }

    pub fn free(&mut self, name: &str, addr: u64, is_alloca: bool) -> Result<()> {
        self.counters.free += 1;
        if addr == 0 {
            return Ok(());
        }
        let au = self.live.lookup_pointer(addr);
        let ty = self.live.get(au).ty;
        if ty == PAuType::Unknown || ty == PAuType::Null {
            // The instrumented program freed something we never saw.
            self.counters.ignored_out_of_range += 1;
            return Ok(());
        }
        let _ = name;
        self.free_object(au, is_alloca);
        Ok(())
    }

    fn free_object(&mut self, au: LiveObjId, is_alloca: bool) {
        let ty = self.live.get(au).ty;
        if !is_alloca && ty != PAuType::Heap {
            if !self.warn_free_stack_as_heap_once {
                warn!(name = %self.live.get(au).name,
                      "expected heap object, but freed object is not on heap");
                self.warn_free_stack_as_heap_once = true;
            }
            return;
        }
        if is_alloca && ty != PAuType::Stack {
            if !self.warn_free_heap_as_stack_once {
                warn!(name = %self.live.get(au).name,
                      "expected stack object, but freed object is not on stack");
                self.warn_free_heap_as_stack_once = true;
            }
            return;
        }

        let (name, creation, low, size) = {
            let o = self.live.get(au);
            (o.name.clone(), o.creation, o.low, o.size())
        };
        self.live.get_mut(au).deletion = Some(self.current);

        // Local w.r.t. the deepest context containing both endpoints.
        let local = self.arena.find_common(creation, self.current);
        let site: SiteKey = (name, creation);
        self.escapes.report_local(&self.arena, site.clone(), local);

        // Short-lived classification from the shadow timestamp.
        if let Some(ts) = self.shadow.read(low) {
            let same = ts_iter(ts) == self.iteration as u16
                && ts_invoc(ts) == self.invocation as u16
                && self.in_loop;
            self.short_lived.observe_free(site, same);
        }

        self.shadow.free(low, size);
        self.live.remove(au);
    }

    pub fn report_constant(&mut self, name: &str, addr: u64, size: u64) {
        self.counters.constant += 1;
        self.live.add_permanent(PAuType::Constant, name, self.current, addr, size);
    }

    pub fn report_global(&mut self, name: &str, addr: u64, size: u64) {
        self.counters.global += 1;
        self.live.add_permanent(PAuType::Global, name, self.current, addr, size);
    }

    pub fn report_stack(&mut self, name: &str, addr: u64, array_size: u64, elt_size: u64) -> Result<()> {
        self.counters.stack += 1;
        let n = if array_size == 0 { 1 } else { array_size };
        let id = self.add_temporary(PAuType::Stack, name, addr, n * elt_size)?;
        let fcn_frame = self.innermost_fcn_ctx().unwrap_or(self.current);
        self.frame_objects.entry(fcn_frame).or_default().push(id);
        Ok(())
    }

    fn innermost_fcn_ctx(&self) -> Option<PCtxId> {
        let mut cur = Some(self.current);
        while let Some(c) = cur {
            if matches!(self.arena.step(c), PCtxStep::Fcn { .. }) {
                return Some(c);
            }
            cur = self.arena.parent(c);
        }
        None
    }

    fn add_temporary(
        &mut self,
        ty: PAuType,
        name: &str,
        addr: u64,
        size: u64,
    ) -> Result<LiveObjId> {
        let id = match self.live.add_temporary(ty, name, self.current, addr, size) {
            AddCollision::Fresh(id) => id,
            AddCollision::Repeat(id) => return Ok(id),
            AddCollision::Conflict { existing } => {
                return Err(SpecloomError::analysis(format!(
                    "profile address collision at {:#x}: new {} overlaps live {}",
                    addr,
                    name,
                    self.live.get(existing).name
                )))
            }
        };
        let ctx_hash = hash16(&self.arena.print(self.current));
        let ts = create_ts(hash16(name), ctx_hash, self.iteration, self.invocation);
        self.shadow.allocate_unchecked(addr, size, ts);
        Ok(id)
    }

    /// Called when leaving a function: everything stack-allocated in this
    /// frame dies here.
    fn free_stacks(&mut self) {
        let Some(frame) = self.innermost_fcn_ctx() else { return };
        let Some(objs) = self.frame_objects.remove(&frame) else { return };
        for id in objs {
            if self.live.get(id).deletion.is_none() {
                self.free_object(id, true);
            }
        }
    }

    // ---- observations --------------------------------------------------

    pub fn find_underlying_object(&mut self, name: &str, ptr: u64) {
        self.counters.fuo += 1;
        let au = self.live.lookup_pointer(ptr);
        let o = self.live.get(au);
        let sample = PObjSample {
            ty: o.ty,
            name: o.name.clone(),
            ctx: o.creation,
            offset: if o.ty == PAuType::Unknown || o.ty == PAuType::Null {
                0
            } else {
                ptr.saturating_sub(o.low)
            },
            frequency: 1,
        };
        self.obj_predictions
            .entry((name.to_string(), self.current))
            .or_default()
            .receive(sample);
    }

    /// Underlying-object observation for a function argument; keyed as
    /// `fcn:argN` so it resolves independently of any instruction.
    pub fn points_to_arg(&mut self, fcn: &str, arg_ix: u32, ptr: u64) {
        let name = format!("{}:arg{}", fcn, arg_ix);
        self.find_underlying_object(&name, ptr);
    }

    pub fn predict_int(&mut self, name: &str, value: u64) {
        self.counters.pred_int += 1;
        self.int_predictions
            .entry((name.to_string(), self.current))
            .or_default()
            .receive(PIntSample { value, frequency: 1 });
    }

    /// Pointer prediction implies a residue observation.
    pub fn predict_ptr(&mut self, name: &str, ptr: u64) {
        self.counters.pred_ptr += 1;
        self.find_underlying_object(name, ptr);
        self.pointer_residue(name, ptr);
    }

    pub fn pointer_residue(&mut self, name: &str, ptr: u64) {
        self.counters.ptr_residue += 1;
        self.residues
            .entry((name.to_string(), self.current))
            .or_default()
            .receive(ptr);
    }

    /// A load observation feeds value prediction: the first value sticks,
    /// any disagreement poisons the slot forever.
    pub fn load(&mut self, instr: &str, addr: u64, value: u64, _size: u32) {
        self.counters.pred_val += 1;
        if self.shadow.read(addr).is_none() && self.live.lookup_pointer(addr) == self.live.unknown()
        {
            // Loads from memory the profiler never saw allocated (foreign
            // stack frames, unseen globals) are ignored, not fatal.
            self.counters.ignored_out_of_range += 1;
        }
        match self.value_predictions.get_mut(instr) {
            None => {
                self.value_predictions.insert(instr.to_string(), value);
            }
            Some(slot) => {
                if *slot != value {
                    *slot = MAGIC_INVALID;
                }
            }
        }
    }

    pub fn store(&mut self, _instr: &str, addr: u64) {
        if self.shadow.read(addr).is_none() {
            self.counters.ignored_out_of_range += 1;
        }
    }

    pub fn possible_allocation_leak(&mut self, fcn: &str) {
        self.possible_allocation_leaks.insert(fcn.to_string());
    }

    // ---- output --------------------------------------------------------

    pub fn print(&self, out: &mut impl std::io::Write) -> Result<()> {
        writer::write_profile_text(self, out)
    }

    /// Write the profile next to `dir`, atomically: a `.tmp` sibling is
    /// written in full and renamed into place.
    pub fn write_results(&self, dir: &Path) -> Result<PathBuf> {
        let final_path = dir.join("result.specpriv.profile.txt");
        let tmp_path = dir.join("result.specpriv.profile.txt.tmp");
        {
            let mut f = std::fs::File::create(&tmp_path)?;
            self.print(&mut f)?;
        }
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(final_path)
    }
}
