//! Live-object table: raw address -> allocation unit.
//!
//! Lookup tolerates the ugly things real programs do: "disguised" pointers
//! computed just past the end of an object (C99 allows one byte; we accept
//! up to 16 to match observed benchmark behavior), pointers into the excess
//! cut off by a shrinking realloc, and small integers mistaken for pointers
//! (anything below 1024 resolves to the Null AU).

use super::pctx::PCtxId;
use std::collections::BTreeMap;

/// Allocation-unit type as seen by the profiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PAuType {
    Null,
    Unknown,
    Constant,
    Global,
    Stack,
    Heap,
}

impl PAuType {
    pub fn tag(&self) -> &'static str {
        match self {
            PAuType::Null => "NULL",
            PAuType::Unknown => "UNKNOWN",
            PAuType::Constant => "CONSTANT",
            PAuType::Global => "GLOBAL",
            PAuType::Stack => "STACK",
            PAuType::Heap => "HEAP",
        }
    }
}

/// Handle to a live (or once-live) object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LiveObjId(pub u32);

#[derive(Debug, Clone)]
pub struct LiveObject {
    pub ty: PAuType,
    pub name: String,
    pub creation: PCtxId,
    pub deletion: Option<PCtxId>,
    pub low: u64,
    pub high: u64,
    /// Dummy object covering the tail a shrinking realloc released.
    pub realloc_shrink_excess: bool,
}

impl LiveObject {
    pub fn size(&self) -> u64 {
        self.high - self.low
    }
}

/// Outcome of inserting a temporary whose address range is already taken.
#[derive(Debug, PartialEq, Eq)]
pub enum AddCollision {
    /// Address range was free (or freed shrink-excess); object inserted.
    Fresh(LiveObjId),
    /// The very same object was reported twice (lifetime markers); kept.
    Repeat(LiveObjId),
    /// A genuinely different live object already covers the range.
    /// Indicates a profiler bug in the instrumented program.
    Conflict { existing: LiveObjId },
}

#[derive(Default)]
pub struct AllocationUnitTable {
    objects: Vec<LiveObject>,
    /// keyed by low address
    temporaries: BTreeMap<u64, LiveObjId>,
    permanents: BTreeMap<u64, LiveObjId>,
    mru: Option<LiveObjId>,
    null_obj: Option<LiveObjId>,
    unknown_obj: Option<LiveObjId>,
    peak_temporaries: usize,
}

/// Pointers up to this far past an object still resolve to it.
const DISGUISE_SLACK: u64 = 16;
/// Addresses below this resolve to the Null AU.
const WIDENED_NULL: u64 = 1024;

impl AllocationUnitTable {
    pub fn new(top_ctx: PCtxId) -> Self {
        let mut t = AllocationUnitTable::default();
        t.null_obj = Some(t.push(LiveObject {
            ty: PAuType::Null,
            name: String::new(),
            creation: top_ctx,
            deletion: None,
            low: 0,
            high: 0,
            realloc_shrink_excess: false,
        }));
        t.unknown_obj = Some(t.push(LiveObject {
            ty: PAuType::Unknown,
            name: String::new(),
            creation: top_ctx,
            deletion: None,
            low: 0,
            high: 0,
            realloc_shrink_excess: false,
        }));
        t
    }

    fn push(&mut self, obj: LiveObject) -> LiveObjId {
        let id = LiveObjId(self.objects.len() as u32);
        self.objects.push(obj);
        id
    }

    pub fn null(&self) -> LiveObjId {
        self.null_obj.unwrap()
    }

    pub fn unknown(&self) -> LiveObjId {
        self.unknown_obj.unwrap()
    }

    pub fn get(&self, id: LiveObjId) -> &LiveObject {
        &self.objects[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: LiveObjId) -> &mut LiveObject {
        &mut self.objects[id.0 as usize]
    }

    pub fn peak_temporaries(&self) -> usize {
        self.peak_temporaries
    }

    fn includes(&self, id: LiveObjId, addr: u64) -> bool {
        let o = self.get(id);
        o.low <= addr && addr < o.high
    }

    fn find_in(map: &BTreeMap<u64, LiveObjId>, objects: &[LiveObject], addr: u64) -> Option<LiveObjId> {
        let (_, &id) = map.range(..=addr).next_back()?;
        let o = &objects[id.0 as usize];
        if o.low <= addr && addr < o.high {
            Some(id)
        } else {
            None
        }
    }

    fn find_disguised(
        map: &BTreeMap<u64, LiveObjId>,
        objects: &[LiveObject],
        addr: u64,
    ) -> Option<LiveObjId> {
        let (_, &id) = map.range(..=addr).next_back()?;
        let o = &objects[id.0 as usize];
        if addr >= o.high && addr - o.high < DISGUISE_SLACK {
            Some(id)
        } else {
            None
        }
    }

    /// Resolve a raw pointer to an object.
    pub fn lookup_pointer(&mut self, addr: u64) -> LiveObjId {
        if addr == 0 {
            return self.null();
        }

        if let Some(mru) = self.mru {
            if self.includes(mru, addr) {
                return mru;
            }
        }

        // Proper inclusion in temporaries, then permanents.
        if let Some(id) = Self::find_in(&self.temporaries, &self.objects, addr) {
            self.mru = Some(id);
            return id;
        }
        if let Some(id) = Self::find_in(&self.permanents, &self.objects, addr) {
            self.mru = Some(id);
            return id;
        }

        // Disguised pointers just past an object.
        if let Some(id) = Self::find_disguised(&self.temporaries, &self.objects, addr) {
            self.mru = Some(id);
            return id;
        }
        if let Some(id) = Self::find_disguised(&self.permanents, &self.objects, addr) {
            self.mru = Some(id);
            return id;
        }

        if addr < WIDENED_NULL {
            return self.null();
        }

        self.unknown()
    }

    /// Register a temporary (stack or heap) object.
    pub fn add_temporary(
        &mut self,
        ty: PAuType,
        name: impl Into<String>,
        creation: PCtxId,
        low: u64,
        size: u64,
    ) -> AddCollision {
        let name = name.into();
        if let Some(existing) = Self::find_in(&self.temporaries, &self.objects, low) {
            let e = self.get(existing);
            let same = e.ty == ty && e.name == name && e.creation == creation && e.low == low;
            let (e_low, shrink_excess) = (e.low, e.realloc_shrink_excess);
            if same {
                // Pesky lifetime.start/.end pattern: same object twice.
                return AddCollision::Repeat(existing);
            }
            if shrink_excess {
                self.temporaries.remove(&e_low);
            } else {
                return AddCollision::Conflict { existing };
            }
        }

        let id = self.push(LiveObject {
            ty,
            name,
            creation,
            deletion: None,
            low,
            high: low + size,
            realloc_shrink_excess: false,
        });
        self.temporaries.insert(low, id);
        if self.temporaries.len() > self.peak_temporaries {
            self.peak_temporaries = self.temporaries.len();
        }
        AddCollision::Fresh(id)
    }

    /// Register the dummy object covering a shrinking realloc's excess.
    pub fn add_shrink_excess(
        &mut self,
        name: impl Into<String>,
        creation: PCtxId,
        deletion: PCtxId,
        low: u64,
        size: u64,
    ) -> LiveObjId {
        let id = self.push(LiveObject {
            ty: PAuType::Heap,
            name: name.into(),
            creation,
            deletion: Some(deletion),
            low,
            high: low + size,
            realloc_shrink_excess: true,
        });
        self.temporaries.insert(low, id);
        id
    }

    /// Register a permanent (global or constant) object. Colliding constant
    /// strings split the range so each named AU keeps its offset-0 address.
    pub fn add_permanent(
        &mut self,
        ty: PAuType,
        name: impl Into<String>,
        creation: PCtxId,
        low: u64,
        size: u64,
    ) -> LiveObjId {
        if let Some(existing) = Self::find_in(&self.permanents, &self.objects, low) {
            let e = self.get_mut(existing);
            if e.ty == PAuType::Constant && e.low < low {
                e.high = low;
            }
        }
        let id = self.push(LiveObject {
            ty,
            name: name.into(),
            creation,
            deletion: None,
            low,
            high: low + size,
            realloc_shrink_excess: false,
        });
        self.permanents.insert(low, id);
        id
    }

    /// Remove a temporary from the live index (the object record survives
    /// for reporting).
    pub fn remove(&mut self, id: LiveObjId) {
        let low = self.get(id).low;
        if self.temporaries.get(&low) == Some(&id) {
            self.temporaries.remove(&low);
        }
        if self.mru == Some(id) {
            self.mru = None;
        }
    }

    pub fn num_live_temporaries(&self) -> usize {
        self.temporaries.len()
    }
}
