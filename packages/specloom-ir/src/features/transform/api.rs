//! Names of the runtime entry points the emitted code calls.
//!
//! Two runtimes export this surface: the speculative process-based
//! executive and the non-speculative thread-based twin. Which one a build
//! links against is a build-time fact.

use crate::features::classify::HeapKind;

pub struct Api;

impl Api {
    pub const BEGIN: &'static str = "__specpriv_begin";
    pub const END: &'static str = "__specpriv_end";
    pub const BEGIN_INVOCATION: &'static str = "__specpriv_begin_invocation";
    pub const END_INVOCATION: &'static str = "__specpriv_end_invocation";
    pub const SPAWN_WORKERS: &'static str = "__specpriv_spawn_workers";
    pub const JOIN_CHILDREN: &'static str = "__specpriv_join_children";
    pub const BEGIN_ITER: &'static str = "__specpriv_begin_iter";
    pub const END_ITER: &'static str = "__specpriv_end_iter";
    pub const CURRENT_ITER: &'static str = "__specpriv_current_iter";
    pub const WORKER_FINISHES: &'static str = "__specpriv_worker_finishes";
    pub const FINAL_ITER_CKPT_CHECK: &'static str = "__specpriv_final_iter_ckpt_check";
    pub const CREATE_QUEUE: &'static str = "__specpriv_create_queue";
    pub const FREE_QUEUE: &'static str = "__specpriv_free_queue";
    pub const RESET_QUEUE: &'static str = "__specpriv_reset_queue";
    pub const PRODUCE: &'static str = "__specpriv_produce";
    pub const CONSUME: &'static str = "__specpriv_consume";
    pub const UO_CHECK: &'static str = "__specpriv_uo_check";
    pub const PTR_RESIDUE_CHECK: &'static str = "__specpriv_ptr_residue_check";
    pub const CTRL_SPEC_CHECK: &'static str = "__specpriv_ctrl_spec_check";
    pub const MISSPEC: &'static str = "__specpriv_misspec";
    pub const STARTUP: &'static str = "__specpriv_startup";
    pub const SHUTDOWN: &'static str = "__specpriv_shutdown";

    pub fn alloc(heap: HeapKind) -> String {
        format!("heap_alloc_{}", heap.name())
    }

    pub fn free(heap: HeapKind) -> String {
        format!("heap_free_{}", heap.name())
    }

    pub fn private_read(size: u32) -> String {
        format!("__specpriv_private_read_{}", size)
    }

    pub fn private_write(size: u32) -> String {
        format!("__specpriv_private_write_{}", size)
    }

    pub fn io_call(name: &str) -> String {
        format!("__specpriv_io_{}", name)
    }

    /// Numeric code the runtime uses for a heap family in checks.
    pub fn heap_code(heap: HeapKind) -> i64 {
        match heap {
            HeapKind::Shared => 0,
            HeapKind::Local => 1,
            HeapKind::Private => 2,
            HeapKind::ReadOnly => 3,
            HeapKind::Redux => 4,
            HeapKind::KillPrivate => 5,
            HeapKind::SharePrivate => 6,
            HeapKind::Unclassified => 7,
        }
    }
}
