// Misspeculation recovery, recovery idempotence, and per-worker
// reduction views combining to the serial sum.
//
// Worker stages and the committer run on threads here; the channel
// protocol they exercise is the same one the forked processes use (the
// shared region is what crosses the fork).

use specloom_runtime::executive::channel::{Channel, VerMode, VerTid};
use specloom_runtime::executive::worker::{
    committer_recover, run_supervised, IterControl, WorkerOutcome,
};
use specloom_runtime::heaps::{Heap, PageMethod};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[test]
fn misspec_recovery_reexecutes_and_matches_serial() {
    // Serial reference: out[i] = i * 3 for i in 0..8.
    let serial: Vec<u64> = (0..8).map(|i| i * 3).collect();

    let chan = Channel::new(2).unwrap();
    let worker_tid = VerTid::new(chan.clone(), 0);
    let committer_tid = VerTid::new(chan.clone(), 1);

    let out = Arc::new((0..8).map(|_| AtomicU64::new(0)).collect::<Vec<_>>());

    let chan_c = chan.clone();
    let committer = std::thread::spawn(move || {
        let mut misspecs = 0;
        loop {
            match committer_tid.begin() {
                VerMode::Ok => continue,
                VerMode::Misspec => {
                    misspecs += 1;
                    // Re-execute from iteration 3, the first uncommitted.
                    committer_recover(&chan_c, &committer_tid, 3, |_| {});
                }
                VerMode::Term => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        misspecs
    });

    let out_w = out.clone();
    let chan_w = chan.clone();
    let mut tripped = false;
    let outcome = run_supervised(&worker_tid, 0, 1, |i| {
        if i == 3 && !tripped {
            tripped = true;
            // A private-access check fired: poison the value, notify.
            out_w[i as usize].store(999, Ordering::Relaxed);
            worker_tid.misspec();
            chan_w.set_mode(VerMode::Misspec);
            return IterControl::Continue;
        }
        out_w[i as usize].store(i * 3, Ordering::Relaxed);
        if i == 7 {
            IterControl::Break(0)
        } else {
            IterControl::Continue
        }
    });
    assert_eq!(outcome, WorkerOutcome::Finished(0));
    worker_tid.terminate();

    let misspecs = committer.join().unwrap();
    assert_eq!(misspecs, 1);

    // The poisoned iteration re-executed; the final state matches serial.
    let got: Vec<u64> = out.iter().map(|c| c.load(Ordering::Relaxed)).collect();
    assert_eq!(got, serial);
}

#[test]
fn spurious_misspec_is_idempotent() {
    // A misspeculation that violated nothing leaves committed state
    // byte-identical to a clean run. The "committed state" here is a
    // shared-heap buffer the worker fills idempotently per iteration.
    let run = |inject_spurious: bool| -> Vec<u64> {
        let chan = Channel::new(2).unwrap();
        let worker_tid = VerTid::new(chan.clone(), 0);
        let committer_tid = VerTid::new(chan.clone(), 1);

        let dir = tempfile::tempdir().unwrap();
        let heap =
            Heap::create_default("scratch", 0, 1, PageMethod::SparseFile, Some(dir.path())).unwrap();
        let view = heap.map_anywhere().unwrap();
        view.reset();
        let buf = view.alloc(8 * 8) as *mut u64;
        let buf_addr = buf as usize;

        let chan_c = chan.clone();
        let committer = std::thread::spawn(move || loop {
            match committer_tid.begin() {
                VerMode::Ok => continue,
                VerMode::Misspec => {
                    committer_recover(&chan_c, &committer_tid, 0, |_| {});
                }
                VerMode::Term => break,
                other => panic!("unexpected {:?}", other),
            }
        });

        let chan_w = chan.clone();
        let mut injected = false;
        let outcome = run_supervised(&worker_tid, 0, 1, |i| {
            if inject_spurious && i == 4 && !injected {
                injected = true;
                worker_tid.misspec();
                chan_w.set_mode(VerMode::Misspec);
                return IterControl::Continue;
            }
            unsafe { (buf_addr as *mut u64).add(i as usize).write(i * i) };
            if i == 7 {
                IterControl::Break(0)
            } else {
                IterControl::Continue
            }
        });
        assert_eq!(outcome, WorkerOutcome::Finished(0));
        worker_tid.terminate();
        committer.join().unwrap();

        let out = (0..8).map(|i| unsafe { (buf_addr as *const u64).add(i).read() }).collect();
        heap.destroy();
        out
    };

    assert_eq!(run(false), run(true));
}

#[test]
fn redux_views_combine_to_serial_sum() {
    // Each worker accumulates its share into its own
    // view of the reduction heap; the combine step at commit produces the
    // serial sum.
    let a: Vec<u64> = (0..100).map(|i| i * 7 + 1).collect();
    let serial: u64 = a.iter().sum();

    let workers = 4usize;
    let dir = tempfile::tempdir().unwrap();
    let heap =
        Heap::create_default("redux", 0, 2, PageMethod::SparseFile, Some(dir.path())).unwrap();

    // One reduction cell per worker, in the worker's sub-heap namespace.
    let view = heap.map_anywhere().unwrap();
    view.reset();
    let mut cells = Vec::new();
    for w in 0..workers {
        cells.push(view.alloc_subheap(8, w) as *mut u64 as usize);
    }

    let handles: Vec<_> = (0..workers)
        .map(|w| {
            let a = a.clone();
            let cell = cells[w];
            std::thread::spawn(move || {
                // Chunked round-robin distribution.
                let mut partial = 0u64;
                let mut i = w;
                while i < a.len() {
                    partial += a[i];
                    i += workers;
                }
                unsafe { (cell as *mut u64).write(partial) };
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    // Committer combines the per-worker partials.
    let combined: u64 =
        cells.iter().map(|&c| unsafe { (c as *const u64).read() }).sum();
    assert_eq!(combined, serial);
    heap.destroy();
}
