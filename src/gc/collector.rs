//! The collector pool and the tri-color cycle driver.
//!
//! Worker threads share the gray queue: whichever worker notices pressure
//! (occupancy over threshold or the timer interval) leads a cycle, and any
//! worker that finds the queue non-empty while a mark is active assists in
//! draining it. The workers hold only weak heap references so an engine
//! drop tears the pool down instead of leaking it.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use super::{Heap, ObjectId};

/// Spawns `workers` collector threads for `heap`.
pub(super) fn spawn_collectors(heap: &Arc<Heap>, workers: usize) {
    for worker in 0..workers {
        let weak: Weak<Heap> = Arc::downgrade(heap);
        let interval = Duration::from_millis(heap.interval_ms().max(1));
        thread::Builder::new()
            .name(format!("wasmex-gc-{worker}"))
            .spawn(move || worker_loop(weak, interval))
            .expect("failed to spawn GC collector thread");
    }
}

fn worker_loop(weak: Weak<Heap>, interval: Duration) {
    let mut last_cycle = Instant::now();
    loop {
        let Some(heap) = weak.upgrade() else {
            return;
        };
        if heap.mark.stop.load(Ordering::Relaxed) {
            return;
        }
        if heap.mark.marking.load(Ordering::Acquire) {
            // Another worker leads a cycle; help drain the gray queue.
            drain_gray(&heap);
        } else if heap.over_threshold() || last_cycle.elapsed() >= interval {
            collect(&heap);
            last_cycle = Instant::now();
        }
        drop(heap);
        thread::sleep(Duration::from_millis(10));
    }
}

/// Runs one full collection cycle; callable from any thread.
pub(super) fn collect(heap: &Heap) {
    let _cycle = heap.mark.cycle.lock();

    // Mark phase. The previous cycle's black set is stale: conceptually it
    // is swapped into the white set, which here is simply "not re-marked".
    heap.mark.black.lock().clear();
    heap.mark.marking.store(true, Ordering::Release);
    {
        let roots = heap.root_snapshot();
        let mut gray = heap.mark.gray.lock();
        gray.extend(roots);
    }
    drain_gray(heap);
    // Late write-barrier pushes race the phase end; one more drain after
    // clearing the flag empties them before the sweep decides anything.
    heap.mark.marking.store(false, Ordering::Release);
    drain_gray(heap);
    while heap.mark.in_flight.load(Ordering::Acquire) != 0 {
        thread::yield_now();
    }

    // Sweep phase.
    let black = std::mem::take(&mut *heap.mark.black.lock());
    let freed = heap.sweep(&black);
    heap.adjust_threshold();
    if freed > 0 {
        log::debug!("gc: cycle freed {freed} bytes, {} in use", heap.used());
    }
}

/// Drains the shared gray queue, marking objects black and graying their
/// children. Safe to run from multiple threads at once.
fn drain_gray(heap: &Heap) {
    loop {
        let id = {
            let mut gray = heap.mark.gray.lock();
            match gray.pop_front() {
                Some(id) => {
                    heap.mark.in_flight.fetch_add(1, Ordering::AcqRel);
                    id
                }
                None => return,
            }
        };
        scan(heap, id);
        heap.mark.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

fn scan(heap: &Heap, id: ObjectId) {
    {
        let mut black = heap.mark.black.lock();
        if !black.insert(id) {
            // Already scanned this cycle.
            return;
        }
    }
    let children = heap.children(id);
    if children.is_empty() {
        return;
    }
    let mut gray = heap.mark.gray.lock();
    for child in children {
        gray.push_back(child);
    }
    heap.mark.gray_ready.notify_all();
}
