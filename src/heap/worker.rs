//! The GC worker pool. Workers park on the phase monitor between cycles
//! and run whichever phase wakes them: marking (when the master has made
//! them eligible) or batch sweeping plus opportunistic coalescing.

use crate::heap::phase::Phase;
use crate::heap::Heap;
use crate::stats;
use crate::sweeper::SWEEP_BATCH_SIZE;
use std::sync::Arc;
use std::thread::JoinHandle;

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the configured number of workers. Worker ids start at 1; id
    /// 0 is the thread driving the collection.
    pub fn spawn(heap: &Arc<Heap>) -> WorkerPool {
        let handles = (1..=heap.options.threads)
            .map(|worker_id| {
                let heap = Arc::clone(heap);
                std::thread::Builder::new()
                    .name(format!("gc-worker-{}", worker_id))
                    .spawn(move || run(heap, worker_id))
                    .expect("failed to spawn GC worker")
            })
            .collect();
        WorkerPool { handles }
    }

    /// Ask every worker to exit and join them.
    pub fn shutdown(mut self, heap: &Heap) {
        heap.phase.request(Phase::Shutdown, 0);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("a GC worker panicked during shutdown");
            }
        }
    }
}

fn run(heap: Arc<Heap>, worker_id: usize) {
    trace!("worker {} up", worker_id);
    let mut epoch = 0;
    loop {
        let (phase, new_epoch) = heap.phase.wait_for_work(worker_id, epoch);
        epoch = new_epoch;
        match phase {
            Phase::Mark => {
                let (_, start, duration) = stats::timed(|| heap.marker.mark_loop(&heap, worker_id));
                if let Some(stats) = &heap.stats {
                    stats.record("mark", worker_id, start, duration);
                }
            }
            Phase::Sweep => {
                let (_, start, duration) = stats::timed(|| {
                    while heap.sweeper.sweep_batch(&heap, worker_id, SWEEP_BATCH_SIZE) {
                        heap.sweeper.lazy_coalesce(&heap);
                    }
                    heap.sweeper.lazy_coalesce(&heap);
                });
                if let Some(stats) = &heap.stats {
                    stats.record("sweep", worker_id, start, duration);
                }
            }
            Phase::Idle => {}
            Phase::Shutdown => break,
        }
    }
    trace!("worker {} down", worker_id);
}
