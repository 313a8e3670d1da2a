//! Serial dispatch queue: a single worker thread that executes submitted closures in
//! submission order.
//!
//! Submissions are boxed closures drawn from an internal `Pool` so the number of
//! in-flight (submitted-but-not-yet-run) jobs is bounded by construction, matching the
//! original's fixed-size work-item record pool. Shutdown enqueues a sentinel closure
//! that flips the worker's running flag and lets the queue drain before the thread
//! exits, then joins it — this crate always prefers join over detach, per the original's
//! own stated preference where the two were ambiguous.

use crate::error::{ FluxError, Result };
use crate::pool::Pool;
use crate::queue::BoundedQueue;
use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::sync::atomic::{ AtomicBool, AtomicU64, Ordering };
use std::sync::{ Arc, Mutex };
use std::thread::JoinHandle;
use std::time::{ Duration, Instant };

type Job = Box<dyn FnOnce() + Send>;

enum WorkItem {
    // The pool guard is held for as long as the job sits in the queue and executes,
    // so pool exhaustion reflects true in-flight submissions, not momentary queue depth.
    Run(crate::pool::PoolRef<()>, Job),
    Shutdown,
}

struct Shared {
    queue: BoundedQueue<WorkItem>,
    pool: Pool<()>,
    destroying: AtomicBool,
}

/// A single-worker FIFO dispatch queue.
pub struct DispatchQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    timer: Arc<Timer>,
}

struct Timer {
    heap: Mutex<BinaryHeap<Reverse<TimerEntry>>>,
    next_id: AtomicU64,
    shutdown: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct TimerEntry {
    fire_at: Instant,
    id: u64,
    reload: Option<Duration>,
    job: Arc<dyn Fn() + Send + Sync>,
    cancelled: Arc<AtomicBool>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.id == other.id
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at.cmp(&other.fire_at).then(self.id.cmp(&other.id))
    }
}

/// A handle to a repeated dispatch, used to cancel it with `stop_repeated`.
#[derive(Clone)]
pub struct RepeatHandle {
    cancelled: Arc<AtomicBool>,
}

impl DispatchQueue {
    /// `queue_capacity` must be a power of two; it bounds both the submission queue
    /// depth and the backing work-item pool.
    pub fn new(queue_capacity: usize) -> Result<Self> {
        let queue = BoundedQueue::new(queue_capacity)?;
        let pool = Pool::new(queue_capacity, || ())?;
        let shared = Arc::new(Shared { queue, pool, destroying: AtomicBool::new(false) });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder
            ::new()
            .name("dispatch-worker".into())
            .spawn(move || {
                loop {
                    match worker_shared.queue.dequeue(None) {
                        Some(WorkItem::Run(_guard, job)) => job(),
                        Some(WorkItem::Shutdown) | None => {
                            break;
                        }
                    }
                }
            })
            .map_err(FluxError::Io)?;

        let timer = Arc::new(Timer {
            heap: Mutex::new(BinaryHeap::new()),
            next_id: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            thread: Mutex::new(None),
        });

        Ok(Self { shared, worker: Mutex::new(Some(worker)), timer })
    }

    /// Submit `job` to run on the worker thread, in submission order. Returns `false`
    /// if the pool backing submissions is exhausted or the queue is shutting down —
    /// callers are expected to treat this as back-pressure, not a fatal error.
    pub fn async_submit(&self, job: impl FnOnce() + Send + 'static) -> bool {
        if self.shared.destroying.load(Ordering::Acquire) {
            return false;
        }
        let Ok(guard) = self.shared.pool.try_alloc() else {
            return false;
        };
        self.shared.queue.try_enqueue(WorkItem::Run(guard, Box::new(job))).is_ok()
    }

    /// Submit `job` to run once, after `delay`.
    pub fn after(&self, delay: Duration, job: impl Fn() + Send + Sync + 'static) -> RepeatHandle {
        self.schedule(delay, None, job)
    }

    /// Submit `job` to run every `interval`, starting after `initial_delay`.
    pub fn start_repeated(
        &self,
        initial_delay: Duration,
        interval: Duration,
        job: impl Fn() + Send + Sync + 'static
    ) -> RepeatHandle {
        self.schedule(initial_delay, Some(interval), job)
    }

    pub fn stop_repeated(&self, handle: &RepeatHandle) {
        handle.cancelled.store(true, Ordering::Release);
    }

    fn schedule(
        &self,
        delay: Duration,
        reload: Option<Duration>,
        job: impl Fn() + Send + Sync + 'static
    ) -> RepeatHandle {
        let id = self.timer.next_id.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = TimerEntry {
            fire_at: Instant::now() + delay,
            id,
            reload,
            job: Arc::new(job),
            cancelled: cancelled.clone(),
        };
        self.timer.heap.lock().unwrap().push(Reverse(entry));
        self.ensure_timer_thread();
        RepeatHandle { cancelled }
    }

    fn ensure_timer_thread(&self) {
        let mut thread = self.timer.thread.lock().unwrap();
        if thread.is_some() {
            return;
        }
        let timer = self.timer.clone();
        let shared = self.shared.clone();
        *thread = Some(
            std::thread::Builder
                ::new()
                .name("dispatch-timer".into())
                .spawn(move || {
                    timer_loop(timer, shared);
                })
                .expect("failed to spawn dispatch timer thread")
        );
    }

    /// Signal shutdown, drain in-flight work, and join the worker thread. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.destroying.swap(true, Ordering::AcqRel) {
            return;
        }
        self.timer.shutdown.store(true, Ordering::Release);
        let _ = self.shared.queue.enqueue(WorkItem::Shutdown, None);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.timer.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(timer: Arc<Timer>, shared: Arc<Shared>) {
    loop {
        if timer.shutdown.load(Ordering::Acquire) {
            return;
        }
        let next_wait = {
            let mut heap = timer.heap.lock().unwrap();
            while let Some(Reverse(entry)) = heap.peek() {
                if entry.cancelled.load(Ordering::Acquire) {
                    heap.pop();
                    continue;
                }
                break;
            }
            match heap.peek() {
                None => None,
                Some(Reverse(entry)) => {
                    let now = Instant::now();
                    if entry.fire_at <= now {
                        let Reverse(entry) = heap.pop().unwrap();
                        drop(heap);
                        if !entry.cancelled.load(Ordering::Acquire) {
                            let job = entry.job.clone();
                            if let Ok(guard) = shared.pool.try_alloc() {
                                let _ = shared.queue.try_enqueue(
                                    WorkItem::Run(
                                        guard,
                                        Box::new(move || {
                                            job();
                                        })
                                    )
                                );
                            }
                            if let Some(reload) = entry.reload {
                                let mut heap = timer.heap.lock().unwrap();
                                heap.push(
                                    Reverse(TimerEntry {
                                        fire_at: Instant::now() + reload,
                                        id: entry.id,
                                        reload: entry.reload,
                                        job: entry.job,
                                        cancelled: entry.cancelled,
                                    })
                                );
                            }
                        }
                        Some(Duration::ZERO)
                    } else {
                        Some(entry.fire_at - now)
                    }
                }
            }
        };
        std::thread::sleep(next_wait.unwrap_or(Duration::from_millis(10)).min(Duration::from_millis(10)));
    }
}
