//! State-event loop: the composition of a dispatch queue, a set of state machines, a
//! notifier, and a pool of event buffers.
//!
//! Every event is handled entirely on the dispatch worker thread: `post` allocates a
//! buffer from the event pool, fills it in, and submits a closure that runs the
//! optional pre-processor, then feeds the event through every registered state machine
//! in registration order, then posts it to the notifier for external observers. The
//! event buffer is returned to the pool automatically when the closure's `PoolRef`
//! drops at the end of the submission.

use crate::dispatch::DispatchQueue;
use crate::error::{ FluxError, Result };
use crate::notifier::Notifier;
use crate::pool::Pool;
use crate::state_machine::StateMachine;
use parking_lot::Mutex;
use std::sync::Arc;

/// An observer registered with a `StateEventLoop`'s internal notifier: invoked with the
/// category and the event that was posted.
pub type Observer<E> = Box<dyn Fn(&E, u32) + Send + Sync>;

struct Shared<E> {
    dispatch: DispatchQueue,
    machines: Mutex<Vec<StateMachine<E>>>,
    notifier: Notifier<Observer<E>, E>,
    events: Pool<E>,
    pre_process: Mutex<Option<Box<dyn Fn(&mut E) + Send + Sync>>>,
}

/// Composite runtime binding a dispatch queue, state machines, a notifier, and an event
/// pool together, per the original state_event_loop contract.
pub struct StateEventLoop<E: Clone + Send + Sync + 'static> {
    shared: Arc<Shared<E>>,
}

impl<E: Clone + Send + Sync + 'static> StateEventLoop<E> {
    pub fn new(
        dispatch_capacity: usize,
        event_pool_capacity: usize,
        category_count: u32,
        default_event: impl Fn() -> E
    )
        -> Result<Self>
        where E: Default
    {
        let dispatch = DispatchQueue::new(dispatch_capacity)?;
        let events = Pool::new(event_pool_capacity, default_event)?;
        let notifier = Notifier::new(
            category_count,
            event_pool_capacity,
            || -> Observer<E> { Box::new(|_e: &E, _category: u32| {}) },
            |observer: &Observer<E>, category, event: &E| {
                observer(event, category);
            }
        )?;
        Ok(
            Self {
                shared: Arc::new(Shared {
                    dispatch,
                    machines: Mutex::new(Vec::new()),
                    notifier,
                    events,
                    pre_process: Mutex::new(None),
                }),
            }
        )
    }

    pub fn add_state_machine(&self, machine: StateMachine<E>) {
        self.shared.machines.lock().push(machine);
    }

    /// Register an observer for `category`; it will be invoked with each posted event.
    pub fn register_observer(&self, category: u32, observer: impl Fn(&E, u32) + Send + Sync + 'static) -> Result<()> {
        self.shared.notifier.register(category, move |slot: &mut Observer<E>| {
            *slot = Box::new(observer);
        })?;
        Ok(())
    }

    /// Install a pre-processor that runs once per event, before any state machine sees
    /// it. Must be set before the first `post`.
    pub fn set_pre_process(&self, pre_process: impl Fn(&mut E) + Send + Sync + 'static) {
        *self.shared.pre_process.lock() = Some(Box::new(pre_process));
    }

    /// Start every registered state machine.
    pub fn start(&self) {
        for machine in self.shared.machines.lock().iter_mut() {
            machine.start();
        }
    }

    /// Allocate an event buffer from the template, and dispatch it through the loop:
    /// pre-process, each state machine's `handle_event`, then the notifier.
    pub fn post(&self, category: u32, template: E) -> Result<()>
        where E: std::fmt::Debug
    {
        let mut event = self.shared.events.try_alloc()?;
        *event = template;

        let shared = self.shared.clone();
        let submitted = self.shared.dispatch.async_submit(move || {
            if let Some(pre) = shared.pre_process.lock().as_ref() {
                pre(&mut event);
            }
            for machine in shared.machines.lock().iter_mut() {
                machine.handle_event(&event);
            }
            let _ = shared.notifier.post(category, &event);
            // `event` (a PoolRef<E>) drops here, returning the buffer to the pool.
        });

        if !submitted {
            return Err(FluxError::unexpected("state event loop dispatch queue rejected the event"));
        }
        Ok(())
    }

    /// Stop every registered state machine, then shut down the dispatch worker.
    ///
    /// The stop-all-machines step runs on the dispatch worker itself (the same thread
    /// that drives every `handle_event` call), so it can never race a still-draining
    /// `post`. `shutdown` then blocks until that job — and anything queued ahead of it —
    /// has finished, and joins the worker thread.
    pub fn stop(&self) {
        let shared = self.shared.clone();
        self.shared.dispatch.async_submit(move || {
            for machine in shared.machines.lock().iter_mut() {
                machine.stop();
            }
        });
        self.shared.dispatch.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::State;
    use std::sync::atomic::{ AtomicU32, Ordering };

    #[derive(Debug, Default, Clone)]
    struct Ev {
        n: u32,
    }

    struct Counter {
        seen: Arc<AtomicU32>,
        exited: Arc<AtomicU32>,
    }
    impl State<Ev> for Counter {
        fn id(&self) -> u32 {
            0
        }
        fn name(&self) -> &str {
            "counter"
        }
        fn on_exit(&mut self, _d: &mut dyn std::any::Any) {
            self.exited.fetch_add(1, Ordering::Relaxed);
        }
        fn is_valid_event(&self, _e: &Ev) -> bool {
            true
        }
        fn handle_event(&mut self, event: &Ev, _d: &mut dyn std::any::Any) -> u32 {
            self.seen.fetch_add(event.n, Ordering::Relaxed);
            0
        }
    }

    #[test]
    fn posted_events_reach_the_state_machine() {
        let loop_ = StateEventLoop::<Ev>::new(4, 4, 1, Ev::default).unwrap();
        let seen = Arc::new(AtomicU32::new(0));
        let exited = Arc::new(AtomicU32::new(0));
        let mut sm = StateMachine::new("sm", 0, Box::new(()));
        sm.register_state(Box::new(Counter { seen: seen.clone(), exited: exited.clone() }));
        loop_.add_state_machine(sm);
        loop_.start();

        loop_.post(0, Ev { n: 5 }).unwrap();
        loop_.post(0, Ev { n: 7 }).unwrap();
        loop_.stop();

        assert_eq!(seen.load(Ordering::Relaxed), 12);
        assert_eq!(exited.load(Ordering::Relaxed), 1);
    }
}
