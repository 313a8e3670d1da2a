//! Finite state machine: a fixed set of registered states with enter/exit hooks and a
//! single current-state latch.
//!
//! Single-threaded by contract, same as the original: nothing here takes a lock, and
//! the caller (typically a `StateEventLoop`'s dispatch worker) is responsible for never
//! driving a `StateMachine` from more than one thread at a time.

pub const MAX_STATES: usize = 20;

/// A single state's callbacks. Implemented by the caller for each state id.
pub trait State<E> {
    fn id(&self) -> u32;
    fn name(&self) -> &str;

    /// Called once, the first time this state becomes current, before `on_enter`.
    fn init(&mut self, _machine_data: &mut dyn std::any::Any) {}

    /// Called every time this state becomes current.
    fn on_enter(&mut self, _machine_data: &mut dyn std::any::Any) {}

    /// Called every time this state is left.
    fn on_exit(&mut self, _machine_data: &mut dyn std::any::Any) {}

    /// Whether this state accepts `event`. A `false` here means `handle_event` is not
    /// called for this event on this state.
    fn is_valid_event(&self, event: &E) -> bool;

    /// Handle `event`, returning the id of the state to transition to (which may be
    /// this state's own id, for a no-op transition).
    fn handle_event(&mut self, event: &E, machine_data: &mut dyn std::any::Any) -> u32;
}

struct Entry<E> {
    state: Box<dyn State<E>>,
    entered_once: bool,
}

/// A machine over up to `MAX_STATES` registered states.
pub struct StateMachine<E> {
    name: String,
    states: Vec<Entry<E>>,
    current: Option<usize>,
    started: bool,
    start_state_id: u32,
    private_data: Box<dyn std::any::Any>,
}

impl<E> StateMachine<E> {
    pub fn new(name: impl Into<String>, start_state_id: u32, private_data: Box<dyn std::any::Any>) -> Self {
        Self {
            name: name.into(),
            states: Vec::with_capacity(MAX_STATES),
            current: None,
            started: false,
            start_state_id,
            private_data,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a state. Panics if more than `MAX_STATES` states are registered or a
    /// duplicate id is registered — both indicate a programmer error, not a runtime
    /// condition a caller can recover from.
    pub fn register_state(&mut self, state: Box<dyn State<E>>) {
        assert!(self.states.len() < MAX_STATES, "state machine '{}' exceeds MAX_STATES", self.name);
        let id = state.id();
        assert!(
            self.states.iter().all(|e| e.state.id() != id),
            "state machine '{}' already has a state with id {id}",
            self.name
        );
        self.states.push(Entry { state, entered_once: false });
    }

    fn index_of(&self, id: u32) -> Option<usize> {
        self.states.iter().position(|e| e.state.id() == id)
    }

    /// Enter `start_state_id`, running `init` (first time only) then `on_enter`.
    pub fn start(&mut self) {
        assert!(!self.started, "state machine '{}' already started", self.name);
        let index = self
            .index_of(self.start_state_id)
            .unwrap_or_else(|| panic!("state machine '{}' has no start state registered", self.name));
        self.enter(index);
        self.started = true;
    }

    fn enter(&mut self, index: usize) {
        let data = self.private_data.as_mut();
        let entry = &mut self.states[index];
        if !entry.entered_once {
            entry.state.init(data);
            entry.entered_once = true;
        }
        entry.state.on_enter(data);
        self.current = Some(index);
    }

    /// Route `event` to the current state and, if it requests a transition to a
    /// different state, run exit/enter hooks in order. Returns `true` if the event was
    /// valid for the current state.
    pub fn handle_event(&mut self, event: &E) -> bool {
        assert!(self.started, "state machine '{}' was not started", self.name);
        let current = self.current.expect("started machine always has a current state");
        if !self.states[current].state.is_valid_event(event) {
            return false;
        }
        let next_id = self.states[current].state.handle_event(event, self.private_data.as_mut());
        let current_id = self.states[current].state.id();
        if next_id != current_id {
            self.transition_to(next_id);
        }
        true
    }

    fn transition_to(&mut self, next_id: u32) {
        let current = self.current.expect("transition_to requires a started machine");
        let next_index = self
            .index_of(next_id)
            .unwrap_or_else(|| panic!("state machine '{}' has no state with id {next_id}", self.name));
        self.states[current].state.on_exit(self.private_data.as_mut());
        self.enter(next_index);
    }

    /// Force a transition to `next_id` from outside `handle_event`, running the current
    /// state's `on_exit` then the target state's `init`/`on_enter`. Panics if `next_id`
    /// is not a registered state or the machine was not started.
    pub fn transition(&mut self, next_id: u32) {
        assert!(self.started, "state machine '{}' was not started", self.name);
        self.transition_to(next_id);
    }

    /// Stop the machine: run the current state's `on_exit`, clear the current state,
    /// and allow `start` to be called again. No-op if not started.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        if let Some(current) = self.current.take() {
            self.states[current].state.on_exit(self.private_data.as_mut());
        }
        self.started = false;
    }

    pub fn current_state_id(&self) -> u32 {
        let current = self.current.expect("state machine not started");
        self.states[current].state.id()
    }

    /// Look up a registered state by id.
    pub fn get_state(&self, id: u32) -> Option<&dyn State<E>> {
        self.index_of(id).map(|i| self.states[i].state.as_ref())
    }

    pub fn private_data(&mut self) -> &mut dyn std::any::Any {
        self.private_data.as_mut()
    }

    pub fn set_private_data(&mut self, private_data: Box<dyn std::any::Any>) {
        self.private_data = private_data;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Event {
        Next,
        Ignore,
    }

    struct A {
        entered: u32,
    }
    impl State<Event> for A {
        fn id(&self) -> u32 {
            0
        }
        fn name(&self) -> &str {
            "A"
        }
        fn on_enter(&mut self, _d: &mut dyn std::any::Any) {
            self.entered += 1;
        }
        fn is_valid_event(&self, event: &Event) -> bool {
            matches!(event, Event::Next)
        }
        fn handle_event(&mut self, _event: &Event, _d: &mut dyn std::any::Any) -> u32 {
            1
        }
    }

    struct B;
    impl State<Event> for B {
        fn id(&self) -> u32 {
            1
        }
        fn name(&self) -> &str {
            "B"
        }
        fn is_valid_event(&self, _event: &Event) -> bool {
            true
        }
        fn handle_event(&mut self, _event: &Event, _d: &mut dyn std::any::Any) -> u32 {
            1
        }
    }

    #[test]
    fn transitions_between_registered_states() {
        let mut sm = StateMachine::new("test", 0, Box::new(()));
        sm.register_state(Box::new(A { entered: 0 }));
        sm.register_state(Box::new(B));
        sm.start();
        assert_eq!(sm.current_state_id(), 0);
        assert!(sm.handle_event(&Event::Next));
        assert_eq!(sm.current_state_id(), 1);
    }

    #[test]
    fn invalid_event_is_rejected_without_transition() {
        let mut sm = StateMachine::new("test", 0, Box::new(()));
        sm.register_state(Box::new(A { entered: 0 }));
        sm.register_state(Box::new(B));
        sm.start();
        assert!(!sm.handle_event(&Event::Ignore));
        assert_eq!(sm.current_state_id(), 0);
    }

    #[test]
    fn self_transition_does_not_re_enter() {
        let mut sm = StateMachine::new("test", 1, Box::new(()));
        sm.register_state(Box::new(A { entered: 0 }));
        sm.register_state(Box::new(B));
        sm.start();
        assert!(sm.handle_event(&Event::Next));
        assert_eq!(sm.current_state_id(), 1);
    }

    #[test]
    fn stop_runs_exit_and_allows_restart() {
        let mut sm = StateMachine::new("test", 0, Box::new(()));
        sm.register_state(Box::new(A { entered: 0 }));
        sm.register_state(Box::new(B));
        sm.start();
        sm.stop();
        sm.start();
        assert_eq!(sm.current_state_id(), 0);
    }

    #[test]
    fn explicit_transition_runs_exit_and_enter() {
        let mut sm = StateMachine::new("test", 0, Box::new(()));
        sm.register_state(Box::new(A { entered: 0 }));
        sm.register_state(Box::new(B));
        sm.start();
        sm.transition(1);
        assert_eq!(sm.current_state_id(), 1);
    }

    #[test]
    fn get_state_looks_up_by_id() {
        let mut sm = StateMachine::new("test", 0, Box::new(()));
        sm.register_state(Box::new(A { entered: 0 }));
        sm.register_state(Box::new(B));
        assert_eq!(sm.get_state(1).unwrap().name(), "B");
        assert!(sm.get_state(99).is_none());
    }

    #[test]
    #[should_panic]
    fn registering_too_many_states_panics() {
        let mut sm: StateMachine<Event> = StateMachine::new("test", 0, Box::new(()));
        for i in 0..(MAX_STATES as u32) + 1 {
            sm.register_state(Box::new(Stub { id: i }));
        }
    }

    struct Stub {
        id: u32,
    }
    impl State<Event> for Stub {
        fn id(&self) -> u32 {
            self.id
        }
        fn name(&self) -> &str {
            "stub"
        }
        fn is_valid_event(&self, _event: &Event) -> bool {
            false
        }
        fn handle_event(&mut self, _event: &Event, _d: &mut dyn std::any::Any) -> u32 {
            self.id
        }
    }
}
