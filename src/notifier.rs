//! Category-indexed observer registry.
//!
//! Observers are allocated from an internal `Pool`, then pushed onto the front of their
//! category's list so the most recently registered observer is delivered to first —
//! matching the original's intrusive-list-head insertion order.

use crate::error::{ FluxError, Result };
use crate::pool::{ Pool, PoolRef };
use parking_lot::Mutex;
use std::collections::VecDeque;

/// A function invoked once per registered observer during `post`, given the observer
/// block, the category posted to, and the event payload.
pub type DeliverFn<B, Ev> = Box<dyn Fn(&B, u32, &Ev) + Send + Sync>;

struct Registry<B> {
    categories: Vec<VecDeque<PoolRef<B>>>,
}

pub struct Notifier<B, Ev = ()> {
    registry: Mutex<Registry<B>>,
    pool: Pool<B>,
    deliver: DeliverFn<B, Ev>,
    category_count: u32,
}

impl<B, Ev> Notifier<B, Ev> {
    /// `category_count` bounds the categories observers may register for;
    /// `max_observers` sizes the backing pool of observer blocks.
    pub fn new(
        category_count: u32,
        max_observers: usize,
        default_block: impl Fn() -> B,
        deliver: impl Fn(&B, u32, &Ev) + Send + Sync + 'static
    ) -> Result<Self> {
        if category_count == 0 {
            return Err(FluxError::config("notifier needs at least one category"));
        }
        let pool = Pool::new(max_observers, default_block)?;
        let categories = (0..category_count).map(|_| VecDeque::new()).collect();
        Ok(Self {
            registry: Mutex::new(Registry { categories }),
            pool,
            deliver: Box::new(deliver),
            category_count,
        })
    }

    /// Allocate and register an observer block for `category`, returning a handle the
    /// caller keeps only to later `deregister` it.
    pub fn register(&self, category: u32, init: impl FnOnce(&mut B)) -> Result<PoolRef<B>> {
        self.check_category(category)?;
        let mut block = self.pool.try_alloc()?;
        init(&mut block);
        let mut registry = self.registry.lock();
        registry.categories[category as usize].push_front(block.clone());
        Ok(block)
    }

    /// Remove the first registered block in `category` that is the same slot as
    /// `handle`. No-op if it was already deregistered.
    pub fn deregister(&self, category: u32, handle: &PoolRef<B>) -> Result<()> {
        self.check_category(category)?;
        let mut registry = self.registry.lock();
        let list = &mut registry.categories[category as usize];
        if let Some(pos) = list.iter().position(|b| std::ptr::eq(&**b, &**handle)) {
            list.remove(pos);
        }
        Ok(())
    }

    /// Deliver `category`'s event to every registered observer, most-recently-registered
    /// first. Runs with the registry lock held: observers must not register or
    /// deregister on this notifier from within the deliver callback.
    pub fn post(&self, category: u32, event: &Ev) -> Result<()> {
        self.check_category(category)?;
        let registry = self.registry.lock();
        for block in &registry.categories[category as usize] {
            (self.deliver)(block, category, event);
        }
        Ok(())
    }

    pub fn observer_count(&self, category: u32) -> Result<usize> {
        self.check_category(category)?;
        Ok(self.registry.lock().categories[category as usize].len())
    }

    fn check_category(&self, category: u32) -> Result<()> {
        if category >= self.category_count {
            return Err(FluxError::config(format!("category {category} out of range")));
        }
        Ok(())
    }
}
