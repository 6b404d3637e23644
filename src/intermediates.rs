//! Lazily built, memoized intermediates.
//!
//! An [`IntermediateCache`] owns a context (the fixed inputs of one operator
//! instance) and a table of named builders. `get` builds an entry at most once;
//! builders may request other entries, and a request for an entry that is
//! still being built is reported as a dependency cycle.

use crate::prelude::*;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

pub type Builder<C> = fn(&C, &IntermediateCache<C>) -> Result<Tsr>;

enum Entry {
    Building,
    Ready(Arc<Tsr>),
}

pub struct IntermediateCache<C> {
    context: C,
    builders: HashMap<&'static str, Builder<C>>,
    entries: RefCell<HashMap<&'static str, Entry>>,
}

impl<C> IntermediateCache<C> {
    pub fn new(context: C) -> Self {
        Self { context, builders: HashMap::new(), entries: RefCell::new(HashMap::new()) }
    }

    pub fn register(&mut self, name: &'static str, builder: Builder<C>) -> &mut Self {
        self.builders.insert(name, builder);
        self
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn get(&self, name: &str) -> Result<Arc<Tsr>> {
        match self.entries.borrow().get(name) {
            Some(Entry::Ready(value)) => return Ok(value.clone()),
            Some(Entry::Building) => return Err(CcError::IntermediateCycle(name.to_string())),
            None => {},
        }
        let (&key, &builder) =
            self.builders.get_key_value(name).ok_or_else(|| CcError::UnregisteredIntermediate(name.to_string()))?;

        self.entries.borrow_mut().insert(key, Entry::Building);
        let timer = std::time::Instant::now();
        let value = match builder(&self.context, self) {
            Ok(value) => Arc::new(value),
            Err(err) => {
                self.entries.borrow_mut().remove(key);
                return Err(err);
            },
        };
        tracing::trace!("Time elapsed (intermediate {key}): {:?}", timer.elapsed());
        self.entries.borrow_mut().insert(key, Entry::Ready(value.clone()));
        Ok(value)
    }

    pub fn is_ready(&self, name: &str) -> bool {
        matches!(self.entries.borrow().get(name), Some(Entry::Ready(_)))
    }

    pub fn ready_count(&self) -> usize {
        self.entries.borrow().values().filter(|e| matches!(e, Entry::Ready(_))).count()
    }
}
