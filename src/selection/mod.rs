//! Event selection for the general-purpose counters.
//!
//! The engine owns a pool of eligible events, shuffled once at construction
//! and consumed destructively: every event drawn to fill an open counter slot
//! leaves the pool for good. Once the pool is exhausted, open slots stay
//! empty.

use anyhow::bail;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogError, CounterBudget, EventCatalog, EventId};

/// Event families the sampler cannot program: they need a second counter
/// or an auxiliary MSR to be configured alongside the event.
pub const EXCLUDED_FAMILIES: &[&str] = &["OFFCORE_RESPONSE", "UOPS_DISPATCHED_PORT"];

/// Returns true if the event belongs to an excluded family.
pub fn is_excluded(event: &str) -> bool {
    EXCLUDED_FAMILIES
        .iter()
        .any(|family| event.contains(family))
}

/// Returns true if a command parameter asks the engine to pick an event.
fn is_open_slot(parameter: &Option<EventId>) -> bool {
    parameter.as_deref().map_or(true, str::is_empty)
}

/// Shrinking, order-significant collection of eligible events.
///
/// Events are drawn from the back; the pool never grows.
#[derive(Debug, Clone, Default)]
pub struct EventPool {
    events: Vec<EventId>,
}

impl EventPool {
    fn new(events: Vec<EventId>) -> Self {
        Self { events }
    }

    /// Remove and return the next event.
    fn draw(&mut self) -> Option<EventId> {
        self.events.pop()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Remaining events; the last one is drawn next.
    pub fn as_slice(&self) -> &[EventId] {
        &self.events
    }
}

/// Turns control command parameters into the list of events to monitor.
#[derive(Debug)]
pub struct SelectionEngine {
    budget: CounterBudget,
    fixed_events: Vec<EventId>,
    pool: EventPool,
}

impl SelectionEngine {
    /// Build the engine for a processor model.
    ///
    /// The pool holds every catalog event except excluded families and the
    /// fixed events, permuted with a generator seeded from `seed` (or from OS
    /// entropy when unset).
    pub fn new<C>(
        model: &str,
        fixed_events: Vec<EventId>,
        catalog: &C,
        seed: Option<u64>,
    ) -> Result<Self, CatalogError>
    where
        C: EventCatalog + ?Sized,
    {
        let budget = catalog.counter_budget(model)?;
        let events = catalog.list_events(model)?;

        let mut rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };

        let mut eligible = eligible_events(events, &fixed_events);
        eligible.shuffle(&mut rng);

        let engine = Self {
            budget,
            fixed_events,
            pool: EventPool::new(eligible),
        };

        info!(
            model,
            pool = engine.pool.len(),
            fixed_slots = budget.fixed_slots,
            general_slots = budget.general_slots,
            fixed_events = ?engine.fixed_events,
            "selection engine ready",
        );

        Ok(engine)
    }

    /// Build the engine from a pool that is already in draw order.
    ///
    /// Excluded families and fixed events are still filtered out; no shuffle
    /// is applied.
    pub fn with_pool(
        budget: CounterBudget,
        fixed_events: Vec<EventId>,
        pool: Vec<EventId>,
    ) -> Self {
        let eligible = eligible_events(pool, &fixed_events);
        Self {
            budget,
            fixed_events,
            pool: EventPool::new(eligible),
        }
    }

    pub fn budget(&self) -> CounterBudget {
        self.budget
    }

    pub fn fixed_events(&self) -> &[EventId] {
        &self.fixed_events
    }

    pub fn pool(&self) -> &EventPool {
        &self.pool
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    /// Fail unless every fixed event has a fixed counter to run on.
    pub fn check_fixed_slots(&self) -> anyhow::Result<()> {
        if self.fixed_events.len() > self.budget.fixed_slots {
            bail!(
                "{} fixed events configured but only {} fixed counters available",
                self.fixed_events.len(),
                self.budget.fixed_slots,
            );
        }
        Ok(())
    }

    /// Compute the events to monitor for a set of command parameters.
    ///
    /// Explicit entries are kept in order. The fill target is the general
    /// budget minus the number of open (unset) entries; the pool tops the
    /// explicit entries up to that target while it lasts. The fixed events
    /// are then pushed to the front one by one, so they lead the result in
    /// reverse configuration order.
    pub fn resolve(&mut self, parameters: &[Option<EventId>]) -> Vec<EventId> {
        let open_count = parameters.iter().filter(|p| is_open_slot(p)).count();
        let target = self.budget.general_slots.saturating_sub(open_count);

        let (mut resolved, dropped) = explicit_entries(parameters, self.budget.general_slots);
        let explicit_count = resolved.len();

        if dropped > 0 {
            warn!(
                requested = explicit_count + dropped,
                dropped,
                general_slots = self.budget.general_slots,
                "explicit events exceed general counters, extra entries dropped",
            );
        }

        while resolved.len() < target {
            match self.pool.draw() {
                Some(event) => resolved.push(event),
                None => break,
            }
        }
        let drawn = resolved.len() - explicit_count;

        debug!(
            explicit = explicit_count,
            open = open_count,
            target,
            drawn,
            pool_remaining = self.pool.len(),
            "resolved command parameters",
        );

        let mut events = Vec::with_capacity(self.fixed_events.len() + resolved.len());
        for fixed in self.fixed_events.iter().rev() {
            events.push(fixed.clone());
        }
        events.extend(resolved);
        events
    }
}

/// Explicit entries in order, capped at `limit`, and how many were cut.
fn explicit_entries(parameters: &[Option<EventId>], limit: usize) -> (Vec<EventId>, usize) {
    let mut explicit: Vec<EventId> = parameters
        .iter()
        .filter(|p| !is_open_slot(p))
        .flatten()
        .cloned()
        .collect();
    let dropped = explicit.len().saturating_sub(limit);
    explicit.truncate(limit);
    (explicit, dropped)
}

fn eligible_events(events: Vec<EventId>, fixed_events: &[EventId]) -> Vec<EventId> {
    events
        .into_iter()
        .filter(|event| !is_excluded(event) && !fixed_events.contains(event))
        .collect()
}
