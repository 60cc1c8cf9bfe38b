//! Capacity accounting.
//!
//! The node advertises an abstract number of capacity units. Provisioning
//! takes one unit before touching any other resource and unprovisioning
//! gives it back, so the counter gates over-subscription under concurrent
//! requests.
//!
//! The tracker counts units in use rather than units left. Instances
//! inherited at startup may exceed the budget; the excess has to be paid
//! back by unprovisions before anything new fits.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Guarded count of capacity units in use, against a fixed `max`.
#[derive(Debug)]
pub struct CapacityTracker {
    max: u32,
    in_use: Mutex<usize>,
}

impl CapacityTracker {
    /// Create a tracker with all `max` units available.
    pub fn new(max: u32) -> Self {
        Self {
            max,
            in_use: Mutex::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.in_use.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remaining_for(&self, in_use: usize) -> u32 {
        let in_use = u32::try_from(in_use).unwrap_or(u32::MAX);
        self.max.saturating_sub(in_use)
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Units left, never more than `max` and zero while over budget.
    pub fn remaining(&self) -> u32 {
        self.remaining_for(*self.lock())
    }

    /// Units held, including any inherited excess over `max`.
    pub fn in_use(&self) -> usize {
        *self.lock()
    }

    /// Take one unit if any is left.
    pub fn try_decrement(&self) -> bool {
        let mut in_use = self.lock();
        if self.remaining_for(*in_use) == 0 {
            return false;
        }
        *in_use += 1;
        true
    }

    /// Return one unit. Returning more than were taken is a no-op.
    pub fn increment(&self) {
        let mut in_use = self.lock();
        *in_use = in_use.saturating_sub(1);
    }

    /// Reset from the number of instances already on the node and return
    /// the units left.
    pub fn reseed(&self, in_use: usize) -> u32 {
        let mut held = self.lock();
        *held = in_use;
        self.remaining_for(in_use)
    }
}
