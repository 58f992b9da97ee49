//! The monitor's streaming rate converter
//!
//! One [`RateConverter`] carries phase and history across callbacks. Access
//! is claimed with a single CAS; the audio thread never waits; a caller that
//! loses the race is told so and converts its block on its own.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::utils::Backoff;

use crate::resample::RateConverter;

pub(crate) struct ConverterSlot {
    busy: AtomicBool,
    converter: UnsafeCell<RateConverter>,
}

// SAFETY: `converter` is only reached through a guard, and a guard exists
// only for the thread that flipped `busy` from false to true
unsafe impl Sync for ConverterSlot {}

impl ConverterSlot {
    pub fn new(converter: RateConverter) -> Self {
        Self {
            busy: AtomicBool::new(false),
            converter: UnsafeCell::new(converter),
        }
    }

    /// Claim the converter without waiting
    #[inline]
    pub fn try_claim(&self) -> Option<ConverterGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ConverterGuard { slot: self })
    }

    /// Spin until the converter is free. Control threads only.
    pub fn claim(&self) -> ConverterGuard<'_> {
        let backoff = Backoff::new();
        loop {
            if let Some(guard) = self.try_claim() {
                return guard;
            }
            backoff.snooze();
        }
    }
}

pub(crate) struct ConverterGuard<'a> {
    slot: &'a ConverterSlot,
}

impl Deref for ConverterGuard<'_> {
    type Target = RateConverter;

    fn deref(&self) -> &RateConverter {
        // SAFETY: this guard holds `busy`
        unsafe { &*self.slot.converter.get() }
    }
}

impl DerefMut for ConverterGuard<'_> {
    fn deref_mut(&mut self) -> &mut RateConverter {
        // SAFETY: this guard holds `busy`
        unsafe { &mut *self.slot.converter.get() }
    }
}

impl Drop for ConverterGuard<'_> {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}
