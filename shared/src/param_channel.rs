//! Versioned parameter channel.
//!
//! Scalar parameters (gain, exposure time, flux statistics, enable flags) are
//! exchanged between the real-time loops as a value paired with a version
//! counter. Writers always store the value before incrementing the version, so
//! a reader that observes a new version also observes the value behind it.
//!
//! The [`Parameter`] trait is the seam: the loops only ever hold a
//! [`SharedParam`], and [`ParamCell`] is the in-process implementation used by
//! the simulator and the tests.

use bitflags::bitflags;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

bitflags! {
    /// Out-of-band markers attached to a published parameter
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ParamFlags: u8 {
        /// Current value was written by the autogain controller
        const AUTOGAIN_WRITE = 0b0000_0001;
        /// A change was observed but has not been applied to the camera yet
        const UPDATED = 0b0000_0010;
    }
}

/// A value paired with a monotonically increasing version counter
pub trait Parameter<T: Copy>: Send + Sync {
    /// Name used in log messages
    fn name(&self) -> &str;

    /// Read the current value together with its version
    fn read(&self) -> (T, u64);

    /// Current value without the version
    fn value(&self) -> T {
        self.read().0
    }

    /// Current version without the value
    fn version(&self) -> u64 {
        self.read().1
    }

    /// Store `value` then advance the version, returning the new version.
    ///
    /// The version advances even when the value is unchanged.
    fn publish(&self, value: T) -> u64;

    /// Publish `value` only if nobody published since `expected_version`.
    ///
    /// # Returns
    /// * `Ok(version)` - The new version after publishing
    /// * `Err(version)` - The version actually found; nothing was written
    fn compare_and_publish(&self, expected_version: u64, value: T) -> Result<u64, u64>;

    /// Current marker flags
    fn flags(&self) -> ParamFlags;

    /// Set marker flags without touching the value or version
    fn insert_flags(&self, flags: ParamFlags);

    /// Clear marker flags without touching the value or version
    fn remove_flags(&self, flags: ParamFlags);
}

/// Shared handle to a parameter, cloned into every loop that reads or writes it
pub type SharedParam<T> = Arc<dyn Parameter<T>>;

/// Number of versions published since `baseline`.
///
/// Counters wrap, so the difference is taken with wrapping arithmetic and a
/// roll-over never stalls a caller waiting for N new versions.
pub fn versions_elapsed(current: u64, baseline: u64) -> u64 {
    current.wrapping_sub(baseline)
}

#[derive(Debug)]
struct Slot<T> {
    value: T,
    version: u64,
    flags: ParamFlags,
}

/// In-process [`Parameter`] backed by a mutex
pub struct ParamCell<T> {
    name: String,
    slot: Mutex<Slot<T>>,
}

impl<T: Copy + Send + 'static> ParamCell<T> {
    /// Create a parameter at version 0 with no flags set
    pub fn new(name: impl Into<String>, initial: T) -> Self {
        Self::with_version(name, initial, 0)
    }

    /// Create a parameter starting from an arbitrary version
    pub fn with_version(name: impl Into<String>, initial: T, version: u64) -> Self {
        Self {
            name: name.into(),
            slot: Mutex::new(Slot {
                value: initial,
                version,
                flags: ParamFlags::empty(),
            }),
        }
    }

    /// Create a parameter and wrap it as a [`SharedParam`]
    pub fn shared(name: impl Into<String>, initial: T) -> SharedParam<T> {
        Arc::new(Self::new(name, initial))
    }

    /// Store a value without advancing the version.
    ///
    /// Models a reader that runs between the two halves of a cross-process
    /// publish (value visible, counter not yet incremented).
    pub fn store_unversioned(&self, value: T) {
        self.lock().value = value;
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Copy + Send + 'static> Parameter<T> for ParamCell<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> (T, u64) {
        let slot = self.lock();
        (slot.value, slot.version)
    }

    fn publish(&self, value: T) -> u64 {
        let mut slot = self.lock();
        slot.value = value;
        slot.version = slot.version.wrapping_add(1);
        slot.version
    }

    fn compare_and_publish(&self, expected_version: u64, value: T) -> Result<u64, u64> {
        let mut slot = self.lock();
        if slot.version != expected_version {
            return Err(slot.version);
        }
        slot.value = value;
        slot.version = slot.version.wrapping_add(1);
        Ok(slot.version)
    }

    fn flags(&self) -> ParamFlags {
        self.lock().flags
    }

    fn insert_flags(&self, flags: ParamFlags) {
        self.lock().flags.insert(flags);
    }

    fn remove_flags(&self, flags: ParamFlags) {
        self.lock().flags.remove(flags);
    }
}

impl<T: Copy + Send + fmt::Debug + 'static> fmt::Debug for ParamCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let slot = self.lock();
        f.debug_struct("ParamCell")
            .field("name", &self.name)
            .field("value", &slot.value)
            .field("version", &slot.version)
            .field("flags", &slot.flags)
            .finish()
    }
}
