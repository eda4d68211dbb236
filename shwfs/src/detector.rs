//! Published detector settings and the bookkeeping around who changed them.
//!
//! Gain and exposure time are shared parameters that both the operator and
//! the autogain controller may write. The controller marks its own writes with
//! [`ParamFlags::AUTOGAIN_WRITE`] before publishing. The acquisition loop runs
//! a [`ChangeObserver`] which flags every observed change as
//! [`ParamFlags::UPDATED`] (pending for the camera) and, when a change arrives
//! without the controller's marker, switches autogain off: the operator has
//! taken manual control.

use crate::exposure_table::ExposureSetting;
use log::info;
use shared::param_channel::{ParamCell, ParamFlags, SharedParam};

/// Shared gain, exposure and autogain-enable parameters
#[derive(Clone)]
pub struct DetectorParams {
    pub gain: SharedParam<i64>,
    pub exposure_ms: SharedParam<f32>,
    pub autogain_on: SharedParam<bool>,
}

impl DetectorParams {
    pub fn new(initial: ExposureSetting, autogain_on: bool) -> Self {
        Self {
            gain: ParamCell::shared("emgain", initial.gain),
            exposure_ms: ParamCell::shared("exposuretime", initial.exposure_ms),
            autogain_on: ParamCell::shared("autogain_on", autogain_on),
        }
    }

    /// Currently published operating point
    pub fn current(&self) -> ExposureSetting {
        ExposureSetting::new(self.gain.value(), self.exposure_ms.value())
    }

    /// Publish an operating point on behalf of the autogain controller
    pub fn request(&self, setting: ExposureSetting) {
        self.gain.insert_flags(ParamFlags::AUTOGAIN_WRITE);
        self.exposure_ms.insert_flags(ParamFlags::AUTOGAIN_WRITE);
        self.gain.publish(setting.gain);
        self.exposure_ms.publish(setting.exposure_ms);
    }

    /// Switch autogain on or off (value first, then version)
    pub fn set_autogain(&self, on: bool) {
        self.autogain_on.publish(on);
    }

    /// True while a gain or exposure change is still on its way to the camera
    pub fn change_in_flight(&self) -> bool {
        let pending = ParamFlags::AUTOGAIN_WRITE | ParamFlags::UPDATED;
        self.gain.flags().intersects(pending) || self.exposure_ms.flags().intersects(pending)
    }

    /// Gain to apply to the camera, if a change is pending
    pub fn take_pending_gain(&self) -> Option<i64> {
        take_pending(&self.gain)
    }

    /// Exposure time to apply to the camera, if a change is pending
    pub fn take_pending_exposure(&self) -> Option<f32> {
        take_pending(&self.exposure_ms)
    }
}

fn take_pending<T: Copy>(param: &SharedParam<T>) -> Option<T> {
    if param.flags().contains(ParamFlags::UPDATED) {
        let value = param.value();
        param.remove_flags(ParamFlags::UPDATED);
        Some(value)
    } else {
        None
    }
}

/// What one [`ChangeObserver::observe`] pass found
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObservedChanges {
    pub gain_changed: bool,
    pub exposure_changed: bool,
    /// Autogain was switched off because of an external change
    pub autogain_released: bool,
}

/// Tracks the last seen gain/exposure versions
#[derive(Debug, Clone)]
pub struct ChangeObserver {
    gain_version: u64,
    exposure_version: u64,
}

impl ChangeObserver {
    /// Start observing from the parameters' current versions
    pub fn new(params: &DetectorParams) -> Self {
        Self {
            gain_version: params.gain.version(),
            exposure_version: params.exposure_ms.version(),
        }
    }

    pub fn observe(&mut self, params: &DetectorParams) -> ObservedChanges {
        let mut changes = ObservedChanges::default();

        if let Some(external) = observe_one(&params.gain, &mut self.gain_version) {
            changes.gain_changed = true;
            changes.autogain_released |= external;
        }
        if let Some(external) = observe_one(&params.exposure_ms, &mut self.exposure_version) {
            changes.exposure_changed = true;
            changes.autogain_released |= external;
        }

        if changes.autogain_released && params.autogain_on.value() {
            info!("Detector setting changed externally, disabling autogain");
            params.set_autogain(false);
        }
        changes
    }
}

/// Returns `Some(external)` when the parameter moved since `seen`
fn observe_one<T: Copy>(param: &SharedParam<T>, seen: &mut u64) -> Option<bool> {
    let version = param.version();
    if version == *seen {
        return None;
    }
    *seen = version;

    param.insert_flags(ParamFlags::UPDATED);
    let own_write = param.flags().contains(ParamFlags::AUTOGAIN_WRITE);
    if own_write {
        param.remove_flags(ParamFlags::AUTOGAIN_WRITE);
    }
    Some(!own_write)
}
