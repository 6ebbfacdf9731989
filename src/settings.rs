// Part of soem-master. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

use crate::engine::Timeouts;
use std::time::Duration;

/// Default size of the process data image.
pub const DEFAULT_IOMAP_CAPACITY: usize = 4096;

/// Default SDO read and write timeout.
pub const DEFAULT_SDO_TIMEOUT: Duration = Duration::from_millis(700);

/// Configuration of a [`Master`](crate::Master).
///
/// ```
/// # use soem_master::Settings;
/// # use std::time::Duration;
/// let settings = Settings::default()
///     .iomap_capacity(8192)
///     .sdo_read_timeout(Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub(crate) timeouts: Timeouts,
    pub(crate) sdo_read_timeout: Duration,
    pub(crate) sdo_write_timeout: Duration,
    pub(crate) iomap_capacity: usize,
    pub(crate) manual_state_change: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            sdo_read_timeout: DEFAULT_SDO_TIMEOUT,
            sdo_write_timeout: DEFAULT_SDO_TIMEOUT,
            iomap_capacity: DEFAULT_IOMAP_CAPACITY,
            manual_state_change: false,
        }
    }
}

impl Settings {
    /// Engine timeouts, pushed to the engine when the link is opened.
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn sdo_read_timeout(mut self, timeout: Duration) -> Self {
        self.sdo_read_timeout = timeout;
        self
    }

    pub fn sdo_write_timeout(mut self, timeout: Duration) -> Self {
        self.sdo_write_timeout = timeout;
        self
    }

    /// Maximum size of the process data image in bytes.
    pub fn iomap_capacity(mut self, capacity: usize) -> Self {
        self.iomap_capacity = capacity;
        self
    }

    /// If set, the engine does not request state changes by itself while
    /// mapping; the application drives every transition.
    pub fn manual_state_change(mut self, manual: bool) -> Self {
        self.manual_state_change = manual;
        self
    }

    pub fn get_timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn get_iomap_capacity(&self) -> usize {
        self.iomap_capacity
    }
}
