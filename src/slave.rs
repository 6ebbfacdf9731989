// Part of soem-master. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

use crate::{
    coe::ObjectDirectory,
    drain,
    engine::{Engine, SlaveRecord},
    eoe::{EoeFragmentState, FragmentCell},
    settings::Settings,
    types::*,
};
use std::{
    convert::TryFrom,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

/// Receives the emergencies of one slave.
pub type EmergencyCallback = Box<dyn FnMut(&Emergency) + Send>;

/// Per slave setup function, run while mapping at the PreOp to SafeOp
/// transition. Typically used to write the PDO assignment over SDO.
pub enum SetupFunc {
    /// Called with the 0-based index of the slave.
    Legacy(Box<dyn FnMut(usize) -> CallbackResult + Send>),
    /// Called with a handle to the slave.
    Handle(Box<dyn FnMut(&mut Slave<'_>) -> CallbackResult + Send>),
}

impl SetupFunc {
    pub fn legacy<F>(f: F) -> Self
    where
        F: FnMut(usize) -> CallbackResult + Send + 'static,
    {
        SetupFunc::Legacy(Box::new(f))
    }

    pub fn handle<F>(f: F) -> Self
    where
        F: FnMut(&mut Slave<'_>) -> CallbackResult + Send + 'static,
    {
        SetupFunc::Handle(Box::new(f))
    }
}

impl fmt::Debug for SetupFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupFunc::Legacy(_) => f.write_str("SetupFunc::Legacy(..)"),
            SetupFunc::Handle(_) => f.write_str("SetupFunc::Handle(..)"),
        }
    }
}

/// State the master keeps per slave, between handle borrows.
pub(crate) struct SlaveEntry {
    pub(crate) identity: SlaveIdentity,
    pub(crate) lost: bool,
    pub(crate) setup: Option<SetupFunc>,
    pub(crate) emergency_callbacks: Vec<EmergencyCallback>,
    pub(crate) eoe: FragmentCell,
    pub(crate) od: ObjectDirectory,
}

impl SlaveEntry {
    pub(crate) fn new(identity: SlaveIdentity) -> Self {
        Self {
            identity,
            lost: false,
            setup: None,
            emergency_callbacks: Vec::new(),
            eoe: Arc::new(Mutex::new(EoeFragmentState::default())),
            od: ObjectDirectory::default(),
        }
    }

    pub(crate) fn from_record(rec: &SlaveRecord) -> Self {
        Self::new(SlaveIdentity::new(
            rec.name.clone(),
            rec.vendor_id,
            rec.product_code,
            rec.revision,
            rec.serial,
        ))
    }

    /// Hands an emergency to the subscribers; `false` if there are none.
    pub(crate) fn dispatch_emergency(&mut self, emcy: &Emergency) -> bool {
        if self.emergency_callbacks.is_empty() {
            return false;
        }
        for cb in self.emergency_callbacks.iter_mut() {
            cb(emcy);
        }
        true
    }
}

/// Table entries of all slaves but one, so emergencies drained during an
/// exchange reach the subscribers of the slave that sent them.
pub(crate) struct Neighbours<'a> {
    before: &'a mut [SlaveEntry],
    after: &'a mut [SlaveEntry],
}

impl<'a> Neighbours<'a> {
    fn get_mut(&mut self, pos: u16) -> Option<&mut SlaveEntry> {
        let idx = usize::from(pos.checked_sub(1)?);
        let own = self.before.len();
        if idx < own {
            self.before.get_mut(idx)
        } else if idx > own {
            self.after.get_mut(idx - own - 1)
        } else {
            None
        }
    }
}

/// Splits the slave table into the entry at 1-based `pos` and all others.
pub(crate) fn split_table(
    table: &mut [SlaveEntry],
    pos: u16,
) -> Option<(&mut SlaveEntry, Neighbours<'_>)> {
    let idx = usize::from(pos.checked_sub(1)?);
    if idx >= table.len() {
        return None;
    }
    let (before, rest) = table.split_at_mut(idx);
    let (entry, after) = rest.split_first_mut()?;
    Some((entry, Neighbours { before, after }))
}

/// Handle to one slave, borrowed from the [`Master`](crate::Master).
///
/// Positions are 1-based, as on the bus.
pub struct Slave<'a> {
    pub(crate) engine: &'a mut dyn Engine,
    pub(crate) entry: &'a mut SlaveEntry,
    pub(crate) neighbours: Neighbours<'a>,
    pub(crate) settings: &'a Settings,
    pub(crate) iomap: &'a mut [u8],
    pub(crate) pos: u16,
}

impl<'a> Slave<'a> {
    pub fn position(&self) -> u16 {
        self.pos
    }

    pub fn identity(&self) -> &SlaveIdentity {
        &self.entry.identity
    }

    pub fn name(&self) -> &str {
        &self.entry.identity.name
    }

    pub fn vendor_id(&self) -> u32 {
        self.entry.identity.vendor_id
    }

    /// Manufacturer, same as [`vendor_id`](Self::vendor_id).
    pub fn man(&self) -> u32 {
        self.vendor_id()
    }

    pub fn product_code(&self) -> u32 {
        self.entry.identity.product_code
    }

    /// Same as [`product_code`](Self::product_code).
    pub fn id(&self) -> u32 {
        self.product_code()
    }

    pub fn revision(&self) -> u32 {
        self.entry.identity.revision
    }

    pub fn serial(&self) -> u32 {
        self.entry.identity.serial
    }

    pub(crate) fn record(&self) -> Result<&SlaveRecord> {
        self.engine.slave(self.pos).ok_or(Error::NoSuchSlave(self.pos))
    }

    pub(crate) fn record_mut(&mut self) -> Result<&mut SlaveRecord> {
        let pos = self.pos;
        self.engine.slave_mut(pos).ok_or(Error::NoSuchSlave(pos))
    }

    /// State as last read from (or requested for) this slave.
    pub fn state(&self) -> Result<SlaveState> {
        SlaveState::try_from(self.record()?.state)
    }

    /// Sets the requested state; it is sent by [`write_state`](Self::write_state).
    pub fn set_state(&mut self, state: SlaveState) -> Result<()> {
        self.record_mut()?.state = state.raw();
        Ok(())
    }

    /// Refreshes the states of all slaves and returns this one's.
    pub fn read_state(&mut self) -> Result<SlaveState> {
        self.engine.read_state();
        self.state()
    }

    pub fn write_state(&mut self) -> Result<i32> {
        log::debug!("slave {}: requesting state {}", self.pos, self.state()?);
        Ok(self.engine.write_state(self.pos))
    }

    /// Waits until the slave reaches `expected`, at most `timeout`. Returns the
    /// state last read, which differs from `expected` on timeout.
    pub fn state_check(&mut self, expected: SlaveState, timeout: Duration) -> Result<SlaveState> {
        SlaveState::try_from(self.engine.state_check(self.pos, expected.raw(), timeout))
    }

    pub fn al_status(&self) -> Result<u16> {
        Ok(self.record()?.al_status_code)
    }

    pub fn al_status_desc(&self) -> Result<String> {
        let code = self.al_status()?;
        Ok(self.engine.al_status_code_to_string(code))
    }

    pub fn is_lost(&self) -> bool {
        self.entry.lost
    }

    pub fn set_lost(&mut self, lost: bool) {
        self.entry.lost = lost;
    }

    pub fn config_addr(&self) -> Result<u16> {
        Ok(self.record()?.config_addr)
    }

    pub fn input_region(&self) -> Result<PdRegion> {
        let rec = self.record()?;
        Ok(PdRegion::new(rec.input_offset, rec.input_bytes, rec.input_bits))
    }

    pub fn output_region(&self) -> Result<PdRegion> {
        let rec = self.record()?;
        Ok(PdRegion::new(
            rec.output_offset,
            rec.output_bytes,
            rec.output_bits,
        ))
    }

    fn region_range(&self, region: PdRegion) -> Result<std::ops::Range<usize>> {
        let end = region.offset + region.len();
        if end > self.iomap.len() {
            return Err(Error::IoMapOverflow {
                required: end,
                capacity: self.iomap.len(),
            });
        }
        Ok(region.offset..end)
    }

    /// Inputs of this slave, valid after a receive with a positive working counter.
    pub fn input(&self) -> Result<&[u8]> {
        let range = self.region_range(self.input_region()?)?;
        Ok(&self.iomap[range])
    }

    pub fn output(&self) -> Result<&[u8]> {
        let range = self.region_range(self.output_region()?)?;
        Ok(&self.iomap[range])
    }

    pub fn output_mut(&mut self) -> Result<&mut [u8]> {
        let range = self.region_range(self.output_region()?)?;
        Ok(&mut self.iomap[range])
    }

    /// Replaces the outputs; `data` must have exactly the output length.
    pub fn set_output(&mut self, data: &[u8]) -> Result<()> {
        let out = self.output_mut()?;
        if out.len() != data.len() {
            return Err(Error::InvalidArgument(format!(
                "output length is {}, got {} bytes",
                out.len(),
                data.len()
            )));
        }
        out.copy_from_slice(data);
        Ok(())
    }

    /// Tries to reconfigure a slave that lost its configuration.
    pub fn reconfig(&mut self, timeout: Duration) -> Result<bool> {
        Ok(self.engine.reconfig_slave(self.pos, timeout) > 0)
    }

    /// Tries to find a lost slave again.
    pub fn recover(&mut self, timeout: Duration) -> Result<bool> {
        Ok(self.engine.recover_slave(self.pos, timeout) > 0)
    }

    /// Installs the setup function, replacing any previous one.
    pub fn set_setup_func(&mut self, func: SetupFunc) {
        self.entry.setup = Some(func);
    }

    pub fn clear_setup_func(&mut self) -> Option<SetupFunc> {
        self.entry.setup.take()
    }

    /// Subscribes to emergencies of this slave. With at least one subscriber,
    /// emergencies are no longer returned as errors from mailbox operations.
    pub fn add_emergency_callback<F>(&mut self, cb: F)
    where
        F: FnMut(&Emergency) + Send + 'static,
    {
        self.entry.emergency_callbacks.push(Box::new(cb));
    }

    /// Activates or deactivates the SYNC0 (and optionally SYNC1) pulse.
    pub fn dc_sync(
        &mut self,
        act: bool,
        sync0_cycle: u32,
        sync0_shift: i32,
        sync1_cycle: Option<u32>,
    ) -> Result<()> {
        self.record()?;
        match sync1_cycle {
            None => self.engine.dc_sync0(self.pos, act, sync0_cycle, sync0_shift),
            Some(sync1) => self
                .engine
                .dc_sync01(self.pos, act, sync0_cycle, sync1, sync0_shift),
        }
        Ok(())
    }

    fn require_state(&self, expected: AlState) -> Result<()> {
        let actual = self.state()?;
        if actual != SlaveState::new(expected) {
            return Err(Error::InvalidState {
                slave: self.pos,
                expected: expected.into(),
                actual,
            });
        }
        Ok(())
    }

    /// Moves a mailbox to another start address and size. Only allowed in Init.
    pub fn amend_mbx(&mut self, mailbox: Mailbox, start: u16, size: u16) -> Result<()> {
        self.require_state(AlState::Init)?;
        let (register, idx) = match mailbox {
            Mailbox::Out => (reg::SM0, 0),
            Mailbox::In => (reg::SM1, 1),
        };
        let mut sm = self.record()?.sm[idx];
        sm.start_addr = start;
        sm.length = size;
        let timeout = self.settings.timeouts.ret;
        self.fpwr(register, &sm.to_bytes(), timeout)?;

        let rec = self.record_mut()?;
        rec.sm[idx] = sm;
        match mailbox {
            Mailbox::Out => {
                rec.mbx_wo = start;
                rec.mbx_l = size;
            }
            Mailbox::In => {
                rec.mbx_ro = start;
                rec.mbx_rl = size;
            }
        }
        log::debug!(
            "slave {}: {:?} mailbox moved to 0x{:04X}, {} bytes",
            self.pos,
            mailbox,
            start,
            size
        );
        Ok(())
    }

    fn watchdog_register(kind: Watchdog) -> u16 {
        match kind {
            Watchdog::Pdi => reg::WD_TIME_PDI,
            Watchdog::ProcessData => reg::WD_TIME_PROCESSDATA,
        }
    }

    /// Duration of one watchdog tick in ns, from the watchdog divider.
    fn watchdog_tick_ns(&mut self) -> Result<f64> {
        let timeout = self.settings.timeouts.ret;
        let raw = self.fprd(reg::WD_DIV, 2, timeout)?;
        let divider = u16::from_le_bytes([raw[0], raw[1]]);
        Ok(40.0 * (f64::from(divider) + 2.0))
    }

    /// Sets a watchdog time in ms. Only allowed in Init.
    pub fn set_watchdog(&mut self, kind: Watchdog, ms: f64) -> Result<()> {
        self.require_state(AlState::Init)?;
        let ns_per_tick = self.watchdog_tick_ns()?;
        let ticks = (ms * 1_000_000.0 / ns_per_tick).trunc();
        if !(0.0..=f64::from(u16::MAX)).contains(&ticks) {
            let max = f64::from(u16::MAX) * ns_per_tick / 1_000_000.0;
            return Err(Error::InvalidArgument(format!(
                "wd_time_ms is limited to {} ms",
                max
            )));
        }
        let timeout = self.settings.timeouts.ret;
        self.fpwr(
            Self::watchdog_register(kind),
            &(ticks as u16).to_le_bytes(),
            timeout,
        )
    }

    /// Current watchdog time in ms.
    pub fn watchdog(&mut self, kind: Watchdog) -> Result<f64> {
        let ns_per_tick = self.watchdog_tick_ns()?;
        let timeout = self.settings.timeouts.ret;
        let raw = self.fprd(Self::watchdog_register(kind), 2, timeout)?;
        let ticks = u16::from_le_bytes([raw[0], raw[1]]);
        Ok(f64::from(ticks) * ns_per_tick / 1_000_000.0)
    }

    /// Drains the error queue after an exchange. Emergencies go to the
    /// subscribers of the sending slave if it has any.
    pub(crate) fn settle(&mut self) -> Result<()> {
        let pos = self.pos;
        let entry = &mut *self.entry;
        let neighbours = &mut self.neighbours;
        drain::settle(&mut *self.engine, &mut |emcy| {
            route_emergency(pos, entry, neighbours, emcy)
        })
    }

    pub(crate) fn settle_one(&mut self) -> Result<()> {
        let pos = self.pos;
        let entry = &mut *self.entry;
        let neighbours = &mut self.neighbours;
        drain::settle_one(&mut *self.engine, &mut |emcy| {
            route_emergency(pos, entry, neighbours, emcy)
        })
    }
}

fn route_emergency(
    pos: u16,
    entry: &mut SlaveEntry,
    neighbours: &mut Neighbours<'_>,
    emcy: &Emergency,
) -> bool {
    if emcy.slave == pos {
        entry.dispatch_emergency(emcy)
    } else {
        neighbours
            .get_mut(emcy.slave)
            .map_or(false, |other| other.dispatch_emergency(emcy))
    }
}

impl fmt::Debug for Slave<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slave")
            .field("pos", &self.pos)
            .field("identity", &self.entry.identity)
            .field("lost", &self.entry.lost)
            .finish()
    }
}
