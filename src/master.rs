// Part of soem-master. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

use crate::{
    drain::{self, Drained},
    engine::{Adapter, Engine},
    eoe::{self, EoeCallback, FragmentTable},
    settings::Settings,
    slave::{self, SetupFunc, Slave, SlaveEntry},
    types::*,
};
use std::{
    convert::TryFrom,
    sync::{Arc, Mutex},
    time::Duration,
};

/// Maximum number of slaves on one network.
pub const MAX_SLAVES: u16 = 200;

/// An EtherCAT master on top of an [`Engine`].
///
/// The master owns the slave table and the process data image. Slaves are
/// accessed through short lived [`Slave`] handles.
pub struct Master {
    engine: Box<dyn Engine>,
    settings: Settings,
    slaves: Vec<SlaveEntry>,
    iomap: Vec<u8>,
    io_size: usize,
    eoe_table: FragmentTable,
    open: bool,
}

impl Master {
    pub fn new(engine: Box<dyn Engine>) -> Self {
        Self::with_settings(engine, Settings::default())
    }

    pub fn with_settings(engine: Box<dyn Engine>, settings: Settings) -> Self {
        let iomap = vec![0; settings.iomap_capacity];
        Self {
            engine,
            settings,
            slaves: Vec::new(),
            iomap,
            io_size: 0,
            eoe_table: Arc::new(Mutex::new(Vec::new())),
            open: false,
        }
    }

    /// Network adapters the engine can use.
    pub fn find_adapters(&self) -> Vec<Adapter> {
        self.engine.adapters()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    /// Opens the network interface, optionally with a redundant second one.
    pub fn open(&mut self, ifname: &str, redundant: Option<&str>) -> Result<()> {
        if self.open {
            self.close();
        }
        let ok = match redundant {
            None => self.engine.init(ifname),
            Some(second) => self.engine.init_redundant(ifname, second),
        };
        if !ok {
            return Err(Error::Connection(ifname.to_owned()));
        }
        self.engine.set_timeouts(&self.settings.timeouts);
        self.engine
            .set_manual_state_change(self.settings.manual_state_change);
        self.open = true;
        log::debug!("opened {}", ifname);
        Ok(())
    }

    /// Closes the network interface. Does nothing if it is not open.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        for rec in drain::drain_all(&mut *self.engine) {
            log::warn!("discarding stale error on close: {:?}", rec);
        }
        self.engine.set_eoe_hook(None);
        self.engine.close();
        self.open = false;
        log::debug!("closed");
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Enumerates all slaves and brings them up. Returns the number of slaves.
    ///
    /// The slave table is rebuilt, state kept for previous slaves is lost.
    pub fn config_init(&mut self, use_table: bool) -> Result<u16> {
        self.ensure_open()?;
        let res = self.engine.config_init(use_table);
        if res <= 0 {
            return Err(Error::NoSlavesFound(res));
        }
        let mut count = self.engine.slave_count();
        if count > MAX_SLAVES {
            log::warn!("{} slaves found, using the first {}", count, MAX_SLAVES);
            count = MAX_SLAVES;
        }
        self.slaves = (1..=count)
            .map(|pos| {
                self.engine
                    .slave(pos)
                    .map(SlaveEntry::from_record)
                    .ok_or(Error::NoSuchSlave(pos))
            })
            .collect::<Result<_>>()?;
        *eoe::lock(&self.eoe_table) = self.slaves.iter().map(|s| s.eoe.clone()).collect();
        self.io_size = 0;
        for b in self.iomap.iter_mut() {
            *b = 0;
        }
        for rec in drain::drain_all(&mut *self.engine) {
            log::warn!("discarding error left by enumeration: {:?}", rec);
        }
        log::debug!("{} slaves found", count);
        Ok(count)
    }

    /// Maps the process data of all slaves into the IO map and returns its
    /// size. Setup functions of the slaves are run during this call.
    pub fn config_map(&mut self) -> Result<usize> {
        self.map(false)
    }

    /// Like [`config_map`](Self::config_map), but inputs and outputs of a slave
    /// share the same IO map bytes.
    pub fn config_overlap_map(&mut self) -> Result<usize> {
        self.map(true)
    }

    fn map(&mut self, overlap: bool) -> Result<usize> {
        self.ensure_open()?;
        let Master {
            engine,
            settings,
            slaves,
            iomap,
            ..
        } = self;
        let settings = &*settings;

        let mut failed: Option<(u16, BoxError)> = None;
        let size = {
            let mut hook = |engine: &mut dyn Engine, pos: u16| {
                let (entry, neighbours) = match slave::split_table(&mut slaves[..], pos) {
                    Some(split) => split,
                    None => return,
                };
                let mut func = match entry.setup.take() {
                    Some(func) => func,
                    None => return,
                };
                let res = match &mut func {
                    SetupFunc::Legacy(f) => f(usize::from(pos - 1)),
                    SetupFunc::Handle(f) => f(&mut Slave {
                        engine,
                        entry: &mut *entry,
                        neighbours,
                        settings,
                        iomap: &mut iomap[..],
                        pos,
                    }),
                };
                entry.setup = Some(func);
                if let Err(e) = res {
                    if failed.is_none() {
                        failed = Some((pos, e));
                    } else {
                        log::warn!("setup function of slave {} failed as well: {}", pos, e);
                    }
                }
            };
            if overlap {
                engine.config_overlap_map_group(0, &mut hook)
            } else {
                engine.config_map_group(0, &mut hook)
            }
        };

        let mut errors = Vec::new();
        for rec in drain::drain_all(&mut **engine) {
            match drain::classify(&**engine, rec) {
                Drained::Emergency(emcy) => {
                    let taken = emcy
                        .slave
                        .checked_sub(1)
                        .and_then(|idx| slaves.get_mut(usize::from(idx)))
                        .map_or(false, |entry| entry.dispatch_emergency(&emcy));
                    if !taken {
                        errors.push(Error::Emergency(emcy));
                    }
                }
                Drained::Error(err) => errors.push(err),
            }
        }

        // the engine layout is in effect even if mapping reported errors
        let capacity = iomap.len();
        let fits = size <= capacity;
        self.io_size = if fits { size } else { 0 };
        log::debug!("mapped {} bytes of process data", size);

        if let Some((slave, source)) = failed {
            for err in &errors {
                log::warn!("while mapping: {}", err);
            }
            return Err(Error::SetupFunc { slave, source });
        }
        if !errors.is_empty() {
            return Err(Error::ConfigMap(errors));
        }
        if !fits {
            return Err(Error::IoMapOverflow {
                required: size,
                capacity,
            });
        }
        Ok(size)
    }

    /// Configures distributed clocks; returns whether any slave supports them.
    pub fn config_dc(&mut self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.engine.config_dc())
    }

    /// Reads the states of all slaves and returns the lowest one.
    pub fn read_state(&mut self) -> Result<SlaveState> {
        self.ensure_open()?;
        SlaveState::try_from(self.engine.read_state())
    }

    /// Requests the state set with [`set_state`](Self::set_state) from all slaves.
    pub fn write_state(&mut self) -> Result<i32> {
        self.ensure_open()?;
        log::debug!("requesting state {} from all slaves", self.state()?);
        Ok(self.engine.write_state(0))
    }

    /// Waits until all slaves reached `expected`, at most `timeout`; returns
    /// the lowest state read.
    pub fn state_check(&mut self, expected: SlaveState, timeout: Duration) -> Result<SlaveState> {
        self.ensure_open()?;
        SlaveState::try_from(self.engine.state_check(0, expected.raw(), timeout))
    }

    /// The state of all slaves, as last read or requested.
    pub fn state(&self) -> Result<SlaveState> {
        self.ensure_open()?;
        let rec = self.engine.slave(0).ok_or(Error::NoSuchSlave(0))?;
        SlaveState::try_from(rec.state)
    }

    pub fn set_state(&mut self, state: SlaveState) -> Result<()> {
        self.ensure_open()?;
        let rec = self.engine.slave_mut(0).ok_or(Error::NoSuchSlave(0))?;
        rec.state = state.raw();
        Ok(())
    }

    pub fn send_processdata(&mut self) -> Result<i32> {
        self.ensure_open()?;
        Ok(self.engine.send_processdata(&self.iomap[..self.io_size]))
    }

    pub fn send_overlap_processdata(&mut self) -> Result<i32> {
        self.ensure_open()?;
        Ok(self
            .engine
            .send_overlap_processdata(&self.iomap[..self.io_size]))
    }

    /// Receives the process data; returns the working counter.
    pub fn receive_processdata(&mut self, timeout: Duration) -> Result<i32> {
        self.ensure_open()?;
        let wkc = self
            .engine
            .receive_processdata(&mut self.iomap[..self.io_size], timeout);
        if wkc <= 0 {
            log::warn!("process data receive returned working counter {}", wkc);
        }
        Ok(wkc)
    }

    /// Working counter of a cycle in which every slave did its part.
    pub fn expected_wkc(&self) -> Result<i32> {
        self.ensure_open()?;
        let group = self.engine.group(0).copied().unwrap_or_default();
        Ok(2 * i32::from(group.outputs_wkc) + i32::from(group.inputs_wkc))
    }

    /// The process data image of the last mapping.
    pub fn io_map(&self) -> &[u8] {
        &self.iomap[..self.io_size]
    }

    pub fn io_map_mut(&mut self) -> &mut [u8] {
        &mut self.iomap[..self.io_size]
    }

    pub fn dc_time(&self) -> Result<i64> {
        self.ensure_open()?;
        Ok(self.engine.dc_time())
    }

    pub fn manual_state_change(&self) -> bool {
        self.settings.manual_state_change
    }

    pub fn set_manual_state_change(&mut self, manual: bool) {
        self.settings.manual_state_change = manual;
        if self.open {
            self.engine.set_manual_state_change(manual);
        }
    }

    pub fn sdo_read_timeout(&self) -> Duration {
        self.settings.sdo_read_timeout
    }

    pub fn set_sdo_read_timeout(&mut self, timeout: Duration) {
        self.settings.sdo_read_timeout = timeout;
    }

    pub fn sdo_write_timeout(&self) -> Duration {
        self.settings.sdo_write_timeout
    }

    pub fn set_sdo_write_timeout(&mut self, timeout: Duration) {
        self.settings.sdo_write_timeout = timeout;
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn slave_count(&self) -> u16 {
        self.slaves.len() as u16
    }

    /// Positions of all slaves.
    pub fn slaves(&self) -> impl Iterator<Item = u16> {
        1..=self.slave_count()
    }

    /// Handle to the slave at 1-based position `pos`.
    pub fn slave(&mut self, pos: u16) -> Result<Slave<'_>> {
        self.ensure_open()?;
        let (entry, neighbours) =
            slave::split_table(&mut self.slaves, pos).ok_or(Error::NoSuchSlave(pos))?;
        Ok(Slave {
            engine: &mut *self.engine,
            entry,
            neighbours,
            settings: &self.settings,
            iomap: &mut self.iomap[..],
            pos,
        })
    }

    /// Installs the receiver of reassembled EoE frames. It runs inside the
    /// engine's mailbox processing, so it must not do mailbox exchanges with
    /// the sending slave itself.
    pub fn set_eoe_callback<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(&[u8], u16) -> CallbackResult + Send + 'static,
    {
        self.ensure_open()?;
        let callback: EoeCallback = Box::new(callback);
        self.engine
            .set_eoe_hook(Some(eoe::frame_hook(self.eoe_table.clone(), callback)));
        Ok(())
    }

    pub fn clear_eoe_callback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.engine.set_eoe_hook(None);
        Ok(())
    }

    pub fn al_status_code_to_string(&self, code: u16) -> String {
        self.engine.al_status_code_to_string(code)
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::{ErrorKind, ErrorRecord},
        sim::{SimEngine, SimSlave},
        slave::SetupFunc,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn terminal(name: &str, inputs: u16, outputs: u16) -> SimSlave {
        SimSlave::new(name, 2, 0x1234)
            .inputs(inputs)
            .outputs(outputs)
            .object(0x1c12, 0, vec![1])
    }

    fn opened(engine: SimEngine) -> Master {
        let mut master = Master::new(Box::new(engine));
        master.open("sim0", None).unwrap();
        master
    }

    #[test]
    fn not_initialized_before_open_and_after_close() {
        let engine = SimEngine::new().with_slave(terminal("a", 8, 8));
        let mut master = Master::new(Box::new(engine));
        assert!(!master.find_adapters().is_empty());
        assert!(matches!(master.config_init(false), Err(Error::NotInitialized)));
        assert!(matches!(master.read_state(), Err(Error::NotInitialized)));
        master.open("sim0", None).unwrap();
        assert_eq!(master.config_init(false).unwrap(), 1);
        master.close();
        master.close();
        assert!(matches!(master.slave(1), Err(Error::NotInitialized)));
        assert!(matches!(master.send_processdata(), Err(Error::NotInitialized)));
        assert!(matches!(master.expected_wkc(), Err(Error::NotInitialized)));
        assert_eq!(master.sdo_read_timeout(), Duration::from_millis(700));
    }

    #[test]
    fn open_failure_is_a_connection_error() {
        let mut master = Master::new(Box::new(SimEngine::new()));
        match master.open("eth9", None) {
            Err(Error::Connection(name)) => assert_eq!(name, "eth9"),
            other => panic!("unexpected {:?}", other),
        }
        master.open("sim0", Some("sim1")).unwrap();
    }

    #[test]
    fn empty_bus() {
        let mut master = opened(SimEngine::new());
        assert!(matches!(master.config_init(false), Err(Error::NoSlavesFound(0))));
    }

    #[test]
    fn no_such_slave() {
        let mut master = opened(SimEngine::new().with_slave(terminal("a", 8, 8)));
        master.config_init(false).unwrap();
        assert!(matches!(master.slave(0), Err(Error::NoSuchSlave(0))));
        assert!(matches!(master.slave(2), Err(Error::NoSuchSlave(2))));
        assert_eq!(master.slaves().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn expected_wkc_follows_mapping() {
        let mut master = opened(
            SimEngine::new()
                .with_slave(terminal("in", 16, 0))
                .with_slave(terminal("out", 0, 4))
                .with_slave(terminal("both", 8, 8)),
        );
        master.config_init(false).unwrap();
        let size = master.config_map().unwrap();
        assert_eq!(size, 2 + 1 + 1 + 1);
        assert_eq!(master.expected_wkc().unwrap(), 2 * 2 + 2);

        let size = master.config_overlap_map().unwrap();
        assert_eq!(size, 3);
        assert_eq!(master.expected_wkc().unwrap(), 2 * 2 + 2);

        let slave = master.slave(2).unwrap();
        // 4 bits still occupy a byte
        assert_eq!(slave.output_region().unwrap().bytes, 0);
        assert_eq!(slave.output().unwrap().len(), 1);
        assert!(slave.input().unwrap().is_empty());
    }

    #[test]
    fn process_data_cycle() {
        let mut master = opened(SimEngine::new().with_slave(terminal("io", 8, 8)));
        master.config_init(false).unwrap();
        master.config_map().unwrap();
        master.set_state(AlState::Op.into()).unwrap();
        master.write_state().unwrap();
        assert_eq!(
            master
                .state_check(AlState::Op.into(), Duration::from_millis(50))
                .unwrap(),
            AlState::Op.into()
        );

        master.slave(1).unwrap().set_output(&[0x3C]).unwrap();
        assert!(master.send_processdata().unwrap() > 0);
        let wkc = master.receive_processdata(Duration::from_millis(2)).unwrap();
        assert_eq!(wkc, master.expected_wkc().unwrap());
        // the simulated terminal loops its outputs back
        assert_eq!(master.slave(1).unwrap().input().unwrap(), &[0x3C]);
    }

    #[test]
    fn setup_functions_run_during_mapping() {
        let calls = Arc::new(AtomicUsize::new(0));
        let legacy_calls = calls.clone();
        let mut master = opened(
            SimEngine::new()
                .with_slave(terminal("a", 8, 0))
                .with_slave(terminal("b", 0, 8)),
        );
        master.config_init(false).unwrap();
        master
            .slave(1)
            .unwrap()
            .set_setup_func(SetupFunc::legacy(move |idx| {
                assert_eq!(idx, 0);
                legacy_calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        master
            .slave(2)
            .unwrap()
            .set_setup_func(SetupFunc::handle(|slave| {
                assert_eq!(slave.position(), 2);
                slave.sdo_write(0x1c12, 0, &[0], false)?;
                Ok(())
            }));

        master.config_map().unwrap();
        master.config_map().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            master.slave(2).unwrap().sdo_read(0x1c12, 0, false, None).unwrap(),
            vec![0]
        );
    }

    #[derive(Debug, thiserror::Error)]
    #[error("PDO assignment rejected")]
    struct Rejected;

    #[test]
    fn setup_error_takes_precedence() {
        let engine = SimEngine::new()
            .with_slave(terminal("a", 8, 0))
            .with_slave(terminal("b", 8, 0));
        let bus = engine.bus();
        let abort = ErrorRecord::new(1, 0x1c12, 0, ErrorKind::SdoAbort(0x0601_0002));
        bus.lock().unwrap().push_map_error(abort);
        let mut master = opened(engine);
        master.config_init(false).unwrap();
        master
            .slave(2)
            .unwrap()
            .set_setup_func(SetupFunc::legacy(|_| Err(Rejected.into())));

        match master.config_map() {
            Err(Error::SetupFunc { slave, source }) => {
                assert_eq!(slave, 2);
                assert!(source.downcast_ref::<Rejected>().is_some());
            }
            other => panic!("unexpected {:?}", other),
        }

        // without the failing function the drained errors are reported
        master.slave(2).unwrap().clear_setup_func();
        bus.lock().unwrap().push_map_error(abort);
        match master.config_map() {
            Err(Error::ConfigMap(errors)) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].slave_pos(), Some(1));
                assert!(matches!(&errors[0], Error::Sdo(a) if a.abort_code == 0x0601_0002));
            }
            other => panic!("unexpected {:?}", other),
        }

        // the injected error was consumed
        assert!(master.config_map().is_ok());
    }

    #[test]
    fn emergencies_while_mapping() {
        let emcy = ErrorKind::Emergency {
            error_code: 0x8100,
            error_reg: 0x11,
            b1: 0,
            w1: 0,
            w2: 0,
        };
        let engine = SimEngine::new()
            .with_slave(terminal("a", 8, 0))
            .with_slave(terminal("b", 8, 0));
        {
            let bus = engine.bus();
            let mut bus = bus.lock().unwrap();
            bus.push_map_error(ErrorRecord::new(1, 0, 0, emcy));
            bus.push_map_error(ErrorRecord::new(2, 0, 0, emcy));
        }
        let mut master = opened(engine);
        master.config_init(false).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        master
            .slave(1)
            .unwrap()
            .add_emergency_callback(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        match master.config_map() {
            Err(Error::ConfigMap(errors)) => {
                assert_eq!(errors.len(), 1);
                assert!(matches!(&errors[0], Error::Emergency(e) if e.slave == 2));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn io_map_overflow() {
        let engine = SimEngine::new().with_slave(terminal("big", 8 * 64, 8 * 64));
        let settings = Settings::default().iomap_capacity(100);
        let mut master = Master::with_settings(Box::new(engine), settings);
        master.open("sim0", None).unwrap();
        master.config_init(false).unwrap();
        match master.config_map() {
            Err(Error::IoMapOverflow { required, capacity }) => {
                assert_eq!((required, capacity), (128, 100));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(master.io_map().is_empty());
    }

    #[test]
    fn state_check_times_out_with_last_state() {
        let engine = SimEngine::new().with_slave(
            SimSlave::new("stuck", 2, 0x1)
                .inputs(8)
                .max_state(AlState::Init),
        );
        let mut master = opened(engine);
        assert_eq!(master.config_init(false).unwrap(), 1);
        assert_eq!(master.read_state().unwrap(), AlState::Init.into());
        assert!(master.config_map().unwrap() > 0);

        master.set_state(AlState::Op.into()).unwrap();
        master.write_state().unwrap();
        let start = std::time::Instant::now();
        let state = master
            .state_check(AlState::Op.into(), Duration::from_millis(20))
            .unwrap();
        assert_eq!(state, AlState::Init.into());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(
            master
                .slave(1)
                .unwrap()
                .state_check(AlState::Op.into(), Duration::from_millis(5))
                .unwrap(),
            AlState::Init.into()
        );
    }

    #[test]
    fn config_init_rebuilds_the_table() {
        let mut master = opened(SimEngine::new().with_slave(terminal("a", 8, 0)));
        master.config_init(false).unwrap();
        master.slave(1).unwrap().set_lost(true);
        master.config_init(false).unwrap();
        assert!(!master.slave(1).unwrap().is_lost());
    }

    #[test]
    fn timeouts_are_read_at_call_time() {
        let mut master = opened(SimEngine::new().with_slave(terminal("a", 8, 0)));
        master.config_init(false).unwrap();
        master.set_sdo_read_timeout(Duration::from_millis(0));
        // the simulated slave answers nothing within a zero timeout
        assert!(matches!(
            master.slave(1).unwrap().sdo_read(0x1c12, 0, false, None),
            Err(Error::Wkc(0))
        ));
        master.set_sdo_read_timeout(Duration::from_millis(700));
        assert_eq!(
            master.slave(1).unwrap().sdo_read(0x1c12, 0, false, None).unwrap(),
            vec![1]
        );
    }

    fn unsubscribed_emergency(slave: u16) -> ErrorRecord {
        ErrorRecord::new(
            slave,
            0,
            0,
            ErrorKind::Emergency {
                error_code: 0x8100,
                error_reg: 0x11,
                b1: 0,
                w1: 0,
                w2: 0,
            },
        )
    }

    #[test]
    fn failed_mapping_still_adopts_the_layout() {
        let engine = SimEngine::new().with_slave(terminal("io", 8, 8));
        let bus = engine.bus();
        bus.lock().unwrap().push_map_error(unsubscribed_emergency(1));
        let mut master = opened(engine);
        master.config_init(false).unwrap();

        assert!(matches!(master.config_map(), Err(Error::ConfigMap(_))));
        assert_eq!(master.io_map().len(), 2);

        master.set_state(AlState::Op.into()).unwrap();
        master.write_state().unwrap();
        master.slave(1).unwrap().set_output(&[0x3C]).unwrap();
        master.send_processdata().unwrap();
        let wkc = master.receive_processdata(Duration::from_millis(2)).unwrap();
        assert_eq!(wkc, master.expected_wkc().unwrap());
        assert_eq!(master.slave(1).unwrap().input().unwrap(), &[0x3C]);

        // a failing re-map replaces the previous layout as well
        assert_eq!(master.config_map().unwrap(), 2);
        bus.lock().unwrap().push_map_error(unsubscribed_emergency(1));
        assert!(master.config_overlap_map().is_err());
        assert_eq!(master.io_map().len(), 1);
    }

    #[test]
    fn all_setup_functions_run_and_the_first_error_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut master = opened(
            SimEngine::new()
                .with_slave(terminal("a", 8, 0))
                .with_slave(terminal("b", 8, 0))
                .with_slave(terminal("c", 8, 0)),
        );
        master.config_init(false).unwrap();
        for pos in 1..=2 {
            master
                .slave(pos)
                .unwrap()
                .set_setup_func(SetupFunc::legacy(|_| Err(Rejected.into())));
        }
        let counter = calls.clone();
        master
            .slave(3)
            .unwrap()
            .set_setup_func(SetupFunc::legacy(move |idx| {
                assert_eq!(idx, 2);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));

        match master.config_map() {
            Err(Error::SetupFunc { slave, .. }) => assert_eq!(slave, 1),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn manual_state_change_keeps_slaves_in_preop() {
        let engine = SimEngine::new().with_slave(terminal("a", 8, 8));
        let settings = Settings::default().manual_state_change(true);
        let mut master = Master::with_settings(Box::new(engine), settings);
        master.open("sim0", None).unwrap();
        assert!(master.manual_state_change());
        master.config_init(false).unwrap();

        master.config_map().unwrap();
        assert_eq!(master.read_state().unwrap(), AlState::PreOp.into());

        master.set_manual_state_change(false);
        master.config_map().unwrap();
        assert_eq!(master.read_state().unwrap(), AlState::SafeOp.into());
    }

    #[test]
    fn distributed_clocks_pass_through() {
        let engine = SimEngine::new()
            .with_slave(terminal("a", 8, 8).dc())
            .with_slave(terminal("b", 8, 0));
        let bus = engine.bus();
        let mut master = opened(engine);
        master.config_init(false).unwrap();
        master.config_map().unwrap();
        assert!(master.config_dc().unwrap());

        let before = master.dc_time().unwrap();
        master.receive_processdata(Duration::from_millis(2)).unwrap();
        assert!(master.dc_time().unwrap() > before);

        master
            .slave(1)
            .unwrap()
            .dc_sync(true, 1_000_000, 250, None)
            .unwrap();
        master
            .slave(2)
            .unwrap()
            .dc_sync(true, 1_000_000, 0, Some(500_000))
            .unwrap();
        let bus = bus.lock().unwrap();
        assert_eq!(bus.slaves[0].dc_sync, Some((true, 1_000_000, None, 250)));
        assert_eq!(
            bus.slaves[1].dc_sync,
            Some((true, 1_000_000, Some(500_000), 0))
        );
    }

    #[test]
    fn no_distributed_clocks() {
        let mut master = opened(SimEngine::new().with_slave(terminal("a", 8, 0)));
        master.config_init(false).unwrap();
        assert!(!master.config_dc().unwrap());
    }

    #[test]
    fn reconfig_and_recover() {
        let mut master = opened(SimEngine::new().with_slave(terminal("a", 8, 0)));
        master.config_init(false).unwrap();
        let timeout = Duration::from_millis(5);
        let mut slave = master.slave(1).unwrap();
        assert!(slave.recover(timeout).unwrap());
        assert!(slave.reconfig(timeout).unwrap());
        assert_eq!(slave.read_state().unwrap(), AlState::PreOp.into());
    }
}
