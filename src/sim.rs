// Part of soem-master. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! An in-memory [`Engine`] with simulated slaves.
//!
//! State changes take effect immediately, up to the highest state a slave is
//! allowed to reach. Mailbox services answer from per slave tables. The
//! devices live in a shared [`SimBus`], so they can still be inspected and
//! changed after the engine was handed to a [`Master`](crate::Master).

use crate::{
    engine::*,
    eoe::{lock, mailbox_type, MBX_TYPE_EOE},
    types::{AlState, STATE_ERROR},
};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    convert::TryFrom,
    sync::{Arc, Mutex},
    time::Duration,
};

/// Size of the simulated ESC register space.
const ESC_SIZE: usize = 0x1000;
const EEPROM_WORDS: usize = 0x400;
const FIRST_STATION_ADDR: u16 = 0x1001;

/// Object dictionary entry of a simulated slave.
#[derive(Debug, Clone)]
pub struct SimObject {
    pub desc: ObjectDescriptionRecord,
    pub entries: Vec<ObjectEntryRecord>,
}

impl SimObject {
    pub fn var(name: &str, data_type: u16, bit_length: u16, obj_access: u16) -> Self {
        Self {
            desc: ObjectDescriptionRecord {
                name: name.into(),
                data_type,
                object_code: 7,
                max_sub: 0,
                bit_length,
                obj_access,
            },
            entries: Vec::new(),
        }
    }

    /// A record whose entries are given as (name, data type, bit length).
    pub fn record(name: &str, entries: &[(&str, u16, u16)]) -> Self {
        Self {
            desc: ObjectDescriptionRecord {
                name: name.into(),
                data_type: 0,
                object_code: 9,
                max_sub: entries.len().saturating_sub(1) as u8,
                bit_length: 0,
                obj_access: 0,
            },
            entries: entries
                .iter()
                .map(|&(name, data_type, bit_length)| ObjectEntryRecord {
                    name: name.into(),
                    value_info: 0,
                    data_type,
                    bit_length,
                    obj_access: 0x0007,
                })
                .collect(),
        }
    }
}

/// One simulated slave device.
#[derive(Debug, Clone)]
pub struct SimSlave {
    pub name: String,
    pub vendor_id: u32,
    pub product_code: u32,
    pub revision: u32,
    pub serial: u32,
    pub input_bits: u16,
    pub output_bits: u16,
    /// Highest state the device accepts.
    pub max_state: AlState,
    pub al_state: u16,
    pub al_status_code: u16,
    pub has_dc: bool,
    pub dc_sync: Option<(bool, u32, Option<u32>, i32)>,
    pub objects: BTreeMap<(u16, u8), Vec<u8>>,
    pub dictionary: BTreeMap<u16, SimObject>,
    /// Writing this object makes the device send an emergency.
    pub emergency_on_write: Option<(u16, u8)>,
    pub pending_emergencies: Vec<ErrorKind>,
    pub esc: Vec<u8>,
    pub eeprom: Vec<u16>,
    pub files: HashMap<String, Vec<u8>>,
    /// Mailboxes the device will send, in order.
    pub inbox: VecDeque<Vec<u8>>,
    pub eoe_ip: EoeIpConfig,
    pub eoe_sent: Vec<Vec<u8>>,
    pub outputs: Vec<u8>,
    pub inputs: Vec<u8>,
    /// Inputs mirror the last outputs received.
    pub loopback: bool,
}

impl SimSlave {
    pub fn new(name: &str, vendor_id: u32, product_code: u32) -> Self {
        let mut esc = vec![0; ESC_SIZE];
        // watchdog divider 2498: 100 us per tick
        esc[0x400..0x402].copy_from_slice(&0x09C2_u16.to_le_bytes());
        Self {
            name: name.into(),
            vendor_id,
            product_code,
            revision: 1,
            serial: 0,
            input_bits: 0,
            output_bits: 0,
            max_state: AlState::Op,
            al_state: AlState::Init as u16,
            al_status_code: 0,
            has_dc: false,
            dc_sync: None,
            objects: BTreeMap::new(),
            dictionary: BTreeMap::new(),
            emergency_on_write: None,
            pending_emergencies: Vec::new(),
            esc,
            eeprom: vec![0; EEPROM_WORDS],
            files: HashMap::new(),
            inbox: VecDeque::new(),
            eoe_ip: EoeIpConfig::default(),
            eoe_sent: Vec::new(),
            outputs: Vec::new(),
            inputs: Vec::new(),
            loopback: true,
        }
    }

    pub fn inputs(mut self, bits: u16) -> Self {
        self.input_bits = bits;
        self
    }

    pub fn outputs(mut self, bits: u16) -> Self {
        self.output_bits = bits;
        self
    }

    pub fn max_state(mut self, state: AlState) -> Self {
        self.max_state = state;
        self
    }

    pub fn dc(mut self) -> Self {
        self.has_dc = true;
        self
    }

    pub fn object(mut self, index: u16, sub_index: u8, value: Vec<u8>) -> Self {
        self.objects.insert((index, sub_index), value);
        self
    }

    pub fn describe(mut self, index: u16, object: SimObject) -> Self {
        self.dictionary.insert(index, object);
        self
    }

    pub fn emergency_on_write(mut self, index: u16, sub_index: u8) -> Self {
        self.emergency_on_write = Some((index, sub_index));
        self
    }

    pub fn eeprom_word(mut self, address: u16, value: u16) -> Self {
        self.eeprom[usize::from(address)] = value;
        self
    }

    /// Queues a mailbox the device sends on the next receive.
    pub fn mailbox(mut self, mbx: Vec<u8>) -> Self {
        self.inbox.push_back(mbx);
        self
    }

    pub fn file(mut self, name: &str, data: Vec<u8>) -> Self {
        self.files.insert(name.into(), data);
        self
    }

    fn reachable(&self, state: u16) -> bool {
        AlState::try_from(state).map_or(false, |s| s != AlState::None && s <= self.max_state)
    }

    fn request(&mut self, requested: u16) {
        let target = requested & !STATE_ERROR;
        let mut state = self.al_state;
        if requested & STATE_ERROR != 0 {
            state &= !STATE_ERROR;
            self.al_status_code = 0;
        }
        if self.reachable(target) {
            state = target;
        }
        self.al_state = state;
    }

    fn output_len(&self) -> usize {
        (usize::from(self.output_bits) + 7) / 8
    }

    fn input_len(&self) -> usize {
        (usize::from(self.input_bits) + 7) / 8
    }

    fn flush_emergencies(&mut self, pos: u16, errors: &mut VecDeque<ErrorRecord>) -> bool {
        let any = !self.pending_emergencies.is_empty();
        for kind in self.pending_emergencies.drain(..) {
            errors.push_back(ErrorRecord::new(pos, 0, 0, kind));
        }
        any
    }
}

/// The simulated devices.
#[derive(Debug, Default)]
pub struct SimBus {
    pub slaves: Vec<SimSlave>,
    map_errors: Vec<ErrorRecord>,
    mailbox_errors: Vec<ErrorRecord>,
}

impl SimBus {
    /// Queues an error to be reported by the next mapping.
    pub fn push_map_error(&mut self, rec: ErrorRecord) {
        self.map_errors.push(rec);
    }

    /// Queues an error to be reported by the next mailbox receive of any
    /// slave.
    pub fn push_mailbox_error(&mut self, rec: ErrorRecord) {
        self.mailbox_errors.push(rec);
    }

    pub fn slave_mut(&mut self, pos: u16) -> Option<&mut SimSlave> {
        self.slaves.get_mut(usize::from(pos.checked_sub(1)?))
    }
}

pub struct SimEngine {
    bus: Arc<Mutex<SimBus>>,
    adapters: Vec<Adapter>,
    records: Vec<SlaveRecord>,
    group: GroupRecord,
    errors: VecDeque<ErrorRecord>,
    eoe_hook: Option<EoeHook>,
    timeouts: Timeouts,
    manual_state_change: bool,
    open: bool,
    dc_time: i64,
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEngine {
    pub fn new() -> Self {
        Self {
            bus: Arc::new(Mutex::new(SimBus::default())),
            adapters: vec![
                Adapter::new("sim0".into(), "Simulated adapter 0".into()),
                Adapter::new("sim1".into(), "Simulated adapter 1".into()),
            ],
            records: vec![SlaveRecord::default()],
            group: GroupRecord::default(),
            errors: VecDeque::new(),
            eoe_hook: None,
            timeouts: Timeouts::default(),
            manual_state_change: false,
            open: false,
            dc_time: 0,
        }
    }

    pub fn with_slave(self, slave: SimSlave) -> Self {
        lock(&self.bus).slaves.push(slave);
        self
    }

    /// Shared handle to the simulated devices.
    pub fn bus(&self) -> Arc<Mutex<SimBus>> {
        self.bus.clone()
    }

    pub fn push_error(&mut self, rec: ErrorRecord) {
        self.errors.push_back(rec);
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Runs `f` on the device at `pos` with access to the error queue.
    fn device<R>(
        &mut self,
        pos: u16,
        f: impl FnOnce(&mut SimSlave, &mut VecDeque<ErrorRecord>) -> R,
    ) -> Option<R> {
        let bus = Arc::clone(&self.bus);
        let mut bus = lock(&bus);
        let dev = bus.slave_mut(pos)?;
        Some(f(dev, &mut self.errors))
    }

    fn device_by_addr<R>(&mut self, config_addr: u16, f: impl FnOnce(&mut SimSlave) -> R) -> Option<R> {
        let pos = config_addr.checked_sub(FIRST_STATION_ADDR)? + 1;
        self.device(pos, |dev, _| f(dev))
    }

    fn sync_states(&mut self) -> u16 {
        let bus = lock(&self.bus);
        let mut lowest: Option<u16> = None;
        let mut error = 0;
        for (dev, rec) in bus.slaves.iter().zip(self.records.iter_mut().skip(1)) {
            rec.state = dev.al_state;
            rec.al_status_code = dev.al_status_code;
            let st = dev.al_state & !STATE_ERROR;
            error |= dev.al_state & STATE_ERROR;
            lowest = Some(lowest.map_or(st, |l| l.min(st)));
        }
        let lowest = lowest.unwrap_or(0) | error;
        self.records[0].state = lowest;
        lowest
    }

    fn map(&mut self, setup: &mut SetupHook<'_>, overlap: bool) -> usize {
        for pos in 1..=self.slave_count() {
            setup(&mut *self, pos);
        }

        let bus = Arc::clone(&self.bus);
        let mut bus = lock(&bus);
        self.errors.extend(bus.map_errors.drain(..));

        let mut group = GroupRecord {
            segments: 1,
            ..GroupRecord::default()
        };
        let mut offset = 0;
        for (dev, rec) in bus.slaves.iter().zip(self.records.iter_mut().skip(1)) {
            rec.output_offset = offset;
            rec.output_bits = dev.output_bits;
            rec.output_bytes = usize::from(dev.output_bits) / 8;
            offset += dev.output_len();
            if dev.output_bits > 0 {
                group.outputs_wkc += 1;
            }
        }
        let outputs_end = offset;
        if overlap {
            offset = 0;
        }
        for (dev, rec) in bus.slaves.iter().zip(self.records.iter_mut().skip(1)) {
            rec.input_offset = offset;
            rec.input_bits = dev.input_bits;
            rec.input_bytes = usize::from(dev.input_bits) / 8;
            offset += dev.input_len();
            if dev.input_bits > 0 {
                group.inputs_wkc += 1;
            }
        }
        group.io_size = offset.max(outputs_end);
        group.has_dc = bus.slaves.iter().any(|s| s.has_dc);
        self.group = group;

        if !self.manual_state_change {
            for dev in bus.slaves.iter_mut() {
                dev.request(AlState::SafeOp as u16);
            }
        }
        drop(bus);
        self.sync_states();
        group.io_size
    }
}

impl Engine for SimEngine {
    fn adapters(&self) -> Vec<Adapter> {
        self.adapters.clone()
    }

    fn init(&mut self, ifname: &str) -> bool {
        self.open = self.adapters.iter().any(|a| a.name == ifname);
        self.open
    }

    fn init_redundant(&mut self, ifname: &str, redundant_ifname: &str) -> bool {
        self.open = self.init(ifname) && self.adapters.iter().any(|a| a.name == redundant_ifname);
        self.open
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn set_timeouts(&mut self, timeouts: &Timeouts) {
        self.timeouts = *timeouts;
    }

    fn set_manual_state_change(&mut self, manual: bool) {
        self.manual_state_change = manual;
    }

    fn config_init(&mut self, _use_table: bool) -> i32 {
        let mut bus = lock(&self.bus);
        self.records = vec![SlaveRecord::default()];
        for (i, dev) in bus.slaves.iter_mut().enumerate() {
            dev.al_state = AlState::Init as u16;
            dev.request(AlState::PreOp as u16);
            let mut sm = [SyncManager::default(); 8];
            sm[0] = SyncManager {
                start_addr: 0x1000,
                length: 128,
                flags: 0x0001_0026,
            };
            sm[1] = SyncManager {
                start_addr: 0x1080,
                length: 128,
                flags: 0x0001_0022,
            };
            self.records.push(SlaveRecord {
                name: dev.name.clone(),
                config_addr: FIRST_STATION_ADDR + i as u16,
                vendor_id: dev.vendor_id,
                product_code: dev.product_code,
                revision: dev.revision,
                serial: dev.serial,
                mbx_wo: sm[0].start_addr,
                mbx_l: sm[0].length,
                mbx_ro: sm[1].start_addr,
                mbx_rl: sm[1].length,
                sm,
                has_dc: dev.has_dc,
                ..SlaveRecord::default()
            });
        }
        let count = bus.slaves.len() as i32;
        drop(bus);
        self.group = GroupRecord::default();
        self.sync_states();
        count
    }

    fn slave_count(&self) -> u16 {
        (self.records.len() - 1) as u16
    }

    fn slave(&self, pos: u16) -> Option<&SlaveRecord> {
        self.records.get(usize::from(pos))
    }

    fn slave_mut(&mut self, pos: u16) -> Option<&mut SlaveRecord> {
        self.records.get_mut(usize::from(pos))
    }

    fn group(&self, group: u8) -> Option<&GroupRecord> {
        if group == 0 {
            Some(&self.group)
        } else {
            None
        }
    }

    fn config_map_group(&mut self, _group: u8, setup: &mut SetupHook<'_>) -> usize {
        self.map(setup, false)
    }

    fn config_overlap_map_group(&mut self, _group: u8, setup: &mut SetupHook<'_>) -> usize {
        self.map(setup, true)
    }

    fn config_dc(&mut self) -> bool {
        self.group.has_dc = lock(&self.bus).slaves.iter().any(|s| s.has_dc);
        self.group.has_dc
    }

    fn dc_time(&self) -> i64 {
        self.dc_time
    }

    fn dc_sync0(&mut self, slave: u16, act: bool, cycle_time: u32, shift_time: i32) {
        self.device(slave, |dev, _| {
            dev.dc_sync = Some((act, cycle_time, None, shift_time))
        });
    }

    fn dc_sync01(
        &mut self,
        slave: u16,
        act: bool,
        cycle_time0: u32,
        cycle_time1: u32,
        shift_time: i32,
    ) {
        self.device(slave, |dev, _| {
            dev.dc_sync = Some((act, cycle_time0, Some(cycle_time1), shift_time))
        });
    }

    fn send_processdata(&mut self, iomap: &[u8]) -> i32 {
        let mut bus = lock(&self.bus);
        for (dev, rec) in bus.slaves.iter_mut().zip(self.records.iter().skip(1)) {
            if dev.al_state != AlState::Op as u16 {
                continue;
            }
            let len = dev.output_len();
            if let Some(out) = iomap.get(rec.output_offset..rec.output_offset + len) {
                dev.outputs = out.to_vec();
            }
            if dev.loopback {
                let mut inputs = dev.outputs.clone();
                inputs.resize(dev.input_len(), 0);
                dev.inputs = inputs;
            }
        }
        1
    }

    fn send_overlap_processdata(&mut self, iomap: &[u8]) -> i32 {
        self.send_processdata(iomap)
    }

    fn receive_processdata(&mut self, iomap: &mut [u8], _timeout: Duration) -> i32 {
        let bus = lock(&self.bus);
        let mut wkc = 0;
        for (dev, rec) in bus.slaves.iter().zip(self.records.iter().skip(1)) {
            let op = dev.al_state == AlState::Op as u16;
            if !op && dev.al_state != AlState::SafeOp as u16 {
                continue;
            }
            if op && dev.output_bits > 0 {
                wkc += 2;
            }
            if dev.input_bits > 0 {
                wkc += 1;
                let len = dev.input_len();
                if let Some(inp) = iomap.get_mut(rec.input_offset..rec.input_offset + len) {
                    for (d, s) in inp.iter_mut().zip(dev.inputs.iter().chain(std::iter::repeat(&0))) {
                        *d = *s;
                    }
                }
            }
        }
        self.dc_time += 1_000_000;
        wkc
    }

    fn read_state(&mut self) -> u16 {
        self.sync_states()
    }

    fn write_state(&mut self, slave: u16) -> i32 {
        let requested = match self.records.get(usize::from(slave)) {
            Some(rec) => rec.state,
            None => return 0,
        };
        let mut bus = lock(&self.bus);
        let wkc = if slave == 0 {
            for dev in bus.slaves.iter_mut() {
                dev.request(requested);
            }
            bus.slaves.len() as i32
        } else {
            match bus.slave_mut(slave) {
                Some(dev) => {
                    dev.request(requested);
                    1
                }
                None => 0,
            }
        };
        // the requested state stays in the record until the next read
        wkc
    }

    fn state_check(&mut self, slave: u16, state: u16, timeout: Duration) -> u16 {
        self.sync_states();
        let current = self.records.get(usize::from(slave)).map_or(0, |r| r.state);
        if current != state {
            // nothing changes while waiting
            std::thread::sleep(timeout);
        }
        current
    }

    fn reconfig_slave(&mut self, slave: u16, _timeout: Duration) -> i32 {
        self.device(slave, |dev, _| {
            dev.request(AlState::PreOp as u16);
            i32::from(dev.al_state)
        })
        .unwrap_or(0)
    }

    fn recover_slave(&mut self, slave: u16, _timeout: Duration) -> i32 {
        self.device(slave, |_, _| 1).unwrap_or(0)
    }

    fn sdo_read(
        &mut self,
        slave: u16,
        index: u16,
        sub_index: u8,
        complete_access: bool,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Transfer {
        if timeout == Duration::from_secs(0) {
            return Transfer::default();
        }
        self.device(slave, |dev, errors| {
            dev.flush_emergencies(slave, errors);
            let data = if complete_access {
                let data: Vec<u8> = dev
                    .objects
                    .range((index, sub_index)..=(index, u8::MAX))
                    .flat_map(|(_, v)| v.iter().copied())
                    .collect();
                Some(data).filter(|d| !d.is_empty())
            } else {
                dev.objects.get(&(index, sub_index)).cloned()
            };
            match data {
                None => {
                    errors.push_back(ErrorRecord::new(
                        slave,
                        index,
                        sub_index,
                        ErrorKind::SdoAbort(0x0602_0000),
                    ));
                    Transfer::default()
                }
                Some(data) if data.len() > buf.len() => {
                    errors.push_back(ErrorRecord::new(
                        slave,
                        index,
                        sub_index,
                        ErrorKind::Packet(3),
                    ));
                    Transfer::default()
                }
                Some(data) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Transfer::new(1, data.len())
                }
            }
        })
        .unwrap_or_default()
    }

    fn sdo_write(
        &mut self,
        slave: u16,
        index: u16,
        sub_index: u8,
        _complete_access: bool,
        data: &[u8],
        timeout: Duration,
    ) -> i32 {
        if timeout == Duration::from_secs(0) {
            return 0;
        }
        self.device(slave, |dev, errors| {
            dev.flush_emergencies(slave, errors);
            match dev.objects.get_mut(&(index, sub_index)) {
                Some(value) => *value = data.to_vec(),
                None => {
                    errors.push_back(ErrorRecord::new(
                        slave,
                        index,
                        sub_index,
                        ErrorKind::SdoAbort(0x0602_0000),
                    ));
                    return 0;
                }
            }
            if dev.emergency_on_write == Some((index, sub_index)) {
                dev.pending_emergencies.push(ErrorKind::Emergency {
                    error_code: 0xFFFE,
                    error_reg: 0x00,
                    b1: 0xAA,
                    w1: 0x5555,
                    w2: 0x5555,
                });
            }
            1
        })
        .unwrap_or(0)
    }

    fn read_od_list(&mut self, slave: u16, list: &mut Vec<u16>) -> i32 {
        self.device(slave, |dev, _| {
            list.clear();
            list.extend(dev.dictionary.keys().copied());
            1
        })
        .unwrap_or(0)
    }

    fn read_od_description(
        &mut self,
        slave: u16,
        index: u16,
        desc: &mut ObjectDescriptionRecord,
    ) -> i32 {
        self.device(slave, |dev, errors| match dev.dictionary.get(&index) {
            Some(obj) => {
                *desc = obj.desc.clone();
                1
            }
            None => {
                errors.push_back(ErrorRecord::new(
                    slave,
                    index,
                    0,
                    ErrorKind::SdoInfo(0x0602_0000),
                ));
                0
            }
        })
        .unwrap_or(0)
    }

    fn read_oe(
        &mut self,
        slave: u16,
        index: u16,
        max_sub: u8,
        entries: &mut Vec<ObjectEntryRecord>,
    ) -> i32 {
        self.device(slave, |dev, _| match dev.dictionary.get(&index) {
            Some(obj) => {
                entries.clear();
                entries.extend(
                    obj.entries
                        .iter()
                        .take(usize::from(max_sub) + 1)
                        .cloned(),
                );
                1
            }
            None => 0,
        })
        .unwrap_or(0)
    }

    fn foe_read(
        &mut self,
        slave: u16,
        filename: &str,
        _password: u32,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Transfer {
        self.device(slave, |dev, errors| {
            let kind = match dev.files.get(filename) {
                Some(data) if data.len() <= buf.len() => {
                    buf[..data.len()].copy_from_slice(data);
                    return Transfer::new(1, data.len());
                }
                Some(_) => ErrorKind::FoeBufferTooSmall,
                None => ErrorKind::FoeFileNotFound,
            };
            errors.push_back(ErrorRecord::new(slave, 0, 0, kind));
            Transfer::default()
        })
        .unwrap_or_default()
    }

    fn foe_write(
        &mut self,
        slave: u16,
        filename: &str,
        _password: u32,
        data: &[u8],
        _timeout: Duration,
    ) -> i32 {
        self.device(slave, |dev, _| {
            dev.files.insert(filename.into(), data.to_vec());
            1
        })
        .unwrap_or(0)
    }

    fn read_eeprom(&mut self, slave: u16, word_address: u16, _timeout: Duration) -> u32 {
        self.device(slave, |dev, _| {
            let word = |addr: usize| u32::from(dev.eeprom.get(addr).copied().unwrap_or(0));
            let addr = usize::from(word_address);
            word(addr) | word(addr + 1) << 16
        })
        .unwrap_or(0)
    }

    fn write_eeprom(&mut self, slave: u16, word_address: u16, data: u16, _timeout: Duration) -> i32 {
        self.device(slave, |dev, _| {
            match dev.eeprom.get_mut(usize::from(word_address)) {
                Some(word) => {
                    *word = data;
                    1
                }
                None => 0,
            }
        })
        .unwrap_or(0)
    }

    fn fprd(&mut self, config_addr: u16, register: u16, buf: &mut [u8], _timeout: Duration) -> i32 {
        let start = usize::from(register);
        self.device_by_addr(config_addr, |dev| {
            match dev.esc.get(start..start + buf.len()) {
                Some(mem) => {
                    buf.copy_from_slice(mem);
                    1
                }
                None => 0,
            }
        })
        .unwrap_or(0)
    }

    fn fpwr(&mut self, config_addr: u16, register: u16, data: &[u8], _timeout: Duration) -> i32 {
        let start = usize::from(register);
        self.device_by_addr(config_addr, |dev| {
            match dev.esc.get_mut(start..start + data.len()) {
                Some(mem) => {
                    mem.copy_from_slice(data);
                    1
                }
                None => 0,
            }
        })
        .unwrap_or(0)
    }

    fn mailbox_receive(&mut self, slave: u16, buf: &mut [u8], _timeout: Duration) -> Transfer {
        self.errors.extend(lock(&self.bus).mailbox_errors.drain(..));
        let mut emergencies = false;
        loop {
            let next = self.device(slave, |dev, errors| {
                emergencies |= dev.flush_emergencies(slave, errors);
                dev.inbox.pop_front()
            });
            let mbx = match next.flatten() {
                Some(mbx) => mbx,
                None => break,
            };
            let is_eoe = mailbox_type(&mbx) == Some(MBX_TYPE_EOE);
            if is_eoe {
                if let Some(hook) = self.eoe_hook.as_mut() {
                    if hook(slave, &mbx) {
                        continue;
                    }
                }
            }
            let len = mbx.len().min(buf.len());
            buf[..len].copy_from_slice(&mbx[..len]);
            return Transfer::new(1, len);
        }
        Transfer::new(if emergencies { 1 } else { 0 }, 0)
    }

    fn eoe_set_ip(&mut self, slave: u16, _port: u8, config: &EoeIpConfig, _timeout: Duration) -> i32 {
        self.device(slave, |dev, _| {
            let ip = &mut dev.eoe_ip;
            if config.mac.is_some() {
                ip.mac = config.mac;
            }
            if config.ip.is_some() {
                ip.ip = config.ip;
            }
            if config.subnet.is_some() {
                ip.subnet = config.subnet;
            }
            if config.default_gateway.is_some() {
                ip.default_gateway = config.default_gateway;
            }
            if config.dns_ip.is_some() {
                ip.dns_ip = config.dns_ip;
            }
            if config.dns_name.is_some() {
                ip.dns_name = config.dns_name.clone();
            }
            1
        })
        .unwrap_or(0)
    }

    fn eoe_get_ip(
        &mut self,
        slave: u16,
        _port: u8,
        config: &mut EoeIpConfig,
        _timeout: Duration,
    ) -> i32 {
        self.device(slave, |dev, _| {
            *config = dev.eoe_ip.clone();
            1
        })
        .unwrap_or(0)
    }

    fn eoe_send(&mut self, slave: u16, _port: u8, frame: &[u8], _timeout: Duration) -> i32 {
        self.device(slave, |dev, _| {
            dev.eoe_sent.push(frame.to_vec());
            1
        })
        .unwrap_or(0)
    }

    fn set_eoe_hook(&mut self, hook: Option<EoeHook>) {
        self.eoe_hook = hook;
    }

    fn pop_error(&mut self) -> Option<ErrorRecord> {
        self.errors.pop_front()
    }

    fn al_status_code_to_string(&self, code: u16) -> String {
        match code {
            0x0000 => "No error",
            0x0001 => "Unspecified error",
            0x0011 => "Invalid requested state change",
            0x0012 => "Unknown requested state",
            0x0013 => "Bootstrap not supported",
            0x0016 => "Invalid mailbox configuration",
            0x001B => "Sync manager watchdog",
            0x001D => "Invalid output configuration",
            0x001E => "Invalid input configuration",
            _ => "Unknown AL status code",
        }
        .into()
    }

    fn sdo_error_to_string(&self, abort_code: u32) -> String {
        match abort_code {
            0x0503_0000 => "Toggle bit not changed",
            0x0504_0000 => "SDO protocol timeout",
            0x0504_0001 => "Client/Server command specifier not valid or unknown",
            0x0504_0005 => "Out of memory",
            0x0601_0000 => "Unsupported access to an object",
            0x0601_0001 => "Attempt to read to a write only object",
            0x0601_0002 => "Attempt to write to a read only object",
            0x0602_0000 => "The object does not exist in the object directory",
            0x0604_0041 => "The object can not be mapped into the PDO",
            0x0604_0042 => "The number and length of the objects to be mapped would exceed the PDO length",
            0x0607_0010 => "Data type does not match, length of service parameter does not match",
            0x0609_0011 => "Subindex does not exist",
            0x0609_0030 => "Value range of parameter exceeded",
            0x0800_0000 => "General error",
            0x0800_0020 => "Data cannot be transferred or stored to the application",
            0x0800_0022 => "Data cannot be transferred or stored to the application because of the present device state",
            _ => "Unknown abort code",
        }
        .into()
    }
}
