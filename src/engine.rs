// Part of soem-master. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! The raw master this crate coordinates.
//!
//! An [`Engine`] transmits and receives frames, enumerates slaves, maps the
//! process data and runs the low level mailbox protocols. It reports results
//! the way a C fieldbus stack does: working counters and an error queue that
//! has to be drained after each exchange. Everything stateful on top of that
//! lives in [`Master`](crate::Master) and [`Slave`](crate::Slave).

use derive_new::new;
use std::{net::Ipv4Addr, time::Duration};

/// Length of a DNS name in an EoE IP parameter request.
pub const DNS_NAME_LENGTH: usize = 32;

/// A network adapter usable for EtherCAT.
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct Adapter {
    pub name: String,
    pub desc: String,
}

/// A sync manager as configured in a slave record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncManager {
    pub start_addr: u16,
    pub length: u16,
    pub flags: u32,
}

impl SyncManager {
    /// Register layout of a sync manager (ESC 0x0800 + 8 * n).
    pub fn to_bytes(self) -> [u8; 8] {
        let mut b = [0; 8];
        b[..2].copy_from_slice(&self.start_addr.to_le_bytes());
        b[2..4].copy_from_slice(&self.length.to_le_bytes());
        b[4..].copy_from_slice(&self.flags.to_le_bytes());
        b
    }
}

/// Per slave data populated by the engine. Position 0 is the aggregate of all
/// slaves; its `state` is the lowest state read and the state requested for all.
#[derive(Debug, Default, Clone)]
pub struct SlaveRecord {
    pub name: String,
    pub state: u16,
    pub al_status_code: u16,
    pub config_addr: u16,
    pub alias_addr: u16,
    pub vendor_id: u32,
    pub product_code: u32,
    pub revision: u32,
    pub serial: u32,
    pub output_offset: usize,
    pub output_bytes: usize,
    pub output_bits: u16,
    pub input_offset: usize,
    pub input_bytes: usize,
    pub input_bits: u16,
    pub mbx_wo: u16,
    pub mbx_ro: u16,
    pub mbx_l: u16,
    pub mbx_rl: u16,
    pub sm: [SyncManager; 8],
    pub has_dc: bool,
    pub group: u8,
}

/// Bookkeeping of a process data group.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GroupRecord {
    pub outputs_wkc: u16,
    pub inputs_wkc: u16,
    pub segments: u16,
    pub io_size: usize,
    pub has_dc: bool,
}

/// Outcome of a transfer that fills a buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, new)]
pub struct Transfer {
    pub wkc: i32,
    /// Number of valid bytes in the buffer.
    pub len: usize,
}

/// Type specific part of an [`ErrorRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SdoAbort(u32),
    Emergency {
        error_code: u16,
        error_reg: u8,
        b1: u8,
        w1: u16,
        w2: u16,
    },
    Mailbox(u16),
    Packet(u16),
    SdoInfo(u32),
    Foe(u32),
    FoeBufferTooSmall,
    FoePacketNumber,
    FoeFileNotFound,
    EoeInvalidRxData,
}

/// One entry of the engine's error queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, new)]
pub struct ErrorRecord {
    pub slave: u16,
    pub index: u16,
    pub sub_index: u8,
    pub kind: ErrorKind,
}

/// Description of a CoE object as returned by SDO info.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ObjectDescriptionRecord {
    pub name: String,
    pub data_type: u16,
    pub object_code: u8,
    pub max_sub: u8,
    pub bit_length: u16,
    pub obj_access: u16,
}

/// Description of one sub-entry of a CoE object.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ObjectEntryRecord {
    pub name: String,
    pub value_info: u8,
    pub data_type: u16,
    pub bit_length: u16,
    pub obj_access: u16,
}

/// EoE IP parameters of a slave port; unset fields are left untouched on the slave.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EoeIpConfig {
    pub mac: Option<[u8; 6]>,
    pub ip: Option<Ipv4Addr>,
    pub subnet: Option<Ipv4Addr>,
    pub default_gateway: Option<Ipv4Addr>,
    pub dns_ip: Option<Ipv4Addr>,
    pub dns_name: Option<heapless::String<DNS_NAME_LENGTH>>,
}

/// Low level timeouts of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Frame round trip.
    pub ret: Duration,
    /// Safe data transfer.
    pub safe: Duration,
    pub eeprom: Duration,
    pub tx_mailbox: Duration,
    pub rx_mailbox: Duration,
    /// State change check.
    pub state: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ret: Duration::from_micros(2_000),
            safe: Duration::from_micros(20_000),
            eeprom: Duration::from_micros(20_000),
            tx_mailbox: Duration::from_micros(20_000),
            rx_mailbox: Duration::from_micros(700_000),
            state: Duration::from_micros(2_000_000),
        }
    }
}

/// Called per slave while mapping, at the PreOp to SafeOp transition.
pub type SetupHook<'a> = dyn FnMut(&mut dyn Engine, u16) + 'a;

/// Called with each received EoE mailbox (slave position, raw mailbox bytes).
/// Returns `true` if the mailbox was consumed.
pub type EoeHook = Box<dyn FnMut(u16, &[u8]) -> bool + Send>;

/// Narrow interface to the raw EtherCAT master.
///
/// Slave positions are 1-based; position 0 addresses all slaves where the
/// operation allows it. Operations returning `i32` return the working counter.
/// Failed exchanges push an [`ErrorRecord`] that is fetched with
/// [`pop_error`](Engine::pop_error).
pub trait Engine: Send {
    fn adapters(&self) -> Vec<Adapter>;
    fn init(&mut self, ifname: &str) -> bool;
    fn init_redundant(&mut self, ifname: &str, redundant_ifname: &str) -> bool;
    fn close(&mut self);
    fn set_timeouts(&mut self, timeouts: &Timeouts);
    fn set_manual_state_change(&mut self, manual: bool);

    /// Enumerates and initializes all slaves; returns the slave count, or a
    /// value <= 0 if none were found.
    fn config_init(&mut self, use_table: bool) -> i32;
    fn slave_count(&self) -> u16;
    fn slave(&self, pos: u16) -> Option<&SlaveRecord>;
    fn slave_mut(&mut self, pos: u16) -> Option<&mut SlaveRecord>;
    fn group(&self, group: u8) -> Option<&GroupRecord>;

    /// Computes the process data layout of `group`; returns the IO map size.
    fn config_map_group(&mut self, group: u8, setup: &mut SetupHook<'_>) -> usize;
    fn config_overlap_map_group(&mut self, group: u8, setup: &mut SetupHook<'_>) -> usize;
    fn config_dc(&mut self) -> bool;
    fn dc_time(&self) -> i64;
    fn dc_sync0(&mut self, slave: u16, act: bool, cycle_time: u32, shift_time: i32);
    fn dc_sync01(
        &mut self,
        slave: u16,
        act: bool,
        cycle_time0: u32,
        cycle_time1: u32,
        shift_time: i32,
    );

    fn send_processdata(&mut self, iomap: &[u8]) -> i32;
    fn send_overlap_processdata(&mut self, iomap: &[u8]) -> i32;
    fn receive_processdata(&mut self, iomap: &mut [u8], timeout: Duration) -> i32;

    /// Reads the state of all slaves; returns the lowest state.
    fn read_state(&mut self) -> u16;
    /// Writes the requested state stored in the slave record.
    fn write_state(&mut self, slave: u16) -> i32;
    /// Polls until `slave` reaches `state` or the timeout expires; returns the
    /// last state read.
    fn state_check(&mut self, slave: u16, state: u16, timeout: Duration) -> u16;
    fn reconfig_slave(&mut self, slave: u16, timeout: Duration) -> i32;
    fn recover_slave(&mut self, slave: u16, timeout: Duration) -> i32;

    fn sdo_read(
        &mut self,
        slave: u16,
        index: u16,
        sub_index: u8,
        complete_access: bool,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Transfer;
    fn sdo_write(
        &mut self,
        slave: u16,
        index: u16,
        sub_index: u8,
        complete_access: bool,
        data: &[u8],
        timeout: Duration,
    ) -> i32;
    fn read_od_list(&mut self, slave: u16, list: &mut Vec<u16>) -> i32;
    fn read_od_description(
        &mut self,
        slave: u16,
        index: u16,
        desc: &mut ObjectDescriptionRecord,
    ) -> i32;
    fn read_oe(
        &mut self,
        slave: u16,
        index: u16,
        max_sub: u8,
        entries: &mut Vec<ObjectEntryRecord>,
    ) -> i32;

    fn foe_read(
        &mut self,
        slave: u16,
        filename: &str,
        password: u32,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Transfer;
    fn foe_write(
        &mut self,
        slave: u16,
        filename: &str,
        password: u32,
        data: &[u8],
        timeout: Duration,
    ) -> i32;

    /// Reads 4 bytes of the slave EEPROM starting at a word address.
    fn read_eeprom(&mut self, slave: u16, word_address: u16, timeout: Duration) -> u32;
    fn write_eeprom(&mut self, slave: u16, word_address: u16, data: u16, timeout: Duration) -> i32;

    fn fprd(&mut self, config_addr: u16, register: u16, buf: &mut [u8], timeout: Duration)
        -> i32;
    fn fpwr(&mut self, config_addr: u16, register: u16, data: &[u8], timeout: Duration) -> i32;

    /// Receives one mailbox. EoE mailboxes are offered to the EoE hook first,
    /// emergencies are pushed to the error queue.
    fn mailbox_receive(&mut self, slave: u16, buf: &mut [u8], timeout: Duration) -> Transfer;
    fn eoe_set_ip(&mut self, slave: u16, port: u8, config: &EoeIpConfig, timeout: Duration)
        -> i32;
    fn eoe_get_ip(
        &mut self,
        slave: u16,
        port: u8,
        config: &mut EoeIpConfig,
        timeout: Duration,
    ) -> i32;
    fn eoe_send(&mut self, slave: u16, port: u8, frame: &[u8], timeout: Duration) -> i32;
    fn set_eoe_hook(&mut self, hook: Option<EoeHook>);

    fn pop_error(&mut self) -> Option<ErrorRecord>;

    fn al_status_code_to_string(&self, code: u16) -> String;
    fn sdo_error_to_string(&self, abort_code: u32) -> String;
}
