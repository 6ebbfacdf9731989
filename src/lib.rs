// Part of soem-master. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Stateful coordination of an EtherCAT network on top of a raw master.
//!
//! The raw master (an [`Engine`]) sends frames, enumerates slaves and runs the
//! mailbox protocols, reporting results as working counters and an error queue.
//! This crate turns that into typed errors, keeps a table of the slaves with
//! their setup functions and emergency subscribers, owns the process data
//! image and reassembles Ethernet over EtherCAT frames.
//!
//! The entry point is [`Master`]; individual slaves are reached through
//! [`Master::slave`], which returns a short lived [`Slave`] handle.

mod coe;
mod convert;
mod drain;
mod engine;
mod eoe;
mod mailbox;
mod master;
mod settings;
mod slave;
mod types;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use self::{
    coe::{data_type, object_code, ObjectDescription, ObjectEntry},
    drain::mailbox_error_desc,
    engine::{
        Adapter, EoeHook, EoeIpConfig, Engine, ErrorKind, ErrorRecord, GroupRecord,
        ObjectDescriptionRecord, ObjectEntryRecord, SetupHook, SlaveRecord, SyncManager,
        Timeouts, Transfer, DNS_NAME_LENGTH,
    },
    eoe::{EoeCallback, EoeFragmentState, EOE_FRAME_CAPACITY, EOE_TIMEOUT, MAILBOX_CAPACITY},
    mailbox::{FOE_TIMEOUT, SDO_SCRATCH_SIZE},
    master::{Master, MAX_SLAVES},
    settings::{Settings, DEFAULT_IOMAP_CAPACITY, DEFAULT_SDO_TIMEOUT},
    slave::{EmergencyCallback, SetupFunc, Slave},
    types::*,
};
