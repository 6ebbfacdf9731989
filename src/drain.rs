// Part of soem-master. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Draining of the engine error queue.
//!
//! Every mailbox exchange may leave records in the queue, including
//! emergencies a slave sent while it answered. The queue is always drained
//! completely so that a stale record never shows up in an unrelated call.

use crate::{
    engine::{Engine, ErrorKind, ErrorRecord},
    types::*,
};

/// A drained record after classification.
#[derive(Debug)]
pub(crate) enum Drained {
    Emergency(Emergency),
    Error(Error),
}

/// Pops every queued record.
pub(crate) fn drain_all(engine: &mut dyn Engine) -> Vec<ErrorRecord> {
    let mut records = Vec::new();
    while let Some(rec) = engine.pop_error() {
        records.push(rec);
    }
    records
}

pub(crate) fn classify(engine: &dyn Engine, rec: ErrorRecord) -> Drained {
    let ErrorRecord {
        slave,
        index,
        sub_index,
        kind,
    } = rec;
    let err: Error = match kind {
        ErrorKind::Emergency {
            error_code,
            error_reg,
            b1,
            w1,
            w2,
        } => {
            return Drained::Emergency(Emergency::new(slave, error_code, error_reg, b1, w1, w2));
        }
        ErrorKind::SdoAbort(code) => {
            SdoAbort::new(slave, index, sub_index, code, engine.sdo_error_to_string(code)).into()
        }
        ErrorKind::SdoInfo(code) => {
            SdoInfoFault::new(slave, index, sub_index, code, engine.sdo_error_to_string(code))
                .into()
        }
        ErrorKind::Mailbox(code) => {
            MailboxFault::new(slave, code, mailbox_error_desc(code).to_owned()).into()
        }
        ErrorKind::Packet(code) => PacketFault::new(
            slave,
            index,
            sub_index,
            code,
            PacketErrorCode::desc(code).to_owned(),
        )
        .into(),
        ErrorKind::Foe(code) => FoeFault::new(slave, FoeFaultKind::Slave(code)).into(),
        ErrorKind::FoeBufferTooSmall => FoeFault::new(slave, FoeFaultKind::BufferTooSmall).into(),
        ErrorKind::FoePacketNumber => FoeFault::new(slave, FoeFaultKind::PacketNumber).into(),
        ErrorKind::FoeFileNotFound => FoeFault::new(slave, FoeFaultKind::FileNotFound).into(),
        ErrorKind::EoeInvalidRxData => Error::EoeInvalidRxData { slave },
    };
    Drained::Error(err)
}

/// Drains the queue after an exchange and decides what the caller sees.
///
/// `dispatch` is offered each emergency and returns whether a subscriber took
/// it. Undispatched emergencies and all other records are errors; the first of
/// them is returned once the queue is empty.
pub(crate) fn settle(
    engine: &mut dyn Engine,
    dispatch: &mut dyn FnMut(&Emergency) -> bool,
) -> Result<()> {
    let mut first = None;
    for rec in drain_all(engine) {
        let err = match classify(engine, rec) {
            Drained::Emergency(emcy) if dispatch(&emcy) => continue,
            Drained::Emergency(emcy) => Error::Emergency(emcy),
            Drained::Error(err) => err,
        };
        if first.is_none() {
            first = Some(err);
        } else {
            log::debug!("dropping further drained error: {}", err);
        }
    }
    first.map_or(Ok(()), Err)
}

/// Like [`settle`], but pops a single record only. File transfers leave at most
/// one record behind.
pub(crate) fn settle_one(
    engine: &mut dyn Engine,
    dispatch: &mut dyn FnMut(&Emergency) -> bool,
) -> Result<()> {
    match engine.pop_error().map(|rec| classify(engine, rec)) {
        None => Ok(()),
        Some(Drained::Emergency(emcy)) if dispatch(&emcy) => Ok(()),
        Some(Drained::Emergency(emcy)) => Err(Error::Emergency(emcy)),
        Some(Drained::Error(err)) => Err(err),
    }
}

/// Text of a mailbox error reply code (ETG.1000.4).
pub fn mailbox_error_desc(code: u16) -> &'static str {
    match code {
        0x0000 => "No error",
        0x0001 => "Syntax of 6 octet Mailbox Header is wrong",
        0x0002 => "The mailbox protocol is not supported",
        0x0003 => "Channel Field contains wrong value",
        0x0004 => "The service is no supported",
        0x0005 => "Invalid mailbox header",
        0x0006 => "Length of received mailbox data is too short",
        0x0007 => "No more memory in slave",
        0x0008 => "The length of data is inconsistent",
        _ => "Unknown",
    }
}
