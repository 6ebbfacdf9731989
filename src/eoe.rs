// Part of soem-master. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Ethernet over EtherCAT.
//!
//! Frames arrive as mailbox fragments. Each slave keeps one
//! [`EoeFragmentState`]; it is shared between the slave table and the receive
//! hook installed on the engine, so frames can be reassembled while the engine
//! processes mailboxes on its own.

use crate::{
    convert,
    engine::{EoeHook, EoeIpConfig},
    slave::Slave,
    types::*,
};
use std::{
    fmt,
    net::Ipv4Addr,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

/// Largest Ethernet frame that can be reassembled.
pub const EOE_FRAME_CAPACITY: usize = 1536;

/// Largest mailbox the engine hands out.
pub const MAILBOX_CAPACITY: usize = 1486;

/// Timeout of EoE requests.
pub const EOE_TIMEOUT: Duration = Duration::from_millis(700);

const MBX_HEADER_LEN: usize = 6;
const EOE_HEADER_LEN: usize = 4;
pub(crate) const MBX_TYPE_EOE: u8 = 0x02;

/// Frame type of a fragment carrying frame data.
const FRAME_TYPE_FRAGMENT: u8 = 0x00;

/// Receives reassembled frames with the position of the sending slave.
pub type EoeCallback = Box<dyn FnMut(&[u8], u16) -> CallbackResult + Send>;

pub(crate) type FragmentCell = Arc<Mutex<EoeFragmentState>>;

/// Fragment state of all slaves, in slave order.
pub(crate) type FragmentTable = Arc<Mutex<Vec<FragmentCell>>>;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mailbox type of a raw mailbox, if it has a complete header.
pub(crate) fn mailbox_type(mbx: &[u8]) -> Option<u8> {
    if mbx.len() < MBX_HEADER_LEN {
        return None;
    }
    Some(mbx[5] & 0x0F)
}

/// Decoded EoE header of one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FragmentHeader {
    pub frame_type: u8,
    pub port: u8,
    pub last: bool,
    pub time_appended: bool,
    pub fragment: u8,
    /// Offset of this fragment in bytes; on fragment 0 the frame size instead.
    pub offset: usize,
    pub frame_no: u8,
}

impl FragmentHeader {
    /// Splits an EoE mailbox into header and payload.
    pub(crate) fn parse(mbx: &[u8]) -> Option<(Self, &[u8])> {
        if mailbox_type(mbx)? != MBX_TYPE_EOE {
            return None;
        }
        let len = usize::from(u16::from_le_bytes([mbx[0], mbx[1]]));
        if len < EOE_HEADER_LEN || mbx.len() < MBX_HEADER_LEN + len {
            return None;
        }
        let info1 = u16::from_le_bytes([mbx[6], mbx[7]]);
        let info2 = u16::from_le_bytes([mbx[8], mbx[9]]);
        let header = FragmentHeader {
            frame_type: (info1 & 0x0F) as u8,
            port: ((info1 >> 4) & 0x0F) as u8,
            last: info1 & (1 << 8) != 0,
            time_appended: info1 & (1 << 9) != 0,
            fragment: (info2 & 0x3F) as u8,
            offset: usize::from((info2 >> 6) & 0x3F) << 5,
            frame_no: ((info2 >> 12) & 0x0F) as u8,
        };
        let start = MBX_HEADER_LEN + EOE_HEADER_LEN;
        Some((header, &mbx[start..MBX_HEADER_LEN + len]))
    }
}

/// Reassembly state of one slave.
#[derive(Debug, Default)]
pub struct EoeFragmentState {
    accumulating: bool,
    fragment_no: u8,
    frame_size: usize,
    frame_offset: usize,
    frame_no: u8,
    buf: Vec<u8>,
}

impl EoeFragmentState {
    pub fn is_idle(&self) -> bool {
        !self.accumulating
    }

    fn reset(&mut self) {
        self.accumulating = false;
        self.fragment_no = 0;
        self.frame_size = 0;
        self.frame_offset = 0;
        self.frame_no = 0;
        self.buf.clear();
    }

    fn invalid(&mut self, slave: u16, why: &str) -> Error {
        log::trace!("slave {}: dropping EoE fragment: {}", slave, why);
        self.reset();
        Error::EoeInvalidRxData { slave }
    }

    /// Feeds one raw EoE fragment mailbox. Returns the frame once its last
    /// fragment arrived.
    pub fn push(&mut self, slave: u16, mbx: &[u8]) -> Result<Option<Vec<u8>>> {
        let (hdr, data) = match FragmentHeader::parse(mbx) {
            Some(parsed) => parsed,
            None => return Err(self.invalid(slave, "malformed header")),
        };
        if hdr.frame_type != FRAME_TYPE_FRAGMENT {
            return Err(self.invalid(slave, "not a fragment"));
        }

        if hdr.fragment == 0 {
            self.reset();
            if hdr.offset > EOE_FRAME_CAPACITY {
                return Err(self.invalid(slave, "declared frame too large"));
            }
            self.accumulating = true;
            self.frame_size = hdr.offset;
            self.frame_no = hdr.frame_no;
        } else if !self.accumulating
            || hdr.fragment != self.fragment_no
            || hdr.offset != self.frame_offset
            || hdr.frame_no != self.frame_no
        {
            return Err(self.invalid(slave, "out of sequence"));
        }

        let end = self.frame_offset + data.len();
        if end > self.frame_size || end > EOE_FRAME_CAPACITY {
            return Err(self.invalid(slave, "fragment exceeds frame"));
        }
        self.buf.extend_from_slice(data);
        self.frame_offset = end;
        self.fragment_no = self.fragment_no.wrapping_add(1);
        log::trace!(
            "slave {}: EoE fragment {} of frame {}, {}/{} bytes",
            slave,
            hdr.fragment,
            hdr.frame_no,
            self.frame_offset,
            self.frame_size
        );

        if !hdr.last {
            return Ok(None);
        }
        let mut frame = std::mem::take(&mut self.buf);
        if hdr.time_appended {
            if frame.len() < 4 {
                return Err(self.invalid(slave, "missing time stamp"));
            }
            frame.truncate(frame.len() - 4);
        }
        self.reset();
        Ok(Some(frame))
    }
}

/// Builds the engine hook that reassembles fragments and hands complete
/// frames to `callback`. Callback failures are logged and never reach the
/// engine.
pub(crate) fn frame_hook(table: FragmentTable, mut callback: EoeCallback) -> EoeHook {
    Box::new(move |slave: u16, mbx: &[u8]| {
        match FragmentHeader::parse(mbx) {
            Some((hdr, _)) if hdr.frame_type == FRAME_TYPE_FRAGMENT => {}
            _ => return false,
        }
        let cell = {
            let table = lock(&table);
            match slave
                .checked_sub(1)
                .and_then(|idx| table.get(usize::from(idx)))
            {
                Some(cell) => cell.clone(),
                None => {
                    log::warn!("EoE fragment from unknown slave {}", slave);
                    return false;
                }
            }
        };
        let res = lock(&cell).push(slave, mbx);
        let frame = match res {
            Ok(Some(frame)) => frame,
            Ok(None) => return true,
            Err(e) => {
                log::warn!("{}", e);
                return true;
            }
        };
        match panic::catch_unwind(AssertUnwindSafe(|| callback(&frame, slave))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("EoE callback failed for slave {}: {}", slave, e),
            Err(_) => log::error!("EoE callback panicked for slave {}", slave),
        }
        true
    })
}

impl EoeIpConfig {
    pub fn ip(mut self, ip: Ipv4Addr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn subnet(mut self, subnet: Ipv4Addr) -> Self {
        self.subnet = Some(subnet);
        self
    }

    pub fn default_gateway(mut self, gw: Ipv4Addr) -> Self {
        self.default_gateway = Some(gw);
        self
    }

    pub fn dns_ip(mut self, ip: Ipv4Addr) -> Self {
        self.dns_ip = Some(ip);
        self
    }

    pub fn mac(mut self, mac: [u8; 6]) -> Self {
        self.mac = Some(mac);
        self
    }

    /// Parses a MAC written as `02:00:00:00:00:01`.
    pub fn mac_str(self, mac: &str) -> Result<Self> {
        Ok(self.mac(convert::parse_mac(mac)?))
    }

    pub fn dns_name(mut self, name: &str) -> Result<Self> {
        self.dns_name = Some(convert::string_to_dns_name(name)?);
        Ok(self)
    }
}

impl fmt::Display for EoeIpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        let mut field = |f: &mut fmt::Formatter<'_>, name: &str, value: &dyn fmt::Display| {
            let res = write!(f, "{}{}={}", sep, name, value);
            sep = " ";
            res
        };
        if let Some(mac) = &self.mac {
            field(f, "mac", &convert::mac_to_string(mac))?;
        }
        if let Some(ip) = &self.ip {
            field(f, "ip", ip)?;
        }
        if let Some(subnet) = &self.subnet {
            field(f, "subnet", subnet)?;
        }
        if let Some(gw) = &self.default_gateway {
            field(f, "gw", gw)?;
        }
        if let Some(dns) = &self.dns_ip {
            field(f, "dns", dns)?;
        }
        if let Some(name) = &self.dns_name {
            field(f, "name", &name.as_str())?;
        }
        Ok(())
    }
}

impl<'a> Slave<'a> {
    fn eoe_check(&mut self, wkc: i32) -> Result<()> {
        self.settle()?;
        if wkc <= 0 {
            return Err(Error::Wkc(wkc));
        }
        Ok(())
    }

    /// Sets the IP parameters of EoE port 0. Unset fields are not sent.
    pub fn eoe_set_ip(&mut self, config: &EoeIpConfig) -> Result<()> {
        let wkc = self.engine.eoe_set_ip(self.pos, 0, config, EOE_TIMEOUT);
        self.eoe_check(wkc)
    }

    pub fn eoe_get_ip(&mut self) -> Result<EoeIpConfig> {
        let mut config = EoeIpConfig::default();
        let wkc = self.engine.eoe_get_ip(self.pos, 0, &mut config, EOE_TIMEOUT);
        self.eoe_check(wkc)?;
        Ok(config)
    }

    /// Sends an Ethernet frame on EoE port 0.
    pub fn eoe_send_data(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() > EOE_FRAME_CAPACITY {
            return Err(Error::InvalidArgument(format!(
                "EoE frame of {} bytes exceeds {} bytes",
                frame.len(),
                EOE_FRAME_CAPACITY
            )));
        }
        let wkc = self.engine.eoe_send(self.pos, 0, frame, EOE_TIMEOUT);
        self.eoe_check(wkc)
    }

    /// Receives one frame, waiting at most `timeout` per fragment. Only useful
    /// without a frame callback on the master, which would consume the
    /// fragments first.
    pub fn eoe_recv(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let mut buf = [0; MAILBOX_CAPACITY];
        let cell = self.entry.eoe.clone();
        loop {
            let t = self.engine.mailbox_receive(self.pos, &mut buf, timeout);
            if t.wkc <= 0 {
                lock(&cell).reset();
                self.settle()?;
                return Err(Error::Wkc(t.wkc));
            }
            let mbx = &buf[..t.len.min(MAILBOX_CAPACITY)];
            if mailbox_type(mbx) != Some(MBX_TYPE_EOE) {
                self.settle()?;
                return Err(PacketFault::new(
                    self.pos,
                    0,
                    0,
                    PacketErrorCode::UnexpectedFrameReturned as u16,
                    PacketErrorCode::desc(PacketErrorCode::UnexpectedFrameReturned as u16)
                        .to_owned(),
                )
                .into());
            }
            if let Some(frame) = lock(&cell).push(self.pos, mbx)? {
                return Ok(frame);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds one EoE fragment mailbox.
    pub(crate) fn fragment(
        fragment: u8,
        offset_or_size: usize,
        frame_no: u8,
        last: bool,
        data: &[u8],
    ) -> Vec<u8> {
        let len = (EOE_HEADER_LEN + data.len()) as u16;
        let info1: u16 = if last { 1 << 8 } else { 0 };
        let blocks = ((offset_or_size + 31) >> 5) as u16;
        let info2: u16 = u16::from(fragment) | (blocks << 6) | (u16::from(frame_no) << 12);
        let mut mbx = Vec::new();
        mbx.extend_from_slice(&len.to_le_bytes());
        mbx.extend_from_slice(&[0, 0, 0, MBX_TYPE_EOE]);
        mbx.extend_from_slice(&info1.to_le_bytes());
        mbx.extend_from_slice(&info2.to_le_bytes());
        mbx.extend_from_slice(data);
        mbx
    }

    /// Splits `frame` into fragments of `chunk` bytes (a multiple of 32).
    pub(crate) fn fragments(frame: &[u8], chunk: usize, frame_no: u8) -> Vec<Vec<u8>> {
        let n = (frame.len() + chunk - 1) / chunk;
        frame
            .chunks(chunk)
            .enumerate()
            .map(|(i, data)| {
                let offset = if i == 0 { frame.len() } else { i * chunk };
                fragment(i as u8, offset, frame_no, i + 1 == n, data)
            })
            .collect()
    }

    #[test]
    fn header_decoding() {
        let mbx = fragment(3, 96, 5, true, &[1, 2, 3]);
        let (hdr, data) = FragmentHeader::parse(&mbx).unwrap();
        assert_eq!(hdr.frame_type, FRAME_TYPE_FRAGMENT);
        assert!(hdr.last);
        assert!(!hdr.time_appended);
        assert_eq!(hdr.fragment, 3);
        assert_eq!(hdr.offset, 96);
        assert_eq!(hdr.frame_no, 5);
        assert_eq!(data, &[1, 2, 3]);

        // not EoE
        let mut coe = mbx.clone();
        coe[5] = 0x03;
        assert!(FragmentHeader::parse(&coe).is_none());
        // length beyond the buffer
        assert!(FragmentHeader::parse(&mbx[..8]).is_none());
    }

    #[test]
    fn in_order_fragments_give_one_frame() {
        let frame: Vec<u8> = (0..320u32).map(|i| i as u8).collect();
        let mut state = EoeFragmentState::default();
        let frags = fragments(&frame, 128, 1);
        assert_eq!(frags.len(), 3);
        assert_eq!(state.push(1, &frags[0]).unwrap(), None);
        assert!(!state.is_idle());
        assert_eq!(state.push(1, &frags[1]).unwrap(), None);
        assert_eq!(state.push(1, &frags[2]).unwrap(), Some(frame));
        assert!(state.is_idle());
    }

    #[test]
    fn out_of_order_fragment_is_rejected() {
        let frame = vec![0xEE; 256];
        let frags = fragments(&frame, 64, 2);
        let mut state = EoeFragmentState::default();
        state.push(4, &frags[0]).unwrap();
        assert!(matches!(
            state.push(4, &frags[2]),
            Err(Error::EoeInvalidRxData { slave: 4 })
        ));
        assert!(state.is_idle());
        // continuing without a new first fragment fails as well
        assert!(state.push(4, &frags[3]).is_err());
        // a fresh frame still works
        for f in &frags[..3] {
            assert_eq!(state.push(4, f).unwrap(), None);
        }
        assert_eq!(state.push(4, &frags[3]).unwrap(), Some(frame));
    }

    #[test]
    fn frame_number_must_match() {
        let frame = vec![1; 64];
        let a = fragments(&frame, 32, 1);
        let b = fragments(&frame, 32, 2);
        let mut state = EoeFragmentState::default();
        state.push(1, &a[0]).unwrap();
        assert!(state.push(1, &b[1]).is_err());
    }

    #[test]
    fn overflow_is_never_truncated() {
        // declares 64 bytes, delivers 96
        let mut state = EoeFragmentState::default();
        state.push(1, &fragment(0, 64, 0, false, &[0; 32])).unwrap();
        state.push(1, &fragment(1, 32, 0, false, &[0; 32])).unwrap();
        assert!(matches!(
            state.push(1, &fragment(2, 64, 0, true, &[0; 32])),
            Err(Error::EoeInvalidRxData { .. })
        ));

        // declared size beyond the buffer
        assert!(state.push(1, &fragment(0, 1600, 0, false, &[0; 32])).is_err());
    }

    #[test]
    fn time_stamp_is_stripped() {
        let mut mbx = fragment(0, 32, 0, true, &[9; 20]);
        mbx[7] |= 0x02;
        let mut state = EoeFragmentState::default();
        assert_eq!(state.push(1, &mbx).unwrap(), Some(vec![9; 16]));
    }

    #[test]
    fn hook_dispatches_and_contains_failures() {
        let table: FragmentTable = Arc::new(Mutex::new(vec![
            Arc::new(Mutex::new(EoeFragmentState::default())),
            Arc::new(Mutex::new(EoeFragmentState::default())),
        ]));
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        let mut hook = frame_hook(
            table,
            Box::new(move |frame: &[u8], slave: u16| -> CallbackResult {
                sink.lock().unwrap().push((slave, frame.len()));
                match slave {
                    1 => Err("refused".into()),
                    2 if frame.len() == 32 => panic!("boom"),
                    _ => Ok(()),
                }
            }),
        );

        let frame = vec![7; 96];
        for f in fragments(&frame, 64, 0) {
            assert!(hook(1, &f));
        }
        assert!(hook(2, &fragment(0, 32, 0, true, &[1; 32])));
        for f in fragments(&frame, 32, 1) {
            assert!(hook(2, &f));
        }
        // unknown slave and foreign mailbox types are left alone
        assert!(!hook(9, &fragment(0, 32, 0, true, &[1; 32])));
        let mut coe = fragment(0, 32, 0, true, &[1; 32]);
        coe[5] = 0x03;
        assert!(!hook(1, &coe));

        assert_eq!(*frames.lock().unwrap(), vec![(1, 96), (2, 32), (2, 96)]);
    }

    mod with_slave {
        use super::*;
        use crate::{
            engine::{ErrorKind, ErrorRecord},
            sim::{SimEngine, SimSlave},
            Master,
        };

        fn master(slave: SimSlave) -> Master {
            let mut master = Master::new(Box::new(SimEngine::new().with_slave(slave)));
            master.open("sim0", None).unwrap();
            master.config_init(false).unwrap();
            master
        }

        #[test]
        fn ip_parameters() {
            let mut master = master(SimSlave::new("EL6601", 2, 0x19c9_3052));
            let mut slave = master.slave(1).unwrap();
            let config = EoeIpConfig::default()
                .mac_str("02-00-00-00-00-0A")
                .unwrap()
                .ip(Ipv4Addr::new(192, 168, 1, 20))
                .subnet(Ipv4Addr::new(255, 255, 255, 0))
                .dns_name("el6601")
                .unwrap();
            slave.eoe_set_ip(&config).unwrap();
            let back = slave.eoe_get_ip().unwrap();
            assert_eq!(back, config);
            assert_eq!(
                back.to_string(),
                "mac=02:00:00:00:00:0a ip=192.168.1.20 subnet=255.255.255.0 name=el6601"
            );
            assert_eq!(EoeIpConfig::default().to_string(), "");

            assert!(slave.eoe_send_data(&[0; EOE_FRAME_CAPACITY + 1]).is_err());
            slave.eoe_send_data(&[0xFF; 60]).unwrap();
        }

        #[test]
        fn receive_without_callback() {
            let frame: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
            let mut sim = SimSlave::new("EL6601", 2, 0x19c9_3052);
            for f in fragments(&frame, 64, 3) {
                sim = sim.mailbox(f);
            }
            let mut master = master(sim);
            let mut slave = master.slave(1).unwrap();
            let timeout = Duration::from_millis(10);
            assert_eq!(slave.eoe_recv(timeout).unwrap(), frame);
            // nothing left
            assert!(matches!(slave.eoe_recv(timeout), Err(Error::Wkc(0))));
        }

        #[test]
        fn callback_receives_frames() {
            let frame = vec![0x42; 100];
            let mut sim = SimSlave::new("EL6601", 2, 0x19c9_3052);
            for f in fragments(&frame, 32, 0) {
                sim = sim.mailbox(f);
            }
            let mut master = master(sim);
            let frames = Arc::new(Mutex::new(Vec::new()));
            let sink = frames.clone();
            master
                .set_eoe_callback(move |frame: &[u8], slave: u16| -> CallbackResult {
                    sink.lock().unwrap().push((slave, frame.to_vec()));
                    Ok(())
                })
                .unwrap();

            assert_eq!(master.slave(1).unwrap().mbx_receive().unwrap(), 0);
            assert_eq!(*frames.lock().unwrap(), vec![(1, frame)]);

            master.clear_eoe_callback().unwrap();
        }

        #[test]
        fn failed_receive_reports_drained_errors() {
            let engine = SimEngine::new().with_slave(SimSlave::new("EL6601", 2, 0x19c9_3052));
            let bus = engine.bus();
            let mut master = Master::new(Box::new(engine));
            master.open("sim0", None).unwrap();
            master.config_init(false).unwrap();
            let timeout = Duration::from_millis(10);

            let rec = ErrorRecord::new(1, 0, 0, ErrorKind::Mailbox(0x0002));
            bus.lock().unwrap().push_mailbox_error(rec);
            let mut slave = master.slave(1).unwrap();
            match slave.eoe_recv(timeout) {
                Err(Error::Mailbox(fault)) => assert_eq!(fault.slave, 1),
                other => panic!("unexpected {:?}", other),
            }
            // the queue is empty now, only the working counter is left
            assert!(matches!(slave.eoe_recv(timeout), Err(Error::Wkc(0))));
        }
    }
}
