// Part of soem-master. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Single request/response exchanges with a slave.
//!
//! Each call runs one engine transaction and then drains the error queue
//! before the working counter is looked at, so an error the slave reported
//! always wins over a bare "no progress".

use crate::{slave::Slave, types::*};
use std::time::Duration;

/// Size of the scratch buffer used by SDO reads without an expected size.
pub const SDO_SCRATCH_SIZE: usize = 256;

/// Default timeout of FoE transfers.
pub const FOE_TIMEOUT: Duration = Duration::from_millis(200);

fn check_wkc(wkc: i32) -> Result<()> {
    if wkc <= 0 {
        Err(Error::Wkc(wkc))
    } else {
        Ok(())
    }
}

impl<'a> Slave<'a> {
    /// Reads an object over SDO.
    ///
    /// Without `size` the answer may have at most [`SDO_SCRATCH_SIZE`] bytes;
    /// larger objects need their size passed in.
    pub fn sdo_read(
        &mut self,
        index: u16,
        sub_index: u8,
        complete_access: bool,
        size: Option<usize>,
    ) -> Result<Vec<u8>> {
        let timeout = self.settings.sdo_read_timeout;
        let pos = self.pos;
        let (wkc, data) = match size {
            None => {
                let mut buf = [0; SDO_SCRATCH_SIZE];
                let t = self
                    .engine
                    .sdo_read(pos, index, sub_index, complete_access, &mut buf, timeout);
                (t.wkc, buf[..t.len.min(SDO_SCRATCH_SIZE)].to_vec())
            }
            Some(size) => {
                let mut buf = vec![0; size];
                let t = self
                    .engine
                    .sdo_read(pos, index, sub_index, complete_access, &mut buf, timeout);
                buf.truncate(t.len);
                (t.wkc, buf)
            }
        };
        self.settle()?;
        check_wkc(wkc)?;
        Ok(data)
    }

    pub fn sdo_write(
        &mut self,
        index: u16,
        sub_index: u8,
        data: &[u8],
        complete_access: bool,
    ) -> Result<()> {
        let timeout = self.settings.sdo_write_timeout;
        let wkc = self
            .engine
            .sdo_write(self.pos, index, sub_index, complete_access, data, timeout);
        self.settle()?;
        check_wkc(wkc)
    }

    /// Reads a file of at most `size` bytes. `timeout` defaults to [`FOE_TIMEOUT`].
    pub fn foe_read(
        &mut self,
        filename: &str,
        password: u32,
        size: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let mut buf = vec![0; size];
        let t = self.engine.foe_read(
            self.pos,
            filename,
            password,
            &mut buf,
            timeout.unwrap_or(FOE_TIMEOUT),
        );
        self.settle_one()?;
        check_wkc(t.wkc)?;
        buf.truncate(t.len);
        Ok(buf)
    }

    pub fn foe_write(
        &mut self,
        filename: &str,
        password: u32,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<()> {
        let wkc = self.engine.foe_write(
            self.pos,
            filename,
            password,
            data,
            timeout.unwrap_or(FOE_TIMEOUT),
        );
        self.settle_one()?;
        check_wkc(wkc)
    }

    /// Reads two EEPROM words starting at `word_address`.
    pub fn eeprom_read(&mut self, word_address: u16) -> Result<[u8; 4]> {
        let timeout = self.settings.timeouts.eeprom;
        Ok(self
            .engine
            .read_eeprom(self.pos, word_address, timeout)
            .to_le_bytes())
    }

    /// Writes one EEPROM word; `data` must be exactly 2 bytes.
    pub fn eeprom_write(&mut self, word_address: u16, data: &[u8]) -> Result<()> {
        if data.len() != 2 {
            return Err(Error::InvalidArgument(format!(
                "EEPROM data must be one word (2 bytes), got {} bytes",
                data.len()
            )));
        }
        let timeout = self.settings.timeouts.eeprom;
        let word = u16::from_le_bytes([data[0], data[1]]);
        if self.engine.write_eeprom(self.pos, word_address, word, timeout) <= 0 {
            return Err(Error::Eeprom {
                slave: self.pos,
                desc: format!("writing word 0x{:04X} failed", word_address),
            });
        }
        Ok(())
    }

    /// Reads `size` bytes from an ESC register, addressed by the configured
    /// station address.
    pub fn fprd(&mut self, register: u16, size: usize, timeout: Duration) -> Result<Vec<u8>> {
        let addr = self.config_addr()?;
        let mut buf = vec![0; size];
        check_wkc(self.engine.fprd(addr, register, &mut buf, timeout))?;
        Ok(buf)
    }

    pub fn fpwr(&mut self, register: u16, data: &[u8], timeout: Duration) -> Result<()> {
        let addr = self.config_addr()?;
        check_wkc(self.engine.fpwr(addr, register, data, timeout))
    }

    /// Polls the mailbox once, without waiting. This is how emergencies and
    /// EoE traffic get picked up outside of other mailbox exchanges.
    pub fn mbx_receive(&mut self) -> Result<i32> {
        let mut buf = [0; crate::eoe::MAILBOX_CAPACITY];
        let t = self.engine.mailbox_receive(self.pos, &mut buf, Duration::from_secs(0));
        self.settle()?;
        Ok(t.wkc)
    }
}
