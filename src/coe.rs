// Part of soem-master. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Browsing of the CoE object dictionary.

use crate::{
    engine::{ObjectDescriptionRecord, ObjectEntryRecord},
    slave::Slave,
    types::*,
};
use std::collections::HashMap;

/// CoE data types, as found in object descriptions.
pub mod data_type {
    pub const BOOLEAN: u16 = 0x0001;
    pub const INTEGER8: u16 = 0x0002;
    pub const INTEGER16: u16 = 0x0003;
    pub const INTEGER32: u16 = 0x0004;
    pub const UNSIGNED8: u16 = 0x0005;
    pub const UNSIGNED16: u16 = 0x0006;
    pub const UNSIGNED32: u16 = 0x0007;
    pub const REAL32: u16 = 0x0008;
    pub const VISIBLE_STRING: u16 = 0x0009;
    pub const OCTET_STRING: u16 = 0x000A;
    pub const UNICODE_STRING: u16 = 0x000B;
    pub const INTEGER64: u16 = 0x0015;
    pub const UNSIGNED64: u16 = 0x001B;
    pub const REAL64: u16 = 0x0011;
}

/// Object codes.
pub mod object_code {
    pub const VAR: u8 = 7;
    pub const ARRAY: u8 = 8;
    pub const RECORD: u8 = 9;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescription {
    pub index: u16,
    pub name: String,
    pub data_type: u16,
    pub object_code: u8,
    pub max_sub: u8,
    pub bit_length: u16,
    pub obj_access: u16,
}

impl ObjectDescription {
    fn from_record(index: u16, rec: ObjectDescriptionRecord) -> Self {
        Self {
            index,
            name: rec.name,
            data_type: rec.data_type,
            object_code: rec.object_code,
            max_sub: rec.max_sub,
            bit_length: rec.bit_length,
            obj_access: rec.obj_access,
        }
    }

    /// Whether the object has sub-entries to be browsed.
    pub fn has_entries(&self) -> bool {
        self.object_code != object_code::VAR
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub sub_index: u8,
    pub name: String,
    pub value_info: u8,
    pub data_type: u16,
    pub bit_length: u16,
    pub obj_access: u16,
}

/// Lazily filled cache of a slave's object dictionary. The index list, each
/// description and each entry list are fetched once.
#[derive(Debug, Default)]
pub(crate) struct ObjectDirectory {
    list: Option<Vec<u16>>,
    descriptions: HashMap<u16, ObjectDescription>,
    entries: HashMap<u16, Vec<ObjectEntry>>,
}

impl<'a> Slave<'a> {
    fn od_check(&mut self, wkc: i32) -> Result<()> {
        self.settle()?;
        if wkc <= 0 {
            return Err(Error::Wkc(wkc));
        }
        Ok(())
    }

    /// Indices of all objects in the dictionary.
    pub fn od_list(&mut self) -> Result<&[u16]> {
        if self.entry.od.list.is_none() {
            let mut list = Vec::new();
            let wkc = self.engine.read_od_list(self.pos, &mut list);
            self.od_check(wkc)?;
            log::debug!("slave {}: {} objects in dictionary", self.pos, list.len());
            self.entry.od.list = Some(list);
        }
        Ok(self.entry.od.list.as_deref().unwrap_or_default())
    }

    pub fn od_description(&mut self, index: u16) -> Result<&ObjectDescription> {
        if !self.entry.od.descriptions.contains_key(&index) {
            let mut rec = ObjectDescriptionRecord::default();
            let wkc = self.engine.read_od_description(self.pos, index, &mut rec);
            self.od_check(wkc)?;
            self.entry
                .od
                .descriptions
                .insert(index, ObjectDescription::from_record(index, rec));
        }
        Ok(&self.entry.od.descriptions[&index])
    }

    /// Sub-entries of an array or record object, indexed by sub-index. Plain
    /// variables have none.
    pub fn od_entries(&mut self, index: u16) -> Result<&[ObjectEntry]> {
        if !self.entry.od.entries.contains_key(&index) {
            let desc = self.od_description(index)?;
            let entries = if desc.has_entries() {
                let max_sub = desc.max_sub;
                let mut recs = Vec::new();
                let wkc = self.engine.read_oe(self.pos, index, max_sub, &mut recs);
                self.od_check(wkc)?;
                recs.into_iter()
                    .enumerate()
                    .map(|(sub, rec): (usize, ObjectEntryRecord)| ObjectEntry {
                        sub_index: sub as u8,
                        name: rec.name,
                        value_info: rec.value_info,
                        data_type: rec.data_type,
                        bit_length: rec.bit_length,
                        obj_access: rec.obj_access,
                    })
                    .collect()
            } else {
                Vec::new()
            };
            self.entry.od.entries.insert(index, entries);
        }
        Ok(self.entry.od.entries[&index].as_slice())
    }

    /// Descriptions of all objects.
    pub fn od(&mut self) -> Result<Vec<ObjectDescription>> {
        let list = self.od_list()?.to_vec();
        list.into_iter()
            .map(|index| self.od_description(index).map(Clone::clone))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sim::{SimEngine, SimObject, SimSlave},
        Master,
    };

    fn el1259() -> SimSlave {
        SimSlave::new("EL1259", 2, 0x04eb_3052)
            .describe(
                0x1000,
                SimObject::var("Device type", data_type::UNSIGNED32, 32, 0x0007),
            )
            .describe(
                0x1018,
                SimObject::record(
                    "Identity",
                    &[
                        ("Number of entries", data_type::UNSIGNED8, 8),
                        ("Vendor ID", data_type::UNSIGNED32, 32),
                        ("Product code", data_type::UNSIGNED32, 32),
                    ],
                ),
            )
    }

    #[test]
    fn variable_object() {
        let mut master = Master::new(Box::new(SimEngine::new().with_slave(el1259())));
        master.open("sim0", None).unwrap();
        master.config_init(false).unwrap();
        let mut slave = master.slave(1).unwrap();

        assert_eq!(slave.od_list().unwrap(), &[0x1000, 0x1018]);
        let obj = slave.od_description(0x1000).unwrap().clone();
        assert_eq!(obj.name, "Device type");
        assert_eq!(obj.object_code, object_code::VAR);
        assert_eq!(obj.data_type, data_type::UNSIGNED32);
        assert_eq!(obj.bit_length, 32);
        assert_eq!(obj.obj_access, 0x0007);
        assert!(slave.od_entries(0x1000).unwrap().is_empty());
    }

    #[test]
    fn record_object() {
        let mut master = Master::new(Box::new(SimEngine::new().with_slave(el1259())));
        master.open("sim0", None).unwrap();
        master.config_init(false).unwrap();
        let mut slave = master.slave(1).unwrap();

        let all = slave.od().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].name, "Identity");
        assert_eq!(all[1].object_code, object_code::RECORD);

        let entries = slave.od_entries(0x1018).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].sub_index, 1);
        assert_eq!(entries[1].name, "Vendor ID");
        assert_eq!(entries[1].data_type, data_type::UNSIGNED32);
        assert_eq!(entries[1].bit_length, 32);
        assert_eq!(entries[1].obj_access, 0x0007);
    }

    #[test]
    fn unknown_object_reports_sdo_info_error() {
        let mut master = Master::new(Box::new(SimEngine::new().with_slave(el1259())));
        master.open("sim0", None).unwrap();
        master.config_init(false).unwrap();
        let mut slave = master.slave(1).unwrap();
        match slave.od_description(0x6000) {
            Err(Error::SdoInfo(e)) => {
                assert_eq!(e.slave, 1);
                assert_eq!(e.index, 0x6000);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
