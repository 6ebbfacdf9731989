// Part of soem-master. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

use soem_master::{
    sim::{SimEngine, SimSlave},
    AlState, Master, SetupFunc, SlaveState,
};
use std::{error::Error, thread, time::Duration};

pub fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let engine = SimEngine::new()
        .with_slave(SimSlave::new("EK1100", 2, 0x044c_2c52))
        .with_slave(
            SimSlave::new("EL2008", 2, 0x07d8_3052)
                .outputs(8)
                .object(0x1c12, 0, vec![1]),
        )
        .with_slave(SimSlave::new("EL1008", 2, 0x03f0_3052).inputs(8));
    let mut master = Master::new(Box::new(engine));

    for adapter in master.find_adapters() {
        log::info!("adapter {}: {}", adapter.name, adapter.desc);
    }
    master.open("sim0", None)?;

    let count = master.config_init(false)?;
    log::info!("{} slaves found", count);
    for pos in master.slaves().collect::<Vec<_>>() {
        let slave = master.slave(pos)?;
        log::info!(
            "slave {}: {} (vendor 0x{:08X}, product 0x{:08X})",
            pos,
            slave.name(),
            slave.man(),
            slave.id()
        );
    }

    master
        .slave(2)?
        .set_setup_func(SetupFunc::handle(|slave| {
            slave.sdo_write(0x1c12, 0, &[1], false)?;
            Ok(())
        }));
    let size = master.config_map()?;
    log::info!("IO map: {} bytes, expected WKC {}", size, master.expected_wkc()?);

    master.set_state(AlState::Op.into())?;
    master.write_state()?;
    let state = master.state_check(AlState::Op.into(), Duration::from_millis(50))?;
    if state != SlaveState::new(AlState::Op) {
        log::error!("not all slaves reached OP, state is {}", state);
        return Ok(());
    }

    for cycle in 0..16u8 {
        master.slave(2)?.set_output(&[1 << (cycle % 8)])?;
        master.send_processdata()?;
        let wkc = master.receive_processdata(Duration::from_millis(2))?;
        log::debug!(
            "cycle {}: wkc {}, inputs {:?}",
            cycle,
            wkc,
            master.slave(3)?.input()?
        );
        thread::sleep(Duration::from_millis(10));
    }

    master.set_state(AlState::Init.into())?;
    master.write_state()?;
    master.close();
    Ok(())
}
