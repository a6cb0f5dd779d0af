use log::info;
use std::io;
use std::sync::Arc;

use ttap::{driver, DriverState, InProcessEngine, Interface, StdoutSink, MONITOR_PORT};

const TUN_NAME: &str = "tun0";

fn main() -> io::Result<()> {
    env_logger::init();

    let engine = Arc::new(InProcessEngine::new());
    let mut state = DriverState::default();
    driver::start(engine.as_ref(), &mut state, Arc::new(StdoutSink)).map_err(io::Error::other)?;

    let iface = Interface::new(engine.clone(), TUN_NAME)?;
    info!("observing TCP remote port {MONITOR_PORT} on {TUN_NAME}");
    let result = iface.wait();

    driver::stop(engine.as_ref(), &mut state).map_err(io::Error::other)?;
    result
}
