use log::warn;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

pub mod callout;
pub mod driver;
pub mod engine;
pub mod tcp;

pub use callout::{DiagnosticSink, FlowDescriptor, MemorySink, StdoutSink, TransportCallout};
pub use driver::{DriverState, MONITOR_PORT};
pub use engine::{Action, FilterEngine, InProcessEngine, Layer};

const BUFFER_SIZE: usize = 1504;
const POLL_INTERVAL_MS: u8 = 100;

/// Handle to the live observer: a TUN device plus the thread feeding
/// its frames through the filter engine.
pub struct Interface {
    shutdown: Arc<AtomicBool>,
    jh: Option<thread::JoinHandle<io::Result<()>>>,
}

fn packet_loop(
    nic: tun_tap::Iface,
    engine: Arc<InProcessEngine>,
    shutdown: Arc<AtomicBool>,
) -> io::Result<()> {
    let mut buf = [0u8; BUFFER_SIZE];
    // tun_tap only exposes the raw fd; it stays open as long as `nic`
    // lives.
    let fd = unsafe { BorrowedFd::borrow_raw(nic.as_raw_fd()) };

    while !shutdown.load(Ordering::Relaxed) {
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
            Ok(0) => continue, // timed out; recheck the shutdown flag
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
        let nbytes = nic.recv(&mut buf[..])?;
        let version = buf[0] >> 4;
        if version != 4 {
            continue; // ignore non-ip
        }
        // A TUN device carries both directions of the flow; each
        // per-layer filter only matches packets on its own side.
        engine.dispatch(Layer::OutboundTransport, &buf[..nbytes]);
        engine.dispatch(Layer::InboundTransport, &buf[..nbytes]);
    }
    Ok(())
}

impl Interface {
    /// Opens the named TUN device and starts feeding its frames through
    /// the engine on a dedicated thread.
    pub fn new(engine: Arc<InProcessEngine>, ifname: &str) -> io::Result<Self> {
        let nic = tun_tap::Iface::without_packet_info(ifname, tun_tap::Mode::Tun)?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let jh = {
            let shutdown = shutdown.clone();
            Some(thread::spawn(move || packet_loop(nic, engine, shutdown)))
        };

        Ok(Interface { shutdown, jh })
    }

    /// Blocks until the packet loop ends.
    pub fn wait(mut self) -> io::Result<()> {
        match self.jh.take() {
            Some(jh) => jh.join().expect("packet loop panicked"),
            None => Ok(()),
        }
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(jh) = self.jh.take() {
            if let Err(e) = jh.join().expect("packet loop panicked") {
                warn!("packet loop exited with {e}");
            }
        }
    }
}
