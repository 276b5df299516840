//! Virtual UART console.
//!
//! Finds the guest's debug descriptor near the bottom of a cluster's
//! DRAM, follows it to a pair of SPSC ring buffers, and shuttles bytes
//! between those rings and the host terminal. Grounded directly on
//! `original_source/console/console.hpp`'s `uart_loop`: same probe
//! sequence, same ring layout and fence placement, same CTRL-A 'x'
//! escape.

use std::os::fd::AsFd;
use std::sync::atomic::{fence, AtomicBool, Ordering};

use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use thiserror::Error;

use crate::cluster::{Cluster, ClusterError, PersistentWindow};
use crate::ddi::Ddi;

/// Offset, relative to a cluster's DRAM base, of a 32-bit pointer to
/// the debug descriptor.
const OPENSBI_DEBUG_PTR: u64 = 0x80;

const EYE_CATCHER: &[u8; 8] = b"OSBIdbug";

/// `debug_descriptor.virtuart_base` sits after an 8-byte eye-catcher
/// and a 4-byte version, padded to 8-byte alignment for the following
/// `u64`.
const DESCRIPTOR_VIRTUART_BASE_OFFSET: u64 = 16;

const VIRTUAL_UART_MAGIC: u64 = 0x5649_5254_5541_5254;

/// Must match the guest firmware's ring layout.
const BUFFER_SIZE: u64 = 0x1000;

const MAGIC_OFFSET: u64 = 0;
const TX_BUF_OFFSET: u64 = 8;
const RX_BUF_OFFSET: u64 = TX_BUF_OFFSET + BUFFER_SIZE;
const TX_HEAD_OFFSET: u64 = RX_BUF_OFFSET + BUFFER_SIZE;
const TX_TAIL_OFFSET: u64 = TX_HEAD_OFFSET + 4;
const RX_HEAD_OFFSET: u64 = TX_TAIL_OFFSET + 4;
const RX_TAIL_OFFSET: u64 = RX_HEAD_OFFSET + 4;

#[derive(Error, Debug)]
pub enum ConsoleError {
    /// The probed debug descriptor's eye-catcher didn't match. Fatal:
    /// there is nothing to retry, the guest firmware never published
    /// the structure we expect.
    #[error("debug descriptor eye-catcher mismatch at cluster offset {0:#x}")]
    UartNotFound(u64),

    /// The ring pair's magic no longer matches once we were already
    /// streaming. Recoverable: the orchestrator sleeps and re-probes.
    #[error("virtual UART magic mismatch, cluster may have reset")]
    UartVanished,

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("terminal control failed: {0}")]
    Termios(#[from] nix::Error),
}

/// A byte-offset view over the `queues` ring pair, backed by a
/// persistent window. Ring arithmetic mirrors `console.hpp`'s
/// `can_push`/`can_pop`/`push_char`/`pop_char` exactly, including
/// fence placement.
struct Rings {
    window: PersistentWindow,
}

impl Rings {
    fn magic(&self) -> u64 {
        self.window.read64(MAGIC_OFFSET).unwrap_or(0)
    }

    fn can_push(&self) -> bool {
        fence(Ordering::Acquire);
        let head = self.window.read32(RX_HEAD_OFFSET).unwrap_or(0) as u64 % BUFFER_SIZE;
        let tail = self.window.read32(RX_TAIL_OFFSET).unwrap_or(0) as u64 % BUFFER_SIZE;
        (head + 1) % BUFFER_SIZE != tail
    }

    fn can_pop(&self) -> bool {
        fence(Ordering::Acquire);
        let head = self.window.read32(TX_HEAD_OFFSET).unwrap_or(0) as u64 % BUFFER_SIZE;
        let tail = self.window.read32(TX_TAIL_OFFSET).unwrap_or(0) as u64 % BUFFER_SIZE;
        head != tail
    }

    /// Push one byte into the host→guest ring, busy-waiting while it's
    /// full. Bounded by `until` so a shutdown request can still break
    /// out instead of spinning forever against a guest that stopped
    /// draining the ring.
    fn push_char(&self, c: u8, until: &AtomicBool) -> bool {
        while !self.can_push() {
            if until.load(Ordering::Relaxed) {
                return false;
            }
            std::hint::spin_loop();
        }
        let head = self.window.read32(RX_HEAD_OFFSET).unwrap_or(0) as u64 % BUFFER_SIZE;
        let _ = self.window.write_u8(RX_BUF_OFFSET + head, c);
        fence(Ordering::Release);
        let _ = self
            .window
            .write32(RX_HEAD_OFFSET, ((head + 1) % BUFFER_SIZE) as u32);
        true
    }

    /// Pop one byte from the guest→host ring. Caller must have checked
    /// `can_pop` first.
    fn pop_char(&self) -> u8 {
        let tail = self.window.read32(TX_TAIL_OFFSET).unwrap_or(0) as u64 % BUFFER_SIZE;
        let c = self.window.read_u8(TX_BUF_OFFSET + tail).unwrap_or(0);
        fence(Ordering::Release);
        let _ = self
            .window
            .write32(TX_TAIL_OFFSET, ((tail + 1) % BUFFER_SIZE) as u32);
        c
    }
}

/// Restores the controlling terminal's settings on drop, regardless of
/// which exit path the console loop takes.
struct TerminalRawMode {
    orig: Termios,
}

impl TerminalRawMode {
    fn enable() -> Result<Self, ConsoleError> {
        let stdin = std::io::stdin();
        let fd = stdin.as_fd();
        let orig = tcgetattr(fd)?;
        let mut raw = orig.clone();
        cfmakeraw(&mut raw);
        tcsetattr(fd, SetArg::TCSAFLUSH, &raw)?;
        Ok(Self { orig })
    }
}

impl Drop for TerminalRawMode {
    fn drop(&mut self) {
        let stdin = std::io::stdin();
        let _ = tcsetattr(stdin.as_fd(), SetArg::TCSAFLUSH, &self.orig);
    }
}

/// True if one byte is waiting on stdin, polled with an effectively
/// non-blocking timeout so the loop keeps ceding the CPU between
/// checks rather than reading the shutdown flag only once a second.
fn stdin_has_input() -> Result<bool, ConsoleError> {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    let stdin = std::io::stdin();
    let mut fds = [PollFd::new(stdin.as_fd(), PollFlags::POLLIN)];
    let n = poll(&mut fds, PollTimeout::from(0u8))?;
    if n <= 0 {
        return Ok(false);
    }
    Ok(fds[0]
        .revents()
        .map(|r| r.contains(PollFlags::POLLIN))
        .unwrap_or(false))
}

fn read_one_stdin_byte() -> Result<Option<u8>, ConsoleError> {
    let stdin = std::io::stdin();
    let mut buf = [0u8; 1];
    let n = nix::unistd::read(stdin.as_fd(), &mut buf)?;
    Ok(if n == 1 { Some(buf[0]) } else { None })
}

/// Probe a cluster for its virtual UART and stream bytes until the
/// guest requests a clean shutdown (CTRL-A `x`), `shutdown` is set, or
/// the ring pair's magic stops matching.
///
/// A magic mismatch returns [`ConsoleError::UartVanished`]; the
/// orchestrator is expected to sleep briefly and call this again to
/// re-probe, since the cluster may simply have been reset out from
/// under the host.
pub fn console_loop<D: Ddi>(
    cluster: &Cluster<D>,
    shutdown: &AtomicBool,
) -> Result<(), ConsoleError> {
    let (tile_x, tile_y) = cluster.coordinates();

    let descriptor_ptr = cluster.read32(OPENSBI_DEBUG_PTR)?;
    eprintln!(
        "console[{tile_x},{tile_y}]: debug descriptor at offset {descriptor_ptr:#x}"
    );

    let descriptor = cluster.persistent_window(cluster.starting_address() + descriptor_ptr as u64)?;
    for (i, expected) in EYE_CATCHER.iter().enumerate() {
        let byte = descriptor.read_u8(i as u64)?;
        if byte != *expected {
            return Err(ConsoleError::UartNotFound(descriptor_ptr as u64));
        }
    }
    let uart_base = descriptor.read64(DESCRIPTOR_VIRTUART_BASE_OFFSET)?;
    eprintln!("console[{tile_x},{tile_y}]: virtual UART at {uart_base:#x}");

    let rings = Rings {
        window: cluster.persistent_window(uart_base)?,
    };

    let _raw_mode = TerminalRawMode::enable()?;
    let mut ctrl_a_pressed = false;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }
        if rings.magic() != VIRTUAL_UART_MAGIC {
            return Err(ConsoleError::UartVanished);
        }

        if stdin_has_input()? {
            if let Some(input) = read_one_stdin_byte()? {
                if ctrl_a_pressed {
                    if input == b'x' {
                        return Ok(());
                    }
                    ctrl_a_pressed = false;
                } else if input == 1 {
                    ctrl_a_pressed = true;
                } else if !rings.push_char(input, shutdown) {
                    return Ok(());
                }
            }
        }

        if rings.can_pop() {
            let c = rings.pop_char();
            let _ = nix::unistd::write(std::io::stdout(), &[c]);
        }
    }
}
