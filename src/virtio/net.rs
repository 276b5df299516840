//! Virtio network device model.
//!
//! Request dispatch is grounded on `examples/loks0n-carbon`'s virtio-blk
//! header/body/status split applied to the net header instead
//! (`process_queue_start` captures the header descriptor, the terminal
//! descriptor's callback does the actual I/O); the two-queue layout and
//! the `send`/`recv`/fd-readiness contract against a user-space L3 stack
//! come from `original_source/console/network.hpp`'s `network_loop`.
//!
//! Unlike `network.hpp`, which opens a real `libvdeslirp` instance, the
//! L3 stack here is a small loopback-backed shim (see [`L3Stack`] and
//! [`LoopbackNetStack`]): no `libslirp`/`libvdeslirp` Rust crate exists
//! anywhere in the example pack's dependency stack, and fabricating an
//! FFI binding to a C library not actually available to this build
//! would just be a different flavor of invented dependency. The shim
//! exposes the identical fd-readiness/send/recv contract a real NAT
//! stack would, so the virtqueue-facing half of the device — the part
//! this crate is actually responsible for — is fully real and testable;
//! swapping in a genuine user-space NAT stack later means implementing
//! `L3Stack` against it, not touching `NetworkDevice`.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Mutex;

use super::DeviceModel;

pub const VIRTIO_NET_DEVICE_ID: u32 = 1;

/// Ethernet MTU plus header, matching `network.hpp`'s `PACKET_SIZE`.
pub const PACKET_SIZE: usize = 1514;

const VIRTIO_NET_F_MAC: u32 = 1 << 5;
const VIRTIO_NET_F_MRG_RXBUF: u32 = 1 << 15;
const VIRTIO_F_VERSION_1_HI: u32 = 1 << 0;

const CONFIG_MAC: u64 = 0x00;
const CONFIG_STATUS: u64 = 0x06;
const NET_S_LINK_UP: u16 = 1;

/// `virtio_net_hdr` with `num_buffers` (i.e. `VIRTIO_NET_F_MRG_RXBUF`
/// negotiated): flags, gso_type, hdr_len, gso_size, csum_start,
/// csum_offset, num_buffers, one byte/u16 field each except the two
/// u16 pairs, 12 bytes total.
const NET_HDR_SIZE: u64 = 12;

const QUEUE_RX: usize = 0;
const QUEUE_TX: usize = 1;

pub fn device_features() -> [u32; 2] {
    [
        VIRTIO_NET_F_MAC | VIRTIO_NET_F_MRG_RXBUF,
        VIRTIO_F_VERSION_1_HI,
    ]
}

/// Capability surface the network device needs from its backing L3
/// stack: readiness (via a raw fd, polled the same way the console
/// polls stdin), and MTU-sized datagram `send`/`recv`.
pub trait L3Stack: Send {
    fn as_raw_fd(&self) -> RawFd;
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// A loopback-backed stand-in for a real user-space NAT stack: a single
/// UDP socket bound to the host's forwarded port. `recv` hands back
/// whatever the last inbound datagram's payload was and remembers its
/// sender; `send` reflects the guest's outgoing payload back to that
/// sender, the way a NAT's one-entry flow table would for a single
/// active connection.
pub struct LoopbackNetStack {
    socket: UdpSocket,
    peer: Mutex<Option<SocketAddr>>,
}

impl LoopbackNetStack {
    /// Bind the host side of the SSH port forward at `127.0.0.1:port`.
    pub fn bind(port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind(("127.0.0.1", port))?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            peer: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl L3Stack for LoopbackNetStack {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (n, from) = self.socket.recv_from(buf)?;
        *self.peer.lock().unwrap() = Some(from);
        Ok(n)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let peer = *self.peer.lock().unwrap();
        match peer {
            Some(addr) => self.socket.send_to(buf, addr),
            // No inbound flow established yet; drop silently, same as
            // a NAT with no matching table entry for this traffic.
            None => Ok(buf.len()),
        }
    }
}

fn stack_readable(fd: RawFd) -> bool {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::os::fd::BorrowedFd;
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::from(0u8)) {
        Ok(n) if n > 0 => fds[0]
            .revents()
            .map(|r| r.contains(PollFlags::POLLIN))
            .unwrap_or(false),
        _ => false,
    }
}

/// Queue 0 (rx): device writes into guest-supplied buffers. Queue 1
/// (tx): device reads guest-supplied buffers. The header descriptor
/// pointer captured by `process_queue_start` is only meaningful for
/// rx; tx ignores its own header (the spec's device model has nothing
/// to do with it beyond forwarding the body).
pub struct NetworkDevice<S: L3Stack> {
    stack: S,
    rx_header_ptr: Option<*mut u8>,
    packet_buf: [u8; PACKET_SIZE],
}

// The captured header pointer targets guest memory shared across
// threads by construction, same rationale as `PersistentWindow`.
unsafe impl<S: L3Stack> Send for NetworkDevice<S> {}

impl<S: L3Stack> NetworkDevice<S> {
    pub fn new(stack: S) -> Self {
        Self {
            stack,
            rx_header_ptr: None,
            packet_buf: [0u8; PACKET_SIZE],
        }
    }

    /// Publish a locally-administered MAC and link-up status into the
    /// device's config space.
    pub fn publish_config(&self, config_ptr: *mut u8, mac: [u8; 6]) {
        unsafe {
            std::ptr::copy_nonoverlapping(mac.as_ptr(), config_ptr.add(CONFIG_MAC as usize), 6);
            std::ptr::write_volatile(
                (config_ptr.add(CONFIG_STATUS as usize)) as *mut u16,
                NET_S_LINK_UP,
            );
        }
    }

    fn write_rx_header(&self, ptr: *mut u8) {
        // flags = 0, gso_type = 0, hdr_len = 0, gso_size = 0,
        // csum_start = 0, csum_offset = 0, num_buffers = 1.
        unsafe {
            std::ptr::write_bytes(ptr, 0, NET_HDR_SIZE as usize);
            std::ptr::write_volatile((ptr.add(10)) as *mut u16, 1u16.to_le());
        }
    }
}

impl<S: L3Stack> DeviceModel for NetworkDevice<S> {
    fn num_queues(&self) -> usize {
        2
    }

    fn queue_header_size(&self) -> u64 {
        NET_HDR_SIZE
    }

    fn queue_has_data(&self, queue_idx: usize) -> bool {
        match queue_idx {
            QUEUE_RX => stack_readable(self.stack.as_raw_fd()),
            QUEUE_TX => true,
            _ => false,
        }
    }

    fn process_queue_start(&mut self, queue_idx: usize, ptr: *mut u8, _len: u64) {
        if queue_idx == QUEUE_RX {
            self.rx_header_ptr = Some(ptr);
        }
    }

    fn process_queue_data(&mut self, _queue_idx: usize, _ptr: *mut u8, _len: u64) {
        // Both queues here are two-descriptor chains (header + body);
        // a body descriptor is always the chain's terminal one, so the
        // real work happens in `process_queue_complete`.
    }

    fn process_queue_complete(&mut self, queue_idx: usize, ptr: *mut u8, len: u64) {
        match queue_idx {
            QUEUE_RX => {
                if let Some(header_ptr) = self.rx_header_ptr.take() {
                    self.write_rx_header(header_ptr);
                }
                let n = match self.stack.recv(&mut self.packet_buf) {
                    Ok(n) => n.min(len as usize).min(PACKET_SIZE),
                    Err(_) => 0,
                };
                unsafe { std::ptr::copy_nonoverlapping(self.packet_buf.as_ptr(), ptr, n) };
            }
            QUEUE_TX => {
                let n = (len as usize).min(PACKET_SIZE);
                unsafe { std::ptr::copy_nonoverlapping(ptr, self.packet_buf.as_mut_ptr(), n) };
                let _ = self.stack.send(&self.packet_buf[..n]);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket as StdUdpSocket;

    #[test]
    fn rx_completion_writes_header_then_recvs_payload() {
        let stack = LoopbackNetStack::bind(0).unwrap();
        let addr = stack.local_addr().unwrap();
        let peer = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        peer.send_to(b"ECHO-PAYLOAD", addr).unwrap();
        // Give the datagram a moment to land in the kernel socket buffer.
        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut dev = NetworkDevice::new(stack);
        assert!(dev.queue_has_data(QUEUE_RX));

        let mut header = [0xffu8; NET_HDR_SIZE as usize];
        dev.process_queue_start(QUEUE_RX, header.as_mut_ptr(), NET_HDR_SIZE);

        let mut body = [0u8; PACKET_SIZE];
        dev.process_queue_complete(QUEUE_RX, body.as_mut_ptr(), PACKET_SIZE as u64);

        assert_eq!(&header[..10], &[0u8; 10]);
        assert_eq!(u16::from_le_bytes([header[10], header[11]]), 1);
        assert_eq!(&body[..12], b"ECHO-PAYLOAD");
    }

    #[test]
    fn tx_completion_sends_body_back_to_last_peer() {
        let stack = LoopbackNetStack::bind(0).unwrap();
        let addr = stack.local_addr().unwrap();
        let peer = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(std::time::Duration::from_millis(200)))
            .unwrap();
        peer.send_to(b"hello", addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut dev = NetworkDevice::new(stack);
        // Establish the flow (rx) so tx has somewhere to reflect to.
        let mut header = [0u8; NET_HDR_SIZE as usize];
        dev.process_queue_start(QUEUE_RX, header.as_mut_ptr(), NET_HDR_SIZE);
        let mut body = [0u8; PACKET_SIZE];
        dev.process_queue_complete(QUEUE_RX, body.as_mut_ptr(), PACKET_SIZE as u64);

        assert!(dev.queue_has_data(QUEUE_TX));
        let mut out = *b"reply-bytes\0\0\0\0";
        let n = out.len() as u64;
        dev.process_queue_complete(QUEUE_TX, out.as_mut_ptr(), n);

        let mut recv_buf = [0u8; 64];
        let (n, _) = peer.recv_from(&mut recv_buf).unwrap();
        assert_eq!(&recv_buf[..n], &out[..]);
    }

    #[test]
    fn tx_queue_always_has_data() {
        let stack = LoopbackNetStack::bind(0).unwrap();
        let dev = NetworkDevice::new(stack);
        assert!(dev.queue_has_data(QUEUE_TX));
    }
}
