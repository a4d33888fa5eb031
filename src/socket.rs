//! Loopback sockets.
//!
//! Single-host datagram sockets over `AF_INET`. A global table maps ports
//! to sockets; `connect` queues the client on the server's request queue,
//! `accept` answers with a freshly bound peer socket. A send writes
//! straight into the peer's receive ring, so the "network" is just the
//! port table. `SOCK_STREAM` is reserved: sockets of that type can be
//! created but not connected.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;

use crate::kalloc;
use crate::lock::SpinLock;
use crate::param::{PAGE_SIZE, SOCKET_BUF_SIZE};
use crate::sem::Semaphore;

pub const AF_INET: i32 = 2;

pub const SOCK_STREAM: i32 = 1;
pub const SOCK_DGRAM: i32 = 2;
pub const SOCK_RAW: i32 = 3;

pub const LOCAL_IP: u32 = (127 << 24) | 1;

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InetAddr {
    pub addr: u32,
    pub port: u16,
}

const SOCKET_BUF_PAGES: usize = SOCKET_BUF_SIZE / PAGE_SIZE;

/// A bounded byte ring over whole pages, with blocking on both sides.
struct RingBuf {
    inner: SpinLock<Ring>,

    /// Posted when data arrives.
    readable: Semaphore,

    /// Posted when space frees up.
    writable: Semaphore,
}

struct Ring {
    pages: [usize; SOCKET_BUF_PAGES],
    r: u64,
    w: u64,
}

impl Ring {
    fn byte_ptr(&self, idx: u64) -> *mut u8 {
        let page = self.pages[(idx / PAGE_SIZE as u64) as usize % SOCKET_BUF_PAGES];
        (page + (idx % PAGE_SIZE as u64) as usize) as *mut u8
    }
}

impl RingBuf {
    fn new() -> Result<Self, ()> {
        let mut pages = [0usize; SOCKET_BUF_PAGES];
        for (i, slot) in pages.iter_mut().enumerate() {
            match kalloc::alloc_page() {
                Some(p) => *slot = p,
                None => {
                    for &p in &pages[..i] {
                        kalloc::free_page(p);
                    }
                    return Err(());
                }
            }
        }
        Ok(Self {
            inner: SpinLock::new("socket ring", Ring { pages, r: 0, w: 0 }),
            readable: Semaphore::new("socket readable", 0),
            writable: Semaphore::new("socket writable", 0),
        })
    }

    /// Blocks while empty, then drains up to `dst.len()` bytes.
    fn read(&self, dst: &mut [u8]) -> Result<usize, ()> {
        let mut ring = self.inner.lock();
        while ring.w == ring.r {
            drop(ring);
            if !self.readable.wait() {
                return Err(());
            }
            ring = self.inner.lock();
        }
        let mut n = 0;
        while n < dst.len() && ring.w != ring.r {
            // SAFETY: the ring's pages live as long as the socket, and the
            // spinlock is held.
            dst[n] = unsafe { *ring.byte_ptr(ring.r) };
            ring.r += 1;
            n += 1;
        }
        self.writable.post_all();
        Ok(n)
    }

    /// Writes all of `src`, blocking while the ring is full. A kill while
    /// waiting returns the count written so far.
    fn write(&self, src: &[u8]) -> Result<usize, ()> {
        let mut ring = self.inner.lock();
        let mut n = 0;
        while n < src.len() {
            if ring.w - ring.r >= SOCKET_BUF_SIZE as u64 {
                self.readable.post_all();
                drop(ring);
                if !self.writable.wait() {
                    return Ok(n);
                }
                ring = self.inner.lock();
            } else {
                // SAFETY: as in `read`.
                unsafe { *ring.byte_ptr(ring.w) = src[n] };
                ring.w += 1;
                n += 1;
            }
        }
        self.readable.post_all();
        Ok(n)
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        for &p in &self.pages {
            kalloc::free_page(p);
        }
    }
}

struct SocketState {
    bound: Option<InetAddr>,
    connect_to: Option<InetAddr>,
    listening: bool,

    /// Clients queued by `connect`, waiting for `accept`.
    backlog: VecDeque<Arc<Socket>>,
}

pub struct Socket {
    pub typ: i32,
    ports: &'static PortTable,
    state: SpinLock<SocketState>,

    /// The receive ring; peers write into it on `send`.
    rcv: RingBuf,

    /// Posted per queued request (server) or on accept (client).
    wait_for_connect: Semaphore,

    /// Close handshake with the peer.
    wait_for_exit: Semaphore,
}

impl Socket {
    pub fn new(ports: &'static PortTable, family: i32, typ: i32, protocol: i32) -> Result<Arc<Self>, ()> {
        if family != AF_INET || !(SOCK_STREAM..=SOCK_RAW).contains(&typ) || protocol != 0 {
            return Err(());
        }
        Ok(Arc::new(Self {
            typ,
            ports,
            state: SpinLock::new(
                "socket",
                SocketState {
                    bound: None,
                    connect_to: None,
                    listening: false,
                    backlog: VecDeque::new(),
                },
            ),
            rcv: RingBuf::new()?,
            wait_for_connect: Semaphore::new("socket connect", 0),
            wait_for_exit: Semaphore::new("socket exit", 0),
        }))
    }

    /// Claims the given address, or picks a free loopback port when
    /// `addr` is `None` and the socket is still unbound.
    pub fn bind(self: &Arc<Self>, addr: Option<InetAddr>) -> Result<(), ()> {
        match addr {
            Some(a) => {
                self.ports.claim(Some(a.port), self)?;
                let old = {
                    let mut state = self.state.lock();
                    core::mem::replace(&mut state.bound, Some(a))
                };
                if let Some(old) = old {
                    self.ports.release(old.port);
                }
                Ok(())
            }
            None => {
                if self.state.lock().bound.is_some() {
                    return Ok(());
                }
                let port = self.ports.claim(None, self)?;
                self.state.lock().bound = Some(InetAddr {
                    addr: LOCAL_IP,
                    port,
                });
                Ok(())
            }
        }
    }

    pub fn bound_addr(&self) -> Option<InetAddr> {
        self.state.lock().bound
    }

    /// Marks the socket as accepting connections.
    pub fn listen(&self) {
        self.state.lock().listening = true;
    }

    /// Datagram connect: remember the peer, queue on its request list,
    /// and wait (unalertably) until `accept` answers.
    pub fn connect(self: &Arc<Self>, addr: InetAddr) -> Result<(), ()> {
        if self.typ != SOCK_DGRAM {
            // SOCK_STREAM connections are reserved, not implemented.
            return Err(());
        }
        {
            let mut state = self.state.lock();
            if state.connect_to.is_some() {
                return Err(());
            }
            state.connect_to = Some(addr);
        }
        let server = match self.ports.lookup(addr.port) {
            Some(s) => s,
            None => {
                self.state.lock().connect_to = None;
                return Err(());
            }
        };
        server.state.lock().backlog.push_back(Arc::clone(self));
        server.wait_for_connect.post();
        self.wait_for_connect.wait_unalertable();
        Ok(())
    }

    /// Dequeues a connection request (blocking if none is pending),
    /// answers it with a freshly bound socket, and wakes the client.
    pub fn accept(self: &Arc<Self>) -> Result<Arc<Socket>, ()> {
        if !self.state.lock().listening {
            return Err(());
        }
        let req = loop {
            if let Some(req) = self.state.lock().backlog.pop_front() {
                break req;
            }
            if !self.wait_for_connect.wait() {
                return Err(());
            }
        };

        let new = Socket::new(self.ports, AF_INET, self.typ, 0)?;
        new.bind(None)?;
        let new_addr = new.bound_addr().ok_or(())?;
        let req_addr = req.bound_addr().ok_or(())?;
        new.state.lock().connect_to = Some(req_addr);
        req.state.lock().connect_to = Some(new_addr);
        req.wait_for_connect.post();
        Ok(new)
    }

    /// Writes into the connected peer's receive ring.
    pub fn send(&self, src: &[u8]) -> Result<usize, ()> {
        let peer_addr = self.state.lock().connect_to.ok_or(())?;
        let peer = self.ports.lookup(peer_addr.port).ok_or(())?;
        peer.rcv.write(src)
    }

    /// Reads from the own receive ring.
    pub fn recv(&self, dst: &mut [u8]) -> Result<usize, ()> {
        self.rcv.read(dst)
    }

    /// Full close: handshake with a connected peer, then release the
    /// port. The file layer drops the socket afterwards.
    pub fn close(self: &Arc<Self>) {
        let peer_addr = self.state.lock().connect_to;
        if let Some(a) = peer_addr {
            if let Some(peer) = self.ports.lookup(a.port) {
                peer.wait_for_exit.post();
                self.wait_for_exit.wait_unalertable();
            }
        }
        self.release_port();
    }

    /// Non-blocking teardown used when the last file handle goes away
    /// without an explicit `closesocket`: free the port and unblock a
    /// peer mid-handshake, but never wait.
    pub(crate) fn on_file_close(self: &Arc<Self>) {
        let peer_addr = self.state.lock().connect_to;
        if let Some(a) = peer_addr {
            if let Some(peer) = self.ports.lookup(a.port) {
                peer.wait_for_exit.post();
            }
        }
        self.release_port();
    }

    fn release_port(self: &Arc<Self>) {
        let bound = self.state.lock().bound.take();
        if let Some(b) = bound {
            self.ports.release(b.port);
        }
    }
}

/// The global port-to-socket table.
pub struct PortTable {
    map: SpinLock<BTreeMap<u16, Arc<Socket>>>,
}

impl PortTable {
    pub const fn new() -> Self {
        Self {
            map: SpinLock::new("ports", BTreeMap::new()),
        }
    }

    /// Claims `port`, or the lowest free one when `None`.
    fn claim(&self, port: Option<u16>, sk: &Arc<Socket>) -> Result<u16, ()> {
        let mut map = self.map.lock();
        let port = match port {
            Some(p) => {
                if map.contains_key(&p) {
                    return Err(());
                }
                p
            }
            None => (0..=u16::MAX).find(|p| !map.contains_key(p)).ok_or(())?,
        };
        map.insert(port, Arc::clone(sk));
        Ok(port)
    }

    fn release(&self, port: u16) -> bool {
        self.map.lock().remove(&port).is_some()
    }

    pub fn lookup(&self, port: u16) -> Option<Arc<Socket>> {
        self.map.lock().get(&port).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ports() -> &'static PortTable {
        crate::kalloc::test_pool::init();
        Box::leak(Box::new(PortTable::new()))
    }

    fn addr(port: u16) -> InetAddr {
        InetAddr {
            addr: LOCAL_IP,
            port,
        }
    }

    #[test]
    fn bind_claims_and_releases_ports() {
        let pt = ports();
        let a = Socket::new(pt, AF_INET, SOCK_DGRAM, 0).unwrap();
        let b = Socket::new(pt, AF_INET, SOCK_DGRAM, 0).unwrap();
        a.bind(Some(addr(700))).unwrap();
        // Port in use.
        assert!(b.bind(Some(addr(700))).is_err());
        a.close();
        b.bind(Some(addr(700))).unwrap();
    }

    #[test]
    fn auto_bind_picks_a_free_port() {
        let pt = ports();
        let a = Socket::new(pt, AF_INET, SOCK_DGRAM, 0).unwrap();
        a.bind(None).unwrap();
        let bound = a.bound_addr().unwrap();
        assert_eq!(bound.addr, LOCAL_IP);
        assert!(pt.lookup(bound.port).is_some());
    }

    #[test]
    fn stream_connect_is_reserved() {
        let pt = ports();
        let s = Socket::new(pt, AF_INET, SOCK_STREAM, 0).unwrap();
        assert!(s.connect(addr(1)).is_err());
    }

    #[test]
    fn accept_requires_listen() {
        let pt = ports();
        let s = Socket::new(pt, AF_INET, SOCK_DGRAM, 0).unwrap();
        assert!(s.accept().is_err());
    }

    #[test]
    fn accepted_pair_carries_datagrams() {
        let pt = ports();
        let server = Socket::new(pt, AF_INET, SOCK_DGRAM, 0).unwrap();
        server.bind(Some(addr(900))).unwrap();
        server.listen();

        let client = Socket::new(pt, AF_INET, SOCK_DGRAM, 0).unwrap();
        client.bind(None).unwrap();
        // The enqueue half of connect; the blocking half needs a second
        // thread of control and is exercised on the target.
        server.state.lock().backlog.push_back(Arc::clone(&client));

        let pair = server.accept().unwrap();
        assert_eq!(
            client.state.lock().connect_to.unwrap(),
            pair.bound_addr().unwrap()
        );

        let payload = [0x42u8; 512];
        assert_eq!(client.send(&payload).unwrap(), 512);
        let mut got = [0u8; 512];
        assert_eq!(pair.recv(&mut got).unwrap(), 512);
        assert!(got.iter().all(|&b| b == 0x42));

        // And the reverse direction.
        assert_eq!(pair.send(&[9; 16]).unwrap(), 16);
        let mut back = [0u8; 16];
        assert_eq!(client.recv(&mut back).unwrap(), 16);
        assert_eq!(back, [9; 16]);
    }

    #[test]
    fn send_requires_connection() {
        let pt = ports();
        let s = Socket::new(pt, AF_INET, SOCK_DGRAM, 0).unwrap();
        assert!(s.send(b"hello").is_err());
    }
}
