//! Calibration against the running kernel: programs loaded through the
//! probe host, operations run over loopback sockets.

use std::fs;
use std::io::{Read, Write};
use std::net::{
    IpAddr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket,
};
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use nix::sys::socket::{setsockopt, sockopt};
use rand::{Rng, RngCore};
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::conn::{CONN_L3_IPV4, CONN_L3_IPV6, CONN_L4_TCP, CONN_L4_UDP};
use crate::layout::addr_to_slot;
use crate::offset::table::{FieldGroup, OffsetTable};
use crate::offset::{Expected, GuessEnv, Operation, GUESS_MAP};
use crate::probe::{CleanupPolicy, ProbeHost, ProbeMap, ProgramHandle, ProgramOptions};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const TCP6_CONNECT_TIMEOUT: Duration = Duration::from_millis(10);
const TCP6_PREFIX: u32 = 0x8758_6031;
const TCP6_PORT: u16 = 57391;
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(1);
const UDP_PAYLOAD: &[u8] = b"guess flowi4";
const HTTP_PAYLOAD: &[u8] = b"GET / HTTP/1.1\r\nHost: hostflow\r\n\r\n";

/// Inode of the calling process's network namespace.
pub fn current_netns() -> Result<u32> {
    let meta = fs::metadata("/proc/self/ns/net").context("Failed to stat /proc/self/ns/net")?;
    Ok(meta.ino() as u32)
}

fn tcp_rtt(stream: &TcpStream) -> Result<(u32, u32)> {
    let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut libc::tcp_info as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        bail!(
            "getsockopt(TCP_INFO) failed: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok((info.tcpi_rtt, info.tcpi_rttvar))
}

/// Loopback listeners and the controlled operations run against them.
pub struct LoopbackStimulus {
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    received: Receiver<usize>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    netns: u32,
    pending: Option<TcpStream>,
}

impl LoopbackStimulus {
    pub fn new() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.2:0").context("Failed to bind 127.0.0.2")?;
        listener.set_nonblocking(true)?;
        let tcp_addr = listener.local_addr()?;
        let udp = UdpSocket::bind("127.0.0.2:0").context("Failed to bind udp 127.0.0.2")?;
        udp.set_read_timeout(Some(Duration::from_millis(100)))?;
        let udp_addr = udp.local_addr()?;

        let stop = Arc::new(AtomicBool::new(false));
        let (tx, received) = mpsc::channel();
        let mut threads = Vec::new();

        let accept_stop = stop.clone();
        threads.push(
            thread::Builder::new()
                .name("guess-accept".to_string())
                .spawn(move || accept_loop(listener, tx, accept_stop))?,
        );
        let drain_stop = stop.clone();
        threads.push(
            thread::Builder::new()
                .name("guess-udp".to_string())
                .spawn(move || {
                    let mut buf = [0u8; 64];
                    while !drain_stop.load(Ordering::Relaxed) {
                        let _ = udp.recv(&mut buf);
                    }
                })?,
        );

        Ok(Self {
            tcp_addr,
            udp_addr,
            received,
            stop,
            threads,
            netns: current_netns()?,
            pending: None,
        })
    }

    pub fn prepare(&mut self, op: Operation) -> Result<u64> {
        match op {
            Operation::SocketWrite => {
                let stream = TcpStream::connect_timeout(&self.tcp_addr, CONNECT_TIMEOUT)?;
                let fd = stream.as_raw_fd() as u64;
                self.pending = Some(stream);
                Ok(fd)
            }
            _ => Ok(0),
        }
    }

    pub fn fire(&mut self, op: Operation) -> Result<Expected> {
        match op {
            Operation::Tcp4 => self.tcp4(),
            Operation::Tcp6 => Ok(self.tcp6()),
            Operation::Udp4 => self.udp4(),
            Operation::TcpTransfer => self.transfer(),
            Operation::SocketWrite => self.socket_write(),
            Operation::ConntrackInsert => self.conntrack_insert(),
        }
    }

    fn expected_tcp(&self, stream: &TcpStream) -> Result<Expected> {
        let local = stream.local_addr()?;
        Ok(Expected {
            meta: CONN_L3_IPV4 | CONN_L4_TCP,
            saddr: addr_to_slot(&local.ip()),
            daddr: addr_to_slot(&self.tcp_addr.ip()),
            sport: local.port(),
            dport: self.tcp_addr.port(),
            netns: self.netns,
            ..Default::default()
        })
    }

    fn tcp4(&mut self) -> Result<Expected> {
        let stream = TcpStream::connect_timeout(&self.tcp_addr, CONNECT_TIMEOUT)
            .context("Failed to connect to the guess listener")?;
        setsockopt(
            &stream,
            sockopt::Linger,
            &libc::linger {
                l_onoff: 1,
                l_linger: 0,
            },
        )?;
        let mut exp = self.expected_tcp(&stream)?;
        let (rtt, rtt_var) = tcp_rtt(&stream)?;
        exp.rtt = rtt;
        exp.rtt_var = rtt_var;
        Ok(exp)
    }

    fn tcp6(&mut self) -> Expected {
        let mut octets = [0u8; 16];
        octets[..4].copy_from_slice(&TCP6_PREFIX.to_be_bytes());
        rand::rng().fill_bytes(&mut octets[4..]);
        let addr = IpAddr::V6(Ipv6Addr::from(octets));
        // The connect is expected to fail, only the attempt is observed.
        let _ = TcpStream::connect_timeout(&SocketAddr::new(addr, TCP6_PORT), TCP6_CONNECT_TIMEOUT);
        Expected {
            meta: CONN_L3_IPV6 | CONN_L4_TCP,
            daddr: octets,
            dport: TCP6_PORT,
            netns: self.netns,
            ..Default::default()
        }
    }

    fn udp4(&mut self) -> Result<Expected> {
        let sock = UdpSocket::bind("127.0.0.1:0")?;
        sock.connect(self.udp_addr)?;
        sock.send(UDP_PAYLOAD)?;
        let local = sock.local_addr()?;
        Ok(Expected {
            meta: CONN_L3_IPV4 | CONN_L4_UDP,
            saddr: addr_to_slot(&local.ip()),
            daddr: addr_to_slot(&self.udp_addr.ip()),
            sport: local.port(),
            dport: self.udp_addr.port(),
            netns: self.netns,
            ..Default::default()
        })
    }

    fn transfer(&mut self) -> Result<Expected> {
        while self.received.try_recv().is_ok() {}
        let mut stream = TcpStream::connect_timeout(&self.tcp_addr, CONNECT_TIMEOUT)?;
        let len = rand::rng().random_range(1000..1400usize);
        stream.write_all(&vec![0x5a; len])?;
        stream.shutdown(Shutdown::Write)?;
        let mut exp = self.expected_tcp(&stream)?;
        exp.bytes = len as u32;
        // Wait for the peer to consume everything so the receive side ran.
        loop {
            match self.received.recv_timeout(TRANSFER_TIMEOUT) {
                Ok(n) if n == len => break,
                Ok(_) => continue,
                Err(_) => {
                    debug!(len, "transfer not drained by the listener in time");
                    break;
                }
            }
        }
        Ok(exp)
    }

    fn socket_write(&mut self) -> Result<Expected> {
        let mut stream = self
            .pending
            .take()
            .ok_or_else(|| anyhow!("socket write fired without prepare"))?;
        stream.write_all(HTTP_PAYLOAD)?;
        self.expected_tcp(&stream)
    }

    fn conntrack_insert(&mut self) -> Result<Expected> {
        let stream = TcpStream::connect_timeout(&self.tcp_addr, CONNECT_TIMEOUT)?;
        self.expected_tcp(&stream)
    }
}

fn accept_loop(listener: TcpListener, tx: Sender<usize>, stop: Arc<AtomicBool>) {
    let mut buf = [0u8; 4096];
    while !stop.load(Ordering::Relaxed) {
        let mut stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(2));
                continue;
            }
            Err(e) => {
                warn!("guess listener accept failed: {}", e);
                thread::sleep(Duration::from_millis(20));
                continue;
            }
        };
        if stream.set_nonblocking(false).is_err()
            || stream.set_read_timeout(Some(TRANSFER_TIMEOUT)).is_err()
        {
            continue;
        }
        let mut total = 0;
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(_) => break,
            }
        }
        if total > 0 && tx.send(total).is_err() {
            break;
        }
    }
}

impl Drop for LoopbackStimulus {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Guess environment backed by a probe host and loopback operations.
pub struct HostGuessEnv {
    host: Arc<dyn ProbeHost>,
    config: Arc<AgentConfig>,
    stimulus: LoopbackStimulus,
    loaded: Option<ProgramHandle>,
}

impl HostGuessEnv {
    pub fn new(host: Arc<dyn ProbeHost>, config: Arc<AgentConfig>) -> Result<Self> {
        Ok(Self {
            host,
            config,
            stimulus: LoopbackStimulus::new()?,
            loaded: None,
        })
    }
}

impl GuessEnv for HostGuessEnv {
    fn open(&mut self, group: FieldGroup, table: &OffsetTable) -> Result<Arc<dyn ProbeMap>> {
        let name = format!("offset_{}", group);
        let path = self.config.probe_object(&name);
        let options = ProgramOptions::new(&name).with_constants(table.as_constants());
        let handle = self.host.load_object(&path, &options)?;
        self.loaded = Some(handle);
        let map = self.host.start(handle).and_then(|_| {
            self.host
                .get_map(handle, GUESS_MAP)
                .ok_or_else(|| anyhow!("{} has no {} map", name, GUESS_MAP))
        });
        if map.is_err() {
            self.close(group);
        }
        map
    }

    fn close(&mut self, group: FieldGroup) {
        if let Some(handle) = self.loaded.take() {
            if let Err(e) = self.host.stop(handle, CleanupPolicy::All) {
                warn!(group = %group, "Failed to unload calibration program: {:#}", e);
            }
        }
    }

    fn prepare(&mut self, op: Operation) -> Result<u64> {
        self.stimulus.prepare(op)
    }

    fn fire(&mut self, op: Operation) -> Result<Expected> {
        self.stimulus.fire(op)
    }
}
