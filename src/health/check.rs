//! Host probes: ICMP echo, TCP connect, TLS, HTTP code/digest,
//! send/expect and script checks.

use crate::{
    config::{Check, DigestType, Host, Table},
    message::ScriptOp,
    relay::kv::glob_match,
    tls,
};
use md5::{Digest as _, Md5};
use privsep_log::{debug, warn};
use sha1::Sha1;
use std::{
    net::{IpAddr, SocketAddr},
    os::unix::io::{AsRawFd, RawFd},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::timeout,
};

/// Handle used by script checks; only the parent may fork.
#[derive(Clone, Debug)]
pub struct ScriptGate {
    tx: mpsc::Sender<(ScriptOp, oneshot::Sender<i32>)>,
}

impl ScriptGate {
    pub fn new() -> (Self, mpsc::Receiver<(ScriptOp, oneshot::Sender<i32>)>) {
        let (tx, rx) = mpsc::channel(64);
        (Self { tx }, rx)
    }

    pub async fn run(&self, op: ScriptOp) -> i32 {
        let (reply, result) = oneshot::channel();
        if self.tx.send((op, reply)).await.is_err() {
            return -1;
        }
        result.await.unwrap_or(-1)
    }
}

/// Run one probe; returns success and a short reason for the log.
pub async fn probe(table: &Table, host: &Host, scripts: &ScriptGate) -> (bool, &'static str) {
    let deadline = table.timeout;
    let port = if table.port != 0 { table.port } else { 80 };
    let addr = SocketAddr::new(host.address, port);

    match &table.check {
        Check::NoCheck => (true, "no check"),
        Check::Icmp => icmp_probe(host.address, deadline).await,
        Check::Tcp => tcp_probe(table, addr, deadline).await,
        Check::HttpCode { path, host: vhost, code } => {
            http_probe(
                table,
                addr,
                deadline,
                path,
                vhost.as_deref().unwrap_or(&host.name),
                HttpExpect::Code(*code),
            )
            .await
        }
        Check::HttpDigest {
            path,
            host: vhost,
            digest,
            value,
        } => {
            http_probe(
                table,
                addr,
                deadline,
                path,
                vhost.as_deref().unwrap_or(&host.name),
                HttpExpect::Digest(*digest, value),
            )
            .await
        }
        Check::SendExpect { send, expect } => {
            send_expect_probe(table, addr, deadline, send.as_deref(), expect).await
        }
        Check::Script { path } => {
            let op = ScriptOp {
                host: host.id,
                name: host.name.clone(),
                path: path.clone(),
                timeout: deadline,
                retval: -1,
            };
            match scripts.run(op).await {
                0 => (true, "script ok"),
                _ => (false, "script failed"),
            }
        }
    }
}

async fn connect(table: &Table, addr: SocketAddr, deadline: Duration) -> Option<ProbeStream> {
    let stream = match timeout(deadline, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        _ => return None,
    };
    if !table.tls {
        return Some(Box::new(stream));
    }
    let connector = match tls::connector(None) {
        Ok(connector) => connector,
        Err(err) => {
            warn!("cannot build check connector: {}", err);
            return None;
        }
    };
    let name = rustls::pki_types::ServerName::try_from(addr.ip().to_string()).ok()?;
    match timeout(deadline, connector.connect(name, stream)).await {
        Ok(Ok(tls)) => Some(Box::new(tls)),
        _ => None,
    }
}

type ProbeStream = Box<dyn ProbeIo>;

trait ProbeIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ProbeIo for T {}

async fn tcp_probe(table: &Table, addr: SocketAddr, deadline: Duration) -> (bool, &'static str) {
    match connect(table, addr, deadline).await {
        Some(_) if table.tls => (true, "tls connect ok"),
        Some(_) => (true, "tcp connect ok"),
        None => (false, "connect failed"),
    }
}

enum HttpExpect<'a> {
    Code(u16),
    Digest(DigestType, &'a str),
}

async fn http_probe(
    table: &Table,
    addr: SocketAddr,
    deadline: Duration,
    path: &str,
    vhost: &str,
    expect: HttpExpect<'_>,
) -> (bool, &'static str) {
    let mut stream = match connect(table, addr, deadline).await {
        Some(stream) => stream,
        None => return (false, "connect failed"),
    };
    let request = format!("GET {} HTTP/1.0\r\nHost: {}\r\n\r\n", path, vhost);
    if timeout(deadline, stream.write_all(request.as_bytes()))
        .await
        .map(|r| r.is_err())
        .unwrap_or(true)
    {
        return (false, "write failed");
    }
    let response = match read_capped(&mut stream, deadline).await {
        Some(response) => response,
        None => return (false, "read failed"),
    };

    match expect {
        HttpExpect::Code(code) => {
            let text = String::from_utf8_lossy(&response);
            let ok = ["HTTP/1.1 ", "HTTP/1.0 "]
                .iter()
                .any(|v| text.starts_with(v))
                && text
                    .get(9..12)
                    .and_then(|s| s.parse::<u16>().ok())
                    .map(|c| c == code)
                    .unwrap_or(false);
            if ok {
                (true, "http code ok")
            } else {
                (false, "http code mismatch")
            }
        }
        HttpExpect::Digest(typ, want) => {
            let body = response
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
                .map(|pos| &response[pos + 4..]);
            let body = match body {
                Some(body) => body,
                None => return (false, "no end of headers"),
            };
            let digest = match typ {
                DigestType::Md5 => to_hex(&Md5::digest(body)),
                DigestType::Sha1 => to_hex(&Sha1::digest(body)),
            };
            if digest == want.to_ascii_lowercase() {
                (true, "http digest ok")
            } else {
                (false, "http digest mismatch")
            }
        }
    }
}

async fn send_expect_probe(
    table: &Table,
    addr: SocketAddr,
    deadline: Duration,
    send: Option<&str>,
    expect: &str,
) -> (bool, &'static str) {
    let mut stream = match connect(table, addr, deadline).await {
        Some(stream) => stream,
        None => return (false, "connect failed"),
    };
    if let Some(send) = send {
        if timeout(deadline, stream.write_all(send.as_bytes()))
            .await
            .map(|r| r.is_err())
            .unwrap_or(true)
        {
            return (false, "write failed");
        }
    }

    // Read incrementally; the response may arrive in pieces and the
    // pattern may match before the peer closes.
    let mut collected = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = match timeout(deadline, stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            _ => return (false, "read failed"),
        };
        collected.extend_from_slice(&buf[..n]);
        if collected.len() >= crate::SMALL_READ_BUF_SIZE {
            break;
        }
        if glob_match(expect, &String::from_utf8_lossy(&collected), false) {
            return (true, "send/expect ok");
        }
    }
    if glob_match(expect, &String::from_utf8_lossy(&collected), false) {
        (true, "send/expect ok")
    } else {
        (false, "send/expect mismatch")
    }
}

async fn read_capped(stream: &mut ProbeStream, deadline: Duration) -> Option<Vec<u8>> {
    let mut collected = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match timeout(deadline, stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                collected.extend_from_slice(&buf[..n]);
                if collected.len() >= crate::SMALL_READ_BUF_SIZE {
                    break;
                }
            }
            Ok(Err(_)) => return None,
            // Timeouts keep whatever arrived; HTTP/1.0 servers close,
            // others may not.
            Err(_) => break,
        }
    }
    if collected.is_empty() {
        None
    } else {
        Some(collected)
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

//
// ICMP echo probe over a raw or datagram ICMP socket.
//

struct IcmpSocket(RawFd);

impl AsRawFd for IcmpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for IcmpSocket {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.0);
    }
}

fn open_icmp_socket(addr: IpAddr) -> Option<IcmpSocket> {
    use nix::libc;
    let (domain, proto) = match addr {
        IpAddr::V4(_) => (libc::AF_INET, libc::IPPROTO_ICMP),
        IpAddr::V6(_) => (libc::AF_INET6, libc::IPPROTO_ICMPV6),
    };
    for typ in [libc::SOCK_RAW, libc::SOCK_DGRAM] {
        let fd = unsafe { libc::socket(domain, typ | libc::SOCK_NONBLOCK, proto) };
        if fd >= 0 {
            return Some(IcmpSocket(fd));
        }
    }
    None
}

fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in data.chunks(2) {
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        };
        sum = sum.wrapping_add(word as u32);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

async fn icmp_probe(addr: IpAddr, deadline: Duration) -> (bool, &'static str) {
    match timeout(deadline, icmp_exchange(addr, deadline)).await {
        Ok(true) => (true, "icmp ok"),
        Ok(false) => (false, "icmp failed"),
        Err(_) => (false, "icmp timeout"),
    }
}

async fn icmp_exchange(addr: IpAddr, _deadline: Duration) -> bool {
    use nix::sys::socket::{recvfrom, sendto, InetAddr, MsgFlags, SockAddr};
    use tokio::io::unix::AsyncFd;

    let socket = match open_icmp_socket(addr) {
        Some(socket) => socket,
        None => {
            debug!("cannot open icmp socket (insufficient privilege?)");
            return false;
        }
    };
    let ident = (std::process::id() & 0xffff) as u16;

    // Echo request: type 8 (v4) or 128 (v6), code 0.
    let typ: u8 = if addr.is_ipv4() { 8 } else { 128 };
    let mut packet = vec![typ, 0, 0, 0];
    packet.extend_from_slice(&ident.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes());
    packet.extend_from_slice(b"relayd-check");
    if addr.is_ipv4() {
        let sum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }

    let target = SockAddr::new_inet(InetAddr::from_std(&SocketAddr::new(addr, 0)));
    let asyncfd = match AsyncFd::new(socket) {
        Ok(asyncfd) => asyncfd,
        Err(_) => return false,
    };

    let sent = loop {
        let mut guard = match asyncfd.writable().await {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        match guard.try_io(|inner| {
            sendto(inner.get_ref().as_raw_fd(), &packet, &target, MsgFlags::empty())
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
        }) {
            Ok(result) => break result.is_ok(),
            Err(_would_block) => continue,
        }
    };
    if !sent {
        return false;
    }

    let mut buf = [0u8; 512];
    loop {
        let mut guard = match asyncfd.readable().await {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        let n = match guard.try_io(|inner| {
            recvfrom(inner.get_ref().as_raw_fd(), &mut buf)
                .map(|(n, _)| n)
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
        }) {
            Ok(Ok(n)) => n,
            Ok(Err(_)) => return false,
            Err(_would_block) => continue,
        };
        if let Some(icmp) = icmp_payload(&buf[..n], addr) {
            let reply_type: u8 = if addr.is_ipv4() { 0 } else { 129 };
            if icmp.first() == Some(&reply_type) {
                // Raw sockets see every echo reply; match the ident
                // when the kernel did not rewrite it.
                if icmp.len() >= 6 {
                    let got = u16::from_be_bytes([icmp[4], icmp[5]]);
                    if got == ident || !addr.is_ipv4() {
                        return true;
                    }
                    continue;
                }
                return true;
            }
        }
    }
}

/// Strip the IPv4 header when the socket delivers whole packets.
fn icmp_payload(buf: &[u8], addr: IpAddr) -> Option<&[u8]> {
    if buf.is_empty() {
        return None;
    }
    if addr.is_ipv4() && buf[0] >> 4 == 4 {
        let ihl = ((buf[0] & 0x0f) as usize) * 4;
        if ihl >= 20 && buf.len() > ihl {
            return Some(&buf[ihl..]);
        }
    }
    Some(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Check;
    use tokio::net::TcpListener;

    fn table(check: Check, timeout_ms: u64) -> Table {
        Table {
            id: 1,
            name: "t".to_string(),
            check,
            timeout: Duration::from_millis(timeout_ms),
            ..Default::default()
        }
    }

    fn host(addr: SocketAddr) -> Host {
        Host {
            id: 1,
            name: addr.ip().to_string(),
            address: addr.ip(),
            ..Default::default()
        }
    }

    #[test]
    fn test_icmp_checksum() {
        // Checksum over an empty echo header must verify to zero.
        let mut packet = vec![8u8, 0, 0, 0, 0x12, 0x34, 0, 1];
        let sum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0xde, 0xad, 0x01]), "dead01");
    }

    #[tokio::test]
    async fn test_tcp_probe_success_and_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let mut t = table(Check::Tcp, 1000);
        t.port = addr.port();
        let h = host(addr);
        let (gate, _rx) = ScriptGate::new();
        let (ok, _) = probe(&t, &h, &gate).await;
        assert!(ok);

        // A port nothing listens on.
        let closed = table(Check::Tcp, 300);
        let mut t = closed;
        t.port = 1;
        let (ok, _) = probe(&t, &h, &gate).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_http_code_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream
                        .write_all(b"HTTP/1.0 200 OK\r\nContent-Type: text/html\r\n\r\nok")
                        .await;
                });
            }
        });

        let mut t = table(
            Check::HttpCode {
                path: "/".to_string(),
                host: None,
                code: 200,
            },
            1000,
        );
        t.port = addr.port();
        let h = host(addr);
        let (gate, _rx) = ScriptGate::new();
        let (ok, _) = probe(&t, &h, &gate).await;
        assert!(ok);

        let mut t404 = table(
            Check::HttpCode {
                path: "/".to_string(),
                host: None,
                code: 404,
            },
            1000,
        );
        t404.port = addr.port();
        let (ok, _) = probe(&t404, &h, &gate).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_send_expect_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream.write_all(b"250 smtp.example.com ready\r\n").await;
                });
            }
        });

        let mut t = table(
            Check::SendExpect {
                send: Some("HELO relayd\r\n".to_string()),
                expect: "250*".to_string(),
            },
            1000,
        );
        t.port = addr.port();
        let h = host(addr);
        let (gate, _rx) = ScriptGate::new();
        let (ok, _) = probe(&t, &h, &gate).await;
        assert!(ok);
    }

    #[tokio::test]
    async fn test_script_gate_reply() {
        let (gate, mut rx) = ScriptGate::new();
        tokio::spawn(async move {
            while let Some((op, reply)) = rx.recv().await {
                assert_eq!(op.host, 1);
                let _ = reply.send(0);
            }
        });
        let op = ScriptOp {
            host: 1,
            name: "h".to_string(),
            path: "/bin/true".into(),
            timeout: Duration::from_secs(1),
            retval: -1,
        };
        assert_eq!(gate.run(op).await, 0);
    }
}
