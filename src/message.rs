use crate::{
    config::{Host, HostState, Id, Protocol, Redirect, Relay, Rule, Table},
    error::Error,
};
use bytes::{Buf, BytesMut};
use derive_more::Display;
use privsep::imsg::Message;
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, net::SocketAddr, path::PathBuf, time::Duration};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[repr(u32)]
pub enum Type {
    /// Configuration stream from the parent.
    CfgTable = Message::RESERVED + 1,
    CfgHost,
    CfgRelay,
    CfgProtocol,
    CfgRule,
    CfgRedirect,
    CfgDone,
    /// Process control.
    CtlStart,
    CtlReset,
    CtlShutdown,
    CtlReload,
    /// Control socket requests and replies.
    CtlOk,
    CtlFail,
    CtlEnd,
    CtlShow,
    CtlHost,
    CtlSession,
    CtlSummary,
    CtlHostEnable,
    CtlHostDisable,
    CtlTableEnable,
    CtlTableDisable,
    CtlLog,
    CtlMonitor,
    /// Host state transitions from the hce.
    HostStatus,
    /// Script check execution in the parent.
    Script,
    /// Privileged socket request.
    Bindany,
    /// Synchronous key operations against the ca process.
    CaPrivEnc,
    CaPrivDec,
    /// Unknown message.
    Unknown,
}

impl Type {
    pub const CFG_TABLE: u32 = Self::CfgTable as u32;
    pub const CFG_HOST: u32 = Self::CfgHost as u32;
    pub const CFG_RELAY: u32 = Self::CfgRelay as u32;
    pub const CFG_PROTOCOL: u32 = Self::CfgProtocol as u32;
    pub const CFG_RULE: u32 = Self::CfgRule as u32;
    pub const CFG_REDIRECT: u32 = Self::CfgRedirect as u32;
    pub const CFG_DONE: u32 = Self::CfgDone as u32;
    pub const CTL_START: u32 = Self::CtlStart as u32;
    pub const CTL_RESET: u32 = Self::CtlReset as u32;
    pub const CTL_SHUTDOWN: u32 = Self::CtlShutdown as u32;
    pub const CTL_RELOAD: u32 = Self::CtlReload as u32;
    pub const CTL_OK: u32 = Self::CtlOk as u32;
    pub const CTL_FAIL: u32 = Self::CtlFail as u32;
    pub const CTL_END: u32 = Self::CtlEnd as u32;
    pub const CTL_SHOW: u32 = Self::CtlShow as u32;
    pub const CTL_HOST: u32 = Self::CtlHost as u32;
    pub const CTL_SESSION: u32 = Self::CtlSession as u32;
    pub const CTL_SUMMARY: u32 = Self::CtlSummary as u32;
    pub const CTL_HOST_ENABLE: u32 = Self::CtlHostEnable as u32;
    pub const CTL_HOST_DISABLE: u32 = Self::CtlHostDisable as u32;
    pub const CTL_TABLE_ENABLE: u32 = Self::CtlTableEnable as u32;
    pub const CTL_TABLE_DISABLE: u32 = Self::CtlTableDisable as u32;
    pub const CTL_LOG: u32 = Self::CtlLog as u32;
    pub const CTL_MONITOR: u32 = Self::CtlMonitor as u32;
    pub const HOST_STATUS: u32 = Self::HostStatus as u32;
    pub const SCRIPT: u32 = Self::Script as u32;
    pub const BINDANY: u32 = Self::Bindany as u32;
    pub const CA_PRIVENC: u32 = Self::CaPrivEnc as u32;
    pub const CA_PRIVDEC: u32 = Self::CaPrivDec as u32;

    /// Per-type ceiling for the payload carried by a message.  A frame
    /// that announces more is a protocol violation.
    pub fn max_payload(self) -> usize {
        match self {
            Self::CfgRelay => 0xffff,
            Self::CaPrivEnc | Self::CaPrivDec => 0xffff,
            Self::CfgTable | Self::CfgHost | Self::CfgProtocol | Self::CfgRule
            | Self::CfgRedirect => 16384,
            Self::CtlSummary | Self::CtlHost | Self::CtlSession | Self::CtlShow => 16384,
            _ => 1024,
        }
    }
}

impl From<u32> for Type {
    fn from(id: u32) -> Self {
        match id {
            Type::CFG_TABLE => Self::CfgTable,
            Type::CFG_HOST => Self::CfgHost,
            Type::CFG_RELAY => Self::CfgRelay,
            Type::CFG_PROTOCOL => Self::CfgProtocol,
            Type::CFG_RULE => Self::CfgRule,
            Type::CFG_REDIRECT => Self::CfgRedirect,
            Type::CFG_DONE => Self::CfgDone,
            Type::CTL_START => Self::CtlStart,
            Type::CTL_RESET => Self::CtlReset,
            Type::CTL_SHUTDOWN => Self::CtlShutdown,
            Type::CTL_RELOAD => Self::CtlReload,
            Type::CTL_OK => Self::CtlOk,
            Type::CTL_FAIL => Self::CtlFail,
            Type::CTL_END => Self::CtlEnd,
            Type::CTL_SHOW => Self::CtlShow,
            Type::CTL_HOST => Self::CtlHost,
            Type::CTL_SESSION => Self::CtlSession,
            Type::CTL_SUMMARY => Self::CtlSummary,
            Type::CTL_HOST_ENABLE => Self::CtlHostEnable,
            Type::CTL_HOST_DISABLE => Self::CtlHostDisable,
            Type::CTL_TABLE_ENABLE => Self::CtlTableEnable,
            Type::CTL_TABLE_DISABLE => Self::CtlTableDisable,
            Type::CTL_LOG => Self::CtlLog,
            Type::CTL_MONITOR => Self::CtlMonitor,
            Type::HOST_STATUS => Self::HostStatus,
            Type::SCRIPT => Self::Script,
            Type::BINDANY => Self::Bindany,
            Type::CA_PRIVENC => Self::CaPrivEnc,
            Type::CA_PRIVDEC => Self::CaPrivDec,
            _ => Self::Unknown,
        }
    }
}

impl From<Type> for Message {
    fn from(typ: Type) -> Self {
        Self::from(typ as u32)
    }
}

/// Which configuration categories a reset covers.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ConfigScope(pub u32);

pub const CONFIG_TABLES: u32 = 0x01;
pub const CONFIG_RDRS: u32 = 0x02;
pub const CONFIG_RELAYS: u32 = 0x04;
pub const CONFIG_PROTOS: u32 = 0x08;
pub const CONFIG_ALL: u32 = 0xff;

impl ConfigScope {
    pub fn all() -> Self {
        Self(CONFIG_ALL)
    }

    pub fn has(self, flag: u32) -> bool {
        self.0 & flag != 0
    }
}

/// A host state transition as published by the hce.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Status {
    pub id: Id,
    pub state: HostState,
    pub check_cnt: u64,
}

/// Script check marshalled to the parent; the reply carries the exit
/// code in `retval`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ScriptOp {
    pub host: Id,
    pub name: String,
    pub path: PathBuf,
    pub timeout: Duration,
    pub retval: i32,
}

/// Request for a privileged socket, answered with a file descriptor.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BindanyOp {
    pub id: Id,
    pub addr: SocketAddr,
}

/// A private key operation; `data` holds the input on the way to the
/// ca process and the result on the way back.  An empty result means
/// the operation failed.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct KeyOp {
    pub id: Id,
    /// TLS signature scheme code point.
    pub scheme: u16,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ShowKind {
    Summary,
    Hosts,
    Relays,
    Sessions,
    Redirects,
}

/// Host or table selector used by the enable/disable commands.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CtlId {
    pub id: Option<Id>,
    pub name: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HostRecord {
    pub host: Host,
    pub state: HostState,
    pub check_cnt: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SessionRecord {
    pub id: u64,
    pub relay: Id,
    pub peer: String,
    pub age: Duration,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Summary {
    pub redirects: usize,
    pub tables: usize,
    pub hosts: usize,
    pub relays: usize,
    pub reload_pending: usize,
}

/// Internal message data
#[derive(Debug, Deserialize, Serialize)]
pub enum Data<'a> {
    Table(Cow<'a, Table>),
    Host(Cow<'a, Host>),
    Relay(Cow<'a, Relay>),
    Protocol(Cow<'a, Protocol>),
    Rule(Cow<'a, Rule>),
    Redirect(Cow<'a, Redirect>),
    Reset(ConfigScope),
    Status(Status),
    Script(ScriptOp),
    Bindany(BindanyOp),
    KeyOp(KeyOp),
    Show(ShowKind),
    CtlId(CtlId),
    HostRecord(Box<HostRecord>),
    Session(SessionRecord),
    Sessions(Vec<SessionRecord>),
    Summary(Summary),
    Verbose(bool),
    Fail(String),
    None,
}

impl<'a> From<&'a Table> for Data<'a> {
    fn from(table: &'a Table) -> Self {
        Self::Table(Cow::Borrowed(table))
    }
}

impl<'a> From<&'a Host> for Data<'a> {
    fn from(host: &'a Host) -> Self {
        Self::Host(Cow::Borrowed(host))
    }
}

impl<'a> From<&'a Redirect> for Data<'a> {
    fn from(rdr: &'a Redirect) -> Self {
        Self::Redirect(Cow::Borrowed(rdr))
    }
}

impl From<()> for Data<'_> {
    fn from(_none: ()) -> Self {
        Self::None
    }
}

//
// Control socket framing.
//
// The control socket speaks the same message layout as the imsg
// channels: a fixed little-endian header followed by `len` bytes of
// payload, here encoded as JSON.
//

/// Fixed wire header of a control frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    pub typ: u32,
    pub len: u16,
    pub flags: u16,
    pub peerid: u32,
    pub pid: u32,
}

impl Header {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.typ.to_le_bytes());
        buf[4..6].copy_from_slice(&self.len.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..12].copy_from_slice(&self.peerid.to_le_bytes());
        buf[12..16].copy_from_slice(&self.pid.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            typ: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            len: u16::from_le_bytes([buf[4], buf[5]]),
            flags: u16::from_le_bytes([buf[6], buf[7]]),
            peerid: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            pid: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }
    }
}

/// Incremental decoder: bytes in, complete frames out, independent of
/// how the stream was fragmented.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next(&mut self) -> Result<Option<(Header, Vec<u8>)>, Error> {
        if self.buf.len() < Header::SIZE {
            return Ok(None);
        }
        let mut hdr = [0u8; Header::SIZE];
        hdr.copy_from_slice(&self.buf[..Header::SIZE]);
        let header = Header::decode(&hdr);
        let len = header.len as usize;
        if len > Type::from(header.typ).max_payload() {
            return Err(Error::MessageTooLarge);
        }
        if self.buf.len() < Header::SIZE + len {
            return Ok(None);
        }
        self.buf.advance(Header::SIZE);
        let payload = self.buf.split_to(len).to_vec();
        Ok(Some((header, payload)))
    }
}

pub fn encode_frame(typ: Type, data: &Data<'_>) -> Result<Vec<u8>, Error> {
    let payload = serde_json::to_vec(data)?;
    if payload.len() > typ.max_payload() {
        return Err(Error::MessageTooLarge);
    }
    let header = Header {
        typ: typ as u32,
        len: payload.len() as u16,
        flags: 0,
        peerid: 0,
        pid: std::process::id(),
    };
    let mut buf = Vec::with_capacity(Header::SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    typ: Type,
    data: &Data<'_>,
) -> Result<(), Error> {
    let buf = encode_frame(typ, data)?;
    stream.write_all(&buf).await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
    decoder: &mut FrameDecoder,
) -> Result<Option<(Type, Data<'static>)>, Error> {
    loop {
        if let Some((header, payload)) = decoder.next()? {
            let data = serde_json::from_slice(&payload)?;
            return Ok(Some((Type::from(header.typ), data)));
        }
        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        decoder.extend(&buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = Header {
            typ: Type::CTL_SHOW,
            len: 42,
            flags: 1,
            peerid: 7,
            pid: 1234,
        };
        assert_eq!(Header::decode(&header.encode()), header);
    }

    #[test]
    fn test_type_roundtrip() {
        for typ in [
            Type::CfgTable,
            Type::CfgDone,
            Type::CtlStart,
            Type::CaPrivEnc,
            Type::HostStatus,
        ] {
            assert_eq!(Type::from(typ as u32), typ);
        }
        assert_eq!(Type::from(0xdead_beef), Type::Unknown);
    }

    #[test]
    fn test_frame_reassembly_at_any_offset() {
        let frames = vec![
            encode_frame(Type::CtlShow, &Data::Show(ShowKind::Hosts)).unwrap(),
            encode_frame(Type::CtlOk, &Data::None).unwrap(),
            encode_frame(
                Type::CtlSession,
                &Data::Session(SessionRecord {
                    id: 99,
                    relay: 3,
                    peer: "192.0.2.1:4711".to_string(),
                    age: Duration::from_secs(5),
                }),
            )
            .unwrap(),
        ];
        let stream: Vec<u8> = frames.concat();

        // Re-deliver the byte stream split at every possible offset;
        // the decoded sequence must not change.
        for split in 0..stream.len() {
            let mut decoder = FrameDecoder::default();
            let mut decoded = Vec::new();
            for chunk in [&stream[..split], &stream[split..]] {
                decoder.extend(chunk);
                while let Some((header, payload)) = decoder.next().unwrap() {
                    decoded.push((header.typ, payload));
                }
            }
            assert_eq!(decoded.len(), 3, "split at {}", split);
            assert_eq!(Type::from(decoded[0].0), Type::CtlShow);
            assert_eq!(Type::from(decoded[1].0), Type::CtlOk);
            assert_eq!(Type::from(decoded[2].0), Type::CtlSession);
        }
    }

    #[test]
    fn test_oversize_frame_is_fatal() {
        let header = Header {
            typ: Type::CTL_OK,
            len: 0x4000,
            flags: 0,
            peerid: 0,
            pid: 0,
        };
        let mut decoder = FrameDecoder::default();
        decoder.extend(&header.encode());
        assert!(decoder.next().is_err());
    }

    #[test]
    fn test_payload_roundtrip() {
        let op = KeyOp {
            id: 17,
            scheme: 0x0804,
            data: vec![1, 2, 3],
        };
        let buf = encode_frame(Type::CaPrivEnc, &Data::KeyOp(op)).unwrap();
        let mut decoder = FrameDecoder::default();
        decoder.extend(&buf);
        let (header, payload) = decoder.next().unwrap().unwrap();
        assert_eq!(Type::from(header.typ), Type::CaPrivEnc);
        match serde_json::from_slice(&payload).unwrap() {
            Data::KeyOp(op) => {
                assert_eq!(op.id, 17);
                assert_eq!(op.data, vec![1, 2, 3]);
            }
            _ => panic!("unexpected payload"),
        }
    }
}
