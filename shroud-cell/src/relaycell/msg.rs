//! Encoding and decoding for relay messages.
//!
//! Relay messages are sent along circuits, inside RELAY or
//! RELAY_EARLY cells.

use super::RelayCmd;
use caret::caret_int;
use shroud_bytes::{Error, Result};
use shroud_bytes::{Readable, Reader, Writeable, Writer};
use shroud_linkspec::LinkSpec;
use std::net::IpAddr;

/// A single parsed relay message, sent or received along a circuit.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum RelayMsg {
    /// Create a stream.
    Begin(Begin),
    /// Send data on a stream.
    Data(Data),
    /// Close a stream.
    End(End),
    /// Successful response to a Begin message.
    Connected(Connected),
    /// For flow control.
    Sendme(Sendme),
    /// Extend a circuit to a new hop.
    Extend2(Extend2),
    /// Successful response to an Extend2 message.
    Extended2(Extended2),
    /// Partially close a circuit.
    Truncate,
    /// Tell the client that a circuit has been partially closed.
    Truncated(Truncated),
    /// Used for padding.
    Drop,
    /// Launch a DNS request.
    Resolve(Resolve),
    /// Response to a Resolve message.
    Resolved(Resolved),
    /// Start a directory stream.
    BeginDir,
    /// An unrecognized command.
    Unrecognized(Unrecognized),
}

/// Internal: traits in common among the message bodies.
pub trait Body: Sized {
    /// Convert this type into a RelayMsg, wrapped appropriately.
    fn into_message(self) -> RelayMsg;
    /// Decode a relay cell body from a provided reader.
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self>;
    /// Encode the body of this cell into the end of a vec.
    fn encode_onto(self, w: &mut Vec<u8>);
}

impl<B: Body> From<B> for RelayMsg {
    fn from(b: B) -> RelayMsg {
        b.into_message()
    }
}

impl RelayMsg {
    /// Return the command associated with this message.
    pub fn cmd(&self) -> RelayCmd {
        use RelayMsg::*;
        match self {
            Begin(_) => RelayCmd::BEGIN,
            Data(_) => RelayCmd::DATA,
            End(_) => RelayCmd::END,
            Connected(_) => RelayCmd::CONNECTED,
            Sendme(_) => RelayCmd::SENDME,
            Extend2(_) => RelayCmd::EXTEND2,
            Extended2(_) => RelayCmd::EXTENDED2,
            Truncate => RelayCmd::TRUNCATE,
            Truncated(_) => RelayCmd::TRUNCATED,
            Drop => RelayCmd::DROP,
            Resolve(_) => RelayCmd::RESOLVE,
            Resolved(_) => RelayCmd::RESOLVED,
            BeginDir => RelayCmd::BEGIN_DIR,
            Unrecognized(u) => u.cmd(),
        }
    }
    /// Extract the body of a message with command `c` from reader `r`.
    pub fn decode_from_reader(c: RelayCmd, r: &mut Reader<'_>) -> Result<Self> {
        Ok(match c {
            RelayCmd::BEGIN => RelayMsg::Begin(Begin::decode_from_reader(r)?),
            RelayCmd::DATA => RelayMsg::Data(Data::decode_from_reader(r)?),
            RelayCmd::END => RelayMsg::End(End::decode_from_reader(r)?),
            RelayCmd::CONNECTED => RelayMsg::Connected(Connected::decode_from_reader(r)?),
            RelayCmd::SENDME => RelayMsg::Sendme(Sendme::decode_from_reader(r)?),
            RelayCmd::EXTEND2 => RelayMsg::Extend2(Extend2::decode_from_reader(r)?),
            RelayCmd::EXTENDED2 => RelayMsg::Extended2(Extended2::decode_from_reader(r)?),
            RelayCmd::TRUNCATE => RelayMsg::Truncate,
            RelayCmd::TRUNCATED => RelayMsg::Truncated(Truncated::decode_from_reader(r)?),
            RelayCmd::DROP => RelayMsg::Drop,
            RelayCmd::RESOLVE => RelayMsg::Resolve(Resolve::decode_from_reader(r)?),
            RelayCmd::RESOLVED => RelayMsg::Resolved(Resolved::decode_from_reader(r)?),
            RelayCmd::BEGIN_DIR => RelayMsg::BeginDir,
            _ => RelayMsg::Unrecognized(Unrecognized::decode_with_cmd(c, r)?),
        })
    }
    /// Encode the body of this message, not including command or
    /// length.
    pub fn encode_onto(self, w: &mut Vec<u8>) {
        use RelayMsg::*;
        match self {
            Begin(b) => b.encode_onto(w),
            Data(b) => b.encode_onto(w),
            End(b) => b.encode_onto(w),
            Connected(b) => b.encode_onto(w),
            Sendme(b) => b.encode_onto(w),
            Extend2(b) => b.encode_onto(w),
            Extended2(b) => b.encode_onto(w),
            Truncate => (),
            Truncated(b) => b.encode_onto(w),
            Drop => (),
            Resolve(b) => b.encode_onto(w),
            Resolved(b) => b.encode_onto(w),
            BeginDir => (),
            Unrecognized(b) => b.encode_onto(w),
        }
    }

    /// Return true if this message is counted by the flow-control
    /// windows.
    ///
    /// Only DATA matters for flow control, at both the stream and the
    /// circuit level.
    pub fn counts_towards_windows(&self) -> bool {
        matches!(self, RelayMsg::Data(_))
    }
}

caret_int! {
    /// A declared reason for closing a stream.
    ///
    /// These reasons are a fixed taxonomy: each is a single byte on
    /// the wire, and each maps onto one class of local failure.
    pub struct EndReason(u8) {
        /// Closing a stream because of an unspecified reason.
        ///
        /// This is the only reason clients send.
        MISC = 1,
        /// Couldn't look up hostname.
        RESOLVEFAILED = 2,
        /// Remote host refused connection.
        CONNECTREFUSED = 3,
        /// Closing because of the exit policy.
        EXITPOLICY = 4,
        /// Circuit is being destroyed.
        DESTROY = 5,
        /// Anonymized TCP connection was closed normally.
        DONE = 6,
        /// Connection timed out, or relay gave up on the connection.
        TIMEOUT = 7,
        /// No route to target destination.
        NOROUTE = 8,
        /// Relay is entering hibernation and not accepting requests.
        HIBERNATING = 9,
        /// Internal error at the relay.
        INTERNAL = 10,
        /// Ran out of memory, sockets, or circuit IDs.
        RESOURCELIMIT = 11,
        /// Connection was unexpectedly reset.
        CONNRESET = 12,
        /// Overlay protocol violation.
        PROTOCOL = 13,
        /// BEGIN_DIR cell at a relay that is not a directory cache.
        NOTDIRECTORY = 14,
    }
}

/// Message to create a new stream.
#[derive(Debug, Clone)]
pub struct Begin {
    /// The address to connect to, as an ASCII string.
    addr: Vec<u8>,
    /// The target port.
    port: u16,
    /// Flags describing the initiator's address-family preferences.
    flags: u32,
}

/// Preference for an IP version when connecting to a Begin target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum IpVersionPreference {
    /// Only IPv4 is allowed.
    Ipv4Only,
    /// Both are allowed; prefer IPv4.
    Ipv4Preferred,
    /// Both are allowed; prefer IPv6.
    Ipv6Preferred,
    /// Only IPv6 is allowed.
    Ipv6Only,
}
impl Default for IpVersionPreference {
    fn default() -> Self {
        IpVersionPreference::Ipv4Preferred
    }
}

/// Flag: IPv6 is okay for this Begin.
const BEGIN_FLAG_IPV6_OK: u32 = 1;
/// Flag: IPv4 is not okay for this Begin.
const BEGIN_FLAG_IPV4_NOT_OK: u32 = 1 << 1;
/// Flag: prefer IPv6 over IPv4.
const BEGIN_FLAG_IPV6_PREFERRED: u32 = 1 << 2;

impl From<IpVersionPreference> for u32 {
    fn from(pref: IpVersionPreference) -> u32 {
        use IpVersionPreference::*;
        match pref {
            Ipv4Only => 0,
            Ipv4Preferred => BEGIN_FLAG_IPV6_OK,
            Ipv6Preferred => BEGIN_FLAG_IPV6_OK | BEGIN_FLAG_IPV6_PREFERRED,
            Ipv6Only => BEGIN_FLAG_IPV6_OK | BEGIN_FLAG_IPV4_NOT_OK,
        }
    }
}

impl Begin {
    /// Construct a new Begin message.
    pub fn new(addr: &str, port: u16, flags: IpVersionPreference) -> crate::Result<Self> {
        if !addr.is_ascii() {
            return Err(crate::Error::BadStreamAddress);
        }
        Ok(Begin {
            addr: addr.as_bytes().into(),
            port,
            flags: flags.into(),
        })
    }
    /// Return the address requested in this message, as bytes.
    pub fn addr(&self) -> &[u8] {
        &self.addr[..]
    }
    /// Return the port requested by this message.
    pub fn port(&self) -> u16 {
        self.port
    }
    /// Return true if the flags on this message allow an IPv6 answer.
    pub fn ipv6_okay(&self) -> bool {
        self.flags & BEGIN_FLAG_IPV6_OK != 0
    }
    /// Return true if the flags on this message allow an IPv4 answer.
    pub fn ipv4_okay(&self) -> bool {
        self.flags & BEGIN_FLAG_IPV4_NOT_OK == 0
    }
}

impl Body for Begin {
    fn into_message(self) -> RelayMsg {
        RelayMsg::Begin(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let addr = r.take_until(b':')?;
        let port = r.take_until(0)?;
        let flags = if r.remaining() >= 4 { r.take_u32()? } else { 0 };

        if !addr.is_ascii() {
            return Err(Error::BadMessage("target address in Begin message not ascii"));
        }

        let port = std::str::from_utf8(port)
            .map_err(|_| Error::BadMessage("port in Begin message not utf8"))?;

        let port = port
            .parse()
            .map_err(|_| Error::BadMessage("port in Begin message not a valid port"))?;

        Ok(Begin {
            addr: addr.into(),
            port,
            flags,
        })
    }
    fn encode_onto(self, w: &mut Vec<u8>) {
        w.write_all(&self.addr[..]);
        w.write_u8(b':');
        w.write_all(self.port.to_string().as_bytes());
        w.write_u8(0);
        if self.flags != 0 {
            w.write_u32(self.flags);
        }
    }
}

/// Data on a stream.
#[derive(Debug, Clone)]
pub struct Data {
    /// The contents of this message: the data that is being sent on
    /// the stream.
    body: Vec<u8>,
}
impl Data {
    /// The longest allowable body length for a single Data message.
    pub const MAXLEN: usize = super::MAX_RELAY_DATA_LEN;

    /// Construct a new Data message.
    ///
    /// # Panics
    ///
    /// Panics if `inp` is longer than [`Data::MAXLEN`] bytes; it is
    /// the caller's job to chunk stream data first.
    pub fn new(inp: &[u8]) -> Self {
        assert!(inp.len() <= Data::MAXLEN);
        Data { body: inp.into() }
    }
}
impl From<Data> for Vec<u8> {
    fn from(data: Data) -> Vec<u8> {
        data.body
    }
}
impl AsRef<[u8]> for Data {
    fn as_ref(&self) -> &[u8] {
        &self.body[..]
    }
}

impl Body for Data {
    fn into_message(self) -> RelayMsg {
        RelayMsg::Data(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Data {
            body: r.take(r.remaining())?.into(),
        })
    }
    fn encode_onto(mut self, w: &mut Vec<u8>) {
        w.append(&mut self.body);
    }
}

/// Closing a stream.
#[derive(Debug, Clone)]
pub struct End {
    /// Why the stream is closing.
    reason: EndReason,
    /// The address of the stream target, if the stream was closed for
    /// an exit-policy reason.
    addr: Option<(IpAddr, u32)>,
}

impl End {
    /// Make a new End message with reason MISC.
    ///
    /// Clients send this every time they decide to close a stream.
    pub fn new_misc() -> Self {
        End {
            reason: EndReason::MISC,
            addr: None,
        }
    }
    /// Make a new End message with the provided end reason.
    pub fn new_with_reason(reason: EndReason) -> Self {
        End { reason, addr: None }
    }
    /// Make a new End message announcing an exit-policy refusal of a
    /// particular address.
    pub fn new_exitpolicy(addr: IpAddr, ttl: u32) -> Self {
        End {
            reason: EndReason::EXITPOLICY,
            addr: Some((addr, ttl)),
        }
    }
    /// Return the reason this stream was closed.
    pub fn reason(&self) -> EndReason {
        self.reason
    }
}
impl Body for End {
    fn into_message(self) -> RelayMsg {
        RelayMsg::End(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        if r.remaining() == 0 {
            return Ok(End {
                reason: EndReason::MISC,
                addr: None,
            });
        }
        let reason: EndReason = r.take_u8()?.into();
        if reason == EndReason::EXITPOLICY {
            let addr = match r.remaining() {
                8 => IpAddr::V4(r.extract()?),
                20 => IpAddr::V6(r.extract()?),
                _ => {
                    // Unknown body length: ignore the rest.
                    return Ok(End { reason, addr: None });
                }
            };
            let ttl = r.take_u32()?;
            Ok(End {
                reason,
                addr: Some((addr, ttl)),
            })
        } else {
            Ok(End { reason, addr: None })
        }
    }
    fn encode_onto(self, w: &mut Vec<u8>) {
        w.write_u8(self.reason.into());
        if self.reason == EndReason::EXITPOLICY {
            if let Some((addr, ttl)) = self.addr {
                match addr {
                    IpAddr::V4(v4) => w.write(&v4),
                    IpAddr::V6(v6) => w.write(&v6),
                }
                w.write_u32(ttl);
            }
        }
    }
}

/// Successful response to a Begin message.
#[derive(Debug, Clone)]
pub struct Connected {
    /// The address that the relay connected to, and a time-to-live
    /// for caching that address.
    addr: Option<(IpAddr, u32)>,
}
impl Connected {
    /// Construct a new empty connected message.
    pub fn new_empty() -> Self {
        Connected { addr: None }
    }
    /// Construct a connected message with an address and a
    /// time-to-live value.
    pub fn new_with_addr(addr: IpAddr, ttl: u32) -> Self {
        Connected {
            addr: Some((addr, ttl)),
        }
    }
    /// Return the address and ttl in this message, if any.
    pub fn addr(&self) -> Option<(IpAddr, u32)> {
        self.addr
    }
}
impl Body for Connected {
    fn into_message(self) -> RelayMsg {
        RelayMsg::Connected(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        if r.remaining() == 0 {
            return Ok(Connected { addr: None });
        }
        let ipv4 = r.take_u32()?;
        let addr = if ipv4 == 0 {
            if r.take_u8()? != 6 {
                return Ok(Connected { addr: None });
            }
            IpAddr::V6(r.extract()?)
        } else {
            IpAddr::V4(ipv4.into())
        };
        let ttl = r.take_u32()?;

        Ok(Connected {
            addr: Some((addr, ttl)),
        })
    }
    fn encode_onto(self, w: &mut Vec<u8>) {
        if let Some((addr, ttl)) = self.addr {
            match addr {
                IpAddr::V4(v4) => w.write(&v4),
                IpAddr::V6(v6) => {
                    w.write_u32(0);
                    w.write_u8(6);
                    w.write(&v6);
                }
            }
            w.write_u32(ttl);
        }
    }
}

/// A Sendme message is acknowledgement-like: it refills one
/// flow-control window.
///
/// Stream-level Sendmes have no body.  Circuit-level Sendmes carry
/// the digest tag of the cell that triggered them, so a malicious
/// relay cannot blindly forge acknowledgements for traffic it never
/// delivered.
#[derive(Debug, Clone)]
pub struct Sendme {
    /// The digest-tag echo, for authenticated (v1) Sendmes.
    digest: Option<Vec<u8>>,
}
impl Sendme {
    /// Return a new empty Sendme message.
    ///
    /// This format is used on streams, and on circuits that do not
    /// use Sendme authentication.
    pub fn new_empty() -> Self {
        Sendme { digest: None }
    }
    /// Return a new Sendme message carrying a digest tag.
    ///
    /// This format is used on circuits with Sendme authentication.
    pub fn new_tag(x: [u8; 20]) -> Self {
        Sendme {
            digest: Some(x.into()),
        }
    }
    /// Consume this message and return its authentication tag, if any.
    pub fn into_tag(self) -> Option<Vec<u8>> {
        self.digest
    }
}
impl Body for Sendme {
    fn into_message(self) -> RelayMsg {
        RelayMsg::Sendme(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let digest = if r.remaining() == 0 {
            None
        } else {
            let ver = r.take_u8()?;
            match ver {
                0 => None,
                1 => {
                    let dlen = r.take_u16()?;
                    Some(r.take(dlen as usize)?.into())
                }
                _ => {
                    return Err(Error::BadMessage("Unrecognized Sendme version"));
                }
            }
        };
        Ok(Sendme { digest })
    }
    fn encode_onto(self, w: &mut Vec<u8>) {
        match self.digest {
            None => (),
            Some(mut x) => {
                w.write_u8(1);
                assert!(x.len() <= std::u16::MAX as usize);
                w.write_u16(x.len() as u16);
                w.append(&mut x);
            }
        }
    }
}

/// Extend the circuit to a new hop.
#[derive(Debug, Clone)]
pub struct Extend2 {
    /// The link specifiers telling the last hop which relay to
    /// connect to.
    linkspec: Vec<LinkSpec>,
    /// The handshake type for the onionskin that follows.
    handshake_type: u16,
    /// The client's part of the circuit-extension handshake.
    handshake: Vec<u8>,
}
impl Extend2 {
    /// Create a new Extend2 message.
    pub fn new(mut linkspec: Vec<LinkSpec>, handshake_type: u16, handshake: Vec<u8>) -> Self {
        LinkSpec::sort_by_type(&mut linkspec);
        Extend2 {
            linkspec,
            handshake_type,
            handshake,
        }
    }
    /// Return the type of this handshake.
    pub fn handshake_type(&self) -> u16 {
        self.handshake_type
    }
    /// Return the inner handshake for this Extend2 message.
    pub fn handshake(&self) -> &[u8] {
        &self.handshake[..]
    }
    /// Return the link specifiers in this message.
    pub fn linkspecs(&self) -> &[LinkSpec] {
        &self.linkspec[..]
    }
}

impl Body for Extend2 {
    fn into_message(self) -> RelayMsg {
        RelayMsg::Extend2(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let n = r.take_u8()?;
        let linkspec = r.extract_n(n as usize)?;
        let handshake_type = r.take_u16()?;
        let hlen = r.take_u16()?;
        let handshake = r.take(hlen as usize)?.into();
        Ok(Extend2 {
            linkspec,
            handshake_type,
            handshake,
        })
    }
    fn encode_onto(self, w: &mut Vec<u8>) {
        assert!(self.linkspec.len() <= std::u8::MAX as usize);
        assert!(self.handshake.len() <= std::u16::MAX as usize);
        w.write_u8(self.linkspec.len() as u8);
        for ls in self.linkspec.iter() {
            w.write(ls);
        }
        w.write_u16(self.handshake_type);
        w.write_u16(self.handshake.len() as u16);
        w.write_all(&self.handshake[..]);
    }
}

/// Successful reply to an Extend2.
#[derive(Debug, Clone)]
pub struct Extended2 {
    /// The relay's part of the circuit-extension handshake.
    handshake: Vec<u8>,
}
impl Extended2 {
    /// Construct a new Extended2 message with the provided handshake.
    pub fn new(handshake: Vec<u8>) -> Self {
        Extended2 { handshake }
    }
    /// Consume this message and return its body.
    pub fn into_body(self) -> Vec<u8> {
        self.handshake
    }
}
impl Body for Extended2 {
    fn into_message(self) -> RelayMsg {
        RelayMsg::Extended2(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let hlen = r.take_u16()?;
        let handshake = r.take(hlen as usize)?;
        Ok(Extended2 {
            handshake: handshake.into(),
        })
    }
    fn encode_onto(self, w: &mut Vec<u8>) {
        assert!(self.handshake.len() <= std::u16::MAX as usize);
        w.write_u16(self.handshake.len() as u16);
        w.write_all(&self.handshake[..]);
    }
}

/// The remaining hops of this circuit have gone away.
#[derive(Debug, Clone)]
pub struct Truncated {
    /// Reason for which the circuit was truncated.
    reason: crate::chancell::msg::DestroyReason,
}
impl Truncated {
    /// Construct a new Truncated message.
    pub fn new(reason: crate::chancell::msg::DestroyReason) -> Self {
        Truncated { reason }
    }
    /// Return the reason in this message.
    pub fn reason(&self) -> crate::chancell::msg::DestroyReason {
        self.reason
    }
}
impl Body for Truncated {
    fn into_message(self) -> RelayMsg {
        RelayMsg::Truncated(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Truncated {
            reason: r.take_u8()?.into(),
        })
    }
    fn encode_onto(self, w: &mut Vec<u8>) {
        w.write_u8(self.reason.into());
    }
}

/// Launch a DNS lookup.
#[derive(Debug, Clone)]
pub struct Resolve {
    /// The hostname to look up.
    query: Vec<u8>,
}
impl Resolve {
    /// Construct a new resolve message to look up a hostname.
    pub fn new(s: &str) -> Self {
        Resolve {
            query: s.as_bytes().into(),
        }
    }
    /// Construct a new resolve message to do a reverse lookup on an
    /// address.
    pub fn new_reverse(addr: &IpAddr) -> Self {
        let query = match addr {
            IpAddr::V4(v4) => {
                let [a, b, c, d] = v4.octets();
                format!("{}.{}.{}.{}.in-addr.arpa", d, c, b, a)
            }
            IpAddr::V6(v6) => {
                let mut s = String::with_capacity(72);
                for o in v6.octets().iter().rev() {
                    let high_nybble = o >> 4;
                    let low_nybble = o & 15;
                    s.push_str(&format!("{:x}.{:x}.", low_nybble, high_nybble));
                }
                s.push_str("ip6.arpa");
                s
            }
        };
        Resolve {
            query: query.into_bytes(),
        }
    }
    /// Return the query in this message, as bytes.
    pub fn query(&self) -> &[u8] {
        &self.query[..]
    }
}
impl Body for Resolve {
    fn into_message(self) -> RelayMsg {
        RelayMsg::Resolve(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let query = r.take_until(0)?;
        Ok(Resolve {
            query: query.into(),
        })
    }
    fn encode_onto(self, w: &mut Vec<u8>) {
        w.write_all(&self.query[..]);
        w.write_u8(0);
    }
}

/// Possible response to a DNS lookup.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ResolvedVal {
    /// We found an IP address.
    Ip(IpAddr),
    /// We found a hostname.
    Hostname(Vec<u8>),
    /// Error; try again.
    TransientError,
    /// Error; don't try again.
    NontransientError,
    /// A DNS lookup response that we didn't recognize.
    Unrecognized(u8, Vec<u8>),
}

/// Indicates a hostname response.
const RES_HOSTNAME: u8 = 0;
/// Indicates an IPv4 response.
const RES_IPV4: u8 = 4;
/// Indicates an IPv6 response.
const RES_IPV6: u8 = 6;
/// Transient error (okay to try again).
const RES_ERR_TRANSIENT: u8 = 0xF0;
/// Non-transient error (don't try again).
const RES_ERR_NONTRANSIENT: u8 = 0xF1;

impl Readable for ResolvedVal {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        /// Return the expected length for a given response type.
        fn res_len(tp: u8) -> Option<usize> {
            match tp {
                RES_IPV4 => Some(4),
                RES_IPV6 => Some(16),
                _ => None,
            }
        }
        let tp = r.take_u8()?;
        let len = r.take_u8()? as usize;
        if let Some(expected_len) = res_len(tp) {
            if len != expected_len {
                return Err(Error::BadMessage("Wrong length for RESOLVED answer"));
            }
        }
        use ResolvedVal::*;
        Ok(match tp {
            RES_HOSTNAME => Hostname(r.take(len)?.into()),
            RES_IPV4 => Ip(IpAddr::V4(r.extract()?)),
            RES_IPV6 => Ip(IpAddr::V6(r.extract()?)),
            RES_ERR_TRANSIENT => {
                r.advance(len)?;
                TransientError
            }
            RES_ERR_NONTRANSIENT => {
                r.advance(len)?;
                NontransientError
            }
            _ => Unrecognized(tp, r.take(len)?.into()),
        })
    }
}

impl Writeable for ResolvedVal {
    fn write_onto<B: Writer + ?Sized>(&self, w: &mut B) {
        use ResolvedVal::*;
        match self {
            Hostname(h) => {
                w.write_u8(RES_HOSTNAME);
                assert!(h.len() <= std::u8::MAX as usize);
                w.write_u8(h.len() as u8);
                w.write_all(&h[..]);
            }
            Ip(IpAddr::V4(a)) => {
                w.write_u8(RES_IPV4);
                w.write_u8(4); // length
                w.write(a);
            }
            Ip(IpAddr::V6(a)) => {
                w.write_u8(RES_IPV6);
                w.write_u8(16); // length
                w.write(a);
            }
            TransientError => {
                w.write_u8(RES_ERR_TRANSIENT);
                w.write_u8(0); // length
            }
            NontransientError => {
                w.write_u8(RES_ERR_NONTRANSIENT);
                w.write_u8(0); // length
            }
            Unrecognized(tp, v) => {
                w.write_u8(*tp);
                assert!(v.len() <= std::u8::MAX as usize);
                w.write_u8(v.len() as u8);
                w.write_all(&v[..]);
            }
        }
    }
}

/// Response to a Resolve message.
#[derive(Debug, Clone)]
pub struct Resolved {
    /// List of answers and their caching times.
    answers: Vec<(ResolvedVal, u32)>,
}
impl Resolved {
    /// Return a new empty Resolved object with no answers.
    pub fn new_empty() -> Self {
        Resolved {
            answers: Vec::new(),
        }
    }
    /// Return a new Resolved object reporting a name lookup error.
    pub fn new_err(transient: bool, ttl: u32) -> Self {
        let mut res = Self::new_empty();
        let err = if transient {
            ResolvedVal::TransientError
        } else {
            ResolvedVal::NontransientError
        };
        res.add_answer(err, ttl);
        res
    }
    /// Add a single answer to this Resolved message.
    pub fn add_answer(&mut self, answer: ResolvedVal, ttl: u32) {
        self.answers.push((answer, ttl));
    }
    /// Consume this Resolved message and return its answers.
    pub fn into_answers(self) -> Vec<(ResolvedVal, u32)> {
        self.answers
    }
}
impl Body for Resolved {
    fn into_message(self) -> RelayMsg {
        RelayMsg::Resolved(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let mut answers = Vec::new();
        while r.remaining() > 0 {
            let rv = r.extract()?;
            let ttl = r.take_u32()?;
            answers.push((rv, ttl));
        }
        Ok(Resolved { answers })
    }
    fn encode_onto(self, w: &mut Vec<u8>) {
        for (rv, ttl) in self.answers.iter() {
            w.write(rv);
            w.write_u32(*ttl);
        }
    }
}

/// A relay message that we didn't recognize.
#[derive(Debug, Clone)]
pub struct Unrecognized {
    /// The command that we didn't recognize.
    cmd: RelayCmd,
    /// The body of the message.
    body: Vec<u8>,
}

impl Unrecognized {
    /// Return the command associated with this message.
    pub fn cmd(&self) -> RelayCmd {
        self.cmd
    }
    /// Decode this message, using a provided command.
    pub fn decode_with_cmd(cmd: RelayCmd, r: &mut Reader<'_>) -> Result<Self> {
        let mut r = Unrecognized::decode_from_reader(r)?;
        r.cmd = cmd;
        Ok(r)
    }
}

impl Body for Unrecognized {
    fn into_message(self) -> RelayMsg {
        RelayMsg::Unrecognized(self)
    }
    fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Unrecognized {
            cmd: 0.into(),
            body: r.take(r.remaining())?.into(),
        })
    }
    fn encode_onto(self, w: &mut Vec<u8>) {
        w.write_all(&self.body[..]);
    }
}
