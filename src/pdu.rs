//! RTR PDUs.
//!
//! This module contains types that represent the protocol data units of
//! RPKI-RTR in their wire representation. That is, these types can be
//! given to read and write operations as buffers.
//! See section 5 of RFC 6810 and RFC 8210. Annoyingly, the format of the
//! `EndOfData` PDU changes between the two versions.
//!
//! All reading and writing happens on blocking sockets.

use std::{io, mem, slice};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr};
use crate::payload;
use crate::serial::Serial;
use crate::state::State;


//------------ Macro for Common Impls ----------------------------------------

macro_rules! common {
    ( $type:ident ) => {
        #[allow(dead_code)]
        impl $type {
            pub fn write<W: Write>(&self, w: &mut W) -> Result<(), io::Error> {
                w.write_all(self.as_ref())
            }
        }

        impl AsRef<[u8]> for $type {
            fn as_ref(&self) -> &[u8] {
                unsafe {
                    slice::from_raw_parts(
                        self as *const Self as *const u8,
                        mem::size_of::<Self>()
                    )
                }
            }
        }

        impl AsMut<[u8]> for $type {
            fn as_mut(&mut self) -> &mut [u8] {
                unsafe {
                    slice::from_raw_parts_mut(
                        self as *mut Self as *mut u8,
                        mem::size_of::<Self>()
                    )
                }
            }
        }
    }
}

macro_rules! concrete {
    ( $type:ident ) => {
        common!($type);

        #[allow(dead_code)]
        impl $type {
            pub fn version(&self) -> u8 {
                self.header.version()
            }

            pub fn session(&self) -> u16 {
                self.header.session()
            }

            pub fn read<R: Read>(sock: &mut R) -> Result<Self, io::Error> {
                let header = Header::read(sock)?;
                if header.pdu() != Self::PDU {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        concat!(
                            "PDU type mismatch when expecting ",
                            stringify!($type)
                        )
                    ))
                }
                Self::read_payload(header, sock)
            }

            pub fn read_payload<R: Read>(
                header: Header, sock: &mut R
            ) -> Result<Self, io::Error> {
                if header.length() as usize != mem::size_of::<Self>() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        concat!(
                            "invalid length for ",
                            stringify!($type),
                            " PDU"
                        )
                    ))
                }
                let mut res = Self::default();
                sock.read_exact(&mut res.as_mut()[Header::LEN..])?;
                res.header = header;
                Ok(res)
            }
        }
    }
}


//------------ SerialNotify --------------------------------------------------

#[derive(Default)]
#[repr(packed)]
#[allow(dead_code)]
pub struct SerialNotify {
    header: Header,
    serial: u32,
}

impl SerialNotify {
    pub const PDU: u8 = 0;
    pub const LEN: u32 = 12;

    pub fn new(version: u8, state: State) -> Self {
        SerialNotify {
            header: Header::new(
                version, Self::PDU, state.session(), Self::LEN
            ),
            serial: state.serial().to_be(),
        }
    }

    pub fn serial(&self) -> Serial {
        Serial::from_be(self.serial)
    }
}

concrete!(SerialNotify);


//------------ SerialQuery ---------------------------------------------------

#[derive(Default)]
#[repr(packed)]
pub struct SerialQuery {
    header: Header,
    payload: SerialQueryPayload,
}

impl SerialQuery {
    pub const PDU: u8 = 1;
    pub const LEN: u32 = 12;

    pub fn new(version: u8, state: State) -> Self {
        SerialQuery {
            header: Header::new(
                version, Self::PDU, state.session(), Self::LEN
            ),
            payload: SerialQueryPayload::new(state.serial()),
        }
    }

    pub fn serial(&self) -> Serial {
        self.payload.serial()
    }
}

concrete!(SerialQuery);


//------------ SerialQueryPayload --------------------------------------------

#[derive(Default)]
#[repr(packed)]
pub struct SerialQueryPayload {
    serial: u32
}

impl SerialQueryPayload {
    pub fn new(serial: Serial) -> Self {
        SerialQueryPayload {
            serial: serial.to_be()
        }
    }

    pub fn read<R: Read>(sock: &mut R) -> Result<Self, io::Error> {
        let mut res = Self::default();
        sock.read_exact(res.as_mut())?;
        Ok(res)
    }

    pub fn serial(&self) -> Serial {
        Serial::from_be(self.serial)
    }
}

common!(SerialQueryPayload);


//------------ ResetQuery ----------------------------------------------------

#[derive(Default)]
#[repr(packed)]
pub struct ResetQuery {
    header: Header
}

impl ResetQuery {
    pub const PDU: u8 = 2;
    pub const LEN: u32 = 8;

    pub fn new(version: u8) -> Self {
        ResetQuery {
            header: Header::new(version, Self::PDU, 0, Self::LEN)
        }
    }
}

concrete!(ResetQuery);


//------------ CacheResponse -------------------------------------------------

#[derive(Default)]
#[repr(packed)]
pub struct CacheResponse {
    header: Header
}

impl CacheResponse {
    pub const PDU: u8 = 3;
    pub const LEN: u32 = 8;

    pub fn new(version: u8, session: u16) -> Self {
        CacheResponse {
            header: Header::new(version, Self::PDU, session, Self::LEN)
        }
    }
}

concrete!(CacheResponse);


//------------ Ipv4Prefix and Ipv6Prefix ------------------------------------

/// Defines a prefix PDU.
///
/// Both prefix PDUs only differ in the address family, so `$bits` is the
/// integer type holding the address in network byte order.
macro_rules! prefix {
    ( $type:ident, $addr:ident, $bits:ident, $pdu:expr, $len:expr ) => {
        #[derive(Default)]
        #[repr(packed)]
        #[allow(dead_code)]
        pub struct $type {
            header: Header,
            flags: u8,
            prefix_len: u8,
            max_len: u8,
            zero: u8,
            prefix: $bits,
            asn: u32,
        }

        impl $type {
            pub const PDU: u8 = $pdu;
            pub const LEN: u32 = $len;

            pub fn new(
                version: u8, flags: u8, origin: payload::$type
            ) -> Self {
                $type {
                    header: Header::new(version, Self::PDU, 0, Self::LEN),
                    flags,
                    prefix_len: origin.prefix_len,
                    max_len: origin.max_len,
                    zero: 0,
                    prefix: $bits::from(origin.prefix).to_be(),
                    asn: origin.asn.to_be(),
                }
            }

            pub fn flags(&self) -> u8 {
                self.flags
            }

            /// Returns the prefix as the type used by the cache.
            pub fn origin(&self) -> payload::$type {
                payload::$type {
                    prefix: $addr::from($bits::from_be(self.prefix)),
                    prefix_len: self.prefix_len,
                    max_len: self.max_len,
                    asn: u32::from_be(self.asn),
                }
            }
        }

        concrete!($type);
    }
}

prefix!(Ipv4Prefix, Ipv4Addr, u32, 4, 20);
prefix!(Ipv6Prefix, Ipv6Addr, u128, 6, 32);


//------------ Payload -------------------------------------------------------

pub enum Payload {
    V4(Ipv4Prefix),
    V6(Ipv6Prefix),
}

impl Payload {
    pub fn new(version: u8, flags: u8, payload: payload::Payload) -> Self {
        match payload {
            payload::Payload::V4(origin) => {
                Payload::V4(Ipv4Prefix::new(version, flags, origin))
            }
            payload::Payload::V6(origin) => {
                Payload::V6(Ipv6Prefix::new(version, flags, origin))
            }
        }
    }

    /// Reads either a payload PDU or the End of Data PDU closing the
    /// sequence.
    pub fn read<R: Read>(
        sock: &mut R
    ) -> Result<Result<Self, EndOfData>, io::Error> {
        let header = Header::read(sock)?;
        match header.pdu() {
            Ipv4Prefix::PDU => {
                Ipv4Prefix::read_payload(header, sock).map(|res| {
                    Ok(Payload::V4(res))
                })
            }
            Ipv6Prefix::PDU => {
                Ipv6Prefix::read_payload(header, sock).map(|res| {
                    Ok(Payload::V6(res))
                })
            }
            EndOfData::PDU => {
                EndOfData::read_payload(header, sock).map(Err)
            }
            _ => {
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unexpected PDU in payload sequence"
                ))
            }
        }
    }

    pub fn version(&self) -> u8 {
        match *self {
            Payload::V4(ref data) => data.version(),
            Payload::V6(ref data) => data.version(),
        }
    }

    pub fn flags(&self) -> u8 {
        match *self {
            Payload::V4(ref data) => data.flags(),
            Payload::V6(ref data) => data.flags(),
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<(), io::Error> {
        w.write_all(self.as_ref())
    }

    pub fn into_payload(self) -> (payload::Action, payload::Payload) {
        let action = payload::Action::from_flags(self.flags());
        match self {
            Payload::V4(data) => (action, payload::Payload::V4(data.origin())),
            Payload::V6(data) => (action, payload::Payload::V6(data.origin())),
        }
    }
}

impl AsRef<[u8]> for Payload {
    fn as_ref(&self) -> &[u8] {
        match *self {
            Payload::V4(ref prefix) => prefix.as_ref(),
            Payload::V6(ref prefix) => prefix.as_ref(),
        }
    }
}


//------------ EndOfData -----------------------------------------------------

/// Generic End-of-Data PDU.
///
/// This PDU differs between version 0 and 1 of RTR. Consequently, this
/// generic version is an enum that can be both, depending on the version
/// requested.
pub enum EndOfData {
    V0(EndOfDataV0),
    V1(EndOfDataV1),
}

impl EndOfData {
    pub const PDU: u8 = 7;

    pub fn new(version: u8, state: State, timing: Timing) -> Self {
        if version == 0 {
            EndOfData::V0(EndOfDataV0::new(state))
        }
        else {
            EndOfData::V1(EndOfDataV1::new(version, state, timing))
        }
    }

    pub fn read_payload<R: Read>(
        header: Header, sock: &mut R
    ) -> Result<Self, io::Error> {
        match header.version() {
            0 => {
                EndOfDataV0::read_payload(header, sock).map(EndOfData::V0)
            }
            1 => {
                EndOfDataV1::read_payload(header, sock).map(EndOfData::V1)
            }
            _ => {
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "invalid version in end of data PDU"
                ))
            }
        }
    }

    pub fn version(&self) -> u8 {
        match *self {
            EndOfData::V0(_) => 0,
            EndOfData::V1(ref data) => data.version(),
        }
    }

    pub fn session(&self) -> u16 {
        match *self {
            EndOfData::V0(ref data) => data.session(),
            EndOfData::V1(ref data) => data.session(),
        }
    }

    pub fn serial(&self) -> Serial {
        match *self {
            EndOfData::V0(ref data) => data.serial(),
            EndOfData::V1(ref data) => data.serial(),
        }
    }

    pub fn state(&self) -> State {
        State::from_parts(self.session(), self.serial())
    }

    pub fn timing(&self) -> Option<Timing> {
        match *self {
            EndOfData::V0(_) => None,
            EndOfData::V1(ref data) => Some(data.timing()),
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<(), io::Error> {
        w.write_all(self.as_ref())
    }
}

impl AsRef<[u8]> for EndOfData {
    fn as_ref(&self) -> &[u8] {
        match *self {
            EndOfData::V0(ref inner) => inner.as_ref(),
            EndOfData::V1(ref inner) => inner.as_ref(),
        }
    }
}


//------------ EndOfDataV0 ---------------------------------------------------

#[derive(Default)]
#[repr(packed)]
#[allow(dead_code)]
pub struct EndOfDataV0 {
    header: Header,
    serial: u32
}

impl EndOfDataV0 {
    pub const PDU: u8 = 7;
    pub const LEN: u32 = 12;

    pub fn new(state: State) -> Self {
        EndOfDataV0 {
            header: Header::new(0, Self::PDU, state.session(), Self::LEN),
            serial: state.serial().to_be()
        }
    }

    pub fn serial(&self) -> Serial {
        Serial::from_be(self.serial)
    }
}

concrete!(EndOfDataV0);


//------------ EndOfDataV1 ---------------------------------------------------

#[derive(Default)]
#[repr(packed)]
#[allow(dead_code)]
pub struct EndOfDataV1 {
    header: Header,
    serial: u32,
    refresh: u32,
    retry: u32,
    expire: u32,
}

impl EndOfDataV1 {
    pub const PDU: u8 = 7;
    pub const LEN: u32 = 24;

    pub fn new(version: u8, state: State, timing: Timing) -> Self {
        EndOfDataV1 {
            header: Header::new(
                version, Self::PDU, state.session(), Self::LEN
            ),
            serial: state.serial().to_be(),
            refresh: timing.refresh.to_be(),
            retry: timing.retry.to_be(),
            expire: timing.expire.to_be(),
        }
    }

    pub fn serial(&self) -> Serial {
        Serial::from_be(self.serial)
    }

    pub fn timing(&self) -> Timing {
        Timing {
            refresh: u32::from_be(self.refresh),
            retry: u32::from_be(self.retry),
            expire: u32::from_be(self.expire),
        }
    }
}

concrete!(EndOfDataV1);


//------------ CacheReset ----------------------------------------------------

#[derive(Default)]
#[repr(packed)]
pub struct CacheReset {
    header: Header
}

impl CacheReset {
    pub const PDU: u8 = 8;
    pub const LEN: u32 = 8;

    pub fn new(version: u8) -> Self {
        CacheReset {
            header: Header::new(version, Self::PDU, 0, Self::LEN)
        }
    }
}

concrete!(CacheReset);


//------------ Error ---------------------------------------------------------

/// An Error Report PDU.
///
/// The erroneous PDU and the error text are included as fixed-size values
/// of type `P` and `T`. Use `()` to leave either out.
#[derive(Default)]
#[repr(packed)]
#[allow(dead_code)]
pub struct Error<P: Sized, T: Sized> {
    header: Header,
    pdu_len: u32,
    pdu: P,
    text_len: u32,
    text: T
}

impl<P, T> Error<P, T>
where
    P: Sized + 'static + Send + Sync,
    T: Sized + 'static + Send + Sync,
{
    pub const PDU: u8 = 10;

    pub fn new(
        version: u8,
        error_code: u16,
        pdu: P,
        text: T
    ) -> Self {
        Error {
            header: Header::new(
                version, Self::PDU, error_code,
                16 + mem::size_of::<P>() as u32 + mem::size_of::<T>() as u32
            ),
            pdu_len: (mem::size_of::<P>() as u32).to_be(),
            pdu,
            text_len: (mem::size_of::<T>() as u32).to_be(),
            text
        }
    }

    pub fn boxed(self) -> BoxedError {
        BoxedError(Box::new(self))
    }
}

impl<P: Sized, T: Sized> Error<P, T> {
    pub fn write<W: Write>(&self, w: &mut W) -> Result<(), io::Error> {
        w.write_all(self.as_ref())
    }
}

impl<P: Sized, T: Sized> AsRef<[u8]> for Error<P, T> {
    fn as_ref(&self) -> &[u8] {
        unsafe {
            slice::from_raw_parts(
                self as *const Self as *const u8,
                mem::size_of::<Self>()
            )
        }
    }
}

/// The PDU type of an Error Report.
pub const ERROR_PDU: u8 = 10;

/// Error codes of an Error Report.
pub mod error_code {
    pub const CORRUPT_DATA: u16 = 0;
    pub const INTERNAL_ERROR: u16 = 1;
    pub const NO_DATA_AVAILABLE: u16 = 2;
    pub const INVALID_REQUEST: u16 = 3;
    pub const UNSUPPORTED_VERSION: u16 = 4;
    pub const UNSUPPORTED_PDU_TYPE: u16 = 5;
    pub const UNEXPECTED_VERSION: u16 = 8;
}


//------------ BoxedError ----------------------------------------------------

pub struct BoxedError(Box<dyn AsRef<[u8]> + Sync + Send>);

impl BoxedError {
    pub fn write<W: Write>(&self, w: &mut W) -> Result<(), io::Error> {
        w.write_all(self.as_ref())
    }

    /// Returns the error code of the report.
    pub fn code(&self) -> u16 {
        let bytes = self.as_ref();
        u16::from_be_bytes([bytes[2], bytes[3]])
    }
}

impl AsRef<[u8]> for BoxedError {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref().as_ref()
    }
}


//------------ ErrorReport ---------------------------------------------------

/// An Error Report received from the other side.
///
/// Only the error code and text are kept.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ErrorReport {
    pub code: u16,
    pub text: String,
}

impl ErrorReport {
    /// The longest Error Report we are willing to read.
    const MAX_LEN: u32 = 64 * 1024;

    pub fn read_payload<R: Read>(
        header: Header, sock: &mut R
    ) -> Result<Self, io::Error> {
        let length = header.length();
        if length < 16 || length > Self::MAX_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid length for Error Report PDU"
            ))
        }
        let mut body = vec![0u8; length as usize - Header::LEN];
        sock.read_exact(&mut body)?;
        let invalid = || io::Error::new(
            io::ErrorKind::InvalidData, "malformed Error Report PDU"
        );
        let pdu_len = read_u32(&body, 0).ok_or_else(invalid)? as usize;
        let text_start = 4usize.checked_add(pdu_len).ok_or_else(invalid)?;
        let text_len = read_u32(&body, text_start).ok_or_else(invalid)?
            as usize;
        let text = body.get(text_start + 4..).and_then(|text| {
            text.get(..text_len)
        }).ok_or_else(invalid)?;
        Ok(ErrorReport {
            code: header.session(),
            text: String::from_utf8_lossy(text).into_owned(),
        })
    }
}

fn read_u32(data: &[u8], start: usize) -> Option<u32> {
    let bytes = data.get(start..start.checked_add(4)?)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}


//------------ Header --------------------------------------------------------

#[derive(Clone, Copy, Default)]
#[repr(packed)]
pub struct Header {
    version: u8,
    pdu: u8,
    session: u16,
    length: u32,
}

impl Header {
    pub const LEN: usize = mem::size_of::<Self>();

    pub fn new(version: u8, pdu: u8, session: u16, length: u32) -> Self {
        Header {
            version,
            pdu,
            session: session.to_be(),
            length: length.to_be(),
        }
    }

    pub fn read<R: Read>(sock: &mut R) -> Result<Self, io::Error> {
        let mut res = Self::default();
        sock.read_exact(res.as_mut())?;
        Ok(res)
    }

    pub fn version(self) -> u8 {
        self.version
    }

    pub fn pdu(self) -> u8 {
        self.pdu
    }

    pub fn session(self) -> u16 {
        u16::from_be(self.session)
    }

    pub fn length(self) -> u32 {
        u32::from_be(self.length)
    }
}

common!(Header);


//------------ Timing --------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timing {
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            refresh: 3600,
            retry: 600,
            expire: 7200
        }
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn sizes() {
        assert_eq!(Header::LEN, 8);
        assert_eq!(mem::size_of::<SerialNotify>(), SerialNotify::LEN as usize);
        assert_eq!(mem::size_of::<SerialQuery>(), SerialQuery::LEN as usize);
        assert_eq!(mem::size_of::<Ipv4Prefix>(), Ipv4Prefix::LEN as usize);
        assert_eq!(mem::size_of::<Ipv6Prefix>(), Ipv6Prefix::LEN as usize);
        assert_eq!(mem::size_of::<EndOfDataV0>(), EndOfDataV0::LEN as usize);
        assert_eq!(mem::size_of::<EndOfDataV1>(), EndOfDataV1::LEN as usize);
    }

    #[test]
    fn serial_query_wire_format() {
        let query = SerialQuery::new(1, State::from_parts(0x1234, Serial(7)));
        assert_eq!(
            query.as_ref(),
            &[1, 1, 0x12, 0x34, 0, 0, 0, 12, 0, 0, 0, 7]
        );
        let read = SerialQuery::read(&mut Cursor::new(query.as_ref()))
            .unwrap();
        assert_eq!(read.session(), 0x1234);
        assert_eq!(read.serial(), Serial(7));
    }

    #[test]
    fn cache_reset_pdu_type() {
        assert_eq!(CacheReset::new(1).as_ref(), &[1, 8, 0, 0, 0, 0, 0, 8]);
    }

    #[test]
    fn end_of_data_versions() {
        let state = State::from_parts(3, Serial(12));
        let mut buf = Vec::new();
        EndOfData::new(0, state, Timing::default()).write(&mut buf).unwrap();
        EndOfData::new(1, state, Timing::default()).write(&mut buf).unwrap();
        assert_eq!(buf.len(), 12 + 24);

        let mut sock = Cursor::new(buf);
        let v0 = match Payload::read(&mut sock).unwrap() {
            Err(eod) => eod,
            Ok(_) => panic!("expected end of data"),
        };
        assert_eq!(v0.version(), 0);
        assert_eq!(v0.state(), state);
        assert_eq!(v0.timing(), None);
        let v1 = match Payload::read(&mut sock).unwrap() {
            Err(eod) => eod,
            Ok(_) => panic!("expected end of data"),
        };
        assert_eq!(v1.version(), 1);
        assert_eq!(v1.state(), state);
        assert_eq!(v1.timing(), Some(Timing::default()));
    }

    #[test]
    fn error_report() {
        let header = Header::new(1, 2, 0, 8);
        let report = Error::new(
            1, error_code::INVALID_REQUEST, header, *b"bad"
        ).boxed();
        assert_eq!(report.code(), error_code::INVALID_REQUEST);
        assert_eq!(report.as_ref().len(), 16 + 8 + 3);

        let mut sock = Cursor::new(report.as_ref());
        let header = Header::read(&mut sock).unwrap();
        assert_eq!(header.pdu(), ERROR_PDU);
        let report = ErrorReport::read_payload(header, &mut sock).unwrap();
        assert_eq!(report.code, error_code::INVALID_REQUEST);
        assert_eq!(report.text, "bad");
    }

    #[test]
    fn payload_into_payload() {
        let vrp = payload::Payload::new(
            Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0).into(), 32, 48, 65
        );
        let pdu = Payload::new(1, 1, vrp);
        let mut sock = Cursor::new(pdu.as_ref().to_vec());
        let read = match Payload::read(&mut sock).unwrap() {
            Ok(payload) => payload,
            Err(_) => panic!("expected payload"),
        };
        assert_eq!(read.into_payload(), (payload::Action::Announce, vrp));
    }
}
