//! Reading an RTR query from a client.

use std::io;
use std::io::Read;
use log::debug;
use crate::pdu;
use crate::pdu::error_code;
use crate::state::State;


/// The highest protocol version we support.
pub const MAX_VERSION: u8 = 1;


//------------ Query ---------------------------------------------------------

pub enum Query {
    /// A Serial Query for the given state.
    Serial(State),

    /// A Reset Query.
    Reset,

    /// The query was bad. Send the error and close the connection.
    Error(pdu::BoxedError),

    /// The client reported an error. Close the connection.
    Report(pdu::ErrorReport),
}


//------------ QueryStream ---------------------------------------------------

pub struct QueryStream<R> {
    sock: R,
    version: Option<u8>
}

impl<R> QueryStream<R> {
    pub fn new(sock: R) -> Self {
        QueryStream { sock, version: None }
    }

    /// Returns the protocol version we agreed on.
    ///
    /// If there hasn’t been a negotiation yet, returns the lowest protocol
    /// version we support, which currently is 0.
    pub fn version(&self) -> u8 {
        self.version.unwrap_or(0)
    }

    /// Returns the protocol version if it has been agreed on.
    pub fn negotiated(&self) -> Option<u8> {
        self.version
    }
}

impl<R: Read> QueryStream<R> {
    /// Receives the next query.
    ///
    /// Returns `Ok(None)` if the client closed the connection.
    pub fn recv(&mut self) -> Result<Option<Query>, io::Error> {
        let header = match pdu::Header::read(&mut self.sock) {
            Ok(header) => header,
            Err(err) => {
                if err.kind() == io::ErrorKind::UnexpectedEof {
                    return Ok(None)
                }
                else {
                    return Err(err)
                }
            }
        };
        if header.pdu() == pdu::ERROR_PDU {
            debug!("RTR: Got error report.");
            return pdu::ErrorReport::read_payload(
                header, &mut self.sock
            ).map(|report| Some(Query::Report(report)))
        }
        if let Err(err) = self.check_version(header) {
            return Ok(Some(err))
        }
        match header.pdu() {
            pdu::SerialQuery::PDU => {
                debug!("RTR: Got serial query.");
                match Self::check_length(header, pdu::SerialQuery::LEN) {
                    Ok(()) => {
                        let payload = pdu::SerialQueryPayload::read(
                            &mut self.sock
                        )?;
                        Ok(Some(Query::Serial(State::from_parts(
                            header.session(), payload.serial()
                        ))))
                    }
                    Err(err) => {
                        debug!("RTR: ... with bad length");
                        Ok(Some(err))
                    }
                }
            }
            pdu::ResetQuery::PDU => {
                debug!("RTR: Got reset query.");
                match Self::check_length(header, pdu::ResetQuery::LEN) {
                    Ok(()) => Ok(Some(Query::Reset)),
                    Err(err) => {
                        debug!("RTR: ... with bad length");
                        Ok(Some(err))
                    }
                }
            }
            pdu::SerialNotify::PDU | pdu::CacheResponse::PDU
            | pdu::Ipv4Prefix::PDU | pdu::Ipv6Prefix::PDU
            | pdu::EndOfData::PDU | pdu::CacheReset::PDU => {
                debug!("RTR: Got cache PDU {}.", header.pdu());
                Ok(Some(Query::Error(
                    pdu::Error::new(
                        header.version(),
                        error_code::INVALID_REQUEST,
                        header,
                        *b"expected Serial Query or Reset Query"
                    ).boxed()
                )))
            }
            pdu => {
                debug!("RTR: Got query with PDU {}.", pdu);
                Ok(Some(Query::Error(
                    pdu::Error::new(
                        header.version(),
                        error_code::UNSUPPORTED_PDU_TYPE,
                        header,
                        *b"unsupported PDU type"
                    ).boxed()
                )))
            }
        }
    }

    /// Checks the version of a PDU.
    ///
    /// Returns an error with the error PDU if the version doesn’t match with
    /// what we agreed upon earlier.
    fn check_version(
        &mut self,
        header: pdu::Header
    ) -> Result<(), Query> {
        if let Some(current) = self.version {
            if current != header.version() {
                Err(Query::Error(
                    pdu::Error::new(
                        current,
                        error_code::UNEXPECTED_VERSION,
                        header,
                        *b"version switched during connection"
                    ).boxed()
                ))
            }
            else {
                Ok(())
            }
        }
        else if header.version() > MAX_VERSION {
            Err(Query::Error(
                pdu::Error::new(
                    MAX_VERSION,
                    error_code::UNSUPPORTED_VERSION,
                    header,
                    *b"only versions 0 and 1 supported"
                ).boxed()
            ))
        }
        else {
            self.version = Some(header.version());
            Ok(())
        }
    }

    /// Checks that the size of a PDU matches an expected size.
    fn check_length(header: pdu::Header, expected: u32) -> Result<(), Query> {
        if header.length() != expected {
            Err(Query::Error(
                pdu::Error::new(
                    header.version(),
                    error_code::INVALID_REQUEST,
                    header,
                    *b"invalid length"
                ).boxed()
            ))
        }
        else {
            Ok(())
        }
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;
    use crate::serial::Serial;

    fn queries(data: Vec<u8>) -> QueryStream<Cursor<Vec<u8>>> {
        QueryStream::new(Cursor::new(data))
    }

    fn code_of(query: Option<Query>) -> u16 {
        match query {
            Some(Query::Error(err)) => err.code(),
            _ => panic!("expected error"),
        }
    }

    #[test]
    fn serial_and_reset() {
        let mut data = Vec::new();
        pdu::ResetQuery::new(1).write(&mut data).unwrap();
        pdu::SerialQuery::new(
            1, State::from_parts(4, Serial(17))
        ).write(&mut data).unwrap();
        let mut stream = queries(data);
        assert_eq!(stream.negotiated(), None);
        assert!(matches!(stream.recv().unwrap(), Some(Query::Reset)));
        assert_eq!(stream.negotiated(), Some(1));
        match stream.recv().unwrap() {
            Some(Query::Serial(state)) => {
                assert_eq!(state, State::from_parts(4, Serial(17)))
            }
            _ => panic!("expected serial query"),
        }
        assert!(stream.recv().unwrap().is_none());
    }

    #[test]
    fn version_switch() {
        let mut data = Vec::new();
        pdu::ResetQuery::new(0).write(&mut data).unwrap();
        pdu::ResetQuery::new(1).write(&mut data).unwrap();
        let mut stream = queries(data);
        assert!(matches!(stream.recv().unwrap(), Some(Query::Reset)));
        assert_eq!(
            code_of(stream.recv().unwrap()),
            error_code::UNEXPECTED_VERSION
        );
    }

    #[test]
    fn unsupported_version() {
        let mut data = Vec::new();
        pdu::ResetQuery::new(2).write(&mut data).unwrap();
        let mut stream = queries(data);
        assert_eq!(
            code_of(stream.recv().unwrap()),
            error_code::UNSUPPORTED_VERSION
        );
        assert_eq!(stream.negotiated(), None);
    }

    #[test]
    fn bad_pdus() {
        let mut stream = queries(pdu::Header::new(1, 2, 0, 12).as_ref().into());
        assert_eq!(
            code_of(stream.recv().unwrap()), error_code::INVALID_REQUEST
        );

        let mut stream = queries(pdu::CacheReset::new(1).as_ref().into());
        assert_eq!(
            code_of(stream.recv().unwrap()), error_code::INVALID_REQUEST
        );

        let mut stream = queries(pdu::Header::new(1, 42, 0, 8).as_ref().into());
        assert_eq!(
            code_of(stream.recv().unwrap()),
            error_code::UNSUPPORTED_PDU_TYPE
        );
    }

    #[test]
    fn error_report() {
        let mut data = Vec::new();
        pdu::Error::new(
            1, error_code::CORRUPT_DATA, (), *b"oops"
        ).write(&mut data).unwrap();
        match queries(data).recv().unwrap() {
            Some(Query::Report(report)) => {
                assert_eq!(report.code, error_code::CORRUPT_DATA);
                assert_eq!(report.text, "oops");
            }
            _ => panic!("expected error report"),
        }
    }
}
