//! A database reading VRPs from a JSON file.
//!
//! The file uses the format produced by most relying party software:
//!
//! ```json
//! {
//!   "roas": [
//!     { "asn": "AS64496", "prefix": "192.0.2.0/24", "maxLength": 24 }
//!   ]
//! }
//! ```
//!
//! The file is read anew every time the VRPs are loaded. Deltas are kept in
//! memory.

use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use log::debug;
use parking_lot::Mutex;
use serde::Deserialize;
use crate::payload::{Dataset, Delta, Payload};
use crate::serial::Serial;
use crate::state::State;
use super::{Connect, Database, DbError, DeltaLog};


//------------ JsonDb --------------------------------------------------------

#[derive(Clone, Debug)]
pub struct JsonDb {
    path: Arc<PathBuf>,
    deltas: Arc<Mutex<DeltaLog>>,
}

impl JsonDb {
    pub fn new(path: impl Into<PathBuf>, history: usize) -> Self {
        JsonDb {
            path: Arc::new(path.into()),
            deltas: Arc::new(Mutex::new(DeltaLog::new(history))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Connect for JsonDb {
    type Conn = JsonConnection;

    fn connect(&self) -> Result<Self::Conn, DbError> {
        if !self.path.is_file() {
            return Err(DbError::new(format!(
                "VRP file {} not found", self.path.display()
            )))
        }
        Ok(JsonConnection {
            path: self.path.clone(),
            deltas: self.deltas.clone(),
        })
    }
}


//------------ JsonConnection ------------------------------------------------

#[derive(Debug)]
pub struct JsonConnection {
    path: Arc<PathBuf>,
    deltas: Arc<Mutex<DeltaLog>>,
}

impl Database for JsonConnection {
    fn load_vrps(&mut self) -> Result<Dataset, DbError> {
        debug!("Reading VRPs from {}", self.path.display());
        let file = File::open(&*self.path).map_err(|err| {
            DbError::new(format!(
                "failed to open {}: {}", self.path.display(), err
            ))
        })?;
        let json: JsonVrps = serde_json::from_reader(BufReader::new(file))?;
        json.roas.iter().map(JsonRoa::to_payload).collect()
    }

    fn store_delta(
        &mut self, state: State, delta: &Delta
    ) -> Result<(), DbError> {
        self.deltas.lock().push(state, delta);
        Ok(())
    }

    fn load_delta(
        &mut self, session: u16, from: Serial, to: Serial
    ) -> Result<Option<Delta>, DbError> {
        Ok(self.deltas.lock().collect(session, from, to))
    }
}


//------------ JsonVrps and JsonRoa ------------------------------------------

#[derive(Deserialize)]
struct JsonVrps {
    roas: Vec<JsonRoa>,
}

#[derive(Deserialize)]
struct JsonRoa {
    asn: JsonAsn,
    prefix: String,
    #[serde(rename = "maxLength")]
    max_length: u8,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonAsn {
    Number(u32),
    Text(String),
}

impl JsonRoa {
    fn to_payload(&self) -> Result<Payload, DbError> {
        let asn = match self.asn {
            JsonAsn::Number(asn) => asn,
            JsonAsn::Text(ref text) => {
                let digits = text.strip_prefix("AS")
                    .or_else(|| text.strip_prefix("as"))
                    .unwrap_or(text.as_str());
                u32::from_str(digits).map_err(|_| {
                    DbError::new(format!("invalid ASN '{}'", text))
                })?
            }
        };
        let invalid = || DbError::new(
            format!("invalid prefix '{}'", self.prefix)
        );
        let mut parts = self.prefix.splitn(2, '/');
        let addr = parts.next().and_then(|addr| {
            IpAddr::from_str(addr).ok()
        }).ok_or_else(invalid)?;
        let len = parts.next().and_then(|len| {
            u8::from_str(len).ok()
        }).ok_or_else(invalid)?;
        let bits = if addr.is_ipv4() { 32 } else { 128 };
        if len > bits || self.max_length < len || self.max_length > bits {
            return Err(invalid())
        }
        Ok(Payload::new(addr, len, self.max_length, asn))
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::{env, fs, process};
    use std::net::Ipv4Addr;

    fn write_file(name: &str, content: &str) -> PathBuf {
        let path = env::temp_dir().join(format!(
            "rtr-json-{}-{}.json", process::id(), name
        ));
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn load_vrps() {
        let path = write_file("good", r#"{"roas": [
            {"asn": "AS64496", "prefix": "192.0.2.0/24", "maxLength": 24},
            {"asn": 64497, "prefix": "2001:db8::/32", "maxLength": 48}
        ]}"#);
        let mut conn = JsonDb::new(&path, 5).connect().unwrap();
        let vrps = conn.load_vrps().unwrap();
        assert_eq!(vrps.len(), 2);
        assert!(vrps.contains(&Payload::new(
            Ipv4Addr::new(192, 0, 2, 0).into(), 24, 24, 64496
        )));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn reject_bad_prefix() {
        let path = write_file("bad", r#"{"roas": [
            {"asn": "AS64496", "prefix": "192.0.2.0/33", "maxLength": 33}
        ]}"#);
        let mut conn = JsonDb::new(&path, 5).connect().unwrap();
        assert!(conn.load_vrps().is_err());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_file() {
        assert!(JsonDb::new("/nonexistent/vrps.json", 5).connect().is_err());
    }
}
