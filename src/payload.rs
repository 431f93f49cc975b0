//! The data being transmitted via RTR.
//!
//! The types in here provide a more compact representation than the PDUs.
//! They also implement all the traits to use them as keys in collections to
//! be able to perform difference processing.
//!
//! A complete, immutable set of payload is a [`Dataset`]. The changes
//! between two data sets are a [`Delta`].

use std::collections::BTreeSet;
use std::iter::FromIterator;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::slice;


//------------ Ipv4Prefix, Ipv6Prefix ----------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Ipv4Prefix {
    pub prefix: Ipv4Addr,
    pub prefix_len: u8,
    pub max_len: u8,
    pub asn: u32
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Ipv6Prefix {
    pub prefix: Ipv6Addr,
    pub prefix_len: u8,
    pub max_len: u8,
    pub asn: u32
}


//------------ Payload -------------------------------------------------------

/// A single validated ROA payload.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Payload {
    V4(Ipv4Prefix),
    V6(Ipv6Prefix)
}

impl Payload {
    /// Creates a payload for either address family.
    pub fn new(prefix: IpAddr, prefix_len: u8, max_len: u8, asn: u32) -> Self {
        match prefix {
            IpAddr::V4(prefix) => {
                Payload::V4(Ipv4Prefix { prefix, prefix_len, max_len, asn })
            }
            IpAddr::V6(prefix) => {
                Payload::V6(Ipv6Prefix { prefix, prefix_len, max_len, asn })
            }
        }
    }

    pub fn asn(&self) -> u32 {
        match *self {
            Payload::V4(ref prefix) => prefix.asn,
            Payload::V6(ref prefix) => prefix.asn,
        }
    }
}


//------------ Action --------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Action {
    Announce,
    Withdraw,
}

impl Action {
    pub fn from_flags(flags: u8) -> Self {
        if flags & 1 == 1 {
            Action::Announce
        }
        else {
            Action::Withdraw
        }
    }

    pub fn into_flags(self) -> u8 {
        match self {
            Action::Announce => 1,
            Action::Withdraw => 0
        }
    }
}


//------------ Dataset -------------------------------------------------------

/// A complete set of payload.
///
/// The payload is kept sorted and free of duplicates which allows
/// calculating the difference to another data set in a single pass.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Dataset {
    payload: Vec<Payload>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<Payload> {
        self.payload.iter()
    }

    pub fn contains(&self, payload: &Payload) -> bool {
        self.payload.binary_search(payload).is_ok()
    }

    /// Returns the changes necessary to get from `self` to `new`.
    pub fn delta_to(&self, new: &Dataset) -> Delta {
        let mut delta = Delta::new();
        let mut old_iter = self.payload.iter().peekable();
        let mut new_iter = new.payload.iter().peekable();
        loop {
            match (old_iter.peek(), new_iter.peek()) {
                (Some(old), Some(new)) => {
                    if old < new {
                        delta.withdraw.insert(**old);
                        old_iter.next();
                    }
                    else if new < old {
                        delta.announce.insert(**new);
                        new_iter.next();
                    }
                    else {
                        old_iter.next();
                        new_iter.next();
                    }
                }
                (Some(old), None) => {
                    delta.withdraw.insert(**old);
                    old_iter.next();
                }
                (None, Some(new)) => {
                    delta.announce.insert(**new);
                    new_iter.next();
                }
                (None, None) => break
            }
        }
        delta
    }
}

impl FromIterator<Payload> for Dataset {
    fn from_iter<I: IntoIterator<Item = Payload>>(iter: I) -> Self {
        let mut payload: Vec<_> = iter.into_iter().collect();
        payload.sort_unstable();
        payload.dedup();
        Dataset { payload }
    }
}

impl<'a> IntoIterator for &'a Dataset {
    type Item = &'a Payload;
    type IntoIter = slice::Iter<'a, Payload>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}


//------------ Delta ---------------------------------------------------------

/// The changes between two data sets.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Delta {
    announce: BTreeSet<Payload>,
    withdraw: BTreeSet<Payload>,
}

impl Delta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.announce.is_empty() && self.withdraw.is_empty()
    }

    pub fn len(&self) -> usize {
        self.announce.len() + self.withdraw.len()
    }

    pub fn announced(&self) -> impl Iterator<Item = &Payload> {
        self.announce.iter()
    }

    pub fn withdrawn(&self) -> impl Iterator<Item = &Payload> {
        self.withdraw.iter()
    }

    /// Adds a single change.
    ///
    /// A change that reverts an earlier change in the delta cancels it.
    pub fn push(&mut self, action: Action, payload: Payload) {
        match action {
            Action::Announce => {
                if !self.withdraw.remove(&payload) {
                    self.announce.insert(payload);
                }
            }
            Action::Withdraw => {
                if !self.announce.remove(&payload) {
                    self.withdraw.insert(payload);
                }
            }
        }
    }

    /// Appends the changes of a later delta to this one.
    pub fn merge(&mut self, later: &Delta) {
        for payload in &later.announce {
            self.push(Action::Announce, *payload)
        }
        for payload in &later.withdraw {
            self.push(Action::Withdraw, *payload)
        }
    }

    /// Returns an iterator over all changes, withdrawals first.
    pub fn iter(&self) -> impl Iterator<Item = (Action, Payload)> + '_ {
        self.withdraw.iter().map(|p| (Action::Withdraw, *p)).chain(
            self.announce.iter().map(|p| (Action::Announce, *p))
        )
    }
}


//============ Testing =======================================================
