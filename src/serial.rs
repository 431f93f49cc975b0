//! Serial numbers.
//!
//! RTR uses serial numbers to tag versions of the data set. They are 32 bit
//! unsigned integers that wrap around and are compared using the rules of
//! serial number arithmetic defined in [RFC 1982]. In particular, not every
//! pair of serial numbers can be compared, so [`Serial`] only implements
//! `PartialOrd`.
//!
//! [RFC 1982]: https://tools.ietf.org/html/rfc1982

use std::{cmp, fmt};


//------------ Serial --------------------------------------------------------

/// A serial number.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Serial(pub u32);

impl Serial {
    /// Creates a serial number from a value in network byte order.
    pub fn from_be(value: u32) -> Self {
        Serial(u32::from_be(value))
    }

    /// Returns the serial number in network byte order.
    pub fn to_be(self) -> u32 {
        self.0.to_be()
    }

    /// Adds `other` to the serial number.
    ///
    /// Serial number addition is only defined for values up to 2^31 - 1.
    ///
    /// # Panics
    ///
    /// The method panics if `other` is larger than that.
    #[allow(clippy::should_implement_trait)]
    pub fn add(self, other: u32) -> Self {
        assert!(other <= 0x7FFF_FFFF, "serial number addend too large");
        Serial(self.0.wrapping_add(other))
    }

    /// Returns the serial number following this one.
    pub fn next(self) -> Self {
        self.add(1)
    }
}


//--- From

impl From<u32> for Serial {
    fn from(value: u32) -> Self {
        Serial(value)
    }
}

impl From<Serial> for u32 {
    fn from(serial: Serial) -> u32 {
        serial.0
    }
}


//--- PartialOrd

impl PartialOrd for Serial {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        let (a, b) = (self.0, other.0);
        if a == b {
            Some(cmp::Ordering::Equal)
        }
        else if (a < b && b - a < 0x8000_0000)
            || (a > b && a - b > 0x8000_0000)
        {
            Some(cmp::Ordering::Less)
        }
        else if (a < b && b - a > 0x8000_0000)
            || (a > b && a - b < 0x8000_0000)
        {
            Some(cmp::Ordering::Greater)
        }
        else {
            None
        }
    }
}


//--- Display

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}


//============ Testing =======================================================
