use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A request from the channel layer to call `number` via `device`.
///
/// Written `<device>/<number>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialString {
    /// The logical device name.
    pub device: String,

    /// The number to dial.
    pub number: String,
}

/// Characters a modem accepts in a dial command.
fn is_dial_char(c: char) -> bool {
    c.is_ascii_digit() || matches!(c, '+' | '*' | '#' | 'p' | 'P' | 'w' | 'W' | ',')
}

/// Reject numbers which would be empty on the wire,
/// or which could smuggle other commands into `ATD<number>;`.
pub fn validate_number(number: &str) -> Result<(), Error> {
    if number.is_empty() || !number.chars().all(is_dial_char) {
        return Err(Error::BadDialString(number.to_owned()));
    }

    Ok(())
}

impl FromStr for DialString {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || Error::BadDialString(s.to_owned());

        let (device, number) = s.trim().split_once('/').ok_or_else(bad)?;

        if device.is_empty() {
            return Err(bad());
        }
        validate_number(number).map_err(|_| bad())?;

        Ok(Self {
            device: device.to_owned(),
            number: number.to_owned(),
        })
    }
}

impl Display for DialString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.device, self.number)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses() {
        let dial: DialString = "m1/12345".parse().unwrap();

        assert_eq!(
            dial,
            DialString {
                device: "m1".into(),
                number: "12345".into()
            }
        );
        assert_eq!(dial.to_string(), "m1/12345");

        let dial: DialString = "office/+4722*31#".parse().unwrap();
        assert_eq!(dial.number, "+4722*31#");
    }

    #[test]
    fn malformed() {
        for bad in ["m1", "/12345", "m1/", "", "/", "m1/12;ATH", "m1/12 34"] {
            let result = bad.parse::<DialString>();
            assert!(
                matches!(result, Err(Error::BadDialString(_))),
                "{bad:?} gave {result:?}"
            );
        }
    }
}
