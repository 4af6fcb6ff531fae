//! VID:PID device filters
//!
//! Filters are written as `0xVID:0xPID` where either half may be `*`, e.g.
//! `0x18d1:*` matches every Google device.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid filter '{filter}': {reason}")]
pub struct FilterParseError {
    filter: String,
    reason: String,
}

/// One VID:PID pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    vendor_id: Option<u16>,
    product_id: Option<u16>,
}

impl DeviceFilter {
    pub const ANY: Self = Self {
        vendor_id: None,
        product_id: None,
    };

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|v| v == vendor_id)
            && self.product_id.is_none_or(|p| p == product_id)
    }

    /// True if `filters` is empty or any filter matches
    pub fn any_matches(filters: &[DeviceFilter], vendor_id: u16, product_id: u16) -> bool {
        filters.is_empty() || filters.iter().any(|f| f.matches(vendor_id, product_id))
    }

    fn parse_id(filter: &str, part: &str, name: &str) -> Result<Option<u16>, FilterParseError> {
        if part == "*" {
            return Ok(None);
        }

        let error = |reason: String| FilterParseError {
            filter: filter.to_string(),
            reason,
        };

        let hex = part
            .strip_prefix("0x")
            .or_else(|| part.strip_prefix("0X"))
            .ok_or_else(|| error(format!("{} '{}' must start with '0x'", name, part)))?;

        if hex.is_empty() || hex.len() > 4 {
            return Err(error(format!("{} '{}' must have 1-4 hex digits", name, part)));
        }

        u16::from_str_radix(hex, 16)
            .map(Some)
            .map_err(|_| error(format!("{} '{}' is not a valid hex number", name, part)))
    }
}

impl FromStr for DeviceFilter {
    type Err = FilterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let [vid, pid] = parts.as_slice() else {
            return Err(FilterParseError {
                filter: s.to_string(),
                reason: "expected VID:PID (e.g. '0x1234:0x5678' or '0x1234:*')".to_string(),
            });
        };

        Ok(Self {
            vendor_id: Self::parse_id(s, vid, "VID")?,
            product_id: Self::parse_id(s, pid, "PID")?,
        })
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vendor_id {
            Some(v) => write!(f, "{:#06x}", v)?,
            None => f.write_str("*")?,
        }
        f.write_str(":")?;
        match self.product_id {
            Some(p) => write!(f, "{:#06x}", p),
            None => f.write_str("*"),
        }
    }
}
