// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::fmt;
use std::str::FromStr;

/// 128-bit identifier split into two halves, formatted as a canonical UUID.
///
/// Data parts carry one of these; `Nil` (all zeroes) means the part was
/// created before uuids were assigned.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct UniqueId {
    pub hi: u64,
    pub lo: u64,
}

impl UniqueId {
    pub const NIL: UniqueId = UniqueId { hi: 0, lo: 0 };

    pub fn is_nil(self) -> bool {
        self.hi == 0 && self.lo == 0
    }

    pub fn to_uuid_string(self) -> String {
        format_uuid(self.hi, self.lo)
    }
}

pub fn format_uuid(hi: u64, lo: u64) -> String {
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        (hi >> 32) as u32,
        (hi >> 16) as u16,
        hi as u16,
        (lo >> 48) as u16,
        lo & 0x0000_FFFF_FFFF_FFFF
    )
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_uuid(self.hi, self.lo))
    }
}

impl FromStr for UniqueId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 36 || bytes[8] != b'-' || bytes[13] != b'-' || bytes[18] != b'-' || bytes[23] != b'-' {
            return Err(format!("invalid uuid string '{}'", s));
        }
        let hex: String = s.chars().filter(|c| *c != '-').collect();
        if hex.len() != 32 {
            return Err(format!("invalid uuid string '{}'", s));
        }
        let hi = u64::from_str_radix(&hex[..16], 16).map_err(|e| format!("invalid uuid '{}': {}", s, e))?;
        let lo = u64::from_str_radix(&hex[16..], 16).map_err(|e| format!("invalid uuid '{}': {}", s, e))?;
        Ok(UniqueId { hi, lo })
    }
}

#[cfg(test)]
mod tests {
    use super::UniqueId;

    #[test]
    fn uuid_display_round_trips_through_parse() {
        let id = UniqueId { hi: 0x019c_98a9_3390_7576, lo: 0x977b_33d1_88ad_1f06 };
        let text = id.to_string();
        assert_eq!(text, "019c98a9-3390-7576-977b-33d188ad1f06");
        assert_eq!(text.parse::<UniqueId>().expect("parse uuid"), id);
    }

    #[test]
    fn nil_uuid_is_all_zero() {
        let id = UniqueId::NIL;
        assert!(id.is_nil());
        assert_eq!(id.to_string(), "00000000-0000-0000-0000-000000000000");
    }

    #[test]
    fn malformed_uuid_is_rejected() {
        assert!("not-a-uuid".parse::<UniqueId>().is_err());
        assert!("019c98a9-3390-7576-977b-33d188ad1f0".parse::<UniqueId>().is_err());
    }
}
