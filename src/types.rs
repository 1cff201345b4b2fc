/// Common types shared by the container readers and writers.
///
/// This module contains the `FourCC` box name type with the box names and
/// brands we know about, the kind of a track, and the 1904-based
/// timestamps used in MP4 headers.
///
use std::fmt::{Debug, Display};

use chrono::{self, offset::{Local, TimeZone}, Utc};
use serde::Serialize;

/// FourCC is the 4-byte name of any box. Usually this is four bytes
/// of ASCII characters, but it could be anything.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FourCC(pub u32);

impl FourCC {
    pub fn to_bytes(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl From<&[u8; 4]> for FourCC {
    fn from(b: &[u8; 4]) -> FourCC {
        FourCC(u32::from_be_bytes(*b))
    }
}

fn fmt_fourcc(fourcc: u32) -> String {
    let c = fourcc.to_be_bytes();
    if c.iter().any(|&b| b < 32 || b > 126) {
        return format!("0x{:x}", fourcc);
    }
    c.iter().map(|&b| b as char).collect()
}

impl Display for FourCC {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", fmt_fourcc(self.0))
    }
}

impl Debug for FourCC {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "\"{}\"", fmt_fourcc(self.0))
    }
}

impl Serialize for FourCC {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&fmt_fourcc(self.0))
    }
}

// Box names.
pub const FTYP: FourCC = FourCC(0x66747970);
pub const MOOV: FourCC = FourCC(0x6D6F6F76);
pub const MVHD: FourCC = FourCC(0x6D766864);
pub const TRAK: FourCC = FourCC(0x7472616B);
pub const TKHD: FourCC = FourCC(0x746B6864);
pub const EDTS: FourCC = FourCC(0x65647473);
pub const ELST: FourCC = FourCC(0x656C7374);
pub const MDIA: FourCC = FourCC(0x6D646961);
pub const MDHD: FourCC = FourCC(0x6D646864);
pub const HDLR: FourCC = FourCC(0x68646C72);
pub const MINF: FourCC = FourCC(0x6D696E66);
pub const DINF: FourCC = FourCC(0x64696E66);
pub const STBL: FourCC = FourCC(0x7374626C);
pub const STSD: FourCC = FourCC(0x73747364);
pub const VMHD: FourCC = FourCC(0x766D6864);
pub const SMHD: FourCC = FourCC(0x736D6864);
pub const MVEX: FourCC = FourCC(0x6D766578);
pub const TREX: FourCC = FourCC(0x74726578);
pub const MOOF: FourCC = FourCC(0x6D6F6F66);
pub const MFHD: FourCC = FourCC(0x6D666864);
pub const TRAF: FourCC = FourCC(0x74726166);
pub const TFHD: FourCC = FourCC(0x74666864);
pub const TFDT: FourCC = FourCC(0x74666474);
pub const TRUN: FourCC = FourCC(0x7472756E);
pub const MDAT: FourCC = FourCC(0x6D646174);
pub const SIDX: FourCC = FourCC(0x73696478);
pub const MFRA: FourCC = FourCC(0x6D667261);
pub const STTS: FourCC = FourCC(0x73747473);
pub const STSS: FourCC = FourCC(0x73747373);
pub const CTTS: FourCC = FourCC(0x63747473);
pub const STSC: FourCC = FourCC(0x73747363);
pub const STSZ: FourCC = FourCC(0x7374737A);
pub const STCO: FourCC = FourCC(0x7374636F);
pub const CO64: FourCC = FourCC(0x636F3634);

// Brands.
pub const BRAND_DASH: FourCC = FourCC(0x64617368);
pub const BRAND_ISO5: FourCC = FourCC(0x69736F35);
pub const BRAND_MP41: FourCC = FourCC(0x6D703431);
pub const BRAND_MP42: FourCC = FourCC(0x6D703432);
pub const BRAND_ISOM: FourCC = FourCC(0x69736F6D);
pub const BRAND_ISO2: FourCC = FourCC(0x69736F32);
pub const BRAND_M4A: FourCC = FourCC(0x4D344120);

// Handler types.
pub const HANDLER_VIDE: FourCC = FourCC(0x76696465);
pub const HANDLER_SOUN: FourCC = FourCC(0x736F756E);
pub const HANDLER_SUBT: FourCC = FourCC(0x73756274);

/// What a track carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TrackKind {
    Audio,
    Video,
    Subtitles,
    Other,
}

impl Default for TrackKind {
    fn default() -> TrackKind {
        TrackKind::Other
    }
}

impl TrackKind {
    /// Kind from an MP4 handler subtype.
    pub fn from_handler(subtype: FourCC) -> TrackKind {
        match subtype {
            HANDLER_VIDE => TrackKind::Video,
            HANDLER_SOUN => TrackKind::Audio,
            HANDLER_SUBT => TrackKind::Subtitles,
            _ => TrackKind::Other,
        }
    }

    /// Kind from a Matroska TrackType value.
    pub fn from_webm_type(track_type: u64) -> TrackKind {
        match track_type {
            1 => TrackKind::Video,
            2 => TrackKind::Audio,
            0x11 => TrackKind::Subtitles,
            _ => TrackKind::Other,
        }
    }
}

/// Time is a value measured in seconds since 01-01-1904 00:00:00
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Time(pub u64);

// TZ=UTC date +%s -d "1904-01-01 00:00:00"
pub const OFFSET_TO_UNIX: u64 = 2082844800;

impl Time {
    pub fn now() -> Time {
        Time(Utc::now().timestamp() as u64 + OFFSET_TO_UNIX)
    }

    fn to_unixtime(&self) -> i64 {
        (self.0 as i64) - (OFFSET_TO_UNIX as i64)
    }

    fn to_rfc3339(&self) -> String {
        match Local.timestamp_opt(self.to_unixtime(), 0).single() {
            Some(t) => t.to_rfc3339(),
            None => format!("{}", self.0),
        }
    }
}

impl Debug for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_fmt() {
        assert_eq!(MOOF.to_string(), "moof");
        assert_eq!(format!("{:?}", BRAND_M4A), "\"M4A \"");
        assert_eq!(FourCC(0x01020304).to_string(), "0x1020304");
        assert_eq!(FourCC::from(b"mdat"), MDAT);
    }

    #[test]
    fn test_track_kind() {
        assert_eq!(TrackKind::from_handler(HANDLER_SOUN), TrackKind::Audio);
        assert_eq!(TrackKind::from_handler(FourCC::from(b"text")), TrackKind::Other);
        assert_eq!(TrackKind::from_webm_type(1), TrackKind::Video);
        assert_eq!(TrackKind::from_webm_type(0x11), TrackKind::Subtitles);
    }

    #[test]
    fn test_time_now_is_after_1904() {
        let t = Time::now();
        assert!(t.0 > OFFSET_TO_UNIX + 1_600_000_000);
        assert!(t.to_unixtime() > 0);
    }

    #[test]
    fn test_time_debug() {
        // 2001-09-09T01:46:40Z, a day either way in local time.
        let s = format!("{:?}", Time(OFFSET_TO_UNIX + 1_000_000_000));
        assert!(s.starts_with("\"2001-09-0"), "{}", s);
    }
}
