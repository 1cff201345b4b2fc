use serde::Serialize;

use crate::mp4_dash_reader::Mp4Track;
use crate::types::*;
use crate::webm_reader::{Info, WebMTrack};

/// General track information.
#[derive(Clone, Debug, Default, Serialize)]
pub struct TrackInfo {
    pub index:                  usize,
    pub id:                     u64,
    pub kind:                   TrackKind,
    pub codec:                  String,
    pub duration_ms:            u64,
    pub timescale:              u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width:                  Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height:                 Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_duration_ns:    Option<u64>,
}

// Duration from a raw `mdhd` box.
fn mdhd_duration(mdhd: &[u8]) -> Option<u64> {
    let be32 = |at: usize| -> Option<u64> {
        let b = mdhd.get(at .. at + 4)?;
        Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as u64)
    };
    match mdhd.get(8)? {
        0 => be32(24),
        _ => Some(be32(32)? << 32 | be32(36)?),
    }
}

// Fourcc of the first sample entry in a raw `stsd` box.
fn stsd_codec(stsd: &[u8]) -> Option<String> {
    let b = stsd.get(20 .. 24)?;
    Some(FourCC(u32::from_be_bytes([b[0], b[1], b[2], b[3]])).to_string())
}

impl TrackInfo {
    /// Track information of a DASH MP4 track.
    pub fn from_mp4(index: usize, track: &Mp4Track) -> TrackInfo {
        let trak = &track.trak;
        let timescale = trak.mdia.timescale as u64;
        let duration = mdhd_duration(&trak.mdia.mdhd).unwrap_or(0);

        let mut info = TrackInfo {
            index,
            id: trak.tkhd.track_id as u64,
            kind: track.kind,
            codec: stsd_codec(&trak.mdia.minf.stsd).unwrap_or_else(|| "-".to_string()),
            timescale,
            ..TrackInfo::default()
        };
        if timescale > 0 {
            info.duration_ms = duration * 1000 / timescale;
            info.default_duration_ns = track.trex
                .map(|t| t.default_sample_duration as u64 * 1_000_000_000 / timescale)
                .filter(|&d| d > 0);
        }
        if track.kind == TrackKind::Video {
            // 16.16 fixed point.
            info.width = Some((trak.tkhd.width >> 16) as u32);
            info.height = Some((trak.tkhd.height >> 16) as u32);
        }
        info
    }

    /// Track information of a WebM track. `segment` is the `Info`
    /// of the segment it was found in.
    pub fn from_webm(index: usize, track: &WebMTrack, segment: Option<Info>) -> TrackInfo {
        let mut info = TrackInfo {
            index,
            id: track.track_number,
            kind: track.kind,
            codec: track.codec_id.clone(),
            default_duration_ns: track.default_duration,
            ..TrackInfo::default()
        };
        if let Some(seg) = segment {
            if seg.timecode_scale > 0 {
                info.timescale = 1_000_000_000 / seg.timecode_scale;
            }
            info.duration_ms = (seg.duration * seg.timecode_scale as f64 / 1_000_000.0) as u64;
        }
        if let Some((w, h)) = track.pixel_size() {
            info.width = Some(w as u32);
            info.height = Some(h as u32);
        }
        info
    }

    /// One line summary.
    pub fn short(&self) -> String {
        let mut s = format!("{}: id {} {:?} {} {}ms", self.index, self.id, self.kind, self.codec, self.duration_ms);
        if let (Some(w), Some(h)) = (self.width, self.height) {
            s.push_str(&format!(" {}x{}", w, h));
        }
        s
    }
}
