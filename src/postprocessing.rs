//! Named post-processing algorithms.
//!
//! A download that consists of several DASH/WebM/TTML parts gets turned
//! into one playable file by one of these. `algorithm` looks one up by
//! name, `test` checks whether it applies to the sources, `process`
//! writes the result.
//!
use std::io;

use crate::mp4_dash_reader::Mp4DashReader;
use crate::mp4_from_dash_writer::Mp4FromDashWriter;
use crate::ogg_from_webm_writer::OggFromWebMWriter;
use crate::srt_from_ttml_writer::SrtFromTtmlWriter;
use crate::stream::MediaStream;
use crate::types::{TrackKind, BRAND_DASH, BRAND_ISO5, BRAND_M4A};
use crate::webm_writer::WebMWriter;

pub const ALGORITHM_TTML_CONVERTER: &str = "ttml";
pub const ALGORITHM_WEBM_MUXER: &str = "webm";
pub const ALGORITHM_MP4_FROM_DASH_MUXER: &str = "mp4D-mp4";
pub const ALGORITHM_M4A_NO_DASH: &str = "mp4D-m4a";
pub const ALGORITHM_OGG_FROM_WEBM_DEMUXER: &str = "webm-ogg-d";

const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];
const OGG_MAGIC: [u8; 4] = *b"OggS";

pub type Sources = [Box<dyn MediaStream>];

pub trait Postprocessing {
    fn name(&self) -> &'static str;

    /// Does this algorithm apply to `sources`? Sources that were read
    /// from are rewound before returning.
    fn test(&mut self, _sources: &mut Sources) -> io::Result<bool> {
        Ok(true)
    }

    fn process(&mut self, out: &mut dyn MediaStream, sources: &mut Sources) -> io::Result<()>;
}

/// Look up an algorithm by name.
pub fn algorithm(name: &str, args: &[String]) -> io::Result<Box<dyn Postprocessing>> {
    let args = args.to_vec();
    let alg: Box<dyn Postprocessing> = match name {
        ALGORITHM_TTML_CONVERTER => Box::new(TtmlConverter { args }),
        ALGORITHM_WEBM_MUXER => Box::new(WebMMuxer),
        ALGORITHM_MP4_FROM_DASH_MUXER => Box::new(Mp4FromDashMuxer),
        ALGORITHM_M4A_NO_DASH => Box::new(M4aNoDash),
        ALGORITHM_OGG_FROM_WEBM_DEMUXER => Box::new(OggFromWebMDemuxer),
        _ => return Err(ioerr!(Unsupported, "Unimplemented post-processing algorithm: {}", name)),
    };
    Ok(alg)
}

fn borrow_all(sources: &mut Sources) -> Vec<&mut dyn MediaStream> {
    let mut v: Vec<&mut dyn MediaStream> = Vec::with_capacity(sources.len());
    for s in sources.iter_mut() {
        v.push(s.as_mut());
    }
    v
}

fn first_source(sources: &mut Sources) -> io::Result<&mut dyn MediaStream> {
    match sources.first_mut() {
        Some(s) => Ok(s.as_mut()),
        None => Err(ioerr!(InvalidInput, "no sources")),
    }
}

struct TtmlConverter {
    args: Vec<String>,
}

impl Postprocessing for TtmlConverter {
    fn name(&self) -> &'static str {
        ALGORITHM_TTML_CONVERTER
    }

    fn process(&mut self, out: &mut dyn MediaStream, sources: &mut Sources) -> io::Result<()> {
        let format = self.args.get(0).map(|s| s.as_str()).unwrap_or("srt");
        if format != "srt" {
            return Err(ioerr!(Unsupported, "Unimplemented post-processing output format: {}", format));
        }
        let ignore_empty = self.args.get(1).map(|s| s == "true").unwrap_or(true);

        let mut writer = SrtFromTtmlWriter::new(out, ignore_empty);
        writer.build(first_source(sources)?)
    }
}

struct WebMMuxer;

impl Postprocessing for WebMMuxer {
    fn name(&self) -> &'static str {
        ALGORITHM_WEBM_MUXER
    }

    fn process(&mut self, out: &mut dyn MediaStream, sources: &mut Sources) -> io::Result<()> {
        let count = sources.len();
        let mut muxer = WebMWriter::new(borrow_all(sources));
        muxer.parse_sources()?;

        // the first audio track of each source, or else its first track.
        let mut indices = Vec::new();
        for i in 0 .. count {
            let tracks = muxer.tracks_from_source(i)?;
            let idx = tracks.iter().position(|t| t.kind == TrackKind::Audio).unwrap_or(0);
            indices.push(idx);
        }
        log::debug!("WebMMuxer::process: tracks {:?}", indices);

        muxer.select_tracks(&indices)?;
        muxer.build(out)
    }
}

struct Mp4FromDashMuxer;

impl Postprocessing for Mp4FromDashMuxer {
    fn name(&self) -> &'static str {
        ALGORITHM_MP4_FROM_DASH_MUXER
    }

    fn process(&mut self, out: &mut dyn MediaStream, sources: &mut Sources) -> io::Result<()> {
        let count = sources.len();
        let mut muxer = Mp4FromDashWriter::new(borrow_all(sources))?;
        muxer.parse_sources()?;
        muxer.select_tracks(&vec![0; count])?;
        muxer.build(out)
    }
}

struct M4aNoDash;

impl Postprocessing for M4aNoDash {
    fn name(&self) -> &'static str {
        ALGORITHM_M4A_NO_DASH
    }

    fn test(&mut self, sources: &mut Sources) -> io::Result<bool> {
        let source = first_source(sources)?;
        let major = {
            let mut reader = Mp4DashReader::new(&mut *source);
            reader.parse()?;
            reader.brands()?[0]
        };
        source.rewind()?;
        Ok(major == BRAND_DASH || major == BRAND_ISO5)
    }

    fn process(&mut self, out: &mut dyn MediaStream, sources: &mut Sources) -> io::Result<()> {
        let mut muxer = Mp4FromDashWriter::new(vec![first_source(sources)?])?;
        muxer.set_main_brand(BRAND_M4A);
        muxer.parse_sources()?;
        muxer.select_tracks(&[0])?;
        muxer.build(out)
    }
}

struct OggFromWebMDemuxer;

impl Postprocessing for OggFromWebMDemuxer {
    fn name(&self) -> &'static str {
        ALGORITHM_OGG_FROM_WEBM_DEMUXER
    }

    fn test(&mut self, sources: &mut Sources) -> io::Result<bool> {
        let source = first_source(sources)?;
        let mut magic = [0u8; 4];
        let n = source.read_full(&mut magic)?;
        source.rewind()?;

        if n == 4 && magic == EBML_MAGIC {
            return Ok(true);
        }
        if n == 4 && magic == OGG_MAGIC {
            return Ok(false);
        }
        Err(ioerr!(Unsupported, "unsupported format, expected WebM or Ogg"))
    }

    fn process(&mut self, out: &mut dyn MediaStream, sources: &mut Sources) -> io::Result<()> {
        let mut demuxer = OggFromWebMWriter::new(first_source(sources)?, out)?;
        demuxer.parse_source()?;
        demuxer.select_track(0)?;
        demuxer.build()
    }
}
