//! Reader for fragmented (DASH) MP4 files.
//!
//! A DASH file is `ftyp`, `moov` (with `mvex/trex` defaults), and then
//! a repeating sequence of `moof` + `mdat` pairs. `parse()` reads the
//! header part and stops at the first `moof`. After a track has been
//! selected, `next_chunk()` walks the fragments and returns one chunk
//! per `moof`/`mdat` pair that carries samples of that track.
//!
use std::io;

use crate::data_reader::DataReader;
use crate::stream::MediaStream;
use crate::types::*;

/// Position, size and type of a box in the input.
#[derive(Clone, Copy, Debug)]
struct BoxHeader {
    kind:   FourCC,
    offset: u64,
    size:   u64,
}

impl BoxHeader {
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[inline]
pub fn has_flag(flags: u32, mask: u32) -> bool {
    flags & mask == mask
}

#[derive(Clone, Debug, Default)]
pub struct Tkhd {
    pub track_id:           u32,
    pub duration:           u64,
    pub layer:              i16,
    pub alternate_group:    i16,
    pub volume:             i16,
    pub matrix:             Vec<u8>,
    pub width:              i32,
    pub height:             i32,
}

/// First entry of the edit list.
#[derive(Clone, Copy, Debug)]
pub struct Elst {
    pub media_time: i64,
    pub media_rate: i32,
}

#[derive(Clone, Debug, Default)]
pub struct Hdlr {
    pub kind:       FourCC,
    pub subtype:    FourCC,
    pub reserved:   [u8; 12],
}

/// Raw boxes from `minf`, copied as-is into the output.
#[derive(Clone, Debug, Default)]
pub struct Minf {
    pub dinf:   Vec<u8>,
    pub stsd:   Vec<u8>,
    pub mhd:    Vec<u8>,
}

#[derive(Clone, Debug, Default)]
pub struct Mdia {
    pub timescale:  u32,
    pub mdhd:       Vec<u8>,
    pub hdlr:       Hdlr,
    pub minf:       Minf,
}

#[derive(Clone, Debug, Default)]
pub struct Trak {
    pub tkhd:   Tkhd,
    pub elst:   Option<Elst>,
    pub mdia:   Mdia,
}

/// Per-track fragment defaults from `mvex/trex`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Trex {
    pub track_id:                           u32,
    pub default_sample_description_index:   u32,
    pub default_sample_duration:            u32,
    pub default_sample_size:                u32,
    pub default_sample_flags:               u32,
}

#[derive(Clone, Debug)]
pub struct Mp4Track {
    pub kind:   TrackKind,
    pub trak:   Trak,
    pub trex:   Option<Trex>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Tfhd {
    pub flags:                      u32,
    pub track_id:                   u32,
    pub default_sample_duration:    u32,
    pub default_sample_size:        u32,
    pub default_sample_flags:       u32,
}

#[derive(Clone, Debug, Default)]
pub struct Trun {
    pub chunk_duration:     u64,
    pub chunk_size:         u64,
    pub flags:              u32,
    pub first_sample_flags: u32,
    pub data_offset:        i64,
    pub entry_count:        u32,
    entries:                Vec<u8>,
    row_size:               usize,
}

/// One sample of a `trun`, with the defaults filled in.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TrunEntry {
    pub sample_duration:            u32,
    pub sample_size:                u32,
    pub sample_flags:               u32,
    pub composition_offset:         i32,
    pub has_composition_offset:     bool,
    pub is_keyframe:                bool,
}

impl Trun {
    /// Entry `i` as stored in the box, no defaults applied.
    pub fn entry(&self, i: usize) -> TrunEntry {
        let row = &self.entries[i * self.row_size..(i + 1) * self.row_size];
        let mut idx = 0;
        let mut next = || {
            let v = u32::from_be_bytes([row[idx], row[idx + 1], row[idx + 2], row[idx + 3]]);
            idx += 4;
            v
        };
        let mut entry = TrunEntry::default();
        if has_flag(self.flags, 0x100) {
            entry.sample_duration = next();
        }
        if has_flag(self.flags, 0x200) {
            entry.sample_size = next();
        }
        if has_flag(self.flags, 0x400) {
            entry.sample_flags = next();
        }
        if has_flag(self.flags, 0x800) {
            entry.composition_offset = next() as i32;
        }
        entry.has_composition_offset = has_flag(self.flags, 0x800);
        entry.is_keyframe = !has_flag(entry.sample_flags, 0x10000);
        entry
    }
}

#[derive(Clone, Debug, Default)]
pub struct Traf {
    pub tfhd:   Tfhd,
    pub tfdt:   Option<u64>,
    pub trun:   Trun,
}

impl Traf {
    /// Entry `i` with the missing fields taken from `tfhd`, then `trex`.
    pub fn absolute_entry(&self, i: usize, trex: Option<&Trex>) -> TrunEntry {
        let trun = &self.trun;
        let tfhd = &self.tfhd;
        let mut entry = trun.entry(i);

        if !has_flag(trun.flags, 0x100) {
            entry.sample_duration = if has_flag(tfhd.flags, 0x08) {
                tfhd.default_sample_duration
            } else {
                trex.map(|t| t.default_sample_duration).unwrap_or(0)
            };
        }
        if !has_flag(trun.flags, 0x200) {
            entry.sample_size = if has_flag(tfhd.flags, 0x10) {
                tfhd.default_sample_size
            } else {
                trex.map(|t| t.default_sample_size).unwrap_or(0)
            };
        }
        if !has_flag(trun.flags, 0x400) {
            entry.sample_flags = if has_flag(tfhd.flags, 0x20) {
                tfhd.default_sample_flags
            } else {
                trex.map(|t| t.default_sample_flags).unwrap_or(0)
            };
        }
        if i == 0 && has_flag(trun.flags, 0x04) {
            entry.sample_flags = trun.first_sample_flags;
        }
        entry.is_keyframe = !has_flag(entry.sample_flags, 0x10000);

        entry
    }
}

#[derive(Clone, Debug, Default)]
pub struct Moof {
    pub sequence_number:    u32,
    pub traf:               Option<Traf>,
}

/// A `moof` + `mdat` pair of the selected track.
///
/// The sample data is not stored in the chunk, it is read from the
/// reader that returned it, through its current view.
#[derive(Debug)]
pub struct Mp4DashChunk {
    pub sequence_number:    u32,
    pub traf:               Traf,
    trex:                   Option<Trex>,
    info_only:              bool,
    index:                  usize,
}

#[derive(Debug)]
pub struct Mp4DashSample {
    pub info:   TrunEntry,
    pub data:   Vec<u8>,
}

impl Mp4DashChunk {
    pub fn trun(&self) -> &Trun {
        &self.traf.trun
    }

    pub fn tfhd(&self) -> &Tfhd {
        &self.traf.tfhd
    }

    pub fn next_sample_info(&mut self) -> Option<TrunEntry> {
        if self.index >= self.trun().entry_count as usize {
            return None;
        }
        let entry = self.traf.absolute_entry(self.index, self.trex.as_ref());
        self.index += 1;
        Some(entry)
    }

    /// Next sample, including its data.
    pub fn next_sample<S: MediaStream>(&mut self, reader: &mut Mp4DashReader<S>) -> io::Result<Option<Mp4DashSample>> {
        if self.info_only {
            return Err(ioerr!(InvalidInput, "This chunk has info only"));
        }
        let info = match self.next_sample_info() {
            Some(info) => info,
            None => return Ok(None),
        };
        let mut data = vec![0u8; info.sample_size as usize];
        if reader.stream.view().read_full(&mut data)? != data.len() {
            return Err(ioerr!(UnexpectedEof, "EOF reached while reading a sample"));
        }
        Ok(Some(Mp4DashSample { info, data }))
    }
}

pub struct Mp4DashReader<S> {
    stream:         DataReader<S>,
    tracks:         Vec<Mp4Track>,
    brands:         Vec<FourCC>,
    current:        Option<BoxHeader>,
    moof:           Option<Moof>,
    chunk_zero:     bool,
    selected:       Option<usize>,
    backup:         Option<BoxHeader>,
}

impl<S: MediaStream> Mp4DashReader<S> {
    pub fn new(source: S) -> Mp4DashReader<S> {
        Mp4DashReader {
            stream: DataReader::new(source),
            tracks: Vec::new(),
            brands: Vec::new(),
            current: None,
            moof: None,
            chunk_zero: false,
            selected: None,
            backup: None,
        }
    }

    /// Read the file header, up to the first `moof`.
    pub fn parse(&mut self) -> io::Result<()> {
        if self.selected.is_some() || self.backup.is_some() {
            return Ok(());
        }

        let mut b = self.read_box_expect(FTYP)?;
        self.brands = self.parse_ftyp(&b)?;
        match self.brands[0] {
            BRAND_DASH | BRAND_ISO5 => {},
            other => return Err(ioerr!(Unsupported,
                "Not a MPEG-4 DASH container, major brand is not 'dash' or 'iso5' is {}", other)),
        }
        log::debug!("Mp4DashReader::parse: brands {:?}", self.brands);

        let mut moov = None;
        while b.kind != MOOF {
            self.ensure(&b)?;
            b = self.read_box()?;
            log::trace!("Mp4DashReader::parse: top level box {} @{} size {}", b.kind, b.offset, b.size);
            if b.kind == MOOV {
                moov = Some(self.parse_moov(&b)?);
            }
        }

        let (traks, trex) = match moov {
            Some(moov) => moov,
            None => return Err(ioerr!(InvalidData, "The provided Mp4 doesn't have the 'moov' box")),
        };

        self.tracks = traks
            .into_iter()
            .map(|trak| {
                let kind = TrackKind::from_handler(trak.mdia.hdlr.subtype);
                let trex = trex.iter().find(|t| t.track_id == trak.tkhd.track_id).cloned();
                Mp4Track { kind, trak, trex }
            })
            .collect();
        log::debug!("Mp4DashReader::parse: {} tracks", self.tracks.len());

        self.current = Some(b);
        self.backup = Some(b);
        Ok(())
    }

    /// Major brand, followed by the compatible brands.
    pub fn brands(&self) -> io::Result<&[FourCC]> {
        if self.brands.is_empty() {
            return Err(ioerr!(InvalidInput, "Not parsed"));
        }
        Ok(&self.brands)
    }

    pub fn tracks(&self) -> &[Mp4Track] {
        &self.tracks
    }

    pub fn select_track(&mut self, index: usize) -> io::Result<&Mp4Track> {
        if index >= self.tracks.len() {
            return Err(ioerr!(InvalidInput, "track index {} out of range (0..{})", index, self.tracks.len()));
        }
        self.selected = Some(index);
        Ok(&self.tracks[index])
    }

    pub fn selected_track(&self) -> Option<&Mp4Track> {
        self.selected.map(|i| &self.tracks[i])
    }

    pub fn can_rewind(&self) -> bool {
        self.stream.can_rewind()
    }

    pub fn stream(&self) -> &S {
        self.stream.stream()
    }

    pub fn stream_mut(&mut self) -> &mut S {
        self.stream.stream_mut()
    }

    /// Go back to the first fragment.
    pub fn rewind(&mut self) -> io::Result<()> {
        if !self.stream.can_rewind() {
            return Err(ioerr!(Unsupported, "The provided stream doesn't allow seek"));
        }
        let backup = match self.backup {
            Some(backup) => backup,
            None => return Ok(()),
        };

        self.current = Some(backup);
        self.chunk_zero = false;
        self.moof = None;

        self.stream.rewind()?;
        self.stream.skip_bytes(backup.offset + 8)?;
        Ok(())
    }

    /// Next chunk of the selected track, `None` at end of stream.
    pub fn next_chunk(&mut self, info_only: bool) -> io::Result<Option<Mp4DashChunk>> {
        let (track_id, trex) = match self.selected_track() {
            Some(track) => (track.trak.tkhd.track_id, track.trex),
            None => return Err(ioerr!(InvalidInput, "no track selected")),
        };

        while self.stream.available()? {
            let current = self.current;
            let b = match current {
                Some(b) if self.chunk_zero => {
                    self.ensure(&b)?;
                    if !self.stream.available()? {
                        break;
                    }
                    self.read_box()?
                },
                Some(b) => {
                    self.chunk_zero = true;
                    b
                },
                None => return Err(ioerr!(InvalidInput, "Not parsed")),
            };
            self.current = Some(b);

            match b.kind {
                MOOF => {
                    if self.moof.is_some() {
                        return Err(ioerr!(InvalidData, "moof found without mdat"));
                    }
                    let mut moof = self.parse_moof(&b, track_id)?;

                    if let Some(traf) = moof.traf.as_mut() {
                        let trun = &mut traf.trun;
                        let tfhd = &traf.tfhd;

                        if has_flag(trun.flags, 0x01) {
                            trun.data_offset -= b.size as i64 + 8;
                            if trun.data_offset < 0 {
                                return Err(ioerr!(InvalidData,
                                    "trun box has wrong data offset, points outside of concurrent mdat box"));
                            }
                        }

                        let count = trun.entry_count as u64;
                        if trun.chunk_size < 1 {
                            trun.chunk_size = if has_flag(tfhd.flags, 0x10) {
                                tfhd.default_sample_size as u64 * count
                            } else if let Some(size) = trex.map(|t| t.default_sample_size).filter(|&s| s > 0) {
                                size as u64 * count
                            } else {
                                b.size - 8
                            };
                        }
                        if !has_flag(trun.flags, 0x900) && trun.chunk_duration == 0 {
                            if has_flag(tfhd.flags, 0x08) {
                                trun.chunk_duration = tfhd.default_sample_duration as u64 * count;
                            } else if let Some(t) = trex {
                                trun.chunk_duration = t.default_sample_duration as u64 * count;
                            }
                        }
                        log::trace!("Mp4DashReader::next_chunk: moof #{} entries {} size {} duration {}",
                            moof.sequence_number, trun.entry_count, trun.chunk_size, trun.chunk_duration);
                    }
                    self.moof = Some(moof);
                },
                MDAT => {
                    let moof = match self.moof.take() {
                        Some(moof) => moof,
                        None => return Err(ioerr!(InvalidData, "mdat found without moof")),
                    };
                    let traf = match moof.traf {
                        Some(traf) => traf,
                        None => {
                            log::warn!("Mp4DashReader::next_chunk: skipping mdat @{}, no samples of track {}",
                                b.offset, track_id);
                            continue;
                        },
                    };

                    if !info_only {
                        self.stream.get_view(traf.trun.chunk_size);
                    }
                    self.stream.skip_bytes(traf.trun.data_offset as u64)?;

                    return Ok(Some(Mp4DashChunk {
                        sequence_number: moof.sequence_number,
                        traf,
                        trex,
                        info_only,
                        index: 0,
                    }));
                },
                _ => {},
            }
        }

        Ok(None)
    }

    fn read_box(&mut self) -> io::Result<BoxHeader> {
        let offset = self.stream.position();
        let mut size = self.stream.read_u32()? as u64;
        let kind = FourCC(self.stream.read_u32()?);
        if size == 1 {
            size = self.stream.read_u64()?;
        }
        Ok(BoxHeader { kind, offset, size })
    }

    fn read_box_expect(&mut self, expected: FourCC) -> io::Result<BoxHeader> {
        let b = self.read_box()?;
        if b.kind != expected {
            return Err(ioerr!(InvalidData, "expected {} found {}", expected, b.kind));
        }
        Ok(b)
    }

    // Whole box, including the header.
    fn read_full_box(&mut self, b: &BoxHeader) -> io::Result<Vec<u8>> {
        if b.size < 8 {
            return Err(ioerr!(InvalidData, "box {} @{} has a bad size {}", b.kind, b.offset, b.size));
        }
        let mut data = Vec::with_capacity(b.size as usize);
        data.extend_from_slice(&(b.size as u32).to_be_bytes());
        data.extend_from_slice(&b.kind.to_bytes());
        data.resize(b.size as usize, 0);
        let n = self.stream.read(&mut data[8..])?;
        if n as u64 != b.size - 8 {
            return Err(ioerr!(UnexpectedEof, "EOF reached in box: type={} offset={} size={}",
                b.kind, b.offset, b.size));
        }
        Ok(data)
    }

    // Skip to the end of the box.
    fn ensure(&mut self, b: &BoxHeader) -> io::Result<()> {
        let pos = self.stream.position();
        let end = b.end();
        if pos > end {
            return Err(ioerr!(UnexpectedEof,
                "parser go beyond limits of the box. type={} offset={} size={} position={}",
                b.kind, b.offset, b.size, pos));
        }
        if pos < end {
            self.stream.skip_bytes(end - pos)?;
        }
        Ok(())
    }

    // Next child of `parent` that has one of the `expected` types.
    fn until_box(&mut self, parent: &BoxHeader, expected: &[FourCC]) -> io::Result<Option<BoxHeader>> {
        while self.stream.position() < parent.end() {
            let b = self.read_box()?;
            if expected.contains(&b.kind) {
                return Ok(Some(b));
            }
            self.ensure(&b)?;
        }
        Ok(None)
    }

    fn until_any_box(&mut self, parent: &BoxHeader) -> io::Result<Option<BoxHeader>> {
        if self.stream.position() >= parent.end() {
            return Ok(None);
        }
        Ok(Some(self.read_box()?))
    }

    fn parse_ftyp(&mut self, b: &BoxHeader) -> io::Result<Vec<FourCC>> {
        let left = b.end().saturating_sub(self.stream.position());
        if left < 8 {
            return Err(ioerr!(InvalidData, "ftyp box too small: {}", b.size));
        }
        let count = (left - 4) / 4;
        let mut brands = Vec::with_capacity(count as usize);
        brands.push(FourCC(self.stream.read_u32()?));
        // minor version
        self.stream.skip_bytes(4)?;
        for _ in 1..count {
            brands.push(FourCC(self.stream.read_u32()?));
        }
        Ok(brands)
    }

    fn parse_moov(&mut self, moov: &BoxHeader) -> io::Result<(Vec<Trak>, Vec<Trex>)> {
        let b = self.read_box_expect(MVHD)?;
        let next_track_id = self.parse_mvhd()?;
        self.ensure(&b)?;

        let mut traks = Vec::with_capacity(next_track_id as usize);
        let mut trex = Vec::new();
        while let Some(b) = self.until_box(moov, &[TRAK, MVEX])? {
            match b.kind {
                TRAK => traks.push(self.parse_trak(&b)?),
                MVEX => trex = self.parse_mvex(&b)?,
                _ => {},
            }
            self.ensure(&b)?;
        }
        Ok((traks, trex))
    }

    // Returns the next track id, the rest is not used.
    fn parse_mvhd(&mut self) -> io::Result<u32> {
        let version = self.stream.read_u8()?;
        let w = if version == 0 { 4 } else { 8 };
        // flags, creation and modification time.
        self.stream.skip_bytes(3 + 2 * w)?;
        let _timescale = self.stream.read_u32()?;
        // duration
        self.stream.skip_bytes(w)?;
        // rate, volume, reserved, matrix, predefined.
        self.stream.skip_bytes(76)?;
        self.stream.read_u32()
    }

    fn parse_tkhd(&mut self) -> io::Result<Tkhd> {
        let version = self.stream.read_u8()?;
        let w = if version == 0 { 4 } else { 8 };
        self.stream.skip_bytes(3 + 2 * w)?;

        let mut tkhd = Tkhd::default();
        tkhd.track_id = self.stream.read_u32()?;
        self.stream.skip_bytes(4)?;
        tkhd.duration = if version == 0 {
            self.stream.read_u32()? as u64
        } else {
            self.stream.read_u64()?
        };
        self.stream.skip_bytes(8)?;
        tkhd.layer = self.stream.read_i16()?;
        tkhd.alternate_group = self.stream.read_i16()?;
        tkhd.volume = self.stream.read_i16()?;
        self.stream.skip_bytes(2)?;
        tkhd.matrix = self.stream.read_vec(36)?;
        tkhd.width = self.stream.read_i32()?;
        tkhd.height = self.stream.read_i32()?;
        Ok(tkhd)
    }

    fn parse_trak(&mut self, trak: &BoxHeader) -> io::Result<Trak> {
        let b = self.read_box_expect(TKHD)?;
        let tkhd = self.parse_tkhd()?;
        self.ensure(&b)?;

        let mut elst = None;
        let mut mdia = None;
        while let Some(b) = self.until_box(trak, &[MDIA, EDTS])? {
            match b.kind {
                MDIA => mdia = Some(self.parse_mdia(&b)?),
                EDTS => elst = self.parse_edts(&b)?,
                _ => {},
            }
            self.ensure(&b)?;
        }

        let mdia = match mdia {
            Some(mdia) => mdia,
            None => return Err(ioerr!(NotFound, "track {} has no 'mdia' box", tkhd.track_id)),
        };
        Ok(Trak { tkhd, elst, mdia })
    }

    fn parse_mdia(&mut self, mdia: &BoxHeader) -> io::Result<Mdia> {
        let mut res = Mdia::default();
        let mut have_hdlr = false;

        while let Some(b) = self.until_box(mdia, &[MDHD, HDLR, MINF])? {
            match b.kind {
                MDHD => {
                    res.mdhd = self.read_full_box(&b)?;
                    let version = res.mdhd.get(8).cloned().unwrap_or(0);
                    let pos = 12 + if version == 0 { 4 } else { 8 } * 2;
                    let ts = res.mdhd.get(pos..pos + 4)
                        .ok_or_else(|| ioerr!(InvalidData, "mdhd box too small"))?;
                    res.timescale = u32::from_be_bytes([ts[0], ts[1], ts[2], ts[3]]);
                },
                HDLR => {
                    res.hdlr = self.parse_hdlr(&b)?;
                    have_hdlr = true;
                },
                MINF => res.minf = self.parse_minf(&b)?,
                _ => {},
            }
            self.ensure(&b)?;
        }

        if !have_hdlr {
            return Err(ioerr!(NotFound, "mdia box @{} has no 'hdlr' box", mdia.offset));
        }
        Ok(res)
    }

    fn parse_hdlr(&mut self, b: &BoxHeader) -> io::Result<Hdlr> {
        // version, flags
        self.stream.skip_bytes(4)?;
        let mut hdlr = Hdlr::default();
        hdlr.kind = FourCC(self.stream.read_u32()?);
        hdlr.subtype = FourCC(self.stream.read_u32()?);
        let reserved = self.stream.read_vec(12)?;
        hdlr.reserved.copy_from_slice(&reserved);
        // the name is skipped by ensure().
        self.ensure(b)?;
        Ok(hdlr)
    }

    fn parse_edts(&mut self, edts: &BoxHeader) -> io::Result<Option<Elst>> {
        if self.until_box(edts, &[ELST])?.is_none() {
            return Ok(None);
        }

        let v1 = self.stream.read_u8()? == 1;
        self.stream.skip_bytes(3)?;

        let count = self.stream.read_u32()?;
        if count < 1 {
            return Ok(Some(Elst { media_time: 0, media_rate: 0x10000 }));
        }

        let media_time = if v1 {
            // segment duration
            self.stream.skip_bytes(8)?;
            let t = self.stream.read_i64()?;
            // only the first entry is used.
            self.stream.skip_bytes((count as u64 - 1) * 16)?;
            t
        } else {
            self.stream.skip_bytes(4)?;
            self.stream.read_i32()? as i64
        };
        let media_rate = self.stream.read_i32()?;

        Ok(Some(Elst { media_time, media_rate }))
    }

    fn parse_minf(&mut self, minf: &BoxHeader) -> io::Result<Minf> {
        let mut res = Minf::default();
        while let Some(b) = self.until_any_box(minf)? {
            match b.kind {
                DINF => res.dinf = self.read_full_box(&b)?,
                STBL => res.stsd = self.parse_stbl(&b)?,
                VMHD | SMHD => res.mhd = self.read_full_box(&b)?,
                _ => {},
            }
            self.ensure(&b)?;
        }
        Ok(res)
    }

    // Only the stsd box is kept, the rest is rebuilt by the writer.
    fn parse_stbl(&mut self, stbl: &BoxHeader) -> io::Result<Vec<u8>> {
        match self.until_box(stbl, &[STSD])? {
            Some(b) => self.read_full_box(&b),
            None => {
                log::warn!("Mp4DashReader: stbl box @{} has no stsd box", stbl.offset);
                Ok(Vec::new())
            },
        }
    }

    fn parse_mvex(&mut self, mvex: &BoxHeader) -> io::Result<Vec<Trex>> {
        let mut res = Vec::new();
        while let Some(b) = self.until_box(mvex, &[TREX])? {
            // version, flags
            self.stream.skip_bytes(4)?;
            res.push(Trex {
                track_id: self.stream.read_u32()?,
                default_sample_description_index: self.stream.read_u32()?,
                default_sample_duration: self.stream.read_u32()?,
                default_sample_size: self.stream.read_u32()?,
                default_sample_flags: self.stream.read_u32()?,
            });
            self.ensure(&b)?;
        }
        Ok(res)
    }

    fn parse_moof(&mut self, moof: &BoxHeader, track_id: u32) -> io::Result<Moof> {
        let mut res = Moof::default();

        let b = self.read_box_expect(MFHD)?;
        self.stream.skip_bytes(4)?;
        res.sequence_number = self.stream.read_u32()?;
        self.ensure(&b)?;

        while let Some(b) = self.until_box(moof, &[TRAF])? {
            res.traf = self.parse_traf(&b, track_id)?;
            self.ensure(&b)?;
            if res.traf.is_some() {
                break;
            }
        }
        Ok(res)
    }

    // None if the traf belongs to another track.
    fn parse_traf(&mut self, traf: &BoxHeader, track_id: u32) -> io::Result<Option<Traf>> {
        let b = self.read_box_expect(TFHD)?;
        let tfhd = self.parse_tfhd(track_id)?;
        self.ensure(&b)?;

        let tfhd = match tfhd {
            Some(tfhd) => tfhd,
            None => return Ok(None),
        };

        let mut tfdt = None;
        let mut b = match self.until_box(traf, &[TRUN, TFDT])? {
            Some(b) => b,
            None => return Err(ioerr!(NotFound, "traf box @{} has no 'trun' box", traf.offset)),
        };
        if b.kind == TFDT {
            let version = self.stream.read_u8()?;
            self.stream.skip_bytes(3)?;
            tfdt = Some(if version == 0 {
                self.stream.read_u32()? as u64
            } else {
                self.stream.read_u64()?
            });
            self.ensure(&b)?;
            b = self.read_box_expect(TRUN)?;
        }

        let trun = self.parse_trun()?;
        self.ensure(&b)?;

        Ok(Some(Traf { tfhd, tfdt, trun }))
    }

    fn parse_tfhd(&mut self, track_id: u32) -> io::Result<Option<Tfhd>> {
        let mut tfhd = Tfhd::default();
        tfhd.flags = self.stream.read_u32()?;
        tfhd.track_id = self.stream.read_u32()?;

        if tfhd.track_id != track_id {
            return Ok(None);
        }

        if has_flag(tfhd.flags, 0x01) {
            // base data offset
            self.stream.skip_bytes(8)?;
        }
        if has_flag(tfhd.flags, 0x02) {
            // sample description index
            self.stream.skip_bytes(4)?;
        }
        if has_flag(tfhd.flags, 0x08) {
            tfhd.default_sample_duration = self.stream.read_u32()?;
        }
        if has_flag(tfhd.flags, 0x10) {
            tfhd.default_sample_size = self.stream.read_u32()?;
        }
        if has_flag(tfhd.flags, 0x20) {
            tfhd.default_sample_flags = self.stream.read_u32()?;
        }
        Ok(Some(tfhd))
    }

    fn parse_trun(&mut self) -> io::Result<Trun> {
        let mut trun = Trun::default();
        trun.flags = self.stream.read_u32()?;
        trun.entry_count = self.stream.read_u32()?;

        let flags = trun.flags;
        trun.row_size = [0x100, 0x200, 0x400, 0x800]
            .iter()
            .filter(|&&f| has_flag(flags, f))
            .count() * 4;

        if has_flag(trun.flags, 0x01) {
            trun.data_offset = self.stream.read_i32()? as i64;
        }
        if has_flag(trun.flags, 0x04) {
            trun.first_sample_flags = self.stream.read_u32()?;
        }

        trun.entries = self.stream.read_vec(trun.row_size * trun.entry_count as usize)?;

        for i in 0..trun.entry_count as usize {
            let entry = trun.entry(i);
            if has_flag(trun.flags, 0x100) {
                trun.chunk_duration += entry.sample_duration as u64;
            } else if has_flag(trun.flags, 0x800) {
                trun.chunk_duration += entry.composition_offset.max(0) as u64;
            }
            if has_flag(trun.flags, 0x200) {
                trun.chunk_size += entry.sample_size as u64;
            }
        }

        Ok(trun)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    // Minimal box builder for test input.
    pub(crate) fn mkbox(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&((body.len() + 8) as u32).to_be_bytes());
        v.extend_from_slice(kind);
        v.extend_from_slice(body);
        v
    }

    fn be(vals: &[u32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_be_bytes().to_vec()).collect()
    }

    fn tkhd(track_id: u32) -> Vec<u8> {
        let mut b = vec![0u8; 4 + 8];
        b.extend(be(&[track_id, 0, 1000, 0, 0]));
        b.extend_from_slice(&[0, 0, 0, 0, 0x01, 0x00, 0, 0]);
        b.extend(be(&[0x10000, 0, 0, 0, 0x10000, 0, 0, 0, 0x40000000]));
        b.extend(be(&[0, 0]));
        mkbox(b"tkhd", &b)
    }

    fn trak(track_id: u32, handler: &[u8; 4]) -> Vec<u8> {
        let mdhd = mkbox(b"mdhd", &be(&[0, 0, 0, 48000, 0, 0]));
        let mut hdlr = be(&[0, 0]);
        hdlr.extend_from_slice(handler);
        hdlr.extend(be(&[0, 0, 0]));
        hdlr.extend_from_slice(b"Sound\0");
        let hdlr = mkbox(b"hdlr", &hdlr);
        let stsd = mkbox(b"stsd", &be(&[0, 0]));
        let stbl = mkbox(b"stbl", &stsd);
        let mut minf = mkbox(b"smhd", &be(&[0, 0]));
        minf.extend(mkbox(b"dinf", &[]));
        minf.extend(stbl);
        let minf = mkbox(b"minf", &minf);
        let mut mdia = mdhd;
        mdia.extend(hdlr);
        mdia.extend(minf);
        let mut t = tkhd(track_id);
        t.extend(mkbox(b"mdia", &mdia));
        mkbox(b"trak", &t)
    }

    /// A DASH file with one track, `fragments` × `samples` samples of
    /// `size` bytes each. Sample `n` is filled with byte `n`.
    pub(crate) fn dash_file(handler: &[u8; 4], fragments: u32, samples: u32, size: u32) -> Vec<u8> {
        let mut f = mkbox(b"ftyp", &[b"dash".to_vec(), be(&[0]), b"iso6".to_vec()].concat());
        let mut moov = mkbox(b"mvhd", &[vec![0u8; 4 + 8], be(&[1000, 0]), vec![0u8; 76], be(&[2])].concat());
        moov.extend(trak(1, handler));
        moov.extend(mkbox(b"mvex", &mkbox(b"trex", &be(&[0, 1, 1, 1024, 0, 0]))));
        f.extend(mkbox(b"moov", &moov));

        let mut n = 0u32;
        for seq in 0..fragments {
            let tfhd = mkbox(b"tfhd", &be(&[0x10, 1, size]));
            let tfdt = mkbox(b"tfdt", &be(&[0, seq * samples * 1024]));
            // flags: data offset present, per-sample flags present.
            let mut trun = be(&[0x401, samples, 0]);
            for i in 0..samples {
                trun.extend(be(&[if i == 0 { 0 } else { 0x10000 }]));
            }
            let trun = mkbox(b"trun", &trun);
            let traf = mkbox(b"traf", &[tfhd, tfdt, trun].concat());
            let mfhd = mkbox(b"mfhd", &be(&[0, seq + 1]));
            let moof = mkbox(b"moof", &[mfhd, traf].concat());
            let moof_len = moof.len() as u32;
            let mut moof = moof;
            // patch data offset: moof size + mdat header.
            let pos = moof.len() - (samples as usize * 4) - 4;
            moof[pos..pos + 4].copy_from_slice(&(moof_len + 8).to_be_bytes());
            f.extend(moof);
            let mut data = Vec::new();
            for _ in 0..samples {
                data.extend(vec![n as u8; size as usize]);
                n += 1;
            }
            f.extend(mkbox(b"mdat", &data));
        }
        f
    }

    fn reader(data: Vec<u8>) -> Mp4DashReader<MemoryStream> {
        Mp4DashReader::new(MemoryStream::from_vec(data))
    }

    #[test]
    fn test_parse_tracks() {
        let mut r = reader(dash_file(b"soun", 2, 3, 10));
        r.parse().unwrap();
        assert_eq!(r.brands().unwrap(), &[BRAND_DASH, FourCC::from(b"iso6")]);
        assert_eq!(r.tracks().len(), 1);
        let t = &r.tracks()[0];
        assert_eq!(t.kind, TrackKind::Audio);
        assert_eq!(t.trak.tkhd.track_id, 1);
        assert_eq!(t.trak.mdia.timescale, 48000);
        assert_eq!(t.trak.tkhd.matrix.len(), 36);
        assert_eq!(t.trex.unwrap().default_sample_duration, 1024);
        assert_eq!(&t.trak.mdia.minf.stsd[4..8], b"stsd");
        assert_eq!(&t.trak.mdia.minf.mhd[4..8], b"smhd");
    }

    #[test]
    fn test_iterate_chunks_and_samples() {
        let mut r = reader(dash_file(b"vide", 3, 4, 16));
        r.parse().unwrap();
        r.select_track(0).unwrap();

        let mut n = 0;
        while let Some(mut chunk) = r.next_chunk(false).unwrap() {
            assert_eq!(chunk.trun().chunk_size, 64);
            assert_eq!(chunk.trun().chunk_duration, 4096);
            let mut i = 0;
            while let Some(sample) = chunk.next_sample(&mut r).unwrap() {
                assert_eq!(sample.info.sample_size, 16);
                assert_eq!(sample.info.sample_duration, 1024);
                assert_eq!(sample.info.is_keyframe, i == 0);
                assert!(sample.data.iter().all(|&b| b == n as u8));
                n += 1;
                i += 1;
            }
        }
        assert_eq!(n, 12);

        // again, after a rewind.
        r.rewind().unwrap();
        let mut chunks = 0;
        while let Some(mut chunk) = r.next_chunk(true).unwrap() {
            assert!(chunk.next_sample(&mut r).is_err());
            chunks += 1;
        }
        assert_eq!(chunks, 3);
    }

    #[test]
    fn test_bad_brand() {
        let mut f = mkbox(b"ftyp", &[b"isom".to_vec(), be(&[0])].concat());
        f.extend(mkbox(b"moov", &[]));
        let err = reader(f).parse().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn test_missing_moov() {
        let mut f = mkbox(b"ftyp", &[b"dash".to_vec(), be(&[0])].concat());
        f.extend(mkbox(b"moof", &mkbox(b"mfhd", &be(&[0, 1]))));
        let err = reader(f).parse().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_moof_without_mdat() {
        let mut f = dash_file(b"soun", 1, 2, 4);
        // drop the mdat, append a second fragment.
        let mdat_len = 8 + 8;
        f.truncate(f.len() - mdat_len);
        let again = dash_file(b"soun", 1, 2, 4);
        let first = again.windows(4).position(|w| w == b"moof").unwrap() - 4;
        f.extend_from_slice(&again[first..]);
        let mut r = reader(f);
        r.parse().unwrap();
        r.select_track(0).unwrap();
        let err = r.next_chunk(true).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("moof found without mdat"));
    }

    #[test]
    fn test_entry_defaults_from_trex() {
        let traf = Traf {
            tfhd: Tfhd { flags: 0, track_id: 1, ..Tfhd::default() },
            tfdt: None,
            trun: Trun {
                flags: 0x04,
                first_sample_flags: 0x02000000,
                entry_count: 2,
                ..Trun::default()
            },
        };
        let trex = Trex {
            track_id: 1,
            default_sample_duration: 512,
            default_sample_size: 99,
            default_sample_flags: 0x01010000,
            ..Trex::default()
        };
        let e0 = traf.absolute_entry(0, Some(&trex));
        let e1 = traf.absolute_entry(1, Some(&trex));
        assert_eq!(e0.sample_duration, 512);
        assert_eq!(e0.sample_size, 99);
        assert!(e0.is_keyframe);
        assert!(!e1.is_keyframe);
    }
}
