//! Mux DASH MP4 tracks into a regular MP4 file.
//!
//! Every source is a fragmented MP4 with one selected track. The output
//! is a `ftyp`, a `moov` with complete sample tables, and one `mdat`.
//!
//! This is done in two passes. The first pass only reads the fragment
//! headers, to count samples and work out the size of each table. Then
//! the `moov` is generated once against a byte counter to get its size,
//! space is reserved for it, and it is generated for real. In the second
//! pass the sample data is copied into the `mdat`, and the table entries
//! (sizes, sync samples, chunk offsets) are patched into the `moov`
//! as each chunk is written.
//!
use std::io;

use crate::io::{BoxSink, CountBytes, MemBuffer};
use crate::mp4_dash_reader::{Mp4DashChunk, Mp4DashReader, Mp4DashSample, Mp4Track};
use crate::stream::MediaStream;
use crate::types::*;

const DEFAULT_TIMESCALE: u32 = 1000;
const SAMPLES_PER_CHUNK_INIT: u32 = 2;
const SAMPLES_PER_CHUNK: u32 = 6;
// near 3.999 GiB
const THRESHOLD_FOR_CO64: u64 = 0xFFFE_FFFF;
// moov boxes smaller than this are built in memory.
const THRESHOLD_MOOV_LENGTH: u64 = (256 * 1024) + (2048 * 1024);

const COMPATIBLE_BRANDS: [FourCC; 3] = [BRAND_MP41, BRAND_ISOM, BRAND_ISO2];

/// Returns true if the chunk offset table needs 64 bit entries
/// (and the mdat a 64 bit size) for this much media data.
pub fn uses_co64(mdat_size: u64) -> bool {
    mdat_size > THRESHOLD_FOR_CO64
}

// Per-track table layout. The counts are computed in the first pass,
// the offsets point at the first free entry of each table in the moov.
#[derive(Debug, Default)]
struct TablesInfo {
    samples:        u32,
    stsz:           u32,
    stsz_default:   u32,
    stss:           u32,
    ctts:           u32,
    stsc:           u32,
    stsc_entries:   Vec<u32>,
    stco:           u32,
    offsets:        TableOffsets,
}

#[derive(Debug, Default)]
struct TableOffsets {
    stts:   u64,
    stss:   u64,
    ctts:   u64,
    stsc:   u64,
    stsz:   u64,
    stco:   u64,
    sbgp:   Option<u64>,
}

impl TablesInfo {
    // Work out the chunk layout from the sample count. Every run
    // starts at a chunk that gets written.
    fn init_chunk_tables(&mut self, first: u32, successive: u32) {
        self.stsc_entries.clear();
        if self.samples == 0 {
            self.stsc = 0;
            self.stco = 0;
            return;
        }
        let first = std::cmp::min(first, self.samples);
        let total = self.samples - first;
        let full = total / successive;
        let remain = total % successive;

        // entry = [first_chunk, samples_per_chunk, sample_description_index]
        self.stsc_entries.extend_from_slice(&[1, first, 1]);
        if full > 0 && first != successive {
            self.stsc_entries.extend_from_slice(&[2, successive, 1]);
        }
        if remain > 0 {
            self.stsc_entries.extend_from_slice(&[full + 2, remain, 1]);
        }
        self.stsc = self.stsc_entries.len() as u32 / 3;
        self.stco = 1 + full + if remain > 0 { 1 } else { 0 };
    }
}

// The output stream, with the write position and a saved position to
// return to after patching a table.
struct Output<O> {
    stream:             O,
    offset:             u64,
    last_write_offset:  Option<u64>,
}

impl<O: MediaStream> Output<O> {
    fn backup(&mut self) {
        if self.last_write_offset.is_none() {
            self.last_write_offset = Some(self.offset);
        }
    }

    fn restore(&mut self) -> io::Result<()> {
        if let Some(offset) = self.last_write_offset.take() {
            if offset > 0 {
                BoxSink::seek(self, offset)?;
            }
        }
        Ok(())
    }
}

impl<O: MediaStream> BoxSink for Output<O> {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write(data)?;
        self.offset += data.len() as u64;
        Ok(())
    }

    fn skip(&mut self, amount: u64) -> io::Result<()> {
        if self.stream.can_seek() {
            self.stream.seek(self.offset + amount)?;
        } else {
            self.stream.skip(amount)?;
        }
        self.offset += amount;
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        if self.stream.can_seek() {
            self.stream.seek(pos)?;
            self.offset = pos;
        } else if self.stream.can_rewind() {
            self.stream.rewind()?;
            self.offset = 0;
            self.skip(pos)?;
        } else {
            return Err(ioerr!(Unsupported, "cannot seek or rewind the output stream"));
        }
        Ok(())
    }

    fn pos(&self) -> u64 {
        self.offset
    }
}

// Patch table entries, either in the in-memory moov or in the output.
fn write_entries<O: MediaStream>(
    out: &mut Output<O>,
    moov: &mut Option<MemBuffer>,
    offset: u64,
    data: &[u8],
) -> io::Result<u64>
{
    match moov {
        Some(buf) => {
            buf.seek(offset)?;
            buf.write(data)?;
        },
        None => {
            out.backup();
            out.seek(offset)?;
            out.write(data)?;
        },
    }
    Ok(offset + data.len() as u64)
}

fn be32(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes().to_vec()).collect()
}

// Set the size of the box that starts at `start`, the box ends at the
// current position.
fn length_for(sink: &mut dyn BoxSink, start: u64) -> io::Result<u64> {
    let size = sink.pos() - start;
    if sink.simulated() {
        return Ok(size);
    }
    sink.seek(start)?;
    sink.write_u32(size as u32)?;
    sink.skip(size - 4)?;
    Ok(size)
}

// Write a table header with `count` entries and reserve space for `rows`
// rows of `cols` 32 bit columns. Returns the offset of the first row.
fn make_table(sink: &mut dyn BoxSink, kind: FourCC, extra: Option<u32>, count: u32, cols: u32, rows: u32) -> io::Result<u64> {
    let size = cols as u64 * rows as u64 * 4;
    let mut total = size + 16;
    let mut offset = sink.pos();
    if extra.is_some() {
        total += 4;
    }

    sink.write_u32(total as u32)?;
    sink.write_u32(kind.0)?;
    // version & flags
    sink.write_u32(0)?;
    if let Some(extra) = extra {
        offset += 4;
        sink.write_u32(extra)?;
    }
    sink.write_u32(count)?;
    sink.skip(size)?;

    Ok(offset + 16)
}

/// Muxer for one or more DASH MP4 sources.
pub struct Mp4FromDashWriter<S> {
    readers:        Vec<Mp4DashReader<S>>,
    chunks:         Vec<Option<Mp4DashChunk>>,
    tracks:         Vec<Mp4Track>,
    main_brand:     Option<FourCC>,
    time:           Time,
    parsed:         bool,
    done:           bool,
}

impl<S: MediaStream> Mp4FromDashWriter<S> {
    pub fn new(sources: Vec<S>) -> io::Result<Mp4FromDashWriter<S>> {
        for (i, src) in sources.iter().enumerate() {
            if !src.can_rewind() || !src.can_read() {
                return Err(ioerr!(Unsupported, "source stream {} must be readable and allow seek", i));
            }
        }
        let chunks = sources.iter().map(|_| None).collect();
        Ok(Mp4FromDashWriter {
            readers: sources.into_iter().map(Mp4DashReader::new).collect(),
            chunks,
            tracks: Vec::new(),
            main_brand: None,
            time: Time::now(),
            parsed: false,
            done: false,
        })
    }

    pub fn parse_sources(&mut self) -> io::Result<()> {
        if self.done {
            return Err(ioerr!(InvalidInput, "already done"));
        }
        if self.parsed {
            return Err(ioerr!(InvalidInput, "already parsed"));
        }
        let res = self.readers.iter_mut().try_for_each(|r| r.parse());
        self.parsed = true;
        res
    }

    pub fn tracks_from_source(&self, index: usize) -> io::Result<&[Mp4Track]> {
        if !self.parsed {
            return Err(ioerr!(InvalidInput, "All sources must be parsed first"));
        }
        match self.readers.get(index) {
            Some(r) => Ok(r.tracks()),
            None => Err(ioerr!(InvalidInput, "source index {} out of range", index)),
        }
    }

    /// Select one track per source.
    pub fn select_tracks(&mut self, track_index: &[usize]) -> io::Result<()> {
        if self.done {
            return Err(ioerr!(InvalidInput, "already done"));
        }
        if !self.parsed {
            return Err(ioerr!(InvalidInput, "All sources must be parsed first"));
        }
        if !self.tracks.is_empty() {
            return Err(ioerr!(InvalidInput, "tracks already selected"));
        }
        if track_index.len() != self.readers.len() {
            return Err(ioerr!(InvalidInput, "expected {} track indexes, got {}",
                self.readers.len(), track_index.len()));
        }
        let mut tracks = Vec::with_capacity(self.readers.len());
        for (reader, &idx) in self.readers.iter_mut().zip(track_index) {
            tracks.push(reader.select_track(idx)?.clone());
        }
        self.tracks = tracks;
        Ok(())
    }

    /// Use `brand` as the major brand instead of `mp42`.
    pub fn set_main_brand(&mut self, brand: FourCC) {
        self.main_brand = Some(brand);
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn is_parsed(&self) -> bool {
        self.parsed
    }

    /// Close all sources.
    pub fn close(&mut self) -> io::Result<()> {
        self.done = true;
        self.parsed = true;
        for r in self.readers.iter_mut() {
            r.stream_mut().close()?;
        }
        self.chunks.clear();
        self.tracks.clear();
        Ok(())
    }

    pub fn build<O: MediaStream>(&mut self, output: O) -> io::Result<()> {
        if self.done {
            return Err(ioerr!(InvalidInput, "already done"));
        }
        if self.tracks.len() != self.readers.len() {
            return Err(ioerr!(InvalidInput, "tracks must be selected first"));
        }
        if !output.can_write() {
            return Err(ioerr!(Unsupported, "the provided output is not writable"));
        }

        let ntracks = self.tracks.len();
        let mut read = 8u64;
        let mut total_sample_size = 0u64;
        let mut sample_extra = vec![0u64; ntracks];
        let mut default_sample_duration = vec![0u32; ntracks];
        let mut sample_count = vec![0u32; ntracks];
        let mut tables: Vec<TablesInfo> = (0..ntracks).map(|_| TablesInfo::default()).collect();

        // near 1 second of audio per chunk for a single audio track.
        let single_sample_buffer = if ntracks == 1 && self.tracks[0].kind == TrackKind::Audio {
            Some(self.tracks[0].trak.mdia.timescale / 1000).filter(|&n| n > 0)
        } else {
            None
        };

        //
        // First pass: sample counts and table sizes.
        //
        for i in 0..ntracks {
            let mut samples_size = None;
            let mut sample_size_changes = 0;
            let mut composition_offset_last = None;
            let tables = &mut tables[i];

            while let Some(mut chunk) = self.readers[i].next_chunk(true)? {
                read += chunk.trun().chunk_size;
                sample_extra[i] += chunk.trun().chunk_duration;

                while let Some(info) = chunk.next_sample_info() {
                    if info.is_keyframe {
                        tables.stss += 1;
                    }
                    if info.sample_duration > default_sample_duration[i] {
                        default_sample_duration[i] = info.sample_duration;
                    }
                    tables.samples += 1;
                    if samples_size != Some(info.sample_size) {
                        samples_size = Some(info.sample_size);
                        sample_size_changes += 1;
                    }
                    if info.has_composition_offset && composition_offset_last != Some(info.composition_offset) {
                        tables.ctts += 1;
                        composition_offset_last = Some(info.composition_offset);
                    }
                    total_sample_size += info.sample_size as u64;
                }
            }

            self.readers[i].rewind()?;

            match single_sample_buffer {
                Some(n) => tables.init_chunk_tables(n, n),
                None => tables.init_chunk_tables(SAMPLES_PER_CHUNK_INIT, SAMPLES_PER_CHUNK),
            }

            sample_count[i] = tables.samples;
            // constant sample size: only the default, no rows.
            if sample_size_changes == 1 {
                tables.stsz = 0;
                tables.stsz_default = samples_size.unwrap_or(0);
            } else {
                tables.stsz = tables.samples;
            }
            // all samples are keyframes, no sync sample table.
            if tables.stss == sample_count[i] {
                tables.stss = 0;
            }

            if self.tracks[i].trak.tkhd.duration < 1 {
                self.tracks[i].trak.tkhd.duration = sample_extra[i];
            }

            log::debug!("Mp4FromDashWriter::build: track {}: {} samples, {} chunks, stsz rows {} stss rows {} ctts rows {}",
                i, sample_count[i], tables.stco, tables.stsz, tables.stss, tables.ctts);
        }

        let is64 = uses_co64(read);

        // size of the moov.
        let mut counter = CountBytes::new();
        let moov_size = self.make_moov(&mut counter, &mut tables, is64)?;

        let mut moov_buf = if moov_size < THRESHOLD_MOOV_LENGTH {
            Some(MemBuffer::with_size(moov_size as usize))
        } else {
            None
        };
        log::debug!("Mp4FromDashWriter::build: moov size {} in memory {} co64 {}",
            moov_size, moov_buf.is_some(), is64);

        let mut out = Output {
            stream: output,
            offset: 0,
            last_write_offset: None,
        };

        let ftyp_size = self.make_ftyp(&mut out)?;

        // reserve space for the moov.
        let zeros = vec![0u8; 64 * 1024];
        let mut left = moov_size;
        while left > 0 {
            let n = std::cmp::min(left, zeros.len() as u64) as usize;
            out.write(&zeros[..n])?;
            left -= n as u64;
        }

        // now for real. this fills in the table offsets.
        match moov_buf {
            Some(ref mut buf) => {
                self.make_moov(buf, &mut tables, is64)?;
            },
            None => {
                out.seek(ftyp_size)?;
                self.make_moov(&mut out, &mut tables, is64)?;
            },
        }

        // tables that can be written right away: stts stsc sbgp.
        let mut ctts_run: Vec<Option<(u32, i32)>> = vec![None; ntracks];
        for i in 0..ntracks {
            let t = &mut tables[i];
            let data = be32(&[sample_count[i], default_sample_duration[i]]);
            write_entries(&mut out, &mut moov_buf, t.offsets.stts, &data)?;
            let data = be32(&t.stsc_entries);
            write_entries(&mut out, &mut moov_buf, t.offsets.stsc, &data)?;
            if let Some(sbgp) = t.offsets.sbgp {
                write_entries(&mut out, &mut moov_buf, sbgp, &be32(&[sample_count[i]]))?;
            }
        }
        out.restore()?;

        out.write(&make_mdat(total_sample_size, is64))?;

        //
        // Second pass: copy the samples, round robin, one chunk per track.
        //
        let mut sample_index = vec![0u32; ntracks];
        let mut finished = vec![false; ntracks];
        let mut written = ntracks;
        while written > 0 {
            written = 0;

            for i in 0..ntracks {
                if finished[i] {
                    continue;
                }
                let chunk_offset = out.offset;
                let limit = match single_sample_buffer {
                    Some(n) => n,
                    None if sample_index[i] == 0 => SAMPLES_PER_CHUNK_INIT,
                    None => SAMPLES_PER_CHUNK,
                };
                let mut sizes = Vec::with_capacity(limit as usize);
                let mut sync = Vec::new();
                let mut count = 0;

                while count < limit {
                    let sample = match self.next_sample(i)? {
                        Some(sample) => sample,
                        None => {
                            // flush the last ctts run.
                            if let Some((n, offset)) = ctts_run[i].take() {
                                let t = &mut tables[i];
                                t.offsets.ctts = write_entries(&mut out, &mut moov_buf, t.offsets.ctts,
                                    &be32(&[n, offset as u32]))?;
                                out.restore()?;
                            }
                            finished[i] = true;
                            break;
                        },
                    };
                    count += 1;
                    sample_index[i] += 1;

                    let t = &mut tables[i];
                    if t.ctts > 0 {
                        let offset = sample.info.composition_offset;
                        ctts_run[i] = match ctts_run[i] {
                            Some((n, last)) if last == offset => Some((n + 1, last)),
                            prev => {
                                if let Some((n, last)) = prev {
                                    t.offsets.ctts = write_entries(&mut out, &mut moov_buf, t.offsets.ctts,
                                        &be32(&[n, last as u32]))?;
                                    out.restore()?;
                                }
                                Some((1, offset))
                            },
                        };
                    }

                    if t.stss > 0 && sample.info.is_keyframe {
                        sync.push(sample_index[i]);
                    }
                    if t.stsz > 0 {
                        sizes.push(sample.data.len() as u32);
                    }

                    out.write(&sample.data)?;
                }

                if count > 0 {
                    written += 1;
                    let t = &mut tables[i];

                    if t.stsz > 0 {
                        t.offsets.stsz = write_entries(&mut out, &mut moov_buf, t.offsets.stsz, &be32(&sizes))?;
                    }
                    if !sync.is_empty() {
                        t.offsets.stss = write_entries(&mut out, &mut moov_buf, t.offsets.stss, &be32(&sync))?;
                    }
                    if t.stco > 0 {
                        let data = if is64 {
                            chunk_offset.to_be_bytes().to_vec()
                        } else {
                            (chunk_offset as u32).to_be_bytes().to_vec()
                        };
                        t.offsets.stco = write_entries(&mut out, &mut moov_buf, t.offsets.stco, &data)?;
                    }
                    out.restore()?;
                }
            }
        }

        if let Some(buf) = moov_buf.take() {
            out.seek(ftyp_size)?;
            out.write(buf.as_slice())?;
        }
        out.stream.flush()?;

        Ok(())
    }

    fn next_sample(&mut self, track: usize) -> io::Result<Option<Mp4DashSample>> {
        loop {
            if self.chunks[track].is_none() {
                match self.readers[track].next_chunk(false)? {
                    Some(chunk) => self.chunks[track] = Some(chunk),
                    None => return Ok(None),
                }
            }
            if let Some(chunk) = self.chunks[track].as_mut() {
                if let Some(sample) = chunk.next_sample(&mut self.readers[track])? {
                    return Ok(Some(sample));
                }
            }
            self.chunks[track] = None;
        }
    }

    fn make_ftyp<O: MediaStream>(&self, out: &mut Output<O>) -> io::Result<u64> {
        let mut size = 16 + COMPATIBLE_BRANDS.len() as u32 * 4;
        if self.main_brand.is_some() {
            size += 4;
        }

        let mut buf = Vec::with_capacity(size as usize);
        buf.extend_from_slice(&size.to_be_bytes());
        buf.extend_from_slice(&FTYP.to_bytes());
        match self.main_brand {
            None => {
                buf.extend_from_slice(&BRAND_MP42.to_bytes());
                buf.extend_from_slice(&512u32.to_be_bytes());
            },
            Some(brand) => {
                buf.extend_from_slice(&brand.to_bytes());
                buf.extend_from_slice(&0u32.to_be_bytes());
                buf.extend_from_slice(&BRAND_MP42.to_bytes());
            },
        }
        for brand in COMPATIBLE_BRANDS.iter() {
            buf.extend_from_slice(&brand.to_bytes());
        }

        out.write(&buf)?;
        Ok(size as u64)
    }

    fn make_mvhd(&self, sink: &mut dyn BoxSink, longest_track: u64) -> io::Result<()> {
        sink.write(&[0x00, 0x00, 0x00, 0x78, b'm', b'v', b'h', b'd', 0x01, 0x00, 0x00, 0x00])?;
        sink.write(&self.time.0.to_be_bytes())?;
        sink.write(&self.time.0.to_be_bytes())?;
        sink.write_u32(DEFAULT_TIMESCALE)?;
        sink.write(&longest_track.to_be_bytes())?;

        // rate, volume, reserved.
        sink.write(&[0x00, 0x01, 0x00, 0x00, 0x01, 0x00])?;
        sink.write(&[0u8; 10])?;
        // matrix
        sink.write(&be32(&[0x10000, 0, 0, 0, 0x10000, 0, 0, 0, 0x40000000]))?;
        // predefined
        sink.write(&[0u8; 24])?;
        sink.write_u32(self.tracks.len() as u32 + 1)
    }

    // Build the moov, returns its size.
    fn make_moov(&self, sink: &mut dyn BoxSink, tables: &mut [TablesInfo], is64: bool) -> io::Result<u64> {
        let start = sink.pos();
        sink.write(&[0, 0, 0, 0, b'm', b'o', b'o', b'v'])?;

        let durations: Vec<u64> = self.tracks
            .iter()
            .map(|t| {
                let timescale = t.trak.mdia.timescale;
                if timescale == 0 {
                    return 0;
                }
                ((t.trak.tkhd.duration as f64 / timescale as f64) * DEFAULT_TIMESCALE as f64).ceil() as u64
            })
            .collect();
        let longest = durations.iter().cloned().max().unwrap_or(0);

        self.make_mvhd(sink, longest)?;

        for (i, track) in self.tracks.iter().enumerate() {
            if track.trak.tkhd.matrix.len() != 36 {
                return Err(ioerr!(InvalidInput, "bad track matrix length (expected 36) in track n°{}", i));
            }
            self.make_trak(sink, i, durations[i], &mut tables[i], is64)?;
        }

        length_for(sink, start)
    }

    fn make_trak(&self, sink: &mut dyn BoxSink, index: usize, duration: u64, tables: &mut TablesInfo, is64: bool) -> io::Result<()> {
        let track = &self.tracks[index];
        let tkhd = &track.trak.tkhd;
        let start = sink.pos();

        sink.write(&[
            // trak header
            0x00, 0x00, 0x00, 0x00, b't', b'r', b'a', b'k',
            // tkhd header
            0x00, 0x00, 0x00, 0x68, b't', b'k', b'h', b'd', 0x01, 0x00, 0x00, 0x03,
        ])?;

        let mut buf = [0u8; 48];
        buf[0..8].copy_from_slice(&self.time.0.to_be_bytes());
        buf[8..16].copy_from_slice(&self.time.0.to_be_bytes());
        buf[16..20].copy_from_slice(&(index as u32 + 1).to_be_bytes());
        buf[24..32].copy_from_slice(&duration.to_be_bytes());
        buf[40..42].copy_from_slice(&tkhd.layer.to_be_bytes());
        buf[42..44].copy_from_slice(&tkhd.alternate_group.to_be_bytes());
        buf[44..46].copy_from_slice(&tkhd.volume.to_be_bytes());
        sink.write(&buf)?;

        sink.write(&tkhd.matrix)?;
        sink.write(&tkhd.width.to_be_bytes())?;
        sink.write(&tkhd.height.to_be_bytes())?;

        sink.write(&[
            // edts header
            0x00, 0x00, 0x00, 0x24, b'e', b'd', b't', b's',
            // elst header, one entry.
            0x00, 0x00, 0x00, 0x1C, b'e', b'l', b's', b't',
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01,
        ])?;

        let (media_time, media_rate) = match track.trak.elst {
            Some(ref elst) => (elst.media_time as i32, elst.media_rate),
            None => (0, 0x10000),
        };
        sink.write_u32(duration as u32)?;
        sink.write(&media_time.to_be_bytes())?;
        sink.write(&media_rate.to_be_bytes())?;

        self.make_mdia(sink, track, tables, is64)?;

        length_for(sink, start)?;
        Ok(())
    }

    fn make_mdia(&self, sink: &mut dyn BoxSink, track: &Mp4Track, tables: &mut TablesInfo, is64: bool) -> io::Result<()> {
        let mdia = &track.trak.mdia;

        let start_mdia = sink.pos();
        sink.write(&[0, 0, 0, 0, b'm', b'd', b'i', b'a'])?;
        sink.write(&mdia.mdhd)?;
        sink.write(&make_hdlr(&mdia.hdlr))?;

        let start_minf = sink.pos();
        sink.write(&[0, 0, 0, 0, b'm', b'i', b'n', b'f'])?;
        sink.write(&mdia.minf.mhd)?;
        sink.write(&mdia.minf.dinf)?;

        let start_stbl = sink.pos();
        sink.write(&[0, 0, 0, 0, b's', b't', b'b', b'l'])?;
        sink.write(&mdia.minf.stsd)?;

        let offsets = &mut tables.offsets;
        offsets.stts = make_table(sink, STTS, None, 1, 2, 1)?;
        if tables.stss > 0 {
            offsets.stss = make_table(sink, STSS, None, tables.stss, 1, tables.stss)?;
        }
        if tables.ctts > 0 {
            offsets.ctts = make_table(sink, CTTS, None, tables.ctts, 2, tables.ctts)?;
        }
        offsets.stsc = make_table(sink, STSC, None, tables.stsc, 3, tables.stsc)?;
        // the sample count, even when there are no rows.
        offsets.stsz = make_table(sink, STSZ, Some(tables.stsz_default), tables.samples, 1, tables.stsz)?;
        offsets.stco = if is64 {
            make_table(sink, CO64, None, tables.stco, 2, tables.stco)?
        } else {
            make_table(sink, STCO, None, tables.stco, 1, tables.stco)?
        };

        if track.kind == TrackKind::Audio {
            sink.write(&SGPD)?;
            let offset = sink.pos();
            sink.write(&SBGP)?;
            offsets.sbgp = Some(offset + 0x14);
        }

        length_for(sink, start_stbl)?;
        length_for(sink, start_minf)?;
        length_for(sink, start_mdia)?;
        Ok(())
    }
}

fn make_hdlr(hdlr: &crate::mp4_dash_reader::Hdlr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(0x21);
    buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x21, b'h', b'd', b'l', b'r']);
    buf.extend_from_slice(&[0u8; 4]);
    buf.extend_from_slice(&hdlr.kind.to_bytes());
    buf.extend_from_slice(&hdlr.subtype.to_bytes());
    buf.extend_from_slice(&hdlr.reserved);
    // empty name.
    buf.push(0);
    buf
}

fn make_mdat(size: u64, is64: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    if is64 {
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&MDAT.to_bytes());
        buf.extend_from_slice(&(size + 16).to_be_bytes());
    } else {
        buf.extend_from_slice(&((size + 8) as u32).to_be_bytes());
        buf.extend_from_slice(&MDAT.to_bytes());
    }
    buf
}

// Sample group description, "roll" group with a roll distance of -1.
const SGPD: [u8; 26] = [
    0x00, 0x00, 0x00, 0x1A, b's', b'g', b'p', b'd',
    0x01, 0x00, 0x00, 0x00, b'r', b'o', b'l', b'l',
    0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x01,
    0xFF, 0xFF,
];

// Sample to group, one entry. The sample count is patched in later.
const SBGP: [u8; 28] = [
    0x00, 0x00, 0x00, 0x1C, b's', b'b', b'g', b'p',
    0x00, 0x00, 0x00, 0x00, b'r', b'o', b'l', b'l',
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x01,
];
