//! Mux WebM tracks into a single WebM file.
//!
//! Each source contributes one track. Blocks are interleaved in windows
//! of `INTERV` milliseconds: a source is read until its timestamps pass
//! the current window limit, then the next source gets its turn.
//!
//! The file header is written with fixed offsets, so the few values that
//! are only known at the end (segment size, duration, position of the
//! first cluster and of the cues, cluster sizes) are patched in place.
//! That needs an output that can be rewound.
//!
use std::io;

use crate::stream::MediaStream;
use crate::webm_reader::{Cluster, Segment, WebMReader, WebMTrack};

const BUFFER_SIZE: usize = 8 * 1024;
const DEFAULT_TIMECODE_SCALE: u64 = 1_000_000;
// 100ms at the default timecode scale.
const INTERV: i64 = 100;
const DEFAULT_CUES_EACH_MS: i64 = 5000;
const CLUSTER_HEADER_SIZE: u64 = 8;
const CUE_RESERVE_SIZE: u64 = 65535;
const MINIMUM_EBML_VOID_SIZE: u64 = 4;

const EBML_HEADER: [u8; 43] = [
    0x1A, 0x45, 0xDF, 0xA3, 0x01, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x1F, 0x42, 0x86, 0x81, 0x01,
    0x42, 0xF7, 0x81, 0x01, 0x42, 0xF2, 0x81, 0x04,
    0x42, 0xF3, 0x81, 0x08, 0x42, 0x82, 0x84, 0x77,
    0x65, 0x62, 0x6D, 0x42, 0x87, 0x81, 0x02,
    0x42, 0x85, 0x81, 0x02,
];

// Segment with a 7 byte content size, filled in at the end.
const SEGMENT_HEADER: [u8; 12] = [
    0x18, 0x53, 0x80, 0x67, 0x01,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

// Info and Tracks come right after the SeekHead, their offsets are fixed.
// The Cluster and Cues offsets are patched.
const SEEK_HEAD: [u8; 67] = [
    0x11, 0x4d, 0x9b, 0x74, 0xbe,
    0x4d, 0xbb, 0x8b,
    0x53, 0xab, 0x84, 0x15, 0x49, 0xa9, 0x66, 0x53, 0xac, 0x81,
    0x43,
    0x4d, 0xbb, 0x8b,
    0x53, 0xab, 0x84, 0x16, 0x54, 0xae, 0x6b, 0x53, 0xac, 0x81,
    0x56,
    0x4d, 0xbb, 0x8e,
    0x53, 0xab, 0x84, 0x1f, 0x43, 0xb6, 0x75, 0x53, 0xac, 0x84,
    0x00, 0x00, 0x00, 0x00,
    0x4d, 0xbb, 0x8e,
    0x53, 0xab, 0x84, 0x1c, 0x53, 0xbb, 0x6b, 0x53, 0xac, 0x84,
    0x00, 0x00, 0x00, 0x00,
];

// Offsets of the patched fields, relative to the end of the EBML header.
const OFFSET_SEGMENT_SIZE: u64 = 5;
const OFFSET_CLUSTER_SEEK: u64 = 58;
const OFFSET_CUES_SEEK: u64 = 75;
const OFFSET_INFO_DURATION: u64 = 94;

// Cues with a 3 byte size, filled in at the end.
const CUES_HEADER: [u8; 7] = [0x1c, 0x53, 0xbb, 0x6b, 0x20, 0x00, 0x00];

/// Encode `number` as an EBML variable length integer. With `with_length`
/// the result is instead a length byte followed by the big-endian value,
/// the way unsigned integer elements are stored.
pub fn encode(number: u64, with_length: bool) -> io::Result<Vec<u8>> {
    let mut length = match (1..=7).find(|&i| number < 1u64 << (7 * i)) {
        Some(length) => length,
        None => return Err(ioerr!(InvalidInput, "Can't encode a number bigger than 7 bytes: {}", number)),
    };
    // all ones is reserved.
    if number == (1u64 << (7 * length)) - 1 {
        length += 1;
    }

    let offset = if with_length { 1 } else { 0 };
    let mut buffer = vec![0u8; offset + length];
    for i in 0..length {
        buffer[offset + length - 1 - i] = (number >> (8 * i)) as u8;
    }
    if with_length {
        buffer[0] = 0x80 | length as u8;
    } else {
        buffer[0] |= 0x80 >> (length - 1);
    }
    Ok(buffer)
}

fn encode_string(value: &str) -> io::Result<Vec<Vec<u8>>> {
    let s = value.as_bytes();
    Ok(vec![encode(s.len() as u64, false)?, s.to_vec()])
}

// `buffer[1]` is a placeholder, fill in the size of `buffer[2..]`.
fn length_for(mut buffer: Vec<Vec<u8>>) -> io::Result<Vec<Vec<u8>>> {
    let size: usize = buffer[2..].iter().map(|b| b.len()).sum();
    buffer[1] = encode(size as u64, false)?;
    Ok(buffer)
}

struct Output<O> {
    stream:     O,
    written:    u64,
}

impl<O: MediaStream> Output<O> {
    fn dump(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn dump_all(&mut self, buffers: &[Vec<u8>]) -> io::Result<()> {
        buffers.iter().try_for_each(|b| self.dump(b))
    }

    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        if self.stream.can_seek() {
            self.stream.seek(offset)?;
        } else if offset > self.written {
            self.stream.skip(offset - self.written)?;
        } else {
            self.stream.rewind()?;
            self.stream.skip(offset)?;
        }
        self.written = offset;
        Ok(())
    }

    fn write_u32_at(&mut self, offset: u64, value: u32) -> io::Result<()> {
        self.seek_to(offset)?;
        self.dump(&value.to_be_bytes())
    }

    fn make_ebml_void(&mut self, amount: u64, wipe: bool) -> io::Result<()> {
        let size = (amount - MINIMUM_EBML_VOID_SIZE) as u16;
        self.dump(&[0xec, 0x20])?;
        self.dump(&size.to_be_bytes())?;
        if wipe {
            let zeroes = [0u8; BUFFER_SIZE];
            let mut left = size as usize;
            while left > 0 {
                let n = std::cmp::min(left, zeroes.len());
                self.dump(&zeroes[..n])?;
                left -= n;
            }
        }
        Ok(())
    }
}

// A block read from a source, timecode in milliseconds.
struct Block {
    data:               Vec<u8>,
    track:              usize,
    flags:              u8,
    absolute_timecode:  i64,
}

impl Block {
    fn is_keyframe(&self) -> bool {
        self.flags & 0x80 == 0x80
    }
}

enum NextBlock {
    Block(Block),
    ClusterEnd,
    Done,
}

struct KeyFrame {
    cluster_position:   u64,
    relative_position:  i64,
    timecode:           i64,
}

impl KeyFrame {
    fn new(segment: u64, cluster: u64, block: u64, timecode: i64) -> KeyFrame {
        KeyFrame {
            cluster_position: cluster - segment,
            relative_position: block as i64 - cluster as i64 - CLUSTER_HEADER_SIZE as i64,
            timecode,
        }
    }
}

#[derive(Debug)]
struct ClusterInfo {
    offset: u64,
    size:   u64,
}

struct Source<S> {
    reader:     WebMReader<S>,
    segment:    Option<Segment>,
    cluster:    Option<Cluster>,
}

pub struct WebMWriter<S> {
    sources:    Vec<Source<S>>,
    tracks:     Vec<WebMTrack>,
    clusters:   Vec<ClusterInfo>,
    parsed:     bool,
    done:       bool,
}

impl<S: MediaStream> WebMWriter<S> {
    pub fn new(sources: Vec<S>) -> WebMWriter<S> {
        let sources = sources
            .into_iter()
            .map(|s| Source { reader: WebMReader::new(s), segment: None, cluster: None })
            .collect();
        WebMWriter {
            sources,
            tracks: Vec::new(),
            clusters: Vec::with_capacity(256),
            parsed: false,
            done: false,
        }
    }

    pub fn parse_sources(&mut self) -> io::Result<()> {
        if self.done {
            return Err(ioerr!(InvalidInput, "already done"));
        }
        if self.parsed {
            return Err(ioerr!(InvalidInput, "already parsed"));
        }
        let res = self.sources.iter_mut().try_for_each(|s| s.reader.parse());
        self.parsed = true;
        res
    }

    pub fn tracks_from_source(&self, index: usize) -> io::Result<&[WebMTrack]> {
        if self.done {
            return Err(ioerr!(InvalidInput, "already done"));
        }
        if !self.parsed {
            return Err(ioerr!(InvalidInput, "All sources must be parsed first"));
        }
        match self.sources.get(index) {
            Some(s) => Ok(s.reader.tracks()),
            None => Err(ioerr!(InvalidInput, "source index {} out of range", index)),
        }
    }

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
        if track_index.len() != self.sources.len() {
            return Err(ioerr!(InvalidInput, "expected {} track indexes, got {}",
                self.sources.len(), track_index.len()));
        }
        let mut tracks = Vec::with_capacity(self.sources.len());
        for (src, &idx) in self.sources.iter_mut().zip(track_index) {
            tracks.push(src.reader.select_track(idx)?.clone());
            src.segment = src.reader.next_segment()?;
        }
        self.tracks = tracks;
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Close all the sources.
    pub fn close(&mut self) -> io::Result<()> {
        self.done = true;
        self.parsed = true;
        for src in self.sources.iter_mut() {
            src.segment = None;
            src.cluster = None;
            src.reader.stream_mut().close()?;
        }
        self.clusters.clear();
        Ok(())
    }

    pub fn build<O: MediaStream>(&mut self, output: O) -> io::Result<()> {
        if self.done {
            return Err(ioerr!(InvalidInput, "already done"));
        }
        if self.tracks.is_empty() || self.tracks.len() != self.sources.len() {
            return Err(ioerr!(InvalidInput, "tracks must be selected first"));
        }
        if !output.can_rewind() {
            return Err(ioerr!(Unsupported, "The output stream must be allow seek"));
        }
        let mut out = Output { stream: output, written: 0 };

        out.dump(&EBML_HEADER)?;

        let offset_segment_size = out.written + OFFSET_SEGMENT_SIZE;
        let offset_info_duration = out.written + OFFSET_INFO_DURATION;
        let offset_cluster_seek = out.written + OFFSET_CLUSTER_SEEK;
        let offset_cues_seek = out.written + OFFSET_CUES_SEEK;

        let mut header = vec![SEGMENT_HEADER.to_vec()];
        let segment_offset = out.written + SEGMENT_HEADER.len() as u64;
        header.push(SEEK_HEAD.to_vec());

        // info, the duration must fit in 4 bytes.
        header.push(vec![0x15, 0x49, 0xa9, 0x66, 0x8e, 0x2a, 0xd7, 0xb1]);
        header.push(encode(DEFAULT_TIMECODE_SCALE, true)?);
        header.push(vec![0x44, 0x89, 0x84, 0x00, 0x00, 0x00, 0x00]);

        header.extend(self.make_tracks()?);
        out.dump_all(&header)?;

        let cue_offset = out.written;
        out.make_ebml_void(CUE_RESERVE_SIZE, true)?;

        let n = self.tracks.len();
        let mut default_sample_duration: Vec<Option<i64>> = self
            .tracks
            .iter()
            .map(|t| t.default_duration.map(|d| (d as f64 / DEFAULT_TIMECODE_SCALE as f64).ceil() as i64))
            .collect();
        let mut duration: Vec<Option<i64>> = vec![None; n];

        let cues_track = self.select_track_for_cue();
        let mut next_cue_time = if self.tracks[cues_track].track_type == 1 {
            None
        } else {
            Some(0)
        };
        let mut key_frames = Vec::with_capacity(32);
        log::debug!("WebMWriter::build: {} tracks, cues for track {}", n, cues_track);

        let first_cluster_offset = out.written;
        let mut current_cluster_offset = self.make_cluster(&mut out, 0, 0, true)?;

        let mut base_timecode = 0i64;
        let mut limit_timecode: Option<i64> = None;
        let mut limit_timecode_by = cues_track;
        let mut new_cluster_by: Option<usize> = None;

        loop {
            let mut blocks_written = 0;
            let mut i = 0;
            while i < n {
                let block = match self.next_block_from(i)? {
                    NextBlock::Done => {
                        i += 1;
                        continue;
                    },
                    NextBlock::ClusterEnd => {
                        blocks_written = 1;
                        new_cluster_by = Some(i);
                        i += 1;
                        continue;
                    },
                    NextBlock::Block(block) => block,
                };

                if new_cluster_by == Some(i) {
                    limit_timecode_by = i;
                    new_cluster_by = None;
                    base_timecode = block.absolute_timecode;
                    limit_timecode = Some(base_timecode + INTERV);
                    current_cluster_offset = self.make_cluster(&mut out, base_timecode, current_cluster_offset, true)?;
                }

                if cues_track == i {
                    let cue = match next_cue_time {
                        Some(t) => block.absolute_timecode >= t,
                        None => block.is_keyframe(),
                    };
                    if cue {
                        if let Some(t) = next_cue_time.as_mut() {
                            *t += DEFAULT_CUES_EACH_MS;
                        }
                        key_frames.push(KeyFrame::new(
                            segment_offset,
                            current_cluster_offset,
                            out.written,
                            block.absolute_timecode,
                        ));
                    }
                }

                write_block(&mut out, &block, base_timecode)?;
                blocks_written += 1;

                // unknown sample duration, use the distance between the first two blocks.
                if default_sample_duration[i].is_none() {
                    if let Some(prev) = duration[i] {
                        default_sample_duration[i] = Some(block.absolute_timecode - prev);
                    }
                }
                duration[i] = Some(block.absolute_timecode);

                match limit_timecode {
                    None => limit_timecode = Some(block.absolute_timecode + INTERV),
                    Some(limit) if block.absolute_timecode >= limit => {
                        if limit_timecode_by != i {
                            limit_timecode = Some(limit + INTERV - (block.absolute_timecode - limit));
                        }
                        i += 1;
                    },
                    Some(_) => {},
                }
            }
            if blocks_written == 0 {
                break;
            }
        }

        self.make_cluster(&mut out, 0, current_cluster_offset, false)?;

        let segment_size = out.written - offset_segment_size - 7;
        out.seek_to(offset_segment_size)?;
        out.dump(&segment_size.to_be_bytes()[1..])?;

        let mut longest = 0i64;
        for (d, dsd) in duration.iter().zip(default_sample_duration.iter()) {
            if let Some(mut d) = *d {
                if let Some(dsd) = dsd.filter(|&dsd| dsd > 0) {
                    d += dsd;
                }
                longest = std::cmp::max(longest, d);
            }
        }
        out.seek_to(offset_info_duration)?;
        out.dump(&(longest as f32).to_be_bytes())?;

        out.write_u32_at(offset_cluster_seek, (first_cluster_offset - segment_offset) as u32)?;

        out.seek_to(cue_offset)?;
        out.dump(&CUES_HEADER)?;
        let header_size = CUES_HEADER.len() as u64;
        let mut cue_size = 0u64;
        let mut cue_points = 0;
        for key_frame in &key_frames {
            let cue = make_cue_point(cues_track, key_frame)?;
            if cue_size + cue.len() as u64 + header_size + MINIMUM_EBML_VOID_SIZE > CUE_RESERVE_SIZE {
                log::warn!("WebMWriter::build: no space left for cues, {} of {} written",
                    cue_points, key_frames.len());
                break;
            }
            cue_size += cue.len() as u64;
            cue_points += 1;
            out.dump(&cue)?;
        }
        out.make_ebml_void(CUE_RESERVE_SIZE - cue_size - header_size, false)?;

        out.seek_to(cue_offset + 5)?;
        out.dump(&(cue_size as u16).to_be_bytes())?;

        out.write_u32_at(offset_cues_seek, (cue_offset - segment_offset) as u32)?;

        for cluster in &self.clusters {
            out.write_u32_at(cluster.offset, cluster.size as u32 | 0x10000000)?;
        }
        log::debug!("WebMWriter::build: {} clusters, {} cue points, duration {}ms",
            self.clusters.len(), cue_points, longest);

        out.stream.flush()
    }

    fn next_block_from(&mut self, index: usize) -> io::Result<NextBlock> {
        let src = &mut self.sources[index];
        loop {
            if src.segment.is_none() {
                match src.reader.next_segment()? {
                    Some(segment) => src.segment = Some(segment),
                    None => return Ok(NextBlock::Done),
                }
            }

            if src.cluster.is_none() {
                let cluster = match src.segment.as_mut() {
                    Some(segment) => segment.next_cluster(&mut src.reader)?,
                    None => None,
                };
                match cluster {
                    Some(cluster) => src.cluster = Some(cluster),
                    None => {
                        src.segment = None;
                        continue;
                    },
                }
            }

            let block = match src.cluster.as_mut() {
                Some(cluster) => cluster.next_simple_block(&mut src.reader)?,
                None => None,
            };
            let block = match block {
                Some(block) => block,
                None => {
                    src.cluster = None;
                    return Ok(NextBlock::ClusterEnd);
                },
            };

            let data = block.read_data(&mut src.reader)?;
            return Ok(NextBlock::Block(Block {
                data,
                track: index,
                flags: block.flags,
                absolute_timecode: block.absolute_timecode_ns / DEFAULT_TIMECODE_SCALE as i64,
            }));
        }
    }

    // Finish the previous cluster (if any) and optionally start a new one.
    // Returns the offset of the new cluster.
    fn make_cluster<O: MediaStream>(&mut self, out: &mut Output<O>, timecode: i64, prev_offset: u64, create: bool) -> io::Result<u64> {
        if prev_offset > 0 {
            if let Some(prev) = self.clusters.last_mut() {
                prev.size = out.written - prev_offset - CLUSTER_HEADER_SIZE;
                if prev.size >= 0x10000000 {
                    return Err(ioerr!(InvalidInput, "cluster at {} is too large ({} bytes)", prev_offset, prev.size));
                }
            }
        }

        let offset = out.written;

        if create {
            if timecode < 0 {
                return Err(ioerr!(InvalidInput, "negative cluster timecode {}", timecode));
            }
            out.dump(&[0x1f, 0x43, 0xb6, 0x75])?;
            self.clusters.push(ClusterInfo { offset: out.written, size: 0 });
            out.dump(&[0x10, 0x00, 0x00, 0x00, 0xe7])?;
            out.dump(&encode(timecode as u64, true)?)?;
        }

        Ok(offset)
    }

    fn make_tracks(&self) -> io::Result<Vec<Vec<u8>>> {
        let mut buffer = vec![vec![0x16, 0x54, 0xae, 0x6b], Vec::new()];
        for (i, track) in self.tracks.iter().enumerate() {
            buffer.extend(make_track_entry(i, track)?);
        }
        length_for(buffer)
    }

    // Cues for the first video track, if there is one, else the first audio track.
    fn select_track_for_cue(&self) -> usize {
        let video = self.tracks.iter().filter(|t| t.track_type == 1).count();
        let audio = self.tracks.iter().filter(|t| t.track_type == 2).count();
        let kind = if video > 0 {
            1
        } else if audio > 0 {
            2
        } else {
            return 0;
        };
        self.tracks.iter().position(|t| t.track_type == kind).unwrap_or(0)
    }
}

fn make_track_entry(index: usize, track: &WebMTrack) -> io::Result<Vec<Vec<u8>>> {
    let id = encode(index as u64 + 1, true)?;
    let mut buffer = Vec::with_capacity(12);

    buffer.push(vec![0xae]);
    buffer.push(Vec::new());

    // number, uid
    buffer.push(vec![0xd7]);
    buffer.push(id.clone());
    buffer.push(vec![0x73, 0xc5]);
    buffer.push(id);

    // no lacing, language "und"
    buffer.push(vec![0x9c, 0x81, 0x00]);
    buffer.push(vec![0x22, 0xb5, 0x9c, 0x83, 0x75, 0x6e, 0x64]);

    buffer.push(vec![0x86]);
    buffer.extend(encode_string(&track.codec_id)?);

    if let Some(delay) = track.codec_delay {
        buffer.push(vec![0x56, 0xaa]);
        buffer.push(encode(delay, true)?);
    }
    if let Some(pre_roll) = track.seek_pre_roll {
        buffer.push(vec![0x56, 0xbb]);
        buffer.push(encode(pre_roll, true)?);
    }

    buffer.push(vec![0x83]);
    buffer.push(encode(track.track_type, true)?);

    if let Some(duration) = track.default_duration {
        buffer.push(vec![0x23, 0xe3, 0x83]);
        buffer.push(encode(duration, true)?);
    }

    if (track.track_type == 1 || track.track_type == 2) && !track.metadata.is_empty() {
        buffer.push(vec![if track.track_type == 1 { 0xe0 } else { 0xe1 }]);
        buffer.push(encode(track.metadata.len() as u64, false)?);
        buffer.push(track.metadata.clone());
    }

    if !track.codec_private.is_empty() {
        buffer.push(vec![0x63, 0xa2]);
        buffer.push(encode(track.codec_private.len() as u64, false)?);
        buffer.push(track.codec_private.clone());
    }

    length_for(buffer)
}

fn make_cue_point(index: usize, key_frame: &KeyFrame) -> io::Result<Vec<u8>> {
    let mut positions = vec![vec![0xb7], Vec::new()];
    positions.push(vec![0xf7]);
    positions.push(encode(index as u64 + 1, true)?);
    positions.push(vec![0xf1]);
    positions.push(encode(key_frame.cluster_position, true)?);
    if key_frame.relative_position > 0 {
        positions.push(vec![0xf0]);
        positions.push(encode(key_frame.relative_position as u64, true)?);
    }

    let mut cue = vec![vec![0xbb], Vec::new()];
    cue.push(vec![0xb3]);
    cue.push(encode(std::cmp::max(key_frame.timecode, 0) as u64, true)?);
    cue.extend(length_for(positions)?);

    Ok(length_for(cue)?.concat())
}

fn write_block<O: MediaStream>(out: &mut Output<O>, block: &Block, cluster_timecode: i64) -> io::Result<()> {
    let relative = block.absolute_timecode - cluster_timecode;
    if relative < i16::MIN as i64 || relative > i16::MAX as i64 {
        return Err(ioerr!(InvalidInput, "SimpleBlock timecode overflow."));
    }

    let mut header = vec![vec![0xa3], Vec::new()];
    header.push(encode(block.track as u64 + 1, false)?);
    header.push((relative as i16).to_be_bytes().to_vec());
    header.push(vec![block.flags]);

    let size = block.data.len() + header[2..].iter().map(|b| b.len()).sum::<usize>();
    header[1] = encode(size as u64, false)?;

    out.dump_all(&header)?;
    out.dump(&block.data)
}
