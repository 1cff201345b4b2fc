//! Reader for WebM (Matroska subset) files.
//!
//! Only the elements needed to copy blocks into another container are
//! parsed: the EBML header, `Segment/Info`, `Segment/Tracks` and the
//! `Cluster`s with their `SimpleBlock` / `BlockGroup` children.
//!
//! Segments, clusters and blocks are small cursor structs. They do not
//! borrow the reader, every step takes it as an argument:
//!
//! ```ignore
//! while let Some(mut segment) = reader.next_segment()? {
//!     while let Some(mut cluster) = segment.next_cluster(&mut reader)? {
//!         while let Some(block) = cluster.next_simple_block(&mut reader)? {
//!             let data = block.read_data(&mut reader)?;
//!         }
//!     }
//! }
//! ```
//!
use std::io;

use byteorder::{BigEndian, ByteOrder};

use crate::data_reader::{DataReader, View};
use crate::stream::MediaStream;
use crate::types::TrackKind;

// Element IDs, with the length marker stripped.
const ID_EBML: u64 = 0x0A45DFA3;
const ID_EBML_READ_VERSION: u64 = 0x02F7;
const ID_EBML_DOC_TYPE: u64 = 0x0282;
const ID_EBML_DOC_TYPE_READ_VERSION: u64 = 0x0285;

const ID_SEGMENT: u64 = 0x08538067;

const ID_INFO: u64 = 0x0549A966;
const ID_TIMECODE_SCALE: u64 = 0x0AD7B1;
const ID_DURATION: u64 = 0x0489;

const ID_TRACKS: u64 = 0x0654AE6B;
const ID_TRACK_ENTRY: u64 = 0x2E;
const ID_TRACK_NUMBER: u64 = 0x57;
const ID_TRACK_TYPE: u64 = 0x03;
const ID_CODEC_ID: u64 = 0x06;
const ID_CODEC_PRIVATE: u64 = 0x23A2;
const ID_VIDEO: u64 = 0x60;
const ID_AUDIO: u64 = 0x61;
const ID_DEFAULT_DURATION: u64 = 0x3E383;
const ID_FLAG_LACING: u64 = 0x1C;
const ID_CODEC_DELAY: u64 = 0x16AA;
const ID_SEEK_PRE_ROLL: u64 = 0x16BB;

const ID_CLUSTER: u64 = 0x0F43B675;
const ID_TIMECODE: u64 = 0x67;
const ID_SIMPLE_BLOCK: u64 = 0x23;
const ID_BLOCK: u64 = 0x21;
const ID_GROUP_BLOCK: u64 = 0x20;

// Children of Audio / Video.
const ID_SAMPLING_FREQUENCY: u64 = 0x35;
const ID_PIXEL_WIDTH: u64 = 0x30;
const ID_PIXEL_HEIGHT: u64 = 0x3A;

/// Position, id and sizes of an element in the input.
#[derive(Clone, Copy, Debug)]
struct Element {
    kind:           u64,
    offset:         u64,
    content_size:   u64,
    size:           u64,
}

impl Element {
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// `Segment/Info`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Info {
    /// Nanoseconds per timecode tick.
    pub timecode_scale: u64,
    /// In timecode ticks.
    pub duration:       f64,
}

#[derive(Clone, Debug)]
pub struct WebMTrack {
    pub track_number:       u64,
    pub track_type:         u64,
    pub kind:               TrackKind,
    pub codec_id:           String,
    pub codec_private:      Vec<u8>,
    /// Payload of the `Audio` or `Video` element.
    pub metadata:           Vec<u8>,
    pub default_duration:   Option<u64>,
    pub codec_delay:        Option<u64>,
    pub seek_pre_roll:      Option<u64>,
}

impl Default for WebMTrack {
    fn default() -> WebMTrack {
        WebMTrack {
            track_number: 0,
            track_type: 0,
            kind: TrackKind::Other,
            codec_id: String::new(),
            codec_private: Vec::new(),
            metadata: Vec::new(),
            default_duration: None,
            codec_delay: None,
            seek_pre_roll: None,
        }
    }
}

impl WebMTrack {
    /// `Audio/SamplingFrequency`, if present.
    pub fn sampling_frequency(&self) -> Option<f64> {
        metadata_child(&self.metadata, ID_SAMPLING_FREQUENCY).and_then(decode_float)
    }

    /// `Video/PixelWidth` and `Video/PixelHeight`, if present.
    pub fn pixel_size(&self) -> Option<(u64, u64)> {
        let w = metadata_child(&self.metadata, ID_PIXEL_WIDTH).map(decode_uint)?;
        let h = metadata_child(&self.metadata, ID_PIXEL_HEIGHT).map(decode_uint)?;
        Some((w, h))
    }
}

// Variable length integer from a byte slice, marker stripped.
fn decode_vint(data: &[u8], pos: &mut usize) -> Option<u64> {
    let first = *data.get(*pos)?;
    if first == 0 {
        return None;
    }
    let len = first.leading_zeros() as usize + 1;
    if *pos + len > data.len() {
        return None;
    }
    let mut value = first as u64 & (0xff >> len);
    for b in &data[*pos + 1..*pos + len] {
        value = (value << 8) | *b as u64;
    }
    *pos += len;
    Some(value)
}

fn metadata_child(data: &[u8], id: u64) -> Option<&[u8]> {
    let mut pos = 0;
    while pos < data.len() {
        let kind = decode_vint(data, &mut pos)?;
        let size = decode_vint(data, &mut pos)? as usize;
        let end = pos.checked_add(size).filter(|&e| e <= data.len())?;
        if kind == id {
            return Some(&data[pos..end]);
        }
        pos = end;
    }
    None
}

fn decode_uint(data: &[u8]) -> u64 {
    data.iter().fold(0u64, |v, &b| (v << 8) | b as u64)
}

fn decode_float(data: &[u8]) -> Option<f64> {
    match data.len() {
        0 => Some(0.0),
        4 => Some(BigEndian::read_f32(data) as f64),
        8 => Some(BigEndian::read_f64(data)),
        _ => None,
    }
}

/// A `Segment`. The first one carries the track list and `Info`.
#[derive(Clone, Debug)]
pub struct Segment {
    pub info:       Option<Info>,
    element:        Element,
    current:        Option<Element>,
    first_cluster:  bool,
}

/// A `Cluster` and the position of its current block.
#[derive(Clone, Debug)]
pub struct Cluster {
    /// In timecode ticks.
    pub timecode:   u64,
    element:        Element,
    block:          Option<Element>,
    group:          Option<Element>,
}

#[derive(Clone, Debug)]
pub struct SimpleBlock {
    pub track_number:           u64,
    pub relative_timecode:      i16,
    pub absolute_timecode_ns:   i64,
    pub flags:                  u8,
    pub data_size:              u64,
    /// Came from `BlockGroup/Block` instead of a `SimpleBlock`.
    pub created_from_block:     bool,
}

impl SimpleBlock {
    pub fn is_keyframe(&self) -> bool {
        self.flags & 0x80 == 0x80
    }

    /// Read the payload. Must be called before the next block is read.
    pub fn read_data<S: MediaStream>(&self, reader: &mut WebMReader<S>) -> io::Result<Vec<u8>> {
        let mut data = vec![0u8; self.data_size as usize];
        if reader.block_view().read_full(&mut data)? != data.len() {
            return Err(ioerr!(UnexpectedEof, "EOF reached while reading a block"));
        }
        Ok(data)
    }
}

pub struct WebMReader<S> {
    stream:         DataReader<S>,
    tracks:         Vec<WebMTrack>,
    first:          Option<Segment>,
    info:           Option<Info>,
    segment:        Option<Element>,
    timecode_scale: u64,
    selected:       Option<usize>,
    parsed:         bool,
    done:           bool,
}

impl<S: MediaStream> WebMReader<S> {
    pub fn new(source: S) -> WebMReader<S> {
        WebMReader {
            stream: DataReader::new(source),
            tracks: Vec::new(),
            first: None,
            info: None,
            segment: None,
            timecode_scale: 0,
            selected: None,
            parsed: false,
            done: false,
        }
    }

    /// Read the EBML header and the first segment up to its first cluster.
    pub fn parse(&mut self) -> io::Result<()> {
        if self.parsed {
            return Ok(());
        }

        let elem = self.read_element_expect(ID_EBML)?;
        if !self.read_ebml(&elem, 1, 2)? {
            return Err(ioerr!(Unsupported, "Unsupported EBML data (WebM)"));
        }
        self.ensure(&elem)?;

        let elem = match self.until_element(None, &[ID_SEGMENT])? {
            Some(elem) => elem,
            None => return Err(ioerr!(InvalidData, "Segment element not found")),
        };
        let (segment, tracks) = self.read_segment(&elem, 0, true)?;
        self.tracks = tracks.unwrap_or_default();
        log::debug!("WebMReader::parse: segment @{} size {}, {} tracks",
            elem.offset, elem.size, self.tracks.len());

        self.segment = Some(elem);
        self.info = segment.info;
        self.first = Some(segment);
        self.parsed = true;
        Ok(())
    }

    pub fn tracks(&self) -> &[WebMTrack] {
        &self.tracks
    }

    pub fn select_track(&mut self, index: usize) -> io::Result<&WebMTrack> {
        if index >= self.tracks.len() {
            return Err(ioerr!(InvalidInput, "track index {} out of range (0..{})", index, self.tracks.len()));
        }
        self.selected = Some(index);
        Ok(&self.tracks[index])
    }

    pub fn selected_track(&self) -> Option<&WebMTrack> {
        self.selected.map(|i| &self.tracks[i])
    }

    /// Nanoseconds per tick, from the last `Info` seen.
    pub fn timecode_scale(&self) -> u64 {
        self.timecode_scale
    }

    /// `Info` of the first segment.
    pub fn info(&self) -> Option<Info> {
        self.info
    }

    pub fn stream(&self) -> &S {
        self.stream.stream()
    }

    pub fn stream_mut(&mut self) -> &mut S {
        self.stream.stream_mut()
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    /// Payload of the block that was returned last.
    pub fn block_view(&mut self) -> View<'_, S> {
        self.stream.view()
    }

    /// The first segment, then any segments that follow it.
    pub fn next_segment(&mut self) -> io::Result<Option<Segment>> {
        if self.done {
            return Ok(None);
        }
        if let Some(first) = self.first.take() {
            return Ok(Some(first));
        }
        let prev = match self.segment {
            Some(prev) => prev,
            None => return Err(ioerr!(InvalidInput, "Not parsed")),
        };
        self.ensure(&prev)?;

        // tracks of later segments must match the first one.
        let elem = match self.until_element(None, &[ID_SEGMENT])? {
            Some(elem) => elem,
            None => {
                self.done = true;
                return Ok(None);
            },
        };
        log::debug!("WebMReader::next_segment: segment @{} size {}", elem.offset, elem.size);
        let (segment, _) = self.read_segment(&elem, 0, false)?;
        self.segment = Some(elem);
        Ok(Some(segment))
    }

    fn read_number(&mut self, elem: &Element) -> io::Result<u64> {
        let mut value = 0u64;
        for _ in 0..elem.content_size {
            value = (value << 8) | self.stream.read_u8()? as u64;
        }
        Ok(value)
    }

    fn read_float(&mut self, elem: &Element) -> io::Result<f64> {
        let data = self.read_blob(elem)?;
        match decode_float(&data) {
            Some(f) => Ok(f),
            None => Err(ioerr!(InvalidData, "float element 0x{:x} has size {}", elem.kind, data.len())),
        }
    }

    fn read_blob(&mut self, elem: &Element) -> io::Result<Vec<u8>> {
        self.stream.read_vec(elem.content_size as usize)
    }

    fn read_string(&mut self, elem: &Element) -> io::Result<String> {
        let data = self.read_blob(elem)?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    fn read_encoded_number(&mut self) -> io::Result<u64> {
        let first = match self.stream.read_byte()? {
            Some(b) => b,
            None => return Err(ioerr!(UnexpectedEof, "EOF reached while reading an element")),
        };
        if first == 0 {
            return Err(ioerr!(InvalidData, "Invalid encoded length"));
        }
        let size = first.leading_zeros() + 1;
        let mut number = first as u64 & (0xff >> size);
        for _ in 1..size {
            number = (number << 8) | self.stream.read_u8()? as u64;
        }
        Ok(number)
    }

    fn read_element(&mut self) -> io::Result<Element> {
        let offset = self.stream.position();
        let kind = self.read_encoded_number()?;
        let content_size = self.read_encoded_number()?;
        let size = content_size + self.stream.position() - offset;
        Ok(Element { kind, offset, content_size, size })
    }

    fn read_element_expect(&mut self, expected: u64) -> io::Result<Element> {
        let elem = self.read_element()?;
        if elem.kind != expected {
            return Err(ioerr!(InvalidData, "expected 0x{:x} found 0x{:x}", expected, elem.kind));
        }
        Ok(elem)
    }

    // Next element of one of the `expected` types (any type if empty),
    // skipping the others. `None` at the end of `parent` (or of the stream).
    fn until_element(&mut self, parent: Option<&Element>, expected: &[u64]) -> io::Result<Option<Element>> {
        loop {
            let more = match parent {
                Some(p) => self.stream.position() < p.end(),
                None => self.stream.available()?,
            };
            if !more {
                return Ok(None);
            }
            let elem = self.read_element()?;
            if expected.is_empty() || expected.contains(&elem.kind) {
                return Ok(Some(elem));
            }
            self.ensure(&elem)?;
        }
    }

    // Skip to the end of `elem`.
    fn ensure(&mut self, elem: &Element) -> io::Result<()> {
        let pos = self.stream.position();
        if pos > elem.end() {
            return Err(ioerr!(InvalidData,
                "parser went beyond the limits of element 0x{:x} offset={} size={} position={}",
                elem.kind, elem.offset, elem.size, pos));
        }
        if pos < elem.end() {
            self.stream.skip_bytes(elem.end() - pos)?;
        }
        Ok(())
    }

    fn read_ebml(&mut self, parent: &Element, max_read_version: u64, max_doc_type_version: u64) -> io::Result<bool> {
        let elem = match self.until_element(Some(parent), &[ID_EBML_READ_VERSION])? {
            Some(elem) => elem,
            None => return Ok(false),
        };
        if self.read_number(&elem)? > max_read_version {
            return Ok(false);
        }

        let elem = match self.until_element(Some(parent), &[ID_EBML_DOC_TYPE])? {
            Some(elem) => elem,
            None => return Ok(false),
        };
        if self.read_string(&elem)? != "webm" {
            return Ok(false);
        }

        match self.until_element(Some(parent), &[ID_EBML_DOC_TYPE_READ_VERSION])? {
            Some(elem) => Ok(self.read_number(&elem)? <= max_doc_type_version),
            None => Ok(false),
        }
    }

    fn read_info(&mut self, parent: &Element) -> io::Result<Info> {
        let mut info = Info::default();
        while let Some(elem) = self.until_element(Some(parent), &[ID_TIMECODE_SCALE, ID_DURATION])? {
            match elem.kind {
                ID_TIMECODE_SCALE => info.timecode_scale = self.read_number(&elem)?,
                ID_DURATION => info.duration = self.read_float(&elem)?,
                _ => {},
            }
            self.ensure(&elem)?;
        }
        if info.timecode_scale == 0 {
            return Err(ioerr!(InvalidData, "Element Timecode not found"));
        }
        Ok(info)
    }

    fn read_segment(
        &mut self,
        elem: &Element,
        lacing_expected: u64,
        metadata_expected: bool,
    ) -> io::Result<(Segment, Option<Vec<WebMTrack>>)>
    {
        let mut segment = Segment {
            info: None,
            element: *elem,
            current: None,
            first_cluster: true,
        };
        let mut tracks = None;

        while let Some(child) = self.until_element(Some(elem), &[ID_INFO, ID_TRACKS, ID_CLUSTER])? {
            if child.kind == ID_CLUSTER {
                segment.current = Some(child);
                break;
            }
            match child.kind {
                ID_INFO => {
                    let info = self.read_info(&child)?;
                    self.timecode_scale = info.timecode_scale;
                    segment.info = Some(info);
                },
                ID_TRACKS => tracks = Some(self.read_tracks(&child, lacing_expected)?),
                _ => {},
            }
            self.ensure(&child)?;
        }

        if metadata_expected && (segment.info.is_none() || tracks.is_none()) {
            return Err(ioerr!(InvalidData,
                "Cluster element found without Info and/or Tracks element at position {}", elem.offset));
        }
        Ok((segment, tracks))
    }

    fn read_tracks(&mut self, parent: &Element, lacing_expected: u64) -> io::Result<Vec<WebMTrack>> {
        let mut tracks = Vec::with_capacity(2);

        while let Some(entry_elem) = self.until_element(Some(parent), &[ID_TRACK_ENTRY])? {
            let mut entry = WebMTrack::default();
            let mut drop = false;

            while let Some(elem) = self.until_element(Some(&entry_elem), &[])? {
                match elem.kind {
                    ID_TRACK_NUMBER => entry.track_number = self.read_number(&elem)?,
                    ID_TRACK_TYPE => entry.track_type = self.read_number(&elem)?,
                    ID_CODEC_ID => entry.codec_id = self.read_string(&elem)?,
                    ID_CODEC_PRIVATE => entry.codec_private = self.read_blob(&elem)?,
                    ID_AUDIO | ID_VIDEO => entry.metadata = self.read_blob(&elem)?,
                    ID_DEFAULT_DURATION => entry.default_duration = Some(self.read_number(&elem)?),
                    ID_FLAG_LACING => drop = self.read_number(&elem)? != lacing_expected,
                    ID_CODEC_DELAY => entry.codec_delay = Some(self.read_number(&elem)?),
                    ID_SEEK_PRE_ROLL => entry.seek_pre_roll = Some(self.read_number(&elem)?),
                    _ => {},
                }
                self.ensure(&elem)?;
            }

            entry.kind = TrackKind::from_webm_type(entry.track_type);
            if drop {
                log::warn!("WebMReader: dropping track {} ({}), lacing is not supported",
                    entry.track_number, entry.codec_id);
            } else {
                log::trace!("WebMReader: track {} type {} codec {}",
                    entry.track_number, entry.track_type, entry.codec_id);
                tracks.push(entry);
            }
            self.ensure(&entry_elem)?;
        }
        Ok(tracks)
    }

    fn read_simple_block(&mut self, elem: &Element) -> io::Result<SimpleBlock> {
        let track_number = self.read_encoded_number()?;
        let relative_timecode = self.stream.read_i16()?;
        let flags = self.stream.read_u8()?;
        let pos = self.stream.position();
        if pos > elem.end() {
            return Err(ioerr!(InvalidData,
                "Unexpected SimpleBlock element size, missing {} bytes", pos - elem.end()));
        }
        Ok(SimpleBlock {
            track_number,
            relative_timecode,
            absolute_timecode_ns: 0,
            flags,
            data_size: elem.end() - pos,
            created_from_block: elem.kind == ID_BLOCK,
        })
    }

    fn read_cluster(&mut self, elem: &Element) -> io::Result<Cluster> {
        let tc = match self.until_element(Some(elem), &[ID_TIMECODE])? {
            Some(tc) => tc,
            None => return Err(ioerr!(InvalidData, "Cluster at {} without Timecode element", elem.offset)),
        };
        let timecode = self.read_number(&tc)?;
        log::trace!("WebMReader: cluster @{} size {} timecode {}", elem.offset, elem.size, timecode);
        Ok(Cluster {
            timecode,
            element: *elem,
            block: None,
            group: None,
        })
    }
}

impl Segment {
    /// Next cluster of this segment, `None` at the end of it.
    pub fn next_cluster<S: MediaStream>(&mut self, reader: &mut WebMReader<S>) -> io::Result<Option<Cluster>> {
        if reader.done {
            return Ok(None);
        }
        if self.first_cluster {
            self.first_cluster = false;
            if let Some(current) = self.current {
                return reader.read_cluster(&current).map(Some);
            }
        }
        if let Some(current) = self.current {
            reader.ensure(&current)?;
        }

        let elem = match reader.until_element(Some(&self.element), &[ID_CLUSTER])? {
            Some(elem) => elem,
            None => return Ok(None),
        };
        self.current = Some(elem);
        reader.read_cluster(&elem).map(Some)
    }
}

impl Cluster {
    /// Next block of the selected track in this cluster, `None` at the end of it.
    pub fn next_simple_block<S: MediaStream>(&mut self, reader: &mut WebMReader<S>) -> io::Result<Option<SimpleBlock>> {
        let track_number = match reader.selected_track() {
            Some(track) => track.track_number,
            None => return Err(ioerr!(InvalidInput, "no track selected")),
        };
        let end = self.element.end();
        if reader.stream.position() >= end {
            return Ok(None);
        }

        if let Some(group) = self.group.take() {
            reader.ensure(&group)?;
            self.block = None;
        } else if let Some(block) = self.block {
            reader.ensure(&block)?;
        }

        while reader.stream.position() < end {
            let mut elem = match reader.until_element(Some(&self.element), &[ID_SIMPLE_BLOCK, ID_GROUP_BLOCK])? {
                Some(elem) => elem,
                None => return Ok(None),
            };

            if elem.kind == ID_GROUP_BLOCK {
                self.group = Some(elem);
                elem = match reader.until_element(Some(&elem), &[ID_BLOCK])? {
                    Some(block) => block,
                    None => {
                        reader.ensure(&elem)?;
                        self.group = None;
                        continue;
                    },
                };
            }

            let mut block = reader.read_simple_block(&elem)?;
            self.block = Some(elem);

            if block.track_number == track_number {
                reader.stream.get_view(block.data_size);
                let ticks = block.relative_timecode as i64 + self.timecode as i64;
                block.absolute_timecode_ns = ticks * reader.timecode_scale as i64;
                return Ok(Some(block));
            }

            match self.group.take() {
                Some(group) => reader.ensure(&group)?,
                None => reader.ensure(&elem)?,
            }
            self.block = None;
        }
        Ok(None)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    /// Element with an 8-byte size field.
    pub(crate) fn el(id: &[u8], body: &[u8]) -> Vec<u8> {
        let mut v = id.to_vec();
        v.push(0x01);
        v.extend_from_slice(&(body.len() as u64).to_be_bytes()[1..]);
        v.extend_from_slice(body);
        v
    }

    pub(crate) fn uint(id: &[u8], n: u64) -> Vec<u8> {
        el(id, &n.to_be_bytes())
    }

    pub(crate) fn block(track: u8, rel: i16, flags: u8, data: &[u8]) -> Vec<u8> {
        let mut body = vec![0x80 | track];
        body.extend_from_slice(&rel.to_be_bytes());
        body.push(flags);
        body.extend_from_slice(data);
        el(&[0xa3], &body)
    }

    pub(crate) struct TestTrack<'a> {
        pub number:             u8,
        pub track_type:         u64,
        pub codec:              &'a str,
        pub default_duration:   Option<u64>,
        pub metadata:           Vec<u8>,
    }

    /// A WebM file with 1ms timecode scale.
    pub(crate) fn webm_file(tracks: &[TestTrack], clusters: &[(u64, Vec<Vec<u8>>)]) -> Vec<u8> {
        let mut header = Vec::new();
        header.extend(uint(&[0x42, 0xf7], 1));
        header.extend(el(&[0x42, 0x82], b"webm"));
        header.extend(uint(&[0x42, 0x85], 2));

        let mut info = uint(&[0x2a, 0xd7, 0xb1], 1_000_000);
        info.extend(el(&[0x44, 0x89], &1234.5f64.to_be_bytes()));

        let mut entries = Vec::new();
        for t in tracks {
            let mut e = uint(&[0xd7], t.number as u64);
            e.extend(uint(&[0x83], t.track_type));
            e.extend(el(&[0x86], t.codec.as_bytes()));
            e.extend(el(&[0x63, 0xa2], b"priv"));
            if let Some(d) = t.default_duration {
                e.extend(uint(&[0x23, 0xe3, 0x83], d));
            }
            if !t.metadata.is_empty() {
                let id = if t.track_type == 1 { 0xe0 } else { 0xe1 };
                e.extend(el(&[id], &t.metadata));
            }
            entries.extend(el(&[0xae], &e));
        }

        let mut segment = el(&[0x15, 0x49, 0xa9, 0x66], &info);
        segment.extend(el(&[0x16, 0x54, 0xae, 0x6b], &entries));
        for (timecode, blocks) in clusters {
            let mut c = uint(&[0xe7], *timecode);
            for b in blocks {
                c.extend_from_slice(b);
            }
            segment.extend(el(&[0x1f, 0x43, 0xb6, 0x75], &c));
        }

        let mut file = el(&[0x1a, 0x45, 0xdf, 0xa3], &header);
        file.extend(el(&[0x18, 0x53, 0x80, 0x67], &segment));
        file
    }

    pub(crate) fn audio_metadata(rate: f64) -> Vec<u8> {
        el(&[0xb5], &rate.to_be_bytes())
    }

    fn two_tracks() -> Vec<u8> {
        let tracks = [
            TestTrack { number: 1, track_type: 1, codec: "V_VP9", default_duration: None, metadata: Vec::new() },
            TestTrack { number: 2, track_type: 2, codec: "A_OPUS", default_duration: Some(20_000_000), metadata: audio_metadata(48000.0) },
        ];
        let mut inner = block(2, 40, 0, b"a2");
        inner[0] = 0xa1;
        let group = el(&[0xa0], &inner);
        webm_file(&tracks, &[
            (0, vec![block(1, 0, 0x80, b"v0"), block(2, 0, 0x80, b"a0"), block(2, 20, 0x80, b"a1"), group]),
            (1000, vec![block(2, -5, 0x80, b"a3"), block(1, 0, 0x00, b"v1")]),
        ])
    }

    #[test]
    fn test_parse_tracks() {
        let mut r = WebMReader::new(MemoryStream::from_vec(two_tracks()));
        r.parse().unwrap();
        assert_eq!(r.tracks().len(), 2);
        assert_eq!(r.tracks()[0].kind, TrackKind::Video);
        assert_eq!(r.tracks()[0].codec_id, "V_VP9");
        assert_eq!(r.tracks()[1].kind, TrackKind::Audio);
        assert_eq!(r.tracks()[1].codec_private, b"priv");
        assert_eq!(r.tracks()[1].default_duration, Some(20_000_000));
        assert_eq!(r.tracks()[1].sampling_frequency(), Some(48000.0));
        assert_eq!(r.timecode_scale(), 1_000_000);

        let segment = r.next_segment().unwrap().unwrap();
        let info = segment.info.unwrap();
        assert_eq!(info.duration, 1234.5);
    }

    #[test]
    fn test_blocks_of_selected_track() {
        let mut r = WebMReader::new(MemoryStream::from_vec(two_tracks()));
        r.parse().unwrap();
        r.select_track(1).unwrap();

        let mut got = Vec::new();
        let mut clusters = 0;
        while let Some(mut segment) = r.next_segment().unwrap() {
            while let Some(mut cluster) = segment.next_cluster(&mut r).unwrap() {
                clusters += 1;
                while let Some(block) = cluster.next_simple_block(&mut r).unwrap() {
                    let data = block.read_data(&mut r).unwrap();
                    got.push((block.absolute_timecode_ns, data, block.created_from_block));
                }
            }
        }
        assert_eq!(clusters, 2);
        assert_eq!(got, vec![
            (0, b"a0".to_vec(), false),
            (20_000_000, b"a1".to_vec(), false),
            (40_000_000, b"a2".to_vec(), true),
            (995_000_000, b"a3".to_vec(), false),
        ]);
    }

    #[test]
    fn test_unread_data_is_skipped() {
        let mut r = WebMReader::new(MemoryStream::from_vec(two_tracks()));
        r.parse().unwrap();
        r.select_track(0).unwrap();
        let mut segment = r.next_segment().unwrap().unwrap();
        let mut keys = Vec::new();
        while let Some(mut cluster) = segment.next_cluster(&mut r).unwrap() {
            while let Some(block) = cluster.next_simple_block(&mut r).unwrap() {
                keys.push(block.is_keyframe());
            }
        }
        assert_eq!(keys, vec![true, false]);
        assert!(r.next_segment().unwrap().is_none());
    }

    #[test]
    fn test_bad_doctype() {
        let mut header = uint(&[0x42, 0xf7], 1);
        header.extend(el(&[0x42, 0x82], b"matroska"));
        header.extend(uint(&[0x42, 0x85], 2));
        let file = el(&[0x1a, 0x45, 0xdf, 0xa3], &header);
        let mut r = WebMReader::new(MemoryStream::from_vec(file));
        assert_eq!(r.parse().unwrap_err().kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn test_zero_length_marker() {
        let mut r = WebMReader::new(MemoryStream::from_vec(vec![0x00, 0x00, 0x00]));
        let err = r.parse().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(err.to_string(), "Invalid encoded length");
    }

    #[test]
    fn test_laced_track_dropped() {
        let tracks_v = {
            let mut e = uint(&[0xd7], 1);
            e.extend(uint(&[0x83], 2));
            e.extend(el(&[0x86], b"A_VORBIS"));
            e.extend(uint(&[0x9c], 1));
            el(&[0xae], &e)
        };
        let mut header = uint(&[0x42, 0xf7], 1);
        header.extend(el(&[0x42, 0x82], b"webm"));
        header.extend(uint(&[0x42, 0x85], 2));
        let mut segment = el(&[0x15, 0x49, 0xa9, 0x66], &uint(&[0x2a, 0xd7, 0xb1], 1_000_000));
        segment.extend(el(&[0x16, 0x54, 0xae, 0x6b], &tracks_v));
        let mut file = el(&[0x1a, 0x45, 0xdf, 0xa3], &header);
        file.extend(el(&[0x18, 0x53, 0x80, 0x67], &segment));

        let mut r = WebMReader::new(MemoryStream::from_vec(file));
        r.parse().unwrap();
        assert!(r.tracks().is_empty());
    }

    #[test]
    fn test_metadata_child() {
        let mut meta = uint(&[0xb0], 640);
        meta.extend(uint(&[0xba], 360));
        let track = WebMTrack { metadata: meta, ..WebMTrack::default() };
        assert_eq!(track.pixel_size(), Some((640, 360)));
        assert_eq!(track.sampling_frequency(), None);
    }
}
