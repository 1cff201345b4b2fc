//! Repackage an Opus or Vorbis track from a WebM file into Ogg pages.
//!
//! The codec private data goes into the first page, a minimal comment
//! header into the second, and then every page holds the blocks of one
//! second of media (or less, when the 255 entry segment table fills up).
//!
use std::io;

use byteorder::{ByteOrder, LittleEndian};
use chrono::Utc;
use once_cell::sync::Lazy;

use crate::stream::MediaStream;
use crate::types::TrackKind;
use crate::webm_reader::{Cluster, Segment, SimpleBlock, WebMReader, WebMTrack};

const FLAG_UNSET: u8 = 0x00;
const FLAG_FIRST: u8 = 0x02;
const FLAG_LAST: u8 = 0x04;

const HEADER_CHECKSUM_OFFSET: usize = 22;
const HEADER_SIZE: usize = 27;

const TIME_SCALE_NS: i64 = 1_000_000_000;

/// Largest packet a single page can describe.
pub const MAX_PACKET_SIZE: usize = 255 * 255;

const OPUS_TAGS: [u8; 16] = [
    0x4F, 0x70, 0x75, 0x73, 0x54, 0x61, 0x67, 0x73, // "OpusTags"
    0x00, 0x00, 0x00, 0x00, // vendor string length
    0x00, 0x00, 0x00, 0x00, // comment count
];

const VORBIS_COMMENT: [u8; 15] = [
    0x03, 0x76, 0x6f, 0x72, 0x62, 0x69, 0x73, // 3 "vorbis"
    0x00, 0x00, 0x00, 0x00, // vendor string length
    0x00, 0x00, 0x00, 0x00, // comment count
];

static CRC32_TABLE: Lazy<[u32; 256]> = Lazy::new(|| {
    let mut table = [0u32; 256];
    for (i, entry) in table.iter_mut().enumerate() {
        let mut crc = (i as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04c1_1db7
            } else {
                crc << 1
            };
        }
        *entry = crc;
    }
    table
});

/// Ogg flavour of CRC-32: polynomial 0x04c11db7, MSB first, no reflection
/// and no final xor.
pub fn crc32(crc: u32, data: &[u8]) -> u32 {
    data.iter().fold(crc, |crc, &b| {
        (crc << 8) ^ CRC32_TABLE[((crc >> 24) as u8 ^ b) as usize]
    })
}

pub struct OggFromWebMWriter<S, O> {
    output:             O,
    reader:             WebMReader<S>,
    track:              Option<WebMTrack>,
    segment:            Option<Segment>,
    cluster:            Option<Cluster>,
    pending:            Option<(SimpleBlock, Vec<u8>)>,
    block_last_ns:      i64,
    block_near_ns:      i64,
    stream_id:          u32,
    sequence_count:     u32,
    packet_flag:        u8,
    segment_table:      Vec<u8>,
    next_timestamp:     i64,
    parsed:             bool,
    done:               bool,
}

impl<S: MediaStream, O: MediaStream> OggFromWebMWriter<S, O> {
    pub fn new(source: S, output: O) -> io::Result<OggFromWebMWriter<S, O>> {
        if !source.can_read() || !source.can_rewind() {
            return Err(ioerr!(InvalidInput, "source stream must be readable and allows seeking"));
        }
        if !output.can_write() || !output.can_rewind() {
            return Err(ioerr!(InvalidInput, "output stream must be writable and allows seeking"));
        }
        Ok(OggFromWebMWriter {
            output,
            reader: WebMReader::new(source),
            track: None,
            segment: None,
            cluster: None,
            pending: None,
            block_last_ns: 0,
            block_near_ns: 0,
            stream_id: Utc::now().timestamp_millis() as u32,
            sequence_count: 0,
            packet_flag: FLAG_FIRST,
            segment_table: Vec::with_capacity(255),
            next_timestamp: TIME_SCALE_NS,
            parsed: false,
            done: false,
        })
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn is_parsed(&self) -> bool {
        self.parsed
    }

    pub fn parse_source(&mut self) -> io::Result<()> {
        if self.done {
            return Err(ioerr!(InvalidInput, "already done"));
        }
        if self.parsed {
            return Err(ioerr!(InvalidInput, "already parsed"));
        }
        self.parsed = true;
        self.reader.parse()?;
        self.segment = self.reader.next_segment()?;
        Ok(())
    }

    pub fn tracks_from_source(&self) -> io::Result<&[WebMTrack]> {
        if !self.parsed {
            return Err(ioerr!(InvalidInput, "source must be parsed first"));
        }
        Ok(self.reader.tracks())
    }

    pub fn select_track(&mut self, index: usize) -> io::Result<()> {
        if !self.parsed {
            return Err(ioerr!(InvalidInput, "source must be parsed first"));
        }
        if self.done {
            return Err(ioerr!(InvalidInput, "already done"));
        }
        if self.track.is_some() {
            return Err(ioerr!(InvalidInput, "tracks already selected"));
        }
        match self.reader.tracks().get(index).map(|t| t.kind) {
            Some(TrackKind::Audio) | Some(TrackKind::Video) => {},
            Some(_) => return Err(ioerr!(Unsupported, "the track must an audio or video stream")),
            None => return Err(ioerr!(InvalidInput, "track index {} out of range", index)),
        }
        self.track = Some(self.reader.select_track(index)?.clone());
        Ok(())
    }

    /// Flush the output and close both streams.
    pub fn close(&mut self) -> io::Result<()> {
        self.done = true;
        self.parsed = true;
        self.track = None;
        self.pending = None;
        if !self.output.is_closed() {
            self.output.flush()?;
        }
        self.reader.stream_mut().close()?;
        self.output.close()
    }

    pub fn build(&mut self) -> io::Result<()> {
        let track = match self.track.clone() {
            Some(track) => track,
            None => return Err(ioerr!(InvalidInput, "no track selected")),
        };

        // samples (or frames) per second.
        let resolution = match track.kind {
            TrackKind::Audio => match track.sampling_frequency() {
                Some(rate) if rate > 0.0 => rate,
                _ => return Err(ioerr!(InvalidData, "cannot get the audio sample rate")),
            },
            TrackKind::Video => match track.default_duration {
                Some(d) if d > 0 => 1000.0 / (d as f64 / self.reader.timecode_scale() as f64),
                _ => return Err(ioerr!(InvalidData, "missing default frame time")),
            },
            _ => return Err(ioerr!(Unsupported, "the track must an audio or video stream")),
        };
        log::debug!("OggFromWebMWriter::build: codec {} resolution {}", track.codec_id, resolution);

        let codec_delay = track.codec_delay.unwrap_or(0) as i64;
        let mut header = Vec::with_capacity(HEADER_SIZE + 255);
        let mut page = Vec::with_capacity(64 * 1024);

        if !track.codec_private.is_empty() {
            self.add_packet_segment(track.codec_private.len())?;
            self.make_page_header(0, &mut header, Some(&track.codec_private));
            self.output.write(&header)?;
            self.output.write(&track.codec_private)?;
        }

        let metadata: Option<&[u8]> = match track.codec_id.as_str() {
            "A_OPUS" => Some(&OPUS_TAGS[..]),
            "A_VORBIS" => Some(&VORBIS_COMMENT[..]),
            _ => None,
        };
        if let Some(metadata) = metadata {
            self.add_packet_segment(metadata.len())?;
            self.make_page_header(0, &mut header, Some(metadata));
            self.output.write(&header)?;
            self.output.write(metadata)?;
        }

        let mut pages = 0;
        while self.segment.is_some() {
            let next = self.next_block()?;

            if let Some((block, data)) = next.as_ref() {
                let timestamp = block.absolute_timecode_ns + codec_delay;
                if timestamp < self.next_timestamp && self.add_packet_segment(data.len())? {
                    page.extend_from_slice(data);
                    continue;
                }
                if page.is_empty() && self.segment_table.is_empty() && timestamp < self.next_timestamp {
                    return Err(ioerr!(Unsupported, "a packet of {} bytes does not fit in a page", data.len()));
                }
            }

            // duration of the page, measured up to the next block.
            let mut elapsed_ns = codec_delay as f64;
            match next.as_ref() {
                Some((block, _)) => elapsed_ns += block.absolute_timecode_ns as f64,
                None => {
                    self.packet_flag = FLAG_LAST;
                    elapsed_ns += self.block_last_ns as f64;
                    elapsed_ns += match track.default_duration {
                        Some(d) if d > 0 => d as f64,
                        _ => self.block_near_ns as f64,
                    };
                },
            }
            let granule = (elapsed_ns * resolution / TIME_SCALE_NS as f64).ceil() as u64;

            let checksum = self.make_page_header(granule, &mut header, None);
            let checksum = crc32(checksum, &page);
            LittleEndian::write_u32(&mut header[HEADER_CHECKSUM_OFFSET..], checksum);

            self.output.write(&header)?;
            self.output.write(&page)?;
            page.clear();
            pages += 1;

            self.pending = next;
        }
        log::debug!("OggFromWebMWriter::build: {} data pages", pages);

        self.output.flush()
    }

    // Fill `buffer` with a page header for the current segment table and
    // return the CRC over it. With `immediate` the CRC also covers that
    // data and is stored in the header.
    fn make_page_header(&mut self, granule: u64, buffer: &mut Vec<u8>, immediate: Option<&[u8]>) -> u32 {
        buffer.clear();
        buffer.extend_from_slice(b"OggS");
        buffer.push(0x00);
        buffer.push(self.packet_flag);
        buffer.extend_from_slice(&granule.to_le_bytes());
        buffer.extend_from_slice(&self.stream_id.to_le_bytes());
        buffer.extend_from_slice(&self.sequence_count.to_le_bytes());
        buffer.extend_from_slice(&[0u8; 4]);
        buffer.push(self.segment_table.len() as u8);
        buffer.extend_from_slice(&self.segment_table);
        self.sequence_count += 1;

        self.clear_segment_table();

        let mut checksum = crc32(0, buffer);
        if let Some(data) = immediate {
            checksum = crc32(checksum, data);
            LittleEndian::write_u32(&mut buffer[HEADER_CHECKSUM_OFFSET..], checksum);
            // header pages don't advance the clock.
            self.next_timestamp -= TIME_SCALE_NS;
        }
        checksum
    }

    fn clear_segment_table(&mut self) {
        self.next_timestamp += TIME_SCALE_NS;
        self.packet_flag = FLAG_UNSET;
        self.segment_table.clear();
    }

    // Add the lacing values for a packet of `size` bytes. Returns false
    // if the table does not have room for it.
    fn add_packet_segment(&mut self, size: usize) -> io::Result<bool> {
        if size > MAX_PACKET_SIZE {
            return Err(ioerr!(Unsupported, "page size cannot be larger than {}", MAX_PACKET_SIZE));
        }
        if !fits_segment_table(self.segment_table.len(), size) {
            return Ok(false);
        }
        push_lacing(&mut self.segment_table, size);
        Ok(true)
    }

    fn next_block(&mut self) -> io::Result<Option<(SimpleBlock, Vec<u8>)>> {
        if let Some(pending) = self.pending.take() {
            return Ok(Some(pending));
        }
        loop {
            if self.segment.is_none() {
                self.segment = self.reader.next_segment()?;
                if self.segment.is_none() {
                    return Ok(None);
                }
            }

            if self.cluster.is_none() {
                self.cluster = match self.segment.as_mut() {
                    Some(segment) => segment.next_cluster(&mut self.reader)?,
                    None => None,
                };
                if self.cluster.is_none() {
                    self.segment = None;
                    continue;
                }
            }

            let block = match self.cluster.as_mut() {
                Some(cluster) => cluster.next_simple_block(&mut self.reader)?,
                None => None,
            };
            let block = match block {
                Some(block) => block,
                None => {
                    self.cluster = None;
                    continue;
                },
            };
            let data = block.read_data(&mut self.reader)?;

            self.block_near_ns = block.absolute_timecode_ns - self.block_last_ns;
            self.block_last_ns = block.absolute_timecode_ns;
            return Ok(Some((block, data)));
        }
    }
}

fn fits_segment_table(used: usize, size: usize) -> bool {
    // a size that is a multiple of 255 needs a trailing zero entry.
    let entries = size / 255 + 1;
    used + entries <= 255
}

fn push_lacing(table: &mut Vec<u8>, size: usize) {
    let mut left = size;
    while left >= 255 {
        table.push(255);
        left -= 255;
    }
    table.push(left as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;
    use crate::webm_reader::tests::*;

    #[test]
    fn test_crc32() {
        // CRC-32/MPEG-2 without the init/xorout: check value for "123456789".
        assert_eq!(crc32(0, b"123456789"), 0x89a1897f);
        assert_eq!(crc32(0, &[]), 0);
    }

    #[test]
    fn test_lacing() {
        let mut table = Vec::new();
        push_lacing(&mut table, 600);
        assert_eq!(table, vec![255, 255, 90]);
        table.clear();
        push_lacing(&mut table, 510);
        assert_eq!(table, vec![255, 255, 0]);
        table.clear();
        push_lacing(&mut table, 0);
        assert_eq!(table, vec![0]);

        assert!(fits_segment_table(0, 255 * 254));
        assert!(!fits_segment_table(0, MAX_PACKET_SIZE));
        assert!(fits_segment_table(253, 300));
        assert!(!fits_segment_table(254, 300));
    }

    fn opus_file(blocks: usize) -> Vec<u8> {
        let tracks = [TestTrack {
            number: 1,
            track_type: 2,
            codec: "A_OPUS",
            default_duration: Some(20_000_000),
            metadata: audio_metadata(48000.0),
        }];
        // 20ms blocks, 25 per cluster.
        let clusters: Vec<(u64, Vec<Vec<u8>>)> = (0..blocks)
            .collect::<Vec<_>>()
            .chunks(25)
            .enumerate()
            .map(|(c, chunk)| {
                let blocks = chunk
                    .iter()
                    .enumerate()
                    .map(|(n, _)| block(1, (n * 20) as i16, 0x80, &[0xaa; 100]))
                    .collect();
                ((c * 500) as u64, blocks)
            })
            .collect();
        webm_file(&tracks, &clusters)
    }

    struct Page {
        flag:       u8,
        granule:    u64,
        sequence:   u32,
        segments:   Vec<u8>,
        body:       Vec<u8>,
    }

    fn pages(data: &[u8]) -> Vec<Page> {
        let mut res = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            assert_eq!(&data[pos..pos + 4], b"OggS");
            let nseg = data[pos + 26] as usize;
            let segments = data[pos + 27..pos + 27 + nseg].to_vec();
            let body_len: usize = segments.iter().map(|&s| s as usize).sum();
            let end = pos + 27 + nseg + body_len;

            let mut copy = data[pos..end].to_vec();
            let stored = LittleEndian::read_u32(&copy[22..26]);
            copy[22..26].copy_from_slice(&[0; 4]);
            assert_eq!(crc32(0, &copy), stored);

            res.push(Page {
                flag: data[pos + 5],
                granule: LittleEndian::read_u64(&data[pos + 6..pos + 14]),
                sequence: LittleEndian::read_u32(&data[pos + 18..pos + 22]),
                segments,
                body: data[pos + 27 + nseg..end].to_vec(),
            });
            pos = end;
        }
        res
    }

    #[test]
    fn test_opus_to_ogg() {
        let source = MemoryStream::from_vec(opus_file(110));
        let mut out = MemoryStream::new();
        {
            let mut writer = OggFromWebMWriter::new(source, &mut out).unwrap();
            writer.parse_source().unwrap();
            assert_eq!(writer.tracks_from_source().unwrap().len(), 1);
            writer.select_track(0).unwrap();
            writer.build().unwrap();
        }

        let pages = pages(out.as_slice());
        // codec private, tags, 2.2 seconds of data.
        assert_eq!(pages.len(), 5);
        assert_eq!(pages[0].flag, FLAG_FIRST);
        assert_eq!(pages[0].body, b"priv");
        assert_eq!(pages[1].body, &OPUS_TAGS[..]);
        for (i, p) in pages.iter().enumerate() {
            assert_eq!(p.sequence, i as u32);
        }

        // 50 blocks per second.
        assert_eq!(pages[2].segments, vec![100; 50]);
        assert_eq!(pages[2].granule, 48000);
        assert_eq!(pages[3].segments.len(), 50);
        assert_eq!(pages[3].granule, 96000);
        assert_eq!(pages[4].segments.len(), 10);
        assert_eq!(pages[4].flag, FLAG_LAST);
        // last block at 2180ms plus 20ms.
        assert_eq!(pages[4].granule, 105600);
    }

    #[test]
    fn test_rejects_non_media_track() {
        let tracks = [TestTrack { number: 1, track_type: 0x11, codec: "S_TEXT/WEBVTT", default_duration: None, metadata: Vec::new() }];
        let source = MemoryStream::from_vec(webm_file(&tracks, &[]));
        let mut writer = OggFromWebMWriter::new(source, MemoryStream::new()).unwrap();
        writer.parse_source().unwrap();
        let err = writer.select_track(0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn test_packet_too_large() {
        let source = MemoryStream::from_vec(opus_file(1));
        let mut writer = OggFromWebMWriter::new(source, MemoryStream::new()).unwrap();
        let err = writer.add_packet_segment(MAX_PACKET_SIZE + 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
