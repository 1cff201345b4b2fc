use std::io;

use dashmux::stream::{MediaStream, MemoryStream};
use dashmux::types::TrackKind;
use dashmux::webm_reader::WebMReader;
use dashmux::webm_writer::WebMWriter;

const ID_SEGMENT: u64 = 0x18538067;
const ID_SEEK_HEAD: u64 = 0x114D9B74;
const ID_SEEK: u64 = 0x4DBB;
const ID_SEEK_ID: u64 = 0x53AB;
const ID_SEEK_POSITION: u64 = 0x53AC;
const ID_CUES: u64 = 0x1C53BB6B;
const ID_CUE_POINT: u64 = 0xBB;
const ID_CUE_TIME: u64 = 0xB3;
const ID_CUE_TRACK_POSITIONS: u64 = 0xB7;
const ID_CUE_CLUSTER_POSITION: u64 = 0xF1;
const ID_CLUSTER: u64 = 0x1F43B675;

fn el(id: &[u8], body: &[u8]) -> Vec<u8> {
    let mut v = id.to_vec();
    v.push(0x01);
    v.extend_from_slice(&(body.len() as u64).to_be_bytes()[1..]);
    v.extend_from_slice(body);
    v
}

fn uint(id: &[u8], n: u64) -> Vec<u8> {
    el(id, &n.to_be_bytes())
}

fn simple_block(rel: i16, keyframe: bool, data: &[u8]) -> Vec<u8> {
    let mut body = vec![0x81];
    body.extend_from_slice(&rel.to_be_bytes());
    body.push(if keyframe { 0x80 } else { 0 });
    body.extend_from_slice(data);
    el(&[0xa3], &body)
}

// One track (number 1), 1ms timecode scale. `clusters` holds the cluster
// timecode and the blocks as (relative timecode, keyframe).
fn webm_source(track_type: u64, codec: &str, default_duration: Option<u64>, clusters: &[(u64, Vec<(i16, bool)>)]) -> Vec<u8> {
    let mut header = uint(&[0x42, 0xf7], 1);
    header.extend(el(&[0x42, 0x82], b"webm"));
    header.extend(uint(&[0x42, 0x85], 2));

    let mut info = uint(&[0x2a, 0xd7, 0xb1], 1_000_000);
    info.extend(el(&[0x44, 0x89], &0f64.to_be_bytes()));

    let mut entry = uint(&[0xd7], 1);
    entry.extend(uint(&[0x83], track_type));
    entry.extend(el(&[0x86], codec.as_bytes()));
    if let Some(d) = default_duration {
        entry.extend(uint(&[0x23, 0xe3, 0x83], d));
    }
    if track_type == 2 {
        entry.extend(el(&[0xe1], &el(&[0xb5], &48000f64.to_be_bytes())));
    } else {
        let video = [uint(&[0xb0], 320), uint(&[0xba], 240)].concat();
        entry.extend(el(&[0xe0], &video));
    }

    let mut segment = el(&[0x15, 0x49, 0xa9, 0x66], &info);
    segment.extend(el(&[0x16, 0x54, 0xae, 0x6b], &el(&[0xae], &entry)));
    for (tc, blocks) in clusters {
        let mut c = uint(&[0xe7], *tc);
        for (n, &(rel, key)) in blocks.iter().enumerate() {
            c.extend(simple_block(rel, key, &[n as u8; 16]));
        }
        segment.extend(el(&[0x1f, 0x43, 0xb6, 0x75], &c));
    }

    let mut file = el(&[0x1a, 0x45, 0xdf, 0xa3], &header);
    file.extend(el(&[0x18, 0x53, 0x80, 0x67], &segment));
    file
}

// 12 seconds of video at 25 fps, a keyframe every second, one cluster
// per second.
fn video_source() -> Vec<u8> {
    let clusters: Vec<(u64, Vec<(i16, bool)>)> = (0..12u64)
        .map(|s| (s * 1000, (0..25i16).map(|n| (n * 40, n == 0)).collect()))
        .collect();
    webm_source(1, "V_VP9", None, &clusters)
}

// 12 seconds of 20ms audio frames, clusters of 2 seconds.
fn audio_source() -> Vec<u8> {
    let clusters: Vec<(u64, Vec<(i16, bool)>)> = (0..6u64)
        .map(|s| (s * 2000, (0..100i16).map(|n| (n * 20, true)).collect()))
        .collect();
    webm_source(2, "A_OPUS", Some(20_000_000), &clusters)
}

fn mux(sources: Vec<Vec<u8>>) -> Vec<u8> {
    let n = sources.len();
    let mut w = WebMWriter::new(sources.into_iter().map(MemoryStream::from_vec).collect());
    w.parse_sources().unwrap();
    w.select_tracks(&vec![0; n]).unwrap();
    let mut out = MemoryStream::new();
    w.build(&mut out).unwrap();
    w.close().unwrap();
    out.into_inner()
}

// EBML id (marker kept) or size (marker stripped) at `pos`.
fn vint(data: &[u8], pos: usize, keep_marker: bool) -> (u64, usize) {
    let first = data[pos];
    let len = first.leading_zeros() as usize + 1;
    let mut value = if keep_marker { first as u64 } else { first as u64 & (0xff >> len) };
    for i in 1..len {
        value = (value << 8) | data[pos + i] as u64;
    }
    (value, len)
}

// (id, element start, data start, data end) of each child in `start..end`.
fn children(data: &[u8], start: usize, end: usize) -> Vec<(u64, usize, usize, usize)> {
    let mut v = Vec::new();
    let mut pos = start;
    while pos < end {
        let (id, n) = vint(data, pos, true);
        let (size, m) = vint(data, pos + n, false);
        let body = pos + n + m;
        v.push((id, pos, body, body + size as usize));
        pos = body + size as usize;
    }
    v
}

fn child(data: &[u8], parent: (usize, usize), id: u64) -> Option<(usize, usize)> {
    children(data, parent.0, parent.1)
        .into_iter()
        .find(|c| c.0 == id)
        .map(|c| (c.2, c.3))
}

fn read_uint(data: &[u8], range: (usize, usize)) -> u64 {
    data[range.0..range.1].iter().fold(0, |acc, &b| (acc << 8) | b as u64)
}

fn id_at(data: &[u8], pos: usize) -> u64 {
    vint(data, pos, true).0
}

// Segment data start and end.
fn segment(data: &[u8]) -> (usize, usize) {
    child(data, (0, data.len()), ID_SEGMENT).unwrap()
}

#[test]
fn cues_address_clusters() {
    let data = mux(vec![video_source(), audio_source()]);
    let seg = segment(&data);
    assert_eq!(seg.1, data.len());

    let cues = child(&data, seg, ID_CUES).unwrap();
    let points: Vec<_> = children(&data, cues.0, cues.1)
        .into_iter()
        .filter(|c| c.0 == ID_CUE_POINT)
        .collect();
    // a cue for every video keyframe.
    assert_eq!(points.len(), 12);

    let mut last_time = None;
    for p in points {
        let time = read_uint(&data, child(&data, (p.2, p.3), ID_CUE_TIME).unwrap());
        if let Some(last) = last_time {
            assert!(time > last);
        }
        last_time = Some(time);

        let positions = child(&data, (p.2, p.3), ID_CUE_TRACK_POSITIONS).unwrap();
        let cluster = read_uint(&data, child(&data, positions, ID_CUE_CLUSTER_POSITION).unwrap());
        assert_eq!(id_at(&data, seg.0 + cluster as usize), ID_CLUSTER);
    }
}

#[test]
fn seek_head_positions() {
    let data = mux(vec![video_source(), audio_source()]);
    let seg = segment(&data);
    let head = child(&data, seg, ID_SEEK_HEAD).unwrap();

    let seeks: Vec<_> = children(&data, head.0, head.1).into_iter().filter(|c| c.0 == ID_SEEK).collect();
    assert_eq!(seeks.len(), 4);
    for s in seeks {
        let id = read_uint(&data, child(&data, (s.2, s.3), ID_SEEK_ID).unwrap());
        let pos = read_uint(&data, child(&data, (s.2, s.3), ID_SEEK_POSITION).unwrap());
        assert_eq!(id_at(&data, seg.0 + pos as usize), id);
    }
}

#[test]
fn muxed_file_reads_back() {
    let data = mux(vec![video_source(), audio_source()]);
    let mut r = WebMReader::new(MemoryStream::from_vec(data.clone()));
    r.parse().unwrap();
    assert_eq!(r.tracks().len(), 2);
    assert_eq!(r.tracks()[0].kind, TrackKind::Video);
    assert_eq!(r.tracks()[0].pixel_size(), Some((320, 240)));
    assert_eq!(r.tracks()[1].kind, TrackKind::Audio);
    assert_eq!(r.tracks()[1].default_duration, Some(20_000_000));
    assert_eq!(r.timecode_scale(), 1_000_000);
    // last audio frame at 11980ms plus 20ms.
    assert_eq!(r.info().unwrap().duration, 12000.0);

    for (track, expected) in &[(0usize, 300usize), (1, 600)] {
        let mut r = WebMReader::new(MemoryStream::from_vec(data.clone()));
        r.parse().unwrap();
        r.select_track(*track).unwrap();
        let mut count = 0;
        let mut last = -1;
        let mut segment = r.next_segment().unwrap().unwrap();
        while let Some(mut cluster) = segment.next_cluster(&mut r).unwrap() {
            while let Some(block) = cluster.next_simple_block(&mut r).unwrap() {
                assert!(block.absolute_timecode_ns > last);
                last = block.absolute_timecode_ns;
                count += 1;
            }
        }
        assert_eq!(count, *expected);
        assert!(r.next_segment().unwrap().is_none());
    }
}

#[test]
fn output_must_be_seekable() {
    struct Sink(Vec<u8>);

    impl MediaStream for Sink {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> { Ok(0) }
        fn skip(&mut self, _amount: u64) -> io::Result<u64> { Ok(0) }
        fn available(&mut self) -> io::Result<u64> { Ok(0) }
        fn rewind(&mut self) -> io::Result<()> { Err(io::ErrorKind::Unsupported.into()) }
        fn write(&mut self, data: &[u8]) -> io::Result<()> {
            self.0.extend_from_slice(data);
            Ok(())
        }
        fn close(&mut self) -> io::Result<()> { Ok(()) }
        fn is_closed(&self) -> bool { false }
        fn can_read(&self) -> bool { false }
        fn can_write(&self) -> bool { true }
        fn can_seek(&self) -> bool { false }
        fn can_rewind(&self) -> bool { false }
        fn length(&mut self) -> io::Result<u64> { Ok(self.0.len() as u64) }
    }

    let mut w = WebMWriter::new(vec![MemoryStream::from_vec(audio_source())]);
    w.parse_sources().unwrap();
    w.select_tracks(&[0]).unwrap();
    let err = w.build(Sink(Vec::new())).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::Unsupported);
}

#[test]
fn select_before_parse() {
    let mut w = WebMWriter::new(vec![MemoryStream::from_vec(audio_source())]);
    assert_eq!(w.select_tracks(&[0]).unwrap_err().kind(), io::ErrorKind::InvalidInput);
    w.parse_sources().unwrap();
    assert!(w.select_tracks(&[1]).is_err());
}
