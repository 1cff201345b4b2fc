use std::io;

use dashmux::postprocessing;
use dashmux::srt_from_ttml_writer::{parse_ttml, SrtFromTtmlWriter};
use dashmux::stream::{FileStream, MediaStream, MemoryStream};

const TTML: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<tt xml:lang="en" xmlns="http://www.w3.org/ns/ttml" xmlns:tts="http://www.w3.org/ns/ttml#styling">
  <head>
    <styling>
      <style xml:id="s1" tts:textAlign="center" tts:color="white"/>
    </styling>
    <layout>
      <region xml:id="r1" tts:origin="10% 80%"/>
    </layout>
  </head>
  <body region="r1">
    <div>
      <p begin="00:00:01.500" end="00:00:03.250" style="s1">First line<br/>second line</p>
      <p begin="00:00:04.000" end="00:00:05.000" style="s1">
      </p>
      <p begin="00:00:06.000" end="00:00:08.000"><span tts:fontStyle="italic">Tom</span> &amp; Jerry</p>
      <p begin="9.5s" end="10s">offset time</p>
    </div>
  </body>
</tt>"#;

fn convert(ttml: &str, ignore_empty: bool) -> String {
    let mut out = MemoryStream::new();
    let mut w = SrtFromTtmlWriter::new(&mut out, ignore_empty);
    w.build(MemoryStream::from_vec(ttml.as_bytes().to_vec())).unwrap();
    String::from_utf8(out.into_inner()).unwrap()
}

#[test]
fn ignore_empty_frames() {
    let srt = convert(TTML, true);
    assert_eq!(srt, concat!(
        "0\r\n00:00:01,500 --> 00:00:03,250\r\nFirst line\r\nsecond line\r\n\r\n",
        "1\r\n00:00:06,000 --> 00:00:08,000\r\nTom & Jerry\r\n\r\n",
        "2\r\n00:00:09,500 --> 00:00:10,000\r\noffset time\r\n\r\n",
    ));
}

#[test]
fn keep_empty_frames() {
    let srt = convert(TTML, false);
    // whitespace only, line ending normalized.
    assert!(srt.contains("1\r\n00:00:04,000 --> 00:00:05,000\r\n\r\n      \r\n\r\n2\r\n"));
    assert!(srt.contains("3\r\n00:00:09,500 --> 00:00:10,000\r\n"));
}

#[test]
fn frames() {
    let frames = parse_ttml(TTML).unwrap();
    assert_eq!(frames.len(), 4);
    assert_eq!(frames[0].begin, "00:00:01,500");
    assert_eq!(frames[0].end, "00:00:03,250");
    assert!(frames[1].is_empty_text());
    assert_eq!(frames[2].text, "Tom & Jerry");
}

#[test]
fn malformed_document() {
    let err = parse_ttml(r#"<tt><body><div><p begin="1s" end="2s">x</p><!-- not closed"#).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
}

#[test]
fn wallclock_not_supported() {
    let doc = r#"<tt><body><div><p begin="wallclock(2021-01-01T10:00:00)" end="1s">x</p></div></body></tt>"#;
    let err = parse_ttml(doc).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::Unsupported);
}

#[test]
fn file_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("subs.ttml");
    let output = dir.path().join("subs.srt");
    std::fs::write(&input, TTML).unwrap();

    let mut alg = postprocessing::algorithm("ttml", &["srt".to_string(), "false".to_string()]).unwrap();
    let mut sources: Vec<Box<dyn MediaStream>> = vec![Box::new(FileStream::open(&input).unwrap())];
    assert!(alg.test(&mut sources).unwrap());

    let mut out = FileStream::create(&output).unwrap();
    alg.process(&mut out, &mut sources).unwrap();
    out.close().unwrap();

    let srt = std::fs::read_to_string(&output).unwrap();
    assert_eq!(srt, convert(TTML, false));
}
