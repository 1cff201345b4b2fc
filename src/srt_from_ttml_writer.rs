//! Convert TTML subtitles to SRT.
//!
//! Every `p` directly below `body > div` is one frame. Its text is the
//! concatenation of all text below it, with `br` turned into a line break.
//!
use std::borrow::Cow;
use std::io;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::stream::MediaStream;

const NEW_LINE: &str = "\r\n";

/// One subtitle frame, times already in SRT notation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubtitleFrame {
    pub begin:  String,
    pub end:    String,
    pub text:   String,
}

impl SubtitleFrame {
    pub fn is_empty_text(&self) -> bool {
        self.text.trim().is_empty()
    }
}

pub struct SrtFromTtmlWriter<O> {
    out:                    O,
    ignore_empty_frames:    bool,
    frame_index:            u32,
}

impl<O: MediaStream> SrtFromTtmlWriter<O> {
    pub fn new(out: O, ignore_empty_frames: bool) -> SrtFromTtmlWriter<O> {
        SrtFromTtmlWriter {
            out,
            ignore_empty_frames,
            frame_index: 0,
        }
    }

    /// Read the whole TTML document from `ttml` and write the SRT frames.
    pub fn build<S: MediaStream>(&mut self, mut ttml: S) -> io::Result<()> {
        let mut data = Vec::new();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = ttml.read(&mut buf)?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }
        let xml = match String::from_utf8(data) {
            Ok(xml) => xml,
            Err(e) => return Err(ioerr!(InvalidData, "TTML is not valid UTF-8: {}", e)),
        };

        let frames = parse_ttml(&xml)?;
        log::debug!("SrtFromTtmlWriter::build: {} frames", frames.len());
        for frame in &frames {
            self.write_frame(frame)?;
        }
        self.out.flush()
    }

    pub fn close(&mut self) -> io::Result<()> {
        self.out.close()
    }

    fn write_frame(&mut self, frame: &SubtitleFrame) -> io::Result<()> {
        if self.ignore_empty_frames && frame.is_empty_text() {
            return Ok(());
        }
        let s = format!(
            "{}{nl}{} --> {}{nl}{}{nl}{nl}",
            self.frame_index, frame.begin, frame.end, frame.text,
            nl = NEW_LINE,
        );
        self.frame_index += 1;
        self.out.write(s.as_bytes())
    }
}

fn xml_error(e: quick_xml::Error) -> io::Error {
    ioerr!(InvalidData, "TTML: {}", e)
}

fn resolve_entity(entity: &str) -> Option<&'static str> {
    match entity {
        "lt" => Some("<"),
        "gt" => Some(">"),
        "amp" => Some("&"),
        "apos" => Some("'"),
        "quot" => Some("\""),
        "nbsp" => Some("\u{a0}"),
        _ => None,
    }
}

fn attribute(e: &BytesStart, name: &[u8]) -> io::Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| xml_error(e.into()))?;
        if attr.key.local_name().as_ref() == name {
            let value = attr.unescape_value().map_err(xml_error)?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

// Start of a frame, `None` if the `p` has no timing.
fn frame_start(e: &BytesStart) -> io::Result<Option<SubtitleFrame>> {
    let (begin, end) = match (attribute(e, b"begin")?, attribute(e, b"end")?) {
        (Some(begin), Some(end)) => (begin, end),
        _ => {
            log::warn!("SrtFromTtmlWriter: skipping a <p> without begin/end attributes");
            return Ok(None);
        },
    };
    Ok(Some(SubtitleFrame {
        begin: convert_time(&begin)?,
        end: convert_time(&end)?,
        text: String::new(),
    }))
}

/// Parse a TTML document into frames.
pub fn parse_ttml(xml: &str) -> io::Result<Vec<SubtitleFrame>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(false);
    reader.check_end_names(false);
    reader.expand_empty_elements(false);

    let mut frames = Vec::new();
    let mut stack: Vec<Vec<u8>> = Vec::new();
    // frame being built, and the stack depth of its `p`.
    let mut current: Option<(SubtitleFrame, usize)> = None;

    let is_frame_path = |stack: &[Vec<u8>]| {
        let n = stack.len();
        n >= 2 && stack[n - 2] == b"body" && stack[n - 1] == b"div"
    };

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                if name == b"br" {
                    if let Some((frame, _)) = current.as_mut() {
                        frame.text.push_str(NEW_LINE);
                    }
                    continue;
                }
                if name == b"p" && current.is_none() && is_frame_path(&stack) {
                    if let Some(frame) = frame_start(&e)? {
                        current = Some((frame, stack.len()));
                    }
                }
                stack.push(name);
            },
            Event::Empty(e) => {
                let name = e.local_name();
                if name.as_ref() == b"br" {
                    if let Some((frame, _)) = current.as_mut() {
                        frame.text.push_str(NEW_LINE);
                    }
                } else if name.as_ref() == b"p" && current.is_none() && is_frame_path(&stack) {
                    if let Some(frame) = frame_start(&e)? {
                        frames.push(frame);
                    }
                }
            },
            Event::End(e) => {
                let name = e.local_name();
                if name.as_ref() == b"br" {
                    continue;
                }
                // unbalanced tags are closed implicitly.
                if let Some(pos) = stack.iter().rposition(|n| n.as_slice() == name.as_ref()) {
                    stack.truncate(pos);
                }
                if current.as_ref().map(|(_, depth)| stack.len() <= *depth).unwrap_or(false) {
                    if let Some((frame, _)) = current.take() {
                        frames.push(frame);
                    }
                }
            },
            Event::Text(e) => {
                if let Some((frame, _)) = current.as_mut() {
                    let text = match e.unescape_with(resolve_entity) {
                        Ok(text) => text,
                        Err(err) => {
                            log::warn!("SrtFromTtmlWriter: {}, using the raw text", err);
                            Cow::Owned(String::from_utf8_lossy(&e).into_owned())
                        },
                    };
                    normalize_text(&text, &mut frame.text);
                }
            },
            Event::CData(e) => {
                if let Some((frame, _)) = current.as_mut() {
                    normalize_text(&String::from_utf8_lossy(&e), &mut frame.text);
                }
            },
            Event::Eof => break,
            _ => {},
        }
    }

    if let Some((frame, _)) = current.take() {
        log::warn!("SrtFromTtmlWriter: unterminated <p> at end of document");
        frames.push(frame);
    }
    Ok(frames)
}

/// Append `text` to `out`, with line endings turned into CRLF, tabs and
/// unicode spaces into plain spaces, and control and zero-width
/// characters removed.
pub fn normalize_text(text: &str, out: &mut String) {
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str(NEW_LINE);
            },
            '\n' => out.push_str(NEW_LINE),
            '\t' | '\u{a0}' => out.push(' '),
            '\u{2000}'..='\u{200a}' | '\u{202f}' | '\u{205f}' | '\u{3000}' => out.push(' '),
            '\u{200b}' | '\u{200e}' | '\u{200f}' => {},
            c if (c as u32) < 0x20 => {},
            c => out.push(c),
        }
    }
}

/// Convert a TTML time expression to `HH:MM:SS,mmm`.
///
/// Clock times only get their decimal separator replaced. Offset times
/// (`1.5s`, `200ms`, `2m`, `1h`, or bare seconds) are converted.
pub fn convert_time(time: &str) -> io::Result<String> {
    let time = time.trim();
    if time.starts_with("wallclock(") {
        return Err(ioerr!(Unsupported, "wallclock time is not supported: {}", time));
    }
    if time.contains(':') {
        return Ok(time.replace('.', ","));
    }

    let split = time
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or_else(|| time.len());
    let (number, unit) = time.split_at(split);
    let value: f64 = match number.parse() {
        Ok(value) => value,
        Err(_) => return Err(ioerr!(InvalidData, "invalid time expression: {:?}", time)),
    };
    let ms = match unit {
        "h" => value * 3_600_000.0,
        "m" => value * 60_000.0,
        "s" | "" => value * 1000.0,
        "ms" => value,
        _ => return Err(ioerr!(Unsupported, "unsupported time unit in {:?}", time)),
    };

    let ms = ms.round() as u64;
    Ok(format!(
        "{:02}:{:02}:{:02},{:03}",
        ms / 3_600_000,
        (ms / 60_000) % 60,
        (ms / 1000) % 60,
        ms % 1000
    ))
}
