use bytes::{Buf, Bytes, BytesMut};
use tracing::debug;

/// Largest frame kept from one part; longer bodies are truncated.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 625_000;

const MIXED_REPLACE: &str = "multipart/x-mixed-replace";
const MAX_HEADER_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentTypeError {
    #[error("Content-Type isn't specified")]
    Missing,
    #[error("wrong Content-Type: expected multipart/x-mixed-replace, got {0}")]
    NotMixedReplace(String),
    #[error("no multipart boundary param in Content-Type")]
    MissingBoundary,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MultipartError {
    #[error("malformed MIME header line: {0:?}")]
    MalformedHeader(String),
    #[error("part headers exceed 16 KiB")]
    HeaderTooLarge,
    #[error("unexpected end of stream inside a part")]
    UnexpectedEof,
}

/// Extract the boundary from a `multipart/x-mixed-replace` Content-Type.
///
/// A leading `--` is stripped: some cameras declare the delimiter instead of
/// the boundary, and the decoder matches either form.
pub fn parse_boundary(content_type: Option<&str>) -> Result<String, ContentTypeError> {
    let content_type = content_type
        .map(str::trim)
        .filter(|ct| !ct.is_empty())
        .ok_or(ContentTypeError::Missing)?;

    let mut params = content_type.split(';');
    let media_type = params.next().unwrap_or_default().trim();
    if !media_type.eq_ignore_ascii_case(MIXED_REPLACE) {
        return Err(ContentTypeError::NotMixedReplace(media_type.to_string()));
    }

    let raw = params
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim())
        .ok_or(ContentTypeError::MissingBoundary)?;

    let unquoted = raw
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(raw);
    let boundary = unquoted.strip_prefix("--").unwrap_or(unquoted);
    if boundary.is_empty() {
        return Err(ContentTypeError::MissingBoundary);
    }
    Ok(boundary.to_string())
}

/// Parse state for the multipart body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Skipping the preamble until the first `--boundary`.
    SeekingBoundary,
    /// Just consumed a delimiter; next is either `--` (close) or end of line.
    AfterDelimiter,
    /// Consuming header lines until the empty line.
    SeekingHeaderEnd,
    /// Collecting body bytes until the next delimiter.
    CollectingBody,
    /// Saw `--boundary--`.
    Closed,
}

/// Incremental decoder for a `multipart/x-mixed-replace` body.
///
/// Feed network chunks with [`push`](Self::push) and drain complete part
/// bodies with [`next_part`](Self::next_part). Memory is bounded by the frame
/// limit plus one delimiter: body bytes beyond `max_frame_size` are dropped as
/// they arrive.
pub struct MultipartDecoder {
    /// `--boundary`
    dash_boundary: Vec<u8>,
    /// `\n--boundary`, the delimiter between a body and the next part.
    delimiter: Vec<u8>,
    buffer: BytesMut,
    frame: BytesMut,
    dropped: usize,
    header_bytes: usize,
    max_frame_size: usize,
    state: ParseState,
}

impl MultipartDecoder {
    pub fn new(boundary: &str, max_frame_size: usize) -> Self {
        let dash_boundary = [b"--".as_slice(), boundary.as_bytes()].concat();
        let delimiter = [b"\n".as_slice(), &dash_boundary].concat();
        Self {
            dash_boundary,
            delimiter,
            buffer: BytesMut::with_capacity(64 * 1024),
            frame: BytesMut::with_capacity(max_frame_size.min(256 * 1024)),
            dropped: 0,
            header_bytes: 0,
            max_frame_size,
            state: ParseState::SeekingBoundary,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.state != ParseState::Closed {
            self.buffer.extend_from_slice(chunk);
        }
    }

    /// Whether the closing delimiter has been seen.
    pub fn is_closed(&self) -> bool {
        self.state == ParseState::Closed
    }

    /// Returns the next complete part body, or `None` when more input is
    /// needed (or the stream is closed).
    pub fn next_part(&mut self) -> Result<Option<Bytes>, MultipartError> {
        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    let Some(pos) = find_subsequence(&self.buffer, &self.dash_boundary) else {
                        // Keep a partial boundary that may span chunks
                        let keep = self.dash_boundary.len() - 1;
                        if self.buffer.len() > keep {
                            self.buffer.advance(self.buffer.len() - keep);
                        }
                        return Ok(None);
                    };
                    let end = pos + self.dash_boundary.len();
                    match match_after_boundary(&self.buffer[end..]) {
                        BoundaryMatch::Delimiter => {
                            self.buffer.advance(end);
                            self.state = ParseState::AfterDelimiter;
                        }
                        BoundaryMatch::NeedMore => {
                            self.buffer.advance(pos);
                            return Ok(None);
                        }
                        BoundaryMatch::NotDelimiter => self.buffer.advance(pos + 1),
                    }
                }
                ParseState::AfterDelimiter => {
                    if self.buffer.starts_with(b"--") {
                        self.buffer.clear();
                        self.state = ParseState::Closed;
                        return Ok(None);
                    }
                    // Transport padding up to the end of the delimiter line
                    match self.buffer.iter().position(|&b| b == b'\n') {
                        Some(pos) => {
                            self.buffer.advance(pos + 1);
                            self.header_bytes = 0;
                            self.state = ParseState::SeekingHeaderEnd;
                        }
                        None => return Ok(None),
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                        if self.header_bytes + self.buffer.len() > MAX_HEADER_BYTES {
                            return Err(MultipartError::HeaderTooLarge);
                        }
                        return Ok(None);
                    };
                    let line = &self.buffer[..pos];
                    let line = line.strip_suffix(b"\r").unwrap_or(line);
                    if line.is_empty() {
                        self.buffer.advance(pos + 1);
                        self.state = ParseState::CollectingBody;
                        continue;
                    }
                    let continuation = line[0] == b' ' || line[0] == b'\t';
                    if !continuation && !line.contains(&b':') {
                        return Err(MultipartError::MalformedHeader(
                            String::from_utf8_lossy(line).into_owned(),
                        ));
                    }
                    self.header_bytes += pos + 1;
                    if self.header_bytes > MAX_HEADER_BYTES {
                        return Err(MultipartError::HeaderTooLarge);
                    }
                    self.buffer.advance(pos + 1);
                }
                ParseState::CollectingBody => {
                    // A part with an empty body has no line break before the delimiter
                    if self.frame.is_empty() && self.buffer.starts_with(&self.dash_boundary) {
                        match match_after_boundary(&self.buffer[self.dash_boundary.len()..]) {
                            BoundaryMatch::Delimiter => {
                                self.buffer.advance(self.dash_boundary.len());
                                self.state = ParseState::AfterDelimiter;
                                return Ok(Some(self.take_frame()));
                            }
                            BoundaryMatch::NeedMore => return Ok(None),
                            BoundaryMatch::NotDelimiter => {}
                        }
                    }
                    let mut from = 0;
                    while let Some(offset) = find_subsequence(&self.buffer[from..], &self.delimiter)
                    {
                        let pos = from + offset;
                        let end = if pos > 0 && self.buffer[pos - 1] == b'\r' {
                            pos - 1
                        } else {
                            pos
                        };
                        match match_after_boundary(&self.buffer[pos + self.delimiter.len()..]) {
                            BoundaryMatch::Delimiter => {
                                let body = self.buffer.split_to(end);
                                self.append_body(&body);
                                self.buffer.advance(pos - end + self.delimiter.len());
                                self.state = ParseState::AfterDelimiter;
                                return Ok(Some(self.take_frame()));
                            }
                            BoundaryMatch::NeedMore => {
                                let body = self.buffer.split_to(end);
                                self.append_body(&body);
                                return Ok(None);
                            }
                            // Boundary text inside the body
                            BoundaryMatch::NotDelimiter => from = pos + 1,
                        }
                    }
                    // Hold back enough for a CRLF-delimiter split across chunks
                    let keep = self.delimiter.len();
                    if self.buffer.len() > keep {
                        let body = self.buffer.split_to(self.buffer.len() - keep);
                        self.append_body(&body);
                    }
                    return Ok(None);
                }
                ParseState::Closed => return Ok(None),
            }
        }
    }

    /// Checks that the input ended on a part boundary.
    pub fn finish(&self) -> Result<(), MultipartError> {
        match self.state {
            ParseState::SeekingBoundary | ParseState::Closed => Ok(()),
            ParseState::AfterDelimiter
            | ParseState::SeekingHeaderEnd
            | ParseState::CollectingBody => Err(MultipartError::UnexpectedEof),
        }
    }

    fn append_body(&mut self, body: &[u8]) {
        let room = self.max_frame_size.saturating_sub(self.frame.len());
        let take = room.min(body.len());
        self.frame.extend_from_slice(&body[..take]);
        self.dropped += body.len() - take;
    }

    fn take_frame(&mut self) -> Bytes {
        if self.dropped > 0 {
            debug!(
                dropped = self.dropped,
                max = self.max_frame_size,
                "truncated oversized frame"
            );
            self.dropped = 0;
        }
        self.frame.split().freeze()
    }
}

/// What follows a `--boundary` match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoundaryMatch {
    /// `--`, or optional spaces and tabs then a line break.
    Delimiter,
    NeedMore,
    /// Boundary text that is part of the body.
    NotDelimiter,
}

fn match_after_boundary(rest: &[u8]) -> BoundaryMatch {
    match rest {
        [] | [b'-'] => return BoundaryMatch::NeedMore,
        [b'-', b'-', ..] => return BoundaryMatch::Delimiter,
        _ => {}
    }
    let padding = rest
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(rest.len());
    match &rest[padding..] {
        [] | [b'\r'] => BoundaryMatch::NeedMore,
        [b'\n', ..] | [b'\r', b'\n', ..] => BoundaryMatch::Delimiter,
        _ => BoundaryMatch::NotDelimiter,
    }
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "MyBoundary";
    const FIRST_PART: &str = "01234567890";

    fn decode_all(decoder: &mut MultipartDecoder) -> Vec<Bytes> {
        let mut parts = Vec::new();
        while let Some(part) = decoder.next_part().unwrap() {
            parts.push(part);
        }
        parts
    }

    #[test]
    fn boundary_from_content_type() {
        assert_eq!(
            parse_boundary(Some("multipart/x-mixed-replace; boundary=MyBoundary")).unwrap(),
            "MyBoundary"
        );
        assert_eq!(
            parse_boundary(Some("multipart/x-mixed-replace;boundary=MyBoundary")).unwrap(),
            "MyBoundary"
        );
        assert_eq!(
            parse_boundary(Some("Multipart/X-Mixed-Replace; charset=utf-8; Boundary=\"abc def\""))
                .unwrap(),
            "abc def"
        );
    }

    #[test]
    fn boundary_strips_declared_dashes() {
        assert_eq!(
            parse_boundary(Some("multipart/x-mixed-replace; boundary=--myboundary")).unwrap(),
            "myboundary"
        );
    }

    #[test]
    fn boundary_errors() {
        assert_eq!(parse_boundary(None), Err(ContentTypeError::Missing));
        assert_eq!(parse_boundary(Some("  ")), Err(ContentTypeError::Missing));
        assert_eq!(
            parse_boundary(Some("multipart/x-mixed-replace")),
            Err(ContentTypeError::MissingBoundary)
        );
        assert_eq!(
            parse_boundary(Some("multipart/x-mixed-replace; boundary=")),
            Err(ContentTypeError::MissingBoundary)
        );
        let err = parse_boundary(Some("multipart/form-data; boundary=x")).unwrap_err();
        assert_eq!(err, ContentTypeError::NotMixedReplace("multipart/form-data".into()));
        assert!(err
            .to_string()
            .contains("expected multipart/x-mixed-replace, got multipart/form-data"));
    }

    #[test]
    fn single_part_crlf() {
        let body = format!(
            "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n{FIRST_PART}\r\n--{BOUNDARY}--\r\n"
        );
        let mut decoder = MultipartDecoder::new(BOUNDARY, DEFAULT_MAX_FRAME_SIZE);
        decoder.push(body.as_bytes());
        assert_eq!(decode_all(&mut decoder), vec![Bytes::from(FIRST_PART)]);
        assert!(decoder.is_closed());
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn preamble_and_bare_lf() {
        let body = format!(
            "\nContent-type: multipart/x-mixed-replace;boundary={BOUNDARY}\n\n--{BOUNDARY}\nContent-type: text/plain\n\n{FIRST_PART}\n\n--{BOUNDARY}--\n   "
        );
        let mut decoder = MultipartDecoder::new(BOUNDARY, DEFAULT_MAX_FRAME_SIZE);
        decoder.push(body.as_bytes());
        let parts = decode_all(&mut decoder);
        assert_eq!(parts.len(), 1);
        assert_eq!(&parts[0][..], format!("{FIRST_PART}\n").as_bytes());
    }

    #[test]
    fn byte_by_byte_feeding() {
        let body = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8jpeg\r\n--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8second\r\n--frame\r\n";
        let mut decoder = MultipartDecoder::new("frame", DEFAULT_MAX_FRAME_SIZE);
        let mut parts = Vec::new();
        for byte in body.iter() {
            decoder.push(std::slice::from_ref(byte));
            parts.extend(decode_all(&mut decoder));
        }
        assert_eq!(
            parts,
            vec![
                Bytes::from_static(b"\xFF\xD8jpeg"),
                Bytes::from_static(b"\xFF\xD8second"),
            ]
        );
        assert!(!decoder.is_closed());
    }

    #[test]
    fn oversized_part_is_truncated() {
        let payload = "x".repeat(100);
        let body = format!("--b\r\n\r\n{payload}\r\n--b\r\n\r\nshort\r\n--b--");
        let mut decoder = MultipartDecoder::new("b", 10);
        decoder.push(body.as_bytes());
        let parts = decode_all(&mut decoder);
        assert_eq!(parts[0], Bytes::from("x".repeat(10)));
        assert_eq!(parts[1], Bytes::from("short"));
    }

    #[test]
    fn truncation_across_chunks() {
        let mut decoder = MultipartDecoder::new("b", 8);
        decoder.push(b"--b\r\n\r\n");
        for _ in 0..50 {
            decoder.push(b"0123456789");
            assert_eq!(decoder.next_part().unwrap(), None);
        }
        decoder.push(b"\r\n--b--");
        assert_eq!(decoder.next_part().unwrap(), Some(Bytes::from("01234567")));
    }

    #[test]
    fn empty_part_body() {
        let mut decoder = MultipartDecoder::new("b", 64);
        decoder.push(b"--b\r\nContent-Type: image/jpeg\r\n\r\n--b\r\n\r\nnext\r\n--b--");
        let parts = decode_all(&mut decoder);
        assert_eq!(parts, vec![Bytes::new(), Bytes::from("next")]);
    }

    #[test]
    fn boundary_prefix_inside_body_is_data() {
        let body = b"--frame\r\n\r\nabc\r\n--frameXYZ tail\r\n--frame\r\n\r\nnext\r\n--frame--";
        let mut decoder = MultipartDecoder::new("frame", DEFAULT_MAX_FRAME_SIZE);
        decoder.push(body);
        assert_eq!(
            decode_all(&mut decoder),
            vec![Bytes::from("abc\r\n--frameXYZ tail"), Bytes::from("next")]
        );
        assert!(decoder.is_closed());

        // Same input split at every byte
        let mut decoder = MultipartDecoder::new("frame", DEFAULT_MAX_FRAME_SIZE);
        let mut parts = Vec::new();
        for byte in body.iter() {
            decoder.push(std::slice::from_ref(byte));
            parts.extend(decode_all(&mut decoder));
        }
        assert_eq!(
            parts,
            vec![Bytes::from("abc\r\n--frameXYZ tail"), Bytes::from("next")]
        );
    }

    #[test]
    fn boundary_prefix_in_preamble_and_empty_body() {
        let mut decoder = MultipartDecoder::new("b", 64);
        decoder.push(b"--bogus\r\n--b \t\r\n\r\n--bx\r\n--b\r\n\r\nlast\r\n--b--");
        assert_eq!(
            decode_all(&mut decoder),
            vec![Bytes::from("--bx"), Bytes::from("last")]
        );
    }

    #[test]
    fn malformed_header_line() {
        let body = format!(
            "\n--{BOUNDARY}\nContent-type: text/plain\n{FIRST_PART}\n--{BOUNDARY}--\n   "
        );
        let mut decoder = MultipartDecoder::new(BOUNDARY, DEFAULT_MAX_FRAME_SIZE);
        decoder.push(body.as_bytes());
        let err = decoder.next_part().unwrap_err();
        assert_eq!(err, MultipartError::MalformedHeader(FIRST_PART.into()));
        assert!(err.to_string().contains("malformed MIME header line"));
    }

    #[test]
    fn folded_header_is_accepted() {
        let mut decoder = MultipartDecoder::new("b", 64);
        decoder.push(b"--b\r\nX-Long: a\r\n  continued\r\n\r\nbody\r\n--b--");
        assert_eq!(decode_all(&mut decoder), vec![Bytes::from("body")]);
    }

    #[test]
    fn eof_inside_part() {
        let body = format!(
            "--{BOUNDARY}\nContent-type: text/plain\n\n{FIRST_PART}\n\n--{BOUNDARY}\n   "
        );
        let mut decoder = MultipartDecoder::new(BOUNDARY, DEFAULT_MAX_FRAME_SIZE);
        decoder.push(body.as_bytes());
        assert_eq!(decode_all(&mut decoder).len(), 1);
        assert_eq!(decoder.finish(), Err(MultipartError::UnexpectedEof));
    }

    #[test]
    fn header_block_limit() {
        let mut decoder = MultipartDecoder::new("b", 64);
        decoder.push(b"--b\r\n");
        let line = format!("X-Pad: {}\r\n", "p".repeat(1024));
        let mut result = Ok(None);
        for _ in 0..20 {
            decoder.push(line.as_bytes());
            result = decoder.next_part();
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(MultipartError::HeaderTooLarge));
    }
}
