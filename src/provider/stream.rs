//! Incremental decoder for the upstream's streamed reply.
//!
//! The reply is a raw HTTP/1.1 response: headers, a blank line, then one JSON
//! object per line. Bytes arrive in arbitrary pieces; everything before the
//! header boundary is dropped and every complete payload line is decoded as it
//! appears.

use super::Fragment;
use serde::Deserialize;

const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default)]
pub struct StreamDecoder {
    /// Tail of the header bytes seen so far, long enough to catch a boundary
    /// split across two reads.
    header_tail: Vec<u8>,
    headers_done: bool,
    /// Payload bytes not yet terminated by a newline.
    pending: Vec<u8>,
    done: bool,
    fragments: usize,
    upstream_error: Option<String>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the bytes of one read and return the fragments it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Fragment> {
        let payload = if self.headers_done {
            chunk
        } else {
            match self.strip_headers(chunk) {
                Some(rest) => rest,
                None => return Vec::new(),
            }
        };
        self.pending.extend_from_slice(payload);

        let mut out = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(f) = self.decode_line(&line) {
                out.push(f);
            }
        }
        out
    }

    /// Decode whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<Fragment> {
        if !self.headers_done || self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        self.decode_line(&line)
    }

    pub fn headers_done(&self) -> bool {
        self.headers_done
    }

    /// Whether a `"done": true` object has been seen.
    pub fn saw_done(&self) -> bool {
        self.done
    }

    pub fn fragments(&self) -> usize {
        self.fragments
    }

    pub fn upstream_error(&self) -> Option<&str> {
        self.upstream_error.as_deref()
    }

    fn strip_headers<'a>(&mut self, chunk: &'a [u8]) -> Option<&'a [u8]> {
        let carried = self.header_tail.len();
        let mut window = std::mem::take(&mut self.header_tail);
        window.extend_from_slice(chunk);

        match find(&window, HEADER_END) {
            Some(pos) => {
                self.headers_done = true;
                let body_start = pos + HEADER_END.len() - carried;
                Some(&chunk[body_start..])
            }
            None => {
                let keep = window.len().min(HEADER_END.len() - 1);
                self.header_tail = window[window.len() - keep..].to_vec();
                None
            }
        }
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<Fragment> {
        let line = trim_ascii(raw);
        if line.is_empty() {
            return None;
        }
        // Chunked transfer-encoding size markers.
        if line.iter().all(u8::is_ascii_hexdigit) {
            return None;
        }
        if line[0] != b'{' {
            tracing::debug!(line = %String::from_utf8_lossy(line), "skipping non-JSON line");
            return None;
        }

        let chunk: GenerateChunk = match serde_json::from_slice(line) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(error = %e, "skipping malformed stream object");
                return None;
            }
        };

        if chunk.done {
            self.done = true;
            tracing::debug!("reached final response object");
        }
        if let Some(err) = chunk.error {
            tracing::warn!(error = %err, "upstream reported an error");
            self.upstream_error = Some(err);
        }

        let text = chunk.response.filter(|t| !t.is_empty())?;
        self.fragments += 1;
        Some(Fragment { text })
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn trim_ascii(mut s: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = s {
        if first.is_ascii_whitespace() {
            s = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = s {
        if last.is_ascii_whitespace() {
            s = rest;
        } else {
            break;
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADERS: &str = "HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nDate: Tue, 01 Oct 2024 10:00:00 GMT\r\n\r\n";

    fn texts(frags: Vec<Fragment>) -> String {
        frags.into_iter().map(|f| f.text).collect()
    }

    fn line(text: &str, done: bool) -> String {
        format!("{{\"model\":\"llama3\",\"created_at\":\"2024-10-01T10:00:00Z\",\"response\":\"{text}\",\"done\":{done}}}\n")
    }

    #[test]
    fn fragments_concatenate_in_order() {
        let mut d = StreamDecoder::new();
        let body = format!(
            "{HEADERS}{}{}{}",
            line("Hel", false),
            line("lo", false),
            line("!", true)
        );
        let out = texts(d.push(body.as_bytes()));
        assert_eq!(out, "Hello!");
        assert!(d.saw_done());
        assert_eq!(d.fragments(), 3);
    }

    #[test]
    fn header_bytes_never_reach_the_answer() {
        let mut d = StreamDecoder::new();
        let (first, rest) = HEADERS.split_at(20);

        assert!(d.push(first.as_bytes()).is_empty());
        assert!(!d.headers_done());

        let second = format!("{rest}{}", line("Hi", true));
        assert_eq!(texts(d.push(second.as_bytes())), "Hi");
    }

    #[test]
    fn boundary_split_across_reads_is_found() {
        let mut d = StreamDecoder::new();
        let cut = HEADERS.len() - 2;
        assert!(d.push(HEADERS[..cut].as_bytes()).is_empty());

        let second = format!("{}{}", &HEADERS[cut..], line("ok", true));
        assert_eq!(texts(d.push(second.as_bytes())), "ok");
    }

    #[test]
    fn line_split_across_reads_is_reassembled() {
        let mut d = StreamDecoder::new();
        let l = line("world", false);
        let (a, b) = l.split_at(30);
        assert!(d.push(format!("{HEADERS}{a}").as_bytes()).is_empty());
        assert_eq!(texts(d.push(b.as_bytes())), "world");
    }

    #[test]
    fn chunk_size_markers_and_blank_lines_are_skipped() {
        let mut d = StreamDecoder::new();
        let l1 = line("a", false);
        let l2 = line("b", true);
        let body = format!(
            "{HEADERS}{:x}\r\n{l1}\r\n{:x}\r\n{l2}\r\n0\r\n\r\n",
            l1.len(),
            l2.len()
        );
        assert_eq!(texts(d.push(body.as_bytes())), "ab");
    }

    #[test]
    fn escaped_quotes_stay_inside_fragment() {
        let mut d = StreamDecoder::new();
        let body = format!(
            "{HEADERS}{{\"response\":\"say \\\"hi\\\"\\nnow\",\"done\":false}}\n"
        );
        assert_eq!(texts(d.push(body.as_bytes())), "say \"hi\"\nnow");
    }

    #[test]
    fn body_without_objects_yields_nothing() {
        let mut d = StreamDecoder::new();
        let body = format!("{HEADERS}not json at all\n\n");
        assert!(d.push(body.as_bytes()).is_empty());
        assert!(d.finish().is_none());
        assert_eq!(d.fragments(), 0);
    }

    #[test]
    fn trailing_line_without_newline_is_decoded_at_finish() {
        let mut d = StreamDecoder::new();
        let body = format!("{HEADERS}{}", line("tail", true).trim_end());
        assert!(d.push(body.as_bytes()).is_empty());
        assert_eq!(d.finish().map(|f| f.text).as_deref(), Some("tail"));
    }

    #[test]
    fn empty_final_fragment_is_not_emitted() {
        let mut d = StreamDecoder::new();
        let body = format!("{HEADERS}{}{}", line("x", false), line("", true));
        assert_eq!(d.push(body.as_bytes()).len(), 1);
        assert!(d.saw_done());
    }

    #[test]
    fn upstream_error_object_is_recorded() {
        let mut d = StreamDecoder::new();
        let body = format!("{HEADERS}{{\"error\":\"model 'nope' not found\"}}\n");
        assert!(d.push(body.as_bytes()).is_empty());
        assert_eq!(d.upstream_error(), Some("model 'nope' not found"));
    }

    #[test]
    fn nothing_before_headers_is_payload() {
        let mut d = StreamDecoder::new();
        assert!(d.push(line("early", false).as_bytes()).is_empty());
        assert!(d.finish().is_none());
    }
}
