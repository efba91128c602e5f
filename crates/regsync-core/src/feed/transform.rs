//! Incremental record scanner for change feeds.
//!
//! `ChangeFeedTransform` is fed raw chunks with [`push`](ChangeFeedTransform::push)
//! and hands back one complete JSON object at a time from
//! [`next_record`](ChangeFeedTransform::next_record). Only structural bytes are
//! inspected while scanning (`{ } [ ] " \`), so chunks may split anywhere,
//! including inside a multi-byte UTF-8 sequence. A record is parsed only once
//! its closing brace has arrived.
//!
//! Consumed bytes are dropped as soon as they are scanned, so the buffer never
//! holds more than the record currently in flight plus the unscanned tail.

use bytes::{Buf, BytesMut};

use crate::domain::FeedError;

const RESULTS_KEY: &[u8] = b"results";

/// Where records sit inside the feed document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFraming {
    /// `{"results":[{...},{...}], ...}` (CouchDB `_changes`). Objects in
    /// other top-level arrays of the envelope are not records.
    ResultsEnvelope,
    /// `[{...},{...}]`
    JsonArray,
    /// One object per line, or simply concatenated objects.
    NdJson,
}

impl FeedFraming {
    /// Open containers that must enclose a record.
    fn record_prefix(self) -> &'static [u8] {
        match self {
            FeedFraming::ResultsEnvelope => b"{[",
            FeedFraming::JsonArray => b"[",
            FeedFraming::NdJson => b"",
        }
    }
}

#[derive(Debug)]
pub struct ChangeFeedTransform {
    framing: FeedFraming,
    buf: BytesMut,
    /// Next unscanned index into `buf`.
    scan: usize,
    /// Open containers, innermost last.
    stack: Vec<u8>,
    in_string: bool,
    escape: bool,
    /// Last key of the envelope object, truncated past `RESULTS_KEY`.
    key: Vec<u8>,
    capture_key: bool,
    /// Whether the open envelope array is `results`.
    in_results: bool,
    /// Index into `buf` of the `{` opening the record in flight.
    record_start: Option<usize>,
    /// Bytes dropped from the front of `buf` so far.
    consumed: usize,
    failed: bool,
}

impl ChangeFeedTransform {
    pub fn new(framing: FeedFraming) -> Self {
        Self {
            framing,
            buf: BytesMut::new(),
            scan: 0,
            stack: Vec::new(),
            in_string: false,
            escape: false,
            key: Vec::new(),
            capture_key: false,
            in_results: false,
            record_start: None,
            consumed: 0,
            failed: false,
        }
    }

    pub fn framing(&self) -> FeedFraming {
        self.framing
    }

    /// Bytes currently held (record in flight plus unscanned input).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes pushed so far.
    pub fn offset(&self) -> usize {
        self.consumed + self.buf.len()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.failed {
            return;
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete record, or `None` if more input is needed.
    pub fn next_record(&mut self) -> Result<Option<serde_json::Value>, FeedError> {
        if self.failed {
            return Ok(None);
        }
        match self.scan_record() {
            Ok(found) => Ok(found),
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    /// Signal end of input. Fails if the feed stopped inside a record or
    /// before its framing was closed; nothing partial is ever returned.
    pub fn finish(&mut self) -> Result<(), FeedError> {
        if self.failed {
            return Ok(());
        }
        if self.record_start.is_some() || self.in_string || !self.stack.is_empty() {
            let buffered = self.buf.len();
            self.reset();
            return Err(FeedError::Truncated { buffered });
        }
        Ok(())
    }

    /// Drop everything buffered. Later pushes are ignored.
    pub fn reset(&mut self) {
        self.failed = true;
        self.buf = BytesMut::new();
        self.stack.clear();
        self.key.clear();
        self.in_results = false;
        self.record_start = None;
        self.scan = 0;
    }

    fn scan_record(&mut self) -> Result<Option<serde_json::Value>, FeedError> {
        let prefix = self.framing.record_prefix();
        let mut i = self.scan;
        while i < self.buf.len() {
            let b = self.buf[i];
            if self.in_string {
                let closing = !self.escape && b == b'"';
                if self.escape {
                    self.escape = false;
                } else if b == b'\\' {
                    self.escape = true;
                }
                if closing {
                    self.in_string = false;
                } else if self.capture_key && self.key.len() <= RESULTS_KEY.len() {
                    self.key.push(b);
                }
                i += 1;
                continue;
            }
            match b {
                b'"' => {
                    self.in_string = true;
                    self.capture_key = self.in_envelope();
                    if self.capture_key {
                        self.key.clear();
                    }
                }
                b'{' | b'[' => {
                    if b == b'[' && self.in_envelope() {
                        self.in_results = self.key == RESULTS_KEY;
                    }
                    if b == b'{'
                        && self.record_start.is_none()
                        && self.stack == prefix
                        && (self.framing != FeedFraming::ResultsEnvelope || self.in_results)
                    {
                        self.record_start = Some(i);
                    }
                    self.stack.push(b);
                }
                b'}' | b']' => {
                    let open = if b == b'}' { b'{' } else { b'[' };
                    if self.stack.pop() != Some(open) {
                        return Err(FeedError::Unbalanced {
                            offset: self.consumed + i,
                        });
                    }
                    if b == b'}' && self.stack == prefix {
                        if let Some(start) = self.record_start.take() {
                            return self.emit(start, i).map(Some);
                        }
                    }
                }
                _ => {}
            }
            i += 1;
        }
        self.scan = i;
        self.compact();
        Ok(None)
    }

    /// Directly inside the top-level object of a `ResultsEnvelope` feed.
    fn in_envelope(&self) -> bool {
        self.framing == FeedFraming::ResultsEnvelope && self.stack == b"{"
    }

    fn emit(&mut self, start: usize, end: usize) -> Result<serde_json::Value, FeedError> {
        let value = serde_json::from_slice(&self.buf[start..=end])
            .map_err(FeedError::MalformedRecord)?;
        self.buf.advance(end + 1);
        self.consumed += end + 1;
        self.scan = 0;
        Ok(value)
    }

    fn compact(&mut self) {
        let keep_from = self.record_start.unwrap_or(self.scan);
        if keep_from == 0 {
            return;
        }
        self.buf.advance(keep_from);
        self.consumed += keep_from;
        self.scan -= keep_from;
        if let Some(start) = self.record_start.as_mut() {
            *start = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    const FEED: &str = r#"{"results":[{"seq":1,"id":"a","changes":[{"rev":"1-x"}]},{"seq":2,"id":"b","note":"br}ace\" ]"}],"last_seq":2}"#;

    fn drain(t: &mut ChangeFeedTransform) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Some(v) = t.next_record().unwrap() {
            out.push(v);
        }
        out
    }

    #[test]
    fn every_split_point_yields_both_records() {
        let bytes = FEED.as_bytes();
        for cut in 0..=bytes.len() {
            let mut t = ChangeFeedTransform::new(FeedFraming::ResultsEnvelope);
            t.push(&bytes[..cut]);
            let mut got = drain(&mut t);
            t.push(&bytes[cut..]);
            got.extend(drain(&mut t));
            t.finish().unwrap();
            assert_eq!(got.len(), 2, "split at {cut}");
            assert_eq!(got[0]["id"], "a");
            assert_eq!(got[1]["id"], "b");
            assert_eq!(got[1]["note"], "br}ace\" ]");
        }
    }

    #[test]
    fn objects_outside_results_are_skipped() {
        let feed = concat!(
            r#"{"meta":[{"seq":0,"id":"not-a-change"}],"results":[{"seq":1,"id":"a"}],"#,
            r#""pending":[{"seq":9,"id":"later"}],"last_seq":"results","x":[{}]}"#,
        );
        for cut in 0..=feed.len() {
            let mut t = ChangeFeedTransform::new(FeedFraming::ResultsEnvelope);
            t.push(&feed.as_bytes()[..cut]);
            let mut got = drain(&mut t);
            t.push(&feed.as_bytes()[cut..]);
            got.extend(drain(&mut t));
            t.finish().unwrap();
            assert_eq!(got, vec![json!({"seq":1,"id":"a"})], "split at {cut}");
        }
    }

    #[test]
    fn byte_at_a_time_handles_multibyte_text() {
        let feed = r#"{"results":[{"seq":1,"id":"パッケージ"},{"seq":2,"id":"ü"}]}"#;
        let mut t = ChangeFeedTransform::new(FeedFraming::ResultsEnvelope);
        let mut got = Vec::new();
        for b in feed.as_bytes() {
            t.push(std::slice::from_ref(b));
            got.extend(drain(&mut t));
        }
        t.finish().unwrap();
        assert_eq!(got, vec![json!({"seq":1,"id":"パッケージ"}), json!({"seq":2,"id":"ü"})]);
    }

    #[rstest]
    #[case(FeedFraming::JsonArray, r#"[{"a":1}, {"a":2} ,{"a":{"b":[3]}}]"#)]
    #[case(FeedFraming::NdJson, "{\"a\":1}\n{\"a\":2}\r\n{\"a\":{\"b\":[3]}}\n")]
    fn other_framings(#[case] framing: FeedFraming, #[case] feed: &str) {
        let mut t = ChangeFeedTransform::new(framing);
        t.push(feed.as_bytes());
        let got = drain(&mut t);
        t.finish().unwrap();
        assert_eq!(got, vec![json!({"a":1}), json!({"a":2}), json!({"a":{"b":[3]}})]);
    }

    #[test]
    fn buffer_only_holds_record_in_flight() {
        let mut t = ChangeFeedTransform::new(FeedFraming::ResultsEnvelope);
        t.push(br#"{"results":["#);
        for seq in 0..1000 {
            t.push(format!(r#"{{"seq":{seq},"id":"pkg-{seq}"}},"#).as_bytes());
            assert_eq!(drain(&mut t).len(), 1);
            assert!(t.buffered() <= 1, "buffered {}", t.buffered());
        }
        t.push(br#"{"seq":1000,"#);
        assert!(t.next_record().unwrap().is_none());
        assert_eq!(t.buffered(), r#"{"seq":1000,"#.len());
    }

    #[test]
    fn truncated_record_is_never_emitted() {
        let mut t = ChangeFeedTransform::new(FeedFraming::ResultsEnvelope);
        t.push(br#"{"results":[{"seq":1,"id":"a"},{"seq":2,"id""#);
        assert_eq!(drain(&mut t).len(), 1);
        let err = t.finish().unwrap_err();
        assert!(matches!(err, FeedError::Truncated { .. }));
        assert_eq!(t.buffered(), 0);
        assert!(t.next_record().unwrap().is_none());
    }

    #[test]
    fn unclosed_envelope_is_truncation() {
        let mut t = ChangeFeedTransform::new(FeedFraming::ResultsEnvelope);
        t.push(br#"{"results":[{"seq":1,"id":"a"}"#);
        assert_eq!(drain(&mut t).len(), 1);
        assert!(matches!(t.finish(), Err(FeedError::Truncated { .. })));
    }

    #[test]
    fn mismatched_brackets_are_unbalanced() {
        let mut t = ChangeFeedTransform::new(FeedFraming::JsonArray);
        t.push(br#"[{"a":1]"#);
        match t.next_record() {
            Err(FeedError::Unbalanced { offset }) => assert_eq!(offset, 7),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_record_surfaces_error() {
        let mut t = ChangeFeedTransform::new(FeedFraming::JsonArray);
        t.push(br#"[{"a":1},{"a":tru},{"a":3}]"#);
        assert_eq!(t.next_record().unwrap(), Some(json!({"a":1})));
        assert!(matches!(t.next_record(), Err(FeedError::MalformedRecord(_))));
        // poisoned: the following good record is not emitted
        assert!(t.next_record().unwrap().is_none());
    }
}
