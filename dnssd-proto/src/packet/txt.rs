//! TXT rdata: an ordered mapping of keys to optional values.
//!
//! The wire form is a sequence of length-prefixed strings, each `key`,
//! `key=` or `key=value` (RFC 6763 §6). A key with no `=` is a boolean
//! flag; `key=` is present-but-empty; a missing key is boolean false and
//! is simply not stored.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxtValue {
    /// `key=value`
    Bytes(Vec<u8>),
    /// `key=`
    Empty,
    /// `key` with no equals sign
    Flag,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxtData {
    entries: Vec<(String, TxtValue)>,
}

impl TxtData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; key matching is case-insensitive, insertion
    /// order is kept.
    pub fn set(&mut self, key: impl Into<String>, value: TxtValue) {
        let key = key.into();
        match self
            .entries
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&key))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl AsRef<str>) {
        self.set(key, TxtValue::Bytes(value.as_ref().as_bytes().to_vec()));
    }

    pub fn set_bytes(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.set(key, TxtValue::Bytes(value.into()));
    }

    pub fn set_flag(&mut self, key: impl Into<String>) {
        self.set(key, TxtValue::Flag);
    }

    pub fn set_empty(&mut self, key: impl Into<String>) {
        self.set(key, TxtValue::Empty);
    }

    pub fn get(&self, key: &str) -> Option<&TxtValue> {
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(key))
            .map(|(_, value)| value)
    }

    pub fn remove(&mut self, key: &str) {
        self.entries
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(key));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, TxtValue)> {
        self.entries.iter()
    }

    /// Wire encoding. An empty mapping still encodes as a single empty
    /// string, as required for TXT records.
    pub fn to_wire(&self) -> Vec<u8> {
        if self.entries.is_empty() {
            return vec![0];
        }
        let mut out = Vec::new();
        for (key, value) in &self.entries {
            let mut chunk: Vec<u8> = key.as_bytes().to_vec();
            match value {
                TxtValue::Flag => {}
                TxtValue::Empty => chunk.push(b'='),
                TxtValue::Bytes(bytes) => {
                    chunk.push(b'=');
                    chunk.extend_from_slice(bytes);
                }
            }
            out.push(chunk.len() as u8);
            out.extend_from_slice(&chunk);
        }
        out
    }

    pub fn wire_len(&self) -> usize {
        self.to_wire().len()
    }

    /// Lenient decode: empty strings and a truncated tail are skipped
    /// rather than rejected.
    pub fn from_wire(data: &[u8]) -> Self {
        let mut entries = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let len = data[pos] as usize;
            pos += 1;
            if len == 0 || pos + len > data.len() {
                continue;
            }
            let chunk = &data[pos..pos + len];
            pos += len;

            match chunk.iter().position(|b| *b == b'=') {
                None => {
                    let key = String::from_utf8_lossy(chunk).into_owned();
                    entries.push((key, TxtValue::Flag));
                }
                Some(0) => {
                    // a chunk starting with '=' has no key to store
                }
                Some(eq) => {
                    let key = String::from_utf8_lossy(&chunk[..eq]).into_owned();
                    let value = &chunk[eq + 1..];
                    if value.is_empty() {
                        entries.push((key, TxtValue::Empty));
                    } else {
                        entries.push((key, TxtValue::Bytes(value.to_vec())));
                    }
                }
            }
        }
        Self { entries }
    }

    /// Decoded view for API consumers: flags become empty strings, byte
    /// values become lossy strings.
    pub fn decoded(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|(key, value)| {
                let rendered = match value {
                    TxtValue::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                    TxtValue::Empty | TxtValue::Flag => String::new(),
                };
                (key.clone(), rendered)
            })
            .collect()
    }
}
