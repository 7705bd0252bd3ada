//! Query-string helpers shared by the WebSocket routes.

/// Splits `a=1&b=2` into key/value pairs without decoding.
pub fn query_pairs(query: &str) -> impl Iterator<Item = (&str, &str)> {
    query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
}

/// Percent-encodes everything except unreserved characters.
pub fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Decodes `%XX` escapes (and `+` as space). Returns `None` on malformed input.
pub fn percent_decode(value: &str) -> Option<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3)?;
                let hex = std::str::from_utf8(hex).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

/// What a download request addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadTarget {
    /// Authenticated download by record id.
    Id(u64),
    /// Public download by filename.
    Filename(String),
}

impl DownloadTarget {
    pub fn to_query(&self) -> String {
        match self {
            Self::Id(id) => format!("id={id}"),
            Self::Filename(name) => format!("filename={}", percent_encode(name)),
        }
    }

    pub fn from_query(query: &str) -> Option<Self> {
        for (key, value) in query_pairs(query) {
            match key {
                "id" => return value.parse().ok().map(Self::Id),
                "filename" => return percent_decode(value).map(Self::Filename),
                _ => {}
            }
        }
        None
    }
}
