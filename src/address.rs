//! Tile request addressing.
//!
//! A [`TileAddress`] identifies one tile request: layer, zoom/x/y, file
//! variant, HTTP method, request headers and the raw query string. Addresses
//! are parsed once per request from a path of the form
//! `/{layer}/{z}/{x}/{y}/{file}` or the compact `/{layer}/{z}/{x}/{y}.{file}`
//! and are immutable afterwards.
//!
//! Parsing is total: anything that is not a well-formed tile path yields
//! `None`, which the dispatcher treats as not-found rather than as a
//! malformed-request error.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A case-insensitive header map.
///
/// Keys are matched case-insensitively while the casing used at insertion
/// time is preserved for iteration, so emitted headers keep their
/// conventional display form (`X-Powered-By`, `ETag`, ...).
#[derive(Debug, Clone, Default)]
pub struct Headers {
    // lowercase key -> (display name, value)
    entries: HashMap<String, (String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, replacing any existing value under the same name
    /// regardless of casing.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries
            .insert(name.to_ascii_lowercase(), (name, value.into()));
    }

    /// Returns the value for `name`, matched case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|(_, v)| v.as_str())
    }

    /// Returns true if a header with this name is present.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    /// Removes a header, returning its value if it was present.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries
            .remove(&name.to_ascii_lowercase())
            .map(|(_, v)| v)
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no headers are present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over `(name, value)` pairs in insertion casing.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.values().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl PartialEq for Headers {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .all(|(k, (_, v))| other.entries.get(k).map(|(_, ov)| ov) == Some(v))
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// HTTP method of a tile request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Delete,
    Post,
    Put,
    /// Any other (or non-uppercase) method token.
    Other(String),
}

impl Method {
    /// Parses a method token. Unknown tokens are preserved verbatim.
    pub fn parse(token: &str) -> Self {
        match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "DELETE" => Method::Delete,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            other => Method::Other(other.to_string()),
        }
    }

    /// The canonical token for this method.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Delete => "DELETE",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Other(token) => token,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable identity of one tile request.
///
/// Cloning shares the closed-flag with the original so that closing any
/// address in a derivation chain is visible to all of them. Use
/// [`TileAddress::derive_request`] to obtain an independent copy with a
/// fresh header bag (e.g. for a background cache refresh).
#[derive(Debug, Clone)]
pub struct TileAddress {
    /// Layer name (validated against the registry charset at registration)
    pub layer: String,
    /// Zoom level
    pub z: u8,
    /// Tile column
    pub x: u32,
    /// Tile row
    pub y: u32,
    /// File variant (e.g. `tile.png`)
    pub filename: String,
    /// HTTP method
    pub method: Method,
    /// Request headers
    pub headers: Headers,
    /// Raw query string without the leading `?`, if any
    pub query: Option<String>,
    closed: Arc<AtomicBool>,
}

impl TileAddress {
    /// Creates an address directly, as used by the programmatic
    /// `get_tile` API. Method defaults to GET with no headers.
    pub fn new(
        layer: impl Into<String>,
        z: u8,
        x: u32,
        y: u32,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            layer: layer.into(),
            z,
            x,
            y,
            filename: filename.into(),
            method: Method::Get,
            headers: Headers::new(),
            query: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Parses a path-style address.
    ///
    /// Accepts `/{layer}/{z}/{x}/{y}/{file}` (exactly five segments) or the
    /// compact `/{layer}/{z}/{x}/{y}.{file}` (exactly four segments, y and
    /// file split at the first `.` or `@`). Returns `None` for anything
    /// else; the dispatcher maps that to 404.
    pub fn parse(path: &str, headers: Headers, method: Method) -> Option<TileAddress> {
        if path.is_empty() {
            return None;
        }

        // Strip query string
        let (path, query) = match path.find('?') {
            Some(pos) => {
                let (p, q) = path.split_at(pos);
                (p, Some(q[1..].to_string()))
            }
            None => (path, None),
        };

        let path = path.strip_prefix('/').unwrap_or(path);
        let parts: Vec<&str> = path.split('/').collect();

        let (layer, z_str, x_str, y_str, filename) = match parts.as_slice() {
            [layer, z, x, y, filename] => (*layer, *z, *x, *y, (*filename).to_string()),
            [layer, z, x, y_and_file] => {
                // Compact form: split y from file at the first '.' or '@'.
                // The separator itself is dropped; see the route docs for
                // the caveats around filenames containing either character.
                let split = match (y_and_file.find('.'), y_and_file.find('@')) {
                    (Some(a), Some(b)) => a.min(b),
                    (Some(a), None) => a,
                    (None, Some(b)) => b,
                    (None, None) => return None,
                };
                let (y, file) = y_and_file.split_at(split);
                (*layer, *z, *x, y, file[1..].to_string())
            }
            _ => return None,
        };

        if layer.is_empty() || filename.is_empty() {
            return None;
        }

        Some(TileAddress {
            layer: layer.to_string(),
            z: parse_int::<u8>(z_str)?,
            x: parse_int::<u32>(x_str)?,
            y: parse_int::<u32>(y_str)?,
            filename,
            method,
            headers,
            query,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Returns an independent copy with a fresh (empty) header bag.
    ///
    /// The closed advisory flag is shared with the original, so closing
    /// either is observed by the whole derivation chain.
    pub fn derive_request(&self) -> TileAddress {
        TileAddress {
            headers: Headers::new(),
            ..self.clone()
        }
    }

    /// Marks this request (and everything derived from it) as closed.
    ///
    /// Advisory only: stages may poll it to stop early, but correctness
    /// never depends on prompt cancellation.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Returns true if the request was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

impl fmt::Display for TileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.layer, self.z, self.x, self.y, self.filename
        )
    }
}

/// Strict non-negative integer parse: ASCII digits only, no sign, no
/// fraction. Overflow of the target type fails the parse.
fn parse_int<T: std::str::FromStr>(s: &str) -> Option<T> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
