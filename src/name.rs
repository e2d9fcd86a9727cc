use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors that can occur while decoding a tag-encoded metric name.
///
/// Byte positions are relative to the start of the tag list, i.e. the first
/// byte after the opening `[`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The name portion in front of the tag list was empty or blank.
    #[error("metric name must not be empty")]
    EmptyMetricName,

    /// A tag key was empty after trimming surrounding whitespace.
    #[error("tag key must not be empty")]
    EmptyTagKey,

    /// A tag value was empty after trimming surrounding whitespace.
    #[error("tag value must not be empty")]
    EmptyTagValue,

    /// A tag had no `:` separating the key from the value.
    #[error("expected `:` after tag key at byte {pos} of tag list")]
    ExpectedSeparator {
        /// Offset at which the scan for the separator gave up.
        pos: usize,
    },

    /// A quoted tag value was missing its closing quote.
    #[error("unterminated quoted tag value at byte {pos} of tag list")]
    UnterminatedQuote {
        /// Offset of the first byte after the opening quote.
        pos: usize,
    },

    /// Something other than `,` followed a tag value.
    #[error("expected `,` after tag value at byte {pos} of tag list")]
    ExpectedComma {
        /// Offset of the unexpected byte.
        pos: usize,
    },
}

/// A metric name combined with its canonical tag set.
///
/// The text form is `name[key:value,key:value]`, with the bracketed tag list
/// omitted when there are no tags. Tags are held sorted by key, so two names
/// built from the same entries compare equal (and render identically) no
/// matter what order the tags were added in.
///
/// Values are immutable: [`submetric`](Self::submetric) and
/// [`with_tags`](Self::with_tags) return new instances and never touch the
/// receiver.
///
/// ```
/// use tsdb_client::TagEncodedName;
///
/// let requests = TagEncodedName::decode("http.requests[status:200]").unwrap();
/// let latency = requests.submetric("latency.p99").with_tag("host", "web-1");
/// assert_eq!(latency.to_string(), "http.requests.latency.p99[host:web-1,status:200]");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagEncodedName {
    name: String,
    tags: BTreeMap<String, String>,
}

impl TagEncodedName {
    /// Parses the `name[k:v,...]` text form.
    ///
    /// Whitespace before keys and around values is trimmed, a trailing comma
    /// in the tag list is accepted, and values containing whitespace, commas,
    /// colons, or quotes may be quoted with `"` (a literal quote is written
    /// `""`). Input without a bracketed suffix is a bare name with no tags.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] when the name is empty or the tag list is
    /// malformed.
    pub fn decode(encoded: &str) -> Result<Self, ParseError> {
        let (name, tags) = match encoded.find('[') {
            Some(open) => match encoded.rfind(']') {
                Some(close) if close > open => {
                    (&encoded[..open], parse_tags(&encoded[open + 1..close])?)
                }
                _ => (encoded, BTreeMap::new()),
            },
            None => (encoded, BTreeMap::new()),
        };

        if name.trim().is_empty() {
            return Err(ParseError::EmptyMetricName);
        }

        Ok(TagEncodedName { name: name.to_owned(), tags })
    }

    /// Returns the metric name without the tag list.
    pub fn metric_name(&self) -> &str {
        &self.name
    }

    /// Returns the tags, sorted by key.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Returns a new name with `suffix` dot-joined onto this name, carrying
    /// the same tags.
    ///
    /// The joining dot is omitted when either side is empty, so
    /// `submetric("")` is a plain copy.
    #[must_use]
    pub fn submetric(&self, suffix: &str) -> Self {
        let mut name = String::with_capacity(self.name.len() + suffix.len() + 1);
        name.push_str(&self.name);
        if !name.is_empty() && !suffix.is_empty() {
            name.push('.');
        }
        name.push_str(suffix);
        TagEncodedName { name, tags: self.tags.clone() }
    }

    /// Returns a new name with one additional tag, replacing any existing
    /// entry for the same key.
    #[must_use]
    pub fn with_tag(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut tags = self.tags.clone();
        tags.insert(key.into(), value.into());
        TagEncodedName { name: self.name.clone(), tags }
    }

    /// Returns a new name with the given tags merged on top of the existing
    /// ones. Later entries win on key collision.
    #[must_use]
    pub fn with_tags<K, V, I>(&self, additional: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut tags = self.tags.clone();
        tags.extend(additional.into_iter().map(|(k, v)| (k.into(), v.into())));
        TagEncodedName { name: self.name.clone(), tags }
    }
}

impl fmt::Display for TagEncodedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if self.tags.is_empty() {
            return Ok(());
        }

        f.write_str("[")?;
        let mut first = true;
        for (key, value) in &self.tags {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            f.write_str(key)?;
            f.write_str(":")?;
            write_tag_value(f, value)?;
        }
        f.write_str("]")
    }
}

impl FromStr for TagEncodedName {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TagEncodedName::decode(s)
    }
}

fn needs_quoting(value: &str) -> bool {
    value.chars().any(|c| matches!(c, '"' | ' ' | '\t' | ',' | ':'))
}

fn write_tag_value(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    if !needs_quoting(value) {
        return f.write_str(value);
    }

    f.write_str("\"")?;
    let mut rest = value;
    while let Some(idx) = rest.find('"') {
        // Include the quote itself, then double it.
        f.write_str(&rest[..=idx])?;
        f.write_str("\"")?;
        rest = &rest[idx + 1..];
    }
    f.write_str(rest)?;
    f.write_str("\"")
}

fn parse_tags(list: &str) -> Result<BTreeMap<String, String>, ParseError> {
    let bytes = list.as_bytes();
    let mut tags = BTreeMap::new();
    let mut pos = 0;

    while pos < bytes.len() {
        // Leading whitespace in front of a key; a trailing comma leaves only
        // whitespace behind, which terminates the list cleanly.
        while pos < bytes.len() && (bytes[pos] == b' ' || bytes[pos] == b'\t') {
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }

        let key_start = pos;
        while bytes[pos] != b':' {
            pos += 1;
            if pos >= bytes.len() {
                return Err(ParseError::ExpectedSeparator { pos });
            }
        }
        let key = list[key_start..pos].trim();
        if key.is_empty() {
            return Err(ParseError::EmptyTagKey);
        }
        pos += 1;

        while pos < bytes.len() && (bytes[pos] == b' ' || bytes[pos] == b'\t') {
            pos += 1;
        }
        if pos >= bytes.len() {
            return Err(ParseError::EmptyTagValue);
        }

        let value = if bytes[pos] == b'"' {
            pos += 1;
            let mut buf = String::new();
            loop {
                let Some(rel) = list[pos..].find('"') else {
                    return Err(ParseError::UnterminatedQuote { pos });
                };
                buf.push_str(&list[pos..pos + rel]);
                pos += rel + 1;
                if bytes.get(pos) == Some(&b'"') {
                    // A doubled quote is a literal quote.
                    buf.push('"');
                    pos += 1;
                } else {
                    break;
                }
            }
            if buf.trim().is_empty() {
                return Err(ParseError::EmptyTagValue);
            }
            while pos < bytes.len() && (bytes[pos] == b' ' || bytes[pos] == b'\t') {
                pos += 1;
            }
            buf
        } else {
            let value_start = pos;
            while pos < bytes.len() && bytes[pos] != b',' {
                pos += 1;
            }
            let value = list[value_start..pos].trim();
            if value.is_empty() {
                return Err(ParseError::EmptyTagValue);
            }
            value.to_owned()
        };

        tags.insert(key.to_owned(), value);

        if pos < bytes.len() {
            if bytes[pos] == b',' {
                pos += 1;
            } else {
                return Err(ParseError::ExpectedComma { pos });
            }
        }
    }

    Ok(tags)
}
