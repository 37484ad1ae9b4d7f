use std::fmt::Write as _;

/// Ordered list of message header lines.
///
/// Every entry keeps the raw line exactly as received (folded continuation
/// lines joined to their parent), paired with the lowercased key taken from
/// the text before the first colon. Rendering is byte-for-byte identical to
/// the input until the first mutation; after that the block is emitted with
/// CRLF line endings throughout.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    lines: Vec<HeaderLine>,
    mutated: bool,
}

#[derive(Debug, Clone)]
struct HeaderLine {
    key: String,
    /// Raw header line without its final line terminator. Folded
    /// continuations keep their original embedded terminators.
    raw: String,
    /// Terminator the line carried on input, used for unmutated round trips.
    eol: &'static str,
}

fn normalized_key(raw: &str) -> String {
    raw.split(':').next().unwrap_or("").trim().to_ascii_lowercase()
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a header block. Lines starting with SP/HTAB continue the
    /// previous header. Input may use CRLF or bare LF terminators.
    pub fn parse(block: &str) -> Self {
        let mut lines: Vec<HeaderLine> = Vec::new();

        let mut rest = block;
        while !rest.is_empty() {
            let (line, eol, tail) = match rest.find('\n') {
                Some(idx) => {
                    let raw = &rest[..idx];
                    if let Some(stripped) = raw.strip_suffix('\r') {
                        (stripped, "\r\n", &rest[idx + 1..])
                    } else {
                        (raw, "\n", &rest[idx + 1..])
                    }
                }
                None => (rest, "", &rest[rest.len()..]),
            };
            rest = tail;

            if line.is_empty() && rest.is_empty() {
                break;
            }

            let continuation = line.starts_with(' ') || line.starts_with('\t');
            match lines.last_mut() {
                Some(prev) if continuation => {
                    // rejoin the fold with the terminator it arrived with
                    let prev_eol = std::mem::replace(&mut prev.eol, eol);
                    prev.raw.push_str(prev_eol);
                    prev.raw.push_str(line);
                }
                _ => lines.push(HeaderLine {
                    key: normalized_key(line),
                    raw: line.to_string(),
                    eol,
                }),
            }
        }

        Self {
            lines,
            mutated: false,
        }
    }

    pub fn parse_lines<I, S>(raw_lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let lines = raw_lines
            .into_iter()
            .map(|l| {
                let raw = l.as_ref().trim_end_matches(['\r', '\n']).to_string();
                HeaderLine {
                    key: normalized_key(&raw),
                    raw,
                    eol: "\r\n",
                }
            })
            .collect();
        Self {
            lines,
            mutated: false,
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// All values for `key` (case-insensitive), with the key prefix and
    /// folding whitespace stripped.
    pub fn get_all(&self, key: &str) -> Vec<String> {
        let key = key.to_ascii_lowercase();
        self.lines
            .iter()
            .filter(|l| l.key == key)
            .map(|l| Self::value_of(&l.raw))
            .collect()
    }

    pub fn get_first(&self, key: &str) -> Option<String> {
        let key = key.to_ascii_lowercase();
        self.lines
            .iter()
            .find(|l| l.key == key)
            .map(|l| Self::value_of(&l.raw))
    }

    fn value_of(raw: &str) -> String {
        let value = match raw.find(':') {
            Some(idx) => &raw[idx + 1..],
            None => raw,
        };
        // unfold and collapse the leading whitespace of each fold
        let mut out = String::new();
        for (i, part) in value.split('\n').enumerate() {
            let part = part.trim_matches(['\r', ' ', '\t']);
            if part.is_empty() {
                continue;
            }
            if i > 0 && !out.is_empty() {
                out.push(' ');
            }
            out.push_str(part);
        }
        if out.is_empty() {
            value.trim().to_string()
        } else {
            out
        }
    }

    /// Insert a fully formatted header line at `index`.
    pub fn add_at(&mut self, index: usize, raw: impl Into<String>) {
        let raw = raw.into();
        let index = index.min(self.lines.len());
        self.lines.insert(
            index,
            HeaderLine {
                key: normalized_key(&raw),
                raw,
                eol: "\r\n",
            },
        );
        self.mutated = true;
    }

    /// Prepend a formatted `Key: value` header.
    pub fn add_formatted(&mut self, key: &str, value: impl AsRef<str>) {
        self.add_at(0, format!("{key}: {}", value.as_ref()));
    }

    /// Append a formatted `Key: value` header at the bottom of the block.
    pub fn append_formatted(&mut self, key: &str, value: impl AsRef<str>) {
        let index = self.lines.len();
        self.add_at(index, format!("{key}: {}", value.as_ref()));
    }

    pub fn remove_all(&mut self, key: &str) {
        let key = key.to_ascii_lowercase();
        let before = self.lines.len();
        self.lines.retain(|l| l.key != key);
        if self.lines.len() != before {
            self.mutated = true;
        }
    }

    /// Count of individual header lines with the given key.
    pub fn count(&self, key: &str) -> usize {
        let key = key.to_ascii_lowercase();
        self.lines.iter().filter(|l| l.key == key).count()
    }

    /// Iterate `(normalized-key, raw-line)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lines.iter().map(|l| (l.key.as_str(), l.raw.as_str()))
    }

    /// Render the header block. Unmutated blocks reproduce their input
    /// exactly; mutated blocks use CRLF endings on every line.
    pub fn build(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            if self.mutated {
                // normalize fold terminators as well
                let mut first = true;
                for part in line.raw.split('\n') {
                    let part = part.trim_end_matches('\r');
                    if !first {
                        out.push_str("\r\n");
                    }
                    out.push_str(part);
                    first = false;
                }
                out.push_str("\r\n");
            } else {
                let _ = write!(out, "{}{}", line.raw, line.eol);
            }
        }
        out
    }

    /// Render the block followed by the empty separator line.
    pub fn build_with_terminator(&self) -> String {
        let mut out = self.build();
        out.push_str("\r\n");
        out
    }
}
