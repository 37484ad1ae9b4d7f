use base64ct::{Base64, Encoding};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Hash algorithm of a DKIM signature; `a=rsa-sha256` unless the key
/// descriptor says otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgo {
    Sha1,
    #[default]
    Sha256,
}

impl HashAlgo {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "sha1" | "rsa-sha1" => HashAlgo::Sha1,
            _ => HashAlgo::Sha256,
        }
    }

    pub fn signature_name(&self) -> &'static str {
        match self {
            HashAlgo::Sha1 => "rsa-sha1",
            HashAlgo::Sha256 => "rsa-sha256",
        }
    }
}

enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    fn update(&mut self, bytes: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(bytes),
            Hasher::Sha256(h) => h.update(bytes),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Sha1(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
        }
    }
}

/// Streaming `relaxed` body canonicalization hash (RFC 6376 §3.4.4).
///
/// Bytes pass through unchanged; the digest is fed the canonical form:
/// CR/CRLF/LF normalized to CRLF, trailing whitespace stripped per line,
/// internal whitespace runs collapsed to one SP, and all trailing empty
/// lines collapsed to a single CRLF. The digest never sees bytes that
/// might still turn out to be trailing whitespace or trailing empty lines
/// in a later chunk; those are held as counters until resolved by more
/// data or by `finalize`.
pub struct RelaxedBodyHasher {
    hasher: Hasher,
    /// CR seen, LF not yet.
    saw_cr: bool,
    /// No content emitted for the current line yet.
    at_line_start: bool,
    /// Whitespace run pending inside the current line.
    ws_run: bool,
    /// Completed empty lines not yet known to be internal.
    pending_blank: u64,
}

impl RelaxedBodyHasher {
    pub fn new(algo: HashAlgo) -> Self {
        let hasher = match algo {
            HashAlgo::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlgo::Sha256 => Hasher::Sha256(Sha256::new()),
        };
        Self {
            hasher,
            saw_cr: false,
            at_line_start: true,
            ws_run: false,
            pending_blank: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        for &byte in chunk {
            if self.saw_cr {
                self.saw_cr = false;
                self.line_break();
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\r' => self.saw_cr = true,
                b'\n' => self.line_break(),
                b' ' | b'\t' => self.ws_run = true,
                _ => {
                    if self.at_line_start {
                        self.flush_blank_lines();
                        self.at_line_start = false;
                    }
                    if self.ws_run {
                        self.hasher.update(b" ");
                        self.ws_run = false;
                    }
                    self.hasher.update(&[byte]);
                }
            }
        }
    }

    fn line_break(&mut self) {
        if self.at_line_start {
            self.pending_blank += 1;
        } else {
            self.hasher.update(b"\r\n");
            self.at_line_start = true;
        }
        self.ws_run = false;
    }

    fn flush_blank_lines(&mut self) {
        for _ in 0..self.pending_blank {
            self.hasher.update(b"\r\n");
        }
        self.pending_blank = 0;
    }

    pub fn finalize(mut self) -> Vec<u8> {
        if self.saw_cr {
            self.saw_cr = false;
            self.line_break();
        }
        if !self.at_line_start {
            // unterminated final content line gets its CRLF
            self.hasher.update(b"\r\n");
        }
        self.hasher.finalize()
    }

    pub fn finalize_base64(self) -> String {
        Base64::encode_string(&self.finalize())
    }
}
