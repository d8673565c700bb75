//! hujson standardization.
//!
//! policy files are hujson: json plus `//` and `/* */` comments and
//! trailing commas. [`standardize`] rewrites a document to plain json so
//! the typed deserializer never sees the extensions. comments are replaced
//! with spaces and trailing commas with a space, preserving byte offsets
//! for error reporting.

use crate::Error;

/// rewrite a hujson document to plain json.
pub fn standardize(input: &[u8]) -> Result<String, Error> {
    let src = std::str::from_utf8(input).map_err(|e| Error::Hujson(format!("not utf-8: {e}")))?;

    let bytes = src.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                // copy the string literal verbatim, honoring escapes
                out.push(b'"');
                i += 1;
                loop {
                    match bytes.get(i) {
                        None => return Err(Error::Hujson("unterminated string".to_string())),
                        Some(b'\\') => {
                            out.push(b'\\');
                            if let Some(&next) = bytes.get(i + 1) {
                                out.push(next);
                                i += 2;
                            } else {
                                return Err(Error::Hujson("unterminated escape".to_string()));
                            }
                        }
                        Some(b'"') => {
                            out.push(b'"');
                            i += 1;
                            break;
                        }
                        Some(&b) => {
                            out.push(b);
                            i += 1;
                        }
                    }
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                // line comment: blank out to end of line
                while i < bytes.len() && bytes[i] != b'\n' {
                    out.push(b' ');
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                // block comment: blank out to the closing marker
                let start = i;
                i += 2;
                loop {
                    if i + 1 >= bytes.len() {
                        return Err(Error::Hujson(format!(
                            "unterminated block comment starting at byte {start}"
                        )));
                    }
                    if bytes[i] == b'*' && bytes[i + 1] == b'/' {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
                for _ in start..i {
                    out.push(b' ');
                }
            }
            b',' => {
                // a comma followed (modulo whitespace and comments) by a
                // closing bracket is a trailing comma; blank it out
                if comma_is_trailing(bytes, i + 1) {
                    out.push(b' ');
                } else {
                    out.push(b',');
                }
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(out).map_err(|e| Error::Hujson(format!("not utf-8 after rewrite: {e}")))
}

/// scan forward from `pos` past whitespace and comments; true if the next
/// significant byte closes an object or array.
fn comma_is_trailing(bytes: &[u8], mut pos: usize) -> bool {
    while pos < bytes.len() {
        match bytes[pos] {
            b' ' | b'\t' | b'\r' | b'\n' => pos += 1,
            b'/' if bytes.get(pos + 1) == Some(&b'/') => {
                while pos < bytes.len() && bytes[pos] != b'\n' {
                    pos += 1;
                }
            }
            b'/' if bytes.get(pos + 1) == Some(&b'*') => {
                pos += 2;
                while pos + 1 < bytes.len() && !(bytes[pos] == b'*' && bytes[pos + 1] == b'/') {
                    pos += 1;
                }
                pos += 2;
            }
            b'}' | b']' => return true,
            _ => return false,
        }
    }
    false
}
