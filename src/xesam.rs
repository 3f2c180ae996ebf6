//! Resource identifiers for media urls.
//!
//! Players advertise the current track as `xesam:url` metadata. Bookmarks are
//! keyed on the canonical string form of that url, so parsing has to be
//! stable: the same input always produces the same `raw` rendering, and bare
//! filesystem paths are promoted to `file://` urls.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use url::Url;

use crate::error::PbmError;

/// A parsed `xesam:url` value.
///
/// Equality and persistence are defined on the canonical `raw` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XesamUrl {
    raw: String,
    scheme: String,
    /// Percent-decoded rendering: the path for `file` urls, the whole url
    /// otherwise. Computed once at construction so later uses cannot fail.
    unescaped: String,
}

impl XesamUrl {
    /// Parse an RFC-3986 url, or a bare path which is promoted to the `file`
    /// scheme. Relative bare paths are resolved against the current
    /// directory.
    pub fn parse(input: &str) -> Result<XesamUrl, PbmError> {
        match Url::parse(input) {
            Ok(url) => XesamUrl::from_url(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let path = PathBuf::from(input);
                let path = if path.is_absolute() {
                    path
                } else {
                    env::current_dir()?.join(path)
                };
                let url = Url::from_file_path(&path)
                    .map_err(|_| PbmError::Input(format!("invalid path: {input}")))?;
                XesamUrl::from_url(url)
            }
            Err(err) => Err(PbmError::Input(format!("invalid url '{input}': {err}"))),
        }
    }

    fn from_url(url: Url) -> Result<XesamUrl, PbmError> {
        let raw = url.as_str().to_string();
        let scheme = url.scheme().to_string();
        let quoted_source = if scheme == "file" { url.path() } else { raw.as_str() };
        let unescaped = urlencoding::decode(quoted_source)
            .map_err(|err| PbmError::Input(format!("invalid url '{raw}': {err}")))?
            .into_owned();
        Ok(XesamUrl {
            raw,
            scheme,
            unescaped,
        })
    }

    /// The canonical string, used for persistence and equality.
    pub fn raw_string(&self) -> &str {
        &self.raw
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The percent-decoded filesystem path. Only meaningful for `file` urls.
    pub fn path(&self) -> &Path {
        Path::new(&self.unescaped)
    }

    /// A single argv-safe token: the decoded path for `file` urls, the
    /// decoded url otherwise.
    pub fn shell_quoted(&self) -> String {
        shell_quote(&self.unescaped)
    }
}

impl fmt::Display for XesamUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn needs_quoting(word: &str) -> bool {
    word.is_empty()
        || word.bytes().any(|b| {
            !(b.is_ascii_alphanumeric() || matches!(b, b'_' | b'@' | b'%' | b'+' | b'=' | b':' | b',' | b'.' | b'/' | b'-'))
        })
}

/// POSIX single-quote escaping for one word.
pub fn shell_quote(word: &str) -> String {
    if !needs_quoting(word) {
        return word.to_string();
    }
    let mut out = String::with_capacity(word.len() + 2);
    out.push('\'');
    for ch in word.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Quote and join argv tokens into one `/bin/sh -c` ready string.
pub fn shell_join<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    words
        .into_iter()
        .map(|w| shell_quote(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_urls() {
        let url = XesamUrl::parse("file:///a/b.mp3").unwrap();
        assert_eq!(url.raw_string(), "file:///a/b.mp3");
        assert_eq!(url.scheme(), "file");
        assert_eq!(url.path(), Path::new("/a/b.mp3"));
    }

    #[test]
    fn promotes_bare_paths() {
        let url = XesamUrl::parse("/a/b.mp3").unwrap();
        assert_eq!(url.raw_string(), "file:///a/b.mp3");
        assert_eq!(url.scheme(), "file");
    }

    #[test]
    fn round_trips_canonical_form() {
        let url = XesamUrl::parse("/file with spaces.mp3").unwrap();
        assert_eq!(url.raw_string(), "file:///file%20with%20spaces.mp3");

        let reparsed = XesamUrl::parse(url.raw_string()).unwrap();
        assert_eq!(reparsed, url);
        assert_eq!(reparsed.path(), Path::new("/file with spaces.mp3"));
    }

    #[test]
    fn keeps_other_schemes() {
        let url = XesamUrl::parse("http://example.com/x.mp4").unwrap();
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.raw_string(), "http://example.com/x.mp4");
        assert_eq!(url.shell_quoted(), "http://example.com/x.mp4");
    }

    #[test]
    fn rejects_garbage() {
        assert!(XesamUrl::parse("http://[bad").is_err());
    }

    #[test]
    fn equality_is_on_the_raw_string() {
        let a = XesamUrl::parse("file:///a/b.mp3").unwrap();
        let b = XesamUrl::parse("/a/b.mp3").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn shell_quoting() {
        assert_eq!(
            XesamUrl::parse("/a/b.mp3").unwrap().shell_quoted(),
            "/a/b.mp3"
        );
        assert_eq!(
            XesamUrl::parse("/file with spaces.mp3").unwrap().shell_quoted(),
            "'/file with spaces.mp3'"
        );
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_join(["mpv", "/tmp/a b.mp3"]), "mpv '/tmp/a b.mp3'");
    }
}
