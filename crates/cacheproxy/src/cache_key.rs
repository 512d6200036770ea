use axum::http::{Method, Uri};

/// Storage key for a request against `target`:
/// `file://{METHOD}@{target}#{path}{query}`.
///
/// Path and query are percent-decoded (the query also maps `+` to a space);
/// a component that fails to decode is used as received.
pub fn cache_key(method: &Method, target: &str, uri: &Uri) -> String {
    let path = unescape_path(uri.path());
    let query = uri.query().map(unescape_query).unwrap_or_default();
    format!("file://{method}@{target}#{path}{query}")
        .trim()
        .to_string()
}

fn unescape_path(raw: &str) -> String {
    unescape(raw, false).unwrap_or_else(|| raw.to_string())
}

fn unescape_query(raw: &str) -> String {
    unescape(raw, true).unwrap_or_else(|| raw.to_string())
}

/// Strict percent-decoding. `None` on a malformed escape or non-UTF-8 output.
fn unescape(s: &str, plus_as_space: bool) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = hex_value(*bytes.get(i + 1)?)?;
                let lo = hex_value(*bytes.get(i + 2)?)?;
                out.push(hi << 4 | lo);
                i += 3;
            }
            b'+' if plus_as_space => {
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

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: &str = "http://example.com";

    fn key(method: Method, uri: &str) -> String {
        cache_key(&method, TARGET, &uri.parse::<Uri>().unwrap())
    }

    #[test]
    fn table() {
        let cases = [
            (Method::GET, "/file.txt", "file://GET@http://example.com#/file.txt"),
            (Method::GET, "/file.txt?foo=bar", "file://GET@http://example.com#/file.txtfoo=bar"),
            (Method::POST, "/upload", "file://POST@http://example.com#/upload"),
            (
                Method::GET,
                "/file.txt?name=John%20Doe",
                "file://GET@http://example.com#/file.txtname=John Doe",
            ),
            (Method::GET, "/file.txt?a+b", "file://GET@http://example.com#/file.txta b"),
            (Method::GET, "/file.txt?%ZZ", "file://GET@http://example.com#/file.txt%ZZ"),
            (
                Method::GET,
                "/file%20with%20space.txt",
                "file://GET@http://example.com#/file with space.txt",
            ),
            (Method::GET, "/bad%zzpath", "file://GET@http://example.com#/bad%zzpath"),
        ];

        for (method, uri, expected) in cases {
            assert_eq!(key(method, uri), expected, "uri {uri}");
        }
    }

    #[test]
    fn stable_across_encodings() {
        assert_eq!(key(Method::GET, "/a?q=x%20y"), key(Method::GET, "/a?q=x+y"));
        assert_eq!(key(Method::GET, "/a%2Fb"), key(Method::GET, "/a/b"));
        assert_eq!(key(Method::GET, "/%7Euser"), key(Method::GET, "/~user"));
    }

    #[test]
    fn absolute_form_uses_path_only() {
        assert_eq!(
            key(Method::GET, "http://other.host/page.html?x=1"),
            key(Method::GET, "/page.html?x=1")
        );
    }

    #[test]
    fn differs_by_method_path_and_query() {
        let base = key(Method::GET, "/a?x=1");
        assert_ne!(base, key(Method::HEAD, "/a?x=1"));
        assert_ne!(base, key(Method::GET, "/b?x=1"));
        assert_ne!(base, key(Method::GET, "/a?x=2"));
    }

    #[test]
    fn non_utf8_escape_falls_back_to_raw() {
        assert_eq!(
            key(Method::GET, "/x?%FF"),
            "file://GET@http://example.com#/x%FF"
        );
    }
}
