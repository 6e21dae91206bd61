// Redirect/tracking URL unwrapping.
//
// Share links on social pages are usually wrapped in a redirector such as
// `https://l.facebook.com/l.php?u=https%3A%2F%2Fexample.com%2F&h=...`, and
// sometimes wrapped more than once. `normalize` peels those layers off until
// no wrapper is left. Only the carried destination is ever percent-decoded;
// the escapes inside the final URL are kept as they are.

use tracing::warn;

/// Query parameters that carry the real destination of a redirect wrapper.
const WRAPPER_PARAMS: &[&str] = &["u", "url"];

/// Resolve a redirect/tracking URL to its final destination.
///
/// Never fails: input that cannot be parsed is logged and returned unchanged.
/// The result is a fixed point, so `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(raw: &str) -> String {
    if let Err(e) = url::Url::parse(raw) {
        warn!(url = raw, error = %e, "URL normalization failed, keeping original");
        return raw.to_string();
    }

    // Each peel yields a string carried inside the previous one's query, so
    // it is strictly shorter and the loop ends.
    let mut working = raw.to_string();
    while let Some(next) = wrapped_target(&working) {
        working = next;
    }
    working
}

/// Destination carried by a `u`/`url` query parameter, if it is an http(s) URL.
///
/// `query_pairs` already removes one level of encoding. A value that is still
/// encoded (`https%3A%2F%2F...`) is decoded until it reads as an http(s) URL.
fn wrapped_target(current: &str) -> Option<String> {
    let parsed = url::Url::parse(current).ok()?;
    parsed
        .query_pairs()
        .filter(|(key, _)| WRAPPER_PARAMS.contains(&key.as_ref()))
        .find_map(|(_, value)| decode_destination(&value))
}

fn decode_destination(value: &str) -> Option<String> {
    let mut working = value.to_string();
    while !is_http_url(&working) {
        let decoded = urlencoding::decode(&working).ok()?.into_owned();
        if decoded == working {
            return None;
        }
        working = decoded;
    }
    Some(working)
}

/// True for absolute `http://` / `https://` URLs.
pub fn is_http_url(s: &str) -> bool {
    let s = s.trim_start();
    ["http://", "https://"]
        .iter()
        .any(|scheme| s.get(..scheme.len()).is_some_and(|head| head.eq_ignore_ascii_case(scheme)))
}
