//! # Name normalization
//!
//! Pure functions turning a page/file/thread name into a filesystem-safe
//! path component. `:` becomes `_` in every derived path component; the
//! remaining filesystem-unsafe characters go through a fixed percent-style
//! substitution table so a malicious page name can never resolve outside
//! its own folder (spec §3 invariants, §8 boundary behavior).

/// Characters that cannot appear verbatim in a path component on the
/// platforms this archiver targets, mapped to a stable two-character
/// substitution so the mapping is reversible without collisions.
const SUBSTITUTIONS: &[(char, &str)] = &[
    ('\\', "%5C"),
    ('*', "%2A"),
    ('?', "%3F"),
    ('"', "%22"),
    ('<', "%3C"),
    ('>', "%3E"),
    ('|', "%7C"),
    ('/', "%2F"),
];

/// Normalize a page name for use as an on-disk path component:
/// `:` → `_`, then every other filesystem-unsafe character is
/// percent-encoded via [`SUBSTITUTIONS`].
pub fn normalize(name: &str) -> String {
    encode_component(&name.replace(':', "_"))
}

/// Percent-encode (via the fixed substitution table) a single path
/// component, without the `:` → `_` page-name-specific rewrite.
///
/// A `%` already followed by two hex digits is left untouched so that
/// re-encoding an already-encoded component is a no-op — required for
/// `normalize(normalize(x)) == normalize(x)` (spec §8).
pub fn encode_component(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(chars.len());
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '%' && is_hex_pair(&chars, i + 1) {
            out.push('%');
            out.push(chars[i + 1]);
            out.push(chars[i + 2]);
            i += 3;
            continue;
        }
        if let Some((_, sub)) = SUBSTITUTIONS.iter().find(|(c, _)| *c == ch) {
            out.push_str(sub);
        } else if ch == '%' {
            out.push_str("%25");
        } else {
            out.push(ch);
        }
        i += 1;
    }
    out
}

fn is_hex_pair(chars: &[char], start: usize) -> bool {
    chars.len() > start + 1
        && chars[start].is_ascii_hexdigit()
        && chars[start + 1].is_ascii_hexdigit()
}

/// Reverse [`encode_component`]. Unknown `%XX` sequences are left as-is.
pub fn decode_component(encoded: &str) -> String {
    let mut out = String::with_capacity(encoded.len());
    let bytes: Vec<char> = encoded.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == '%' && i + 2 < bytes.len() {
            let hex: String = bytes[i + 1..i + 3].iter().collect();
            if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                out.push(byte as char);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// Normalization never escapes the page's own folder: it contains no
/// path separators and no literal `..`.
pub fn is_safe_component(component: &str) -> bool {
    !component.contains('/') && !component.contains('\\') && component != ".." && component != "."
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colon_becomes_underscore() {
        assert_eq!(normalize("fragment:scp-001"), "fragment_scp-001");
    }

    #[test]
    fn normalize_is_idempotent() {
        let name = "fragment:scp-001/evil*path";
        let once = normalize(name);
        let twice = normalize(&once);
        // re-normalizing an already-normalized name must not double-encode
        // the literal '%' introduced by the first pass
        assert_eq!(encode_component(&once), twice);
    }

    #[test]
    fn round_trips_through_substitution_table() {
        for raw in [":", "\\", "*", "?", "\"", "<", ">", "|", "/", ".", ".."] {
            let encoded = encode_component(raw);
            let decoded = decode_component(&encoded);
            assert_eq!(decoded, raw);
        }
    }

    #[test]
    fn encoded_components_never_escape_their_folder() {
        let evil = "../../etc/passwd";
        let encoded = normalize(evil);
        assert!(is_safe_component(&encoded));
    }

    #[test]
    fn plain_names_pass_through_unchanged() {
        assert_eq!(normalize("hello"), "hello");
        assert_eq!(normalize("scp-001"), "scp-001");
    }
}
