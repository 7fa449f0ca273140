//! Token-line codec for the main dictionary
//!
//! Every record in the main dictionary is a single physical line mapping one
//! search token to the full nested description of where that token occurs:
//!
//! ```text
//! %25gconf.xml file!basename@%25gconf.xml#579,13249,13692 dir!path@etc#12,40
//! ```
//!
//! The line begins with the percent-quoted token, followed by space-separated
//! action-type groups. Within a group, `!` introduces a subtype, `@` a quoted
//! full matched value, `#` a package id, and `,` the byte offsets into that
//! package's manifest where the token was found. The token is always the
//! lexicographically-first field, so lines for distinct tokens sort the same
//! way the tokens themselves do (both the spooler and the merger compare
//! *decoded* tokens, never the quoted form).
//!
//! Tokens containing embedded newlines are rejected at encode time: the
//! token-offset store writes some tokens unquoted, and a multi-line token
//! would corrupt it.

use std::collections::BTreeMap;

use crate::errors::IndexError;

/// Byte offsets into a manifest where a token occurrence was found.
pub type Offsets = Vec<u64>;

/// package id -> offsets
pub type PackageMap = BTreeMap<u64, Offsets>;

/// full matched value -> packages
pub type ValueMap = BTreeMap<String, PackageMap>;

/// subtype (e.g. attribute name) -> values
pub type SubtypeMap = BTreeMap<String, ValueMap>;

/// Nested occurrence structure for one token:
/// action type -> subtype -> full value -> package id -> offsets.
///
/// Ordered maps at every level keep encoding deterministic and make the
/// splice merge a plain structural union.
pub type OccurrenceTree = BTreeMap<String, SubtypeMap>;

/// Characters that structure a main-dictionary line. Action types and
/// subtypes are written raw, so they must never contain any of these.
const SEP_CHARS: [char; 5] = [' ', '!', '@', '#', ','];

fn is_safe_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-' | b'~' | b'/')
}

/// Percent-quote a string. ASCII alphanumerics and `_ . - ~ /` pass through;
/// every other byte becomes `%XX`. This covers all five separator characters,
/// so quoted fields can never be confused with line structure.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if is_safe_byte(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Inverse of [`quote`]. Fails on truncated or non-hex escapes and on
/// escape sequences that do not decode to UTF-8.
pub fn unquote(s: &str) -> Result<String, IndexError> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 3 > bytes.len() {
                return Err(IndexError::parse(s, "truncated percent escape"));
            }
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                .map_err(|_| IndexError::parse(s, "bad percent escape"))?;
            let val = u8::from_str_radix(hex, 16)
                .map_err(|_| IndexError::parse(s, "bad percent escape"))?;
            out.push(val);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| IndexError::parse(s, "escape is not valid UTF-8"))
}

/// Encode one (token, occurrence tree) record as a dictionary line,
/// newline-terminated. Offsets are written sorted and de-duplicated.
pub fn encode_line(token: &str, tree: &OccurrenceTree) -> Result<String, IndexError> {
    if token.is_empty() {
        return Err(IndexError::parse(token, "empty token"));
    }
    if token.contains('\n') {
        return Err(IndexError::parse(token, "token contains a newline"));
    }
    let mut line = quote(token);
    for (action_type, subtypes) in tree {
        check_bare_field(action_type, "action type")?;
        line.push(' ');
        line.push_str(action_type);
        for (subtype, values) in subtypes {
            check_bare_field(subtype, "subtype")?;
            line.push('!');
            line.push_str(subtype);
            for (value, packages) in values {
                if value.contains('\n') {
                    return Err(IndexError::parse(value, "value contains a newline"));
                }
                line.push('@');
                line.push_str(&quote(value));
                for (pkg_id, offsets) in packages {
                    line.push('#');
                    line.push_str(&pkg_id.to_string());
                    let mut offs = offsets.clone();
                    offs.sort_unstable();
                    offs.dedup();
                    for off in offs {
                        line.push(',');
                        line.push_str(&off.to_string());
                    }
                }
            }
        }
    }
    line.push('\n');
    Ok(line)
}

fn check_bare_field(field: &str, what: &str) -> Result<(), IndexError> {
    if field.is_empty() {
        return Err(IndexError::parse(field, format!("empty {}", what)));
    }
    if field.contains(SEP_CHARS) || field.contains('\n') {
        return Err(IndexError::parse(
            field,
            format!("{} contains a separator character", what),
        ));
    }
    Ok(())
}

/// Decode one dictionary line back into its (token, occurrence tree) record.
/// Exact inverse of [`encode_line`] for any line it produced.
pub fn decode_line(line: &str) -> Result<(String, OccurrenceTree), IndexError> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let mut fields = line.split(' ');
    let token = unquote(
        fields
            .next()
            .ok_or_else(|| IndexError::parse(line, "empty line"))?,
    )?;
    if token.is_empty() {
        return Err(IndexError::parse(line, "empty token"));
    }

    let mut tree = OccurrenceTree::new();
    for group in fields {
        let mut subtypes = group.split('!');
        let action_type = subtypes
            .next()
            .ok_or_else(|| IndexError::parse(line, "missing action type"))?;
        let at_entry = tree.entry(action_type.to_string()).or_default();
        for sub in subtypes {
            let mut values = sub.split('@');
            let subtype = values
                .next()
                .ok_or_else(|| IndexError::parse(line, "missing subtype"))?;
            let st_entry = at_entry.entry(subtype.to_string()).or_default();
            for val in values {
                let mut packages = val.split('#');
                let value = unquote(
                    packages
                        .next()
                        .ok_or_else(|| IndexError::parse(line, "missing value"))?,
                )?;
                let fv_entry = st_entry.entry(value).or_default();
                for pkg in packages {
                    let mut nums = pkg.split(',');
                    let id_str = nums
                        .next()
                        .ok_or_else(|| IndexError::parse(line, "missing package id"))?;
                    let pkg_id: u64 = id_str
                        .parse()
                        .map_err(|_| IndexError::parse(line, "bad package id"))?;
                    let offsets = fv_entry.entry(pkg_id).or_default();
                    for n in nums {
                        let off: u64 = n
                            .parse()
                            .map_err(|_| IndexError::parse(line, "bad offset"))?;
                        offsets.push(off);
                    }
                }
            }
        }
    }
    Ok((token, tree))
}

/// Pull just the token out of a dictionary line, without decoding the rest.
pub fn decode_token(line: &str) -> Result<String, IndexError> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let quoted = line.split(' ').next().unwrap_or(line);
    unquote(quoted)
}

/// Structural union of two occurrence trees for the same token. Keys merge
/// at every level; offset lists for the same leaf are concatenated (the
/// encoder sorts and de-duplicates them on write).
pub fn splice(dst: &mut OccurrenceTree, src: OccurrenceTree) {
    for (action_type, subtypes) in src {
        let at_entry = dst.entry(action_type).or_default();
        for (subtype, values) in subtypes {
            let st_entry = at_entry.entry(subtype).or_default();
            for (value, packages) in values {
                let fv_entry = st_entry.entry(value).or_default();
                for (pkg_id, offsets) in packages {
                    fv_entry.entry(pkg_id).or_default().extend(offsets);
                }
            }
        }
    }
}

/// Build a single-leaf occurrence tree, the shape the spooler records one
/// manifest entry at a time.
pub fn leaf(
    action_type: &str,
    subtype: &str,
    value: &str,
    pkg_id: u64,
    offsets: &[u64],
) -> OccurrenceTree {
    let mut tree = OccurrenceTree::new();
    tree.entry(action_type.to_string())
        .or_default()
        .entry(subtype.to_string())
        .or_default()
        .entry(value.to_string())
        .or_default()
        .insert(pkg_id, offsets.to_vec());
    tree
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_roundtrip() {
        for s in [
            "plain",
            "with space",
            "a!b@c#d,e",
            "%already",
            "unicode é ツ",
            "path/to/file.txt",
        ] {
            assert_eq!(unquote(&quote(s)).unwrap(), s);
        }
    }

    #[test]
    fn test_quote_escapes_separators() {
        let q = quote("a b!c");
        assert!(!q.contains(' '));
        assert!(!q.contains('!'));
        assert_eq!(q, "a%20b%21c");
    }

    #[test]
    fn test_unquote_rejects_truncated_escape() {
        assert!(unquote("abc%2").is_err());
        assert!(unquote("abc%zz").is_err());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut tree = leaf("file", "basename", "%gconf.xml", 579, &[13249, 13692]);
        splice(&mut tree, leaf("dir", "path", "etc/gconf", 12, &[40]));
        let line = encode_line("%gconf.xml", &tree).unwrap();
        assert!(line.ends_with('\n'));
        let (token, decoded) = decode_line(&line).unwrap();
        assert_eq!(token, "%gconf.xml");
        assert_eq!(decoded, tree);
    }

    #[test]
    fn test_token_is_first_field() {
        let tree = leaf("file", "basename", "v", 1, &[0]);
        let line = encode_line("tok", &tree).unwrap();
        assert!(line.starts_with("tok "));
        assert_eq!(decode_token(&line).unwrap(), "tok");
    }

    #[test]
    fn test_encode_rejects_empty_token() {
        let tree = leaf("file", "basename", "v", 1, &[0]);
        assert!(encode_line("", &tree).is_err());
    }

    #[test]
    fn test_encode_rejects_newline_token() {
        let tree = leaf("file", "basename", "v", 1, &[0]);
        assert!(encode_line("a\nb", &tree).is_err());
    }

    #[test]
    fn test_encode_rejects_separator_in_action_type() {
        let tree = leaf("fi le", "basename", "v", 1, &[0]);
        assert!(encode_line("tok", &tree).is_err());
    }

    #[test]
    fn test_encode_sorts_and_dedups_offsets() {
        let tree = leaf("file", "basename", "v", 1, &[9, 3, 3, 1]);
        let line = encode_line("tok", &tree).unwrap();
        assert!(line.contains("#1,1,3,9"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_line("tok file!sub@val#notanumber").is_err());
        assert!(decode_line("").is_err());
    }

    #[test]
    fn test_splice_merges_shared_leaves() {
        let mut a = leaf("file", "basename", "v", 1, &[10]);
        splice(&mut a, leaf("file", "basename", "v", 1, &[20]));
        splice(&mut a, leaf("file", "basename", "v", 2, &[30]));
        let pkgs = &a["file"]["basename"]["v"];
        assert_eq!(pkgs[&1], vec![10, 20]);
        assert_eq!(pkgs[&2], vec![30]);
    }

    #[test]
    fn test_quoted_value_with_structure_chars() {
        let tree = leaf("set", "description", "a, b and c#2!", 7, &[0]);
        let line = encode_line("and", &tree).unwrap();
        let (_, decoded) = decode_line(&line).unwrap();
        assert!(decoded["set"]["description"].contains_key("a, b and c#2!"));
    }
}
