// SPDX-License-Identifier: MIT

//! Building blocks of the textual ATerm format used for `.drv` files:
//! quoted strings with C-like escapes, and bracketed lists.

use bstr::BString;
use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::{escaped_transform, is_not, tag};
use nom::character::complete::char as chr;
use nom::combinator::{map, map_opt, value};
use nom::multi::separated_list0;
use nom::sequence::delimited;

/// Escape a byte string for embedding in a quoted ATerm field.
/// Does not add the surrounding quotes.
pub fn escape(s: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for &b in s {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            b'"' => out.extend_from_slice(b"\\\""),
            _ => out.push(b),
        }
    }
    out
}

fn unescaped_bytes(i: &[u8]) -> IResult<&[u8], BString> {
    escaped_transform(
        is_not("\"\\"),
        '\\',
        alt((
            value("\\".as_bytes(), chr('\\')),
            value("\n".as_bytes(), chr('n')),
            value("\r".as_bytes(), chr('r')),
            value("\t".as_bytes(), chr('t')),
            value("\"".as_bytes(), chr('"')),
        )),
    )(i)
    .map(|(rest, v)| (rest, BString::new(v)))
}

/// Parse a double-quoted field, undoing escapes, as raw bytes.
pub fn bytes_field(i: &[u8]) -> IResult<&[u8], BString> {
    delimited(
        chr('"'),
        alt((unescaped_bytes, map(tag(b""), |_| BString::default()))),
        chr('"'),
    )(i)
}

/// Parse a double-quoted field that must be valid UTF-8.
pub fn string_field(i: &[u8]) -> IResult<&[u8], String> {
    delimited(
        chr('"'),
        alt((
            map_opt(unescaped_bytes, |b| String::from_utf8(b.into()).ok()),
            map(tag(b""), |_| String::new()),
        )),
        chr('"'),
    )(i)
}

/// Parse a bracketed list of quoted UTF-8 fields.
pub fn string_list(i: &[u8]) -> IResult<&[u8], Vec<String>> {
    delimited(chr('['), separated_list0(chr(','), string_field), chr(']'))(i)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    #[rstest]
    #[case::empty(b"".as_slice(), b"".as_slice())]
    #[case::plain(b"hello".as_slice(), b"hello".as_slice())]
    #[case::quote(b"\"".as_slice(), b"\\\"".as_slice())]
    #[case::backslash(b"\\".as_slice(), b"\\\\".as_slice())]
    #[case::newline(b"a\nb".as_slice(), b"a\\nb".as_slice())]
    #[case::colon(b":".as_slice(), b":".as_slice())]
    fn escape(#[case] input: &[u8], #[case] expected: &[u8]) {
        assert_eq!(expected, super::escape(input));
    }

    #[rstest]
    #[case::empty(br#""""#.as_slice(), "", b"".as_slice())]
    #[case::plain(br#""hello""#.as_slice(), "hello", b"".as_slice())]
    #[case::escaped(br#""a\"b\nc""#.as_slice(), "a\"b\nc", b"".as_slice())]
    #[case::rest(br#""x"tail"#.as_slice(), "x", b"tail".as_slice())]
    fn string_field(#[case] input: &[u8], #[case] expected: &str, #[case] rest: &[u8]) {
        let (r, parsed) = super::string_field(input).unwrap();
        assert_eq!(rest, r);
        assert_eq!(expected, parsed);
    }

    #[test]
    fn string_field_rejects_bad_utf8() {
        let input = [b'"', 0xc5, 0xc4, 0xd6, b'"'];
        super::string_field(&input).unwrap_err();
    }

    #[rstest]
    #[case::empty(b"[]".as_slice(), Vec::new())]
    #[case::one(br#"["a"]"#.as_slice(), vec!["a".to_string()])]
    #[case::two(br#"["a","b"]"#.as_slice(), vec!["a".to_string(), "b".to_string()])]
    fn string_list(#[case] input: &[u8], #[case] expected: Vec<String>) {
        let (rest, parsed) = super::string_list(input).unwrap();
        assert!(rest.is_empty());
        assert_eq!(expected, parsed);
    }

    /// Escaping then parsing restores the original bytes.
    #[test]
    fn roundtrip() {
        let raw: &[u8] = b"a\"b\\c\nd\re\tf";
        let mut quoted = vec![b'"'];
        quoted.extend(super::escape(raw));
        quoted.push(b'"');
        let (rest, parsed) = super::bytes_field(&quoted).unwrap();
        assert!(rest.is_empty());
        assert_eq!(raw, parsed.as_slice());
    }
}
