//! Small shared helpers: the quote-aware token join/split pair used by
//! the argument builder, and screendump image conversion.

use std::io::Cursor;

use crate::error::{Error, Result};

/// Join tokens with single spaces, double-quoting any token that
/// contains whitespace so the join is reversible.
///
/// This is the inverse of [`fields_quote_escape`]: tokens that carry
/// embedded spaces (e.g. `exec:cat /tmp/img`) survive a join/split
/// round trip.
pub fn unescape_join(tokens: &[String]) -> String {
    let mut out = String::new();
    for tok in tokens {
        if !out.is_empty() {
            out.push(' ');
        }
        if tok.chars().any(char::is_whitespace) {
            out.push('"');
            out.push_str(tok);
            out.push('"');
        } else {
            out.push_str(tok);
        }
    }
    out
}

/// Split on whitespace, except that runs quoted with `quote` are kept
/// as one token with the quote characters stripped.
///
/// Example: `a b "c d"` splits to `["a", "b", "c d"]`.
pub fn fields_quote_escape(quote: char, input: &str) -> Vec<String> {
    let mut ret: Vec<String> = Vec::new();
    let mut in_quote = false;

    for field in input.split_whitespace() {
        if in_quote {
            let last = ret.last_mut().unwrap();
            last.push(' ');
            if let Some(pos) = field.find(quote) {
                in_quote = false;
                let mut merged = String::with_capacity(field.len());
                merged.push_str(&field[..pos]);
                merged.push_str(&field[pos + quote.len_utf8()..]);
                last.push_str(&merged);
            } else {
                last.push_str(field);
            }
            continue;
        }

        if let Some(pos) = field.find(quote) {
            let mut stripped = String::with_capacity(field.len());
            stripped.push_str(&field[..pos]);
            stripped.push_str(&field[pos + quote.len_utf8()..]);
            if let Some(pos2) = stripped.find(quote) {
                // single quoted word, e.g. "foo"
                let mut once = String::with_capacity(stripped.len());
                once.push_str(&stripped[..pos2]);
                once.push_str(&stripped[pos2 + quote.len_utf8()..]);
                ret.push(once);
            } else {
                in_quote = true;
                ret.push(stripped);
            }
        } else {
            ret.push(field.to_string());
        }
    }

    ret
}

/// Convert a raw PPM screendump into a PNG scaled so its width is
/// `size` pixels (height proportional). `size` of 0 keeps the native
/// resolution.
pub fn ppm_to_png(ppm: &[u8], size: u32) -> Result<Vec<u8>> {
    let img = image::load_from_memory_with_format(ppm, image::ImageFormat::Pnm)
        .map_err(|e| Error::Screenshot(format!("decode ppm: {}", e)))?;

    let img = if size == 0 || img.width() <= size {
        img
    } else {
        let height = (u64::from(size) * u64::from(img.height()) / u64::from(img.width())) as u32;
        img.resize_exact(size, height.max(1), image::imageops::FilterType::Lanczos3)
    };

    let mut png = Cursor::new(Vec::new());
    img.write_to(&mut png, image::ImageFormat::Png)
        .map_err(|e| Error::Screenshot(format!("encode png: {}", e)))?;

    Ok(png.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_quotes_whitespace_tokens() {
        let tokens = vec![
            "-incoming".to_string(),
            "exec:cat /tmp/migrate".to_string(),
        ];
        assert_eq!(unescape_join(&tokens), r#"-incoming "exec:cat /tmp/migrate""#);
    }

    #[test]
    fn split_groups_quoted_fields() {
        assert_eq!(
            fields_quote_escape('"', r#"a b "c d""#),
            vec!["a", "b", "c d"]
        );
    }

    #[test]
    fn join_split_round_trip() {
        let tokens: Vec<String> = vec!["-append".into(), "root=/dev/vda console=ttyS0".into()];
        let joined = unescape_join(&tokens);
        assert_eq!(fields_quote_escape('"', &joined), tokens);
    }

    #[test]
    fn split_handles_single_quoted_word() {
        assert_eq!(fields_quote_escape('"', r#""foo" bar"#), vec!["foo", "bar"]);
    }

    #[test]
    fn ppm_round_trips_to_png() {
        // 2x2 white P6 image
        let ppm = b"P6\n2 2\n255\n\xff\xff\xff\xff\xff\xff\xff\xff\xff\xff\xff\xff";
        let png = ppm_to_png(ppm, 0).unwrap();
        assert_eq!(&png[1..4], b"PNG");
    }
}
