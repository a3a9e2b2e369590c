//! Body rewriting applied to messages in transit: TUID header handling and
//! line-ending conversion between stores.

use crate::types::Tuid;

const TUID_HEADER: &[u8] = b"X-TUID: ";

/// The message has no header/body boundary; it cannot be tagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MalformedHeader;

/// Rewrite a message for storing on the other side.
///
/// When `tuid` is given, any existing `X-TUID:` header is excised and a fresh
/// one inserted in its place (or right before the blank line ending the
/// header block). When the stores disagree on line endings, the body is
/// converted: expanded to CRLF when the destination requires it, stripped to
/// bare LF otherwise. The new header's line terminator follows the
/// surrounding headers.
pub fn rewrite_message(
    data: &[u8],
    tuid: Option<&Tuid>,
    src_crlf: bool,
    dst_crlf: bool,
) -> Result<Vec<u8>, MalformedHeader> {
    let convert = src_crlf != dst_crlf;
    if tuid.is_none() && !convert {
        return Ok(data.to_vec());
    }

    let mut out = Vec::with_capacity(data.len() + TUID_HEADER.len() + 16);
    let append = |out: &mut Vec<u8>, chunk: &[u8]| {
        if !convert {
            out.extend_from_slice(chunk);
        } else if dst_crlf {
            for &c in chunk {
                if c != b'\r' {
                    if c == b'\n' {
                        out.push(b'\r');
                    }
                    out.push(c);
                }
            }
        } else {
            out.extend(chunk.iter().copied().filter(|&c| c != b'\r'));
        }
    };

    let Some(tuid) = tuid else {
        append(&mut out, data);
        return Ok(out);
    };

    // Find where the fresh header goes: over an existing X-TUID line, or
    // right before the blank line terminating the headers.
    let mut header_crs = 0usize;
    let mut start = 0usize;
    let mut brk = None;
    for (i, &c) in data.iter().enumerate() {
        if c != b'\n' {
            continue;
        }
        let line = &data[start..i];
        if line.starts_with(TUID_HEADER) {
            brk = Some((start, i + 1));
            break;
        }
        let line_crs = line.iter().filter(|&&c| c == b'\r').count();
        if line_crs == line.len() {
            brk = Some((start, start));
            break;
        }
        header_crs += line_crs;
        start = i + 1;
    }
    let Some((sbreak, ebreak)) = brk else {
        return Err(MalformedHeader);
    };

    append(&mut out, &data[..sbreak]);
    out.extend_from_slice(TUID_HEADER);
    out.extend_from_slice(tuid.as_bytes());
    if dst_crlf && (!src_crlf || header_crs > 0) {
        out.push(b'\r');
    }
    out.push(b'\n');
    append(&mut out, &data[ebreak..]);
    Ok(out)
}
