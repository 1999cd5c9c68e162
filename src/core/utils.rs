use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use zip::ZipArchive;

/// Maximum size of diagnostics surfaced to users (compiler output, runtime messages)
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Extract every regular file of an archive, flattened into `dest`
///
/// Returns the written paths. Directory structure inside the archive is
/// dropped; entries whose names escape the archive root are skipped.
pub fn extract_zip<R: Read + Seek>(data: R, dest: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut archive = ZipArchive::new(data)?;
    let mut written = Vec::new();

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;

        // ZIP Slip protection
        let file_path = match file.enclosed_name() {
            Some(path) => path.to_owned(),
            None => continue,
        };

        if file.is_dir() {
            continue;
        }

        let name = match file_path.file_name() {
            Some(name) => name.to_owned(),
            None => continue,
        };

        let mut content = Vec::new();
        file.read_to_end(&mut content)?;

        let outpath = dest.join(name);
        std::fs::write(&outpath, sanitize_content(content))?;
        written.push(outpath);
    }

    Ok(written)
}

/// Normalize line endings of text content to `\n`
///
/// Content containing NUL bytes is treated as binary and returned unchanged.
pub fn sanitize_content(content: Vec<u8>) -> Vec<u8> {
    if content.contains(&0) || !content.contains(&b'\r') {
        return content;
    }

    let mut out = Vec::with_capacity(content.len());
    let mut iter = content.iter().peekable();
    while let Some(&b) = iter.next() {
        if b == b'\r' {
            if iter.peek() == Some(&&b'\n') {
                iter.next();
            }
            out.push(b'\n');
        } else {
            out.push(b);
        }
    }
    out
}

/// Cut a diagnostic message down to `MAX_MESSAGE_BYTES` on a char boundary
pub fn truncate_message(message: &str) -> String {
    if message.len() <= MAX_MESSAGE_BYTES {
        return message.to_string();
    }
    let mut end = MAX_MESSAGE_BYTES;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... (truncated)", &message[..end])
}

/// Compare two file names, treating runs of digits as numbers
///
/// `2.in` sorts before `10.in`. Ties (`1` vs `01`) fall back to byte order.
pub fn natural_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    natural_cmp_bytes(a.as_bytes(), b.as_bytes()).then_with(|| a.cmp(b))
}

fn natural_cmp_bytes(mut a: &[u8], mut b: &[u8]) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    loop {
        match (a.first(), b.first()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let da = a.iter().take_while(|c| c.is_ascii_digit()).count();
                let db = b.iter().take_while(|c| c.is_ascii_digit()).count();
                let na = trim_zeros(&a[..da]);
                let nb = trim_zeros(&b[..db]);
                let ord = na.len().cmp(&nb.len()).then_with(|| na.cmp(nb));
                if ord != Ordering::Equal {
                    return ord;
                }
                a = &a[da..];
                b = &b[db..];
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(y);
                }
                a = &a[1..];
                b = &b[1..];
            }
        }
    }
}

fn trim_zeros(digits: &[u8]) -> &[u8] {
    let start = digits.iter().take_while(|&&c| c == b'0').count();
    &digits[start..]
}
