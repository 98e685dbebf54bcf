//! Reader and writer for the git credential-helper I/O format.
//!
//! The format is a sequence of `key=value\n` lines terminated by an empty
//! line. Multi-valued properties are not implemented; they are not required
//! by this service.
//!
//! See also: <https://git-scm.com/docs/git-credential#IOFMT>

use std::io::{BufRead, Write};

use anyhow::{bail, Result};

use super::PropertyMap;

/// Maximum number of distinct properties accepted from a client. Callers must
/// additionally wrap the reader in a byte-size limiter.
pub const MAX_PROPERTIES: usize = 20;

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Parse credential-helper properties from `reader`.
///
/// The first empty line terminates input. Lines without a `=` delimiter or
/// with an empty key are skipped. A repeated key keeps its original position
/// and takes the last value seen. Reading stops once [`MAX_PROPERTIES`]
/// distinct keys have been collected.
///
/// Fails only if the underlying reader fails.
pub fn read_properties<R: BufRead>(reader: R) -> std::io::Result<PropertyMap> {
    let mut pairs = PropertyMap::with_capacity(MAX_PROPERTIES);

    for line in reader.lines() {
        let line = line?;

        if line.is_empty() {
            // empty line terminates input
            break;
        }

        // must have a delimiter, key must be valued, skip invalid
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if key.is_empty() {
            continue;
        }

        if pairs.len() >= MAX_PROPERTIES && pairs.get(key).is_none() {
            break;
        }

        pairs.set(key, value);
    }

    Ok(pairs)
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Write credential-helper properties to `writer` in insertion order,
/// terminated by an empty line.
///
/// Fails if any key is empty or contains one of `\n`, `=`, NUL, or if any
/// value contains `\n` or NUL. Serialization happens into a buffer first, so
/// a failure produces no output bytes.
pub fn write_properties<W: Write>(properties: &PropertyMap, writer: &mut W) -> Result<()> {
    let mut buf = Vec::new();

    for (key, value) in properties.iter() {
        if key.is_empty() || key.contains(['\n', '=', '\0']) {
            bail!("key empty or contains invalid character");
        }
        if value.contains(['\n', '\0']) {
            bail!("value contains invalid character");
        }

        buf.extend_from_slice(key.as_bytes());
        buf.push(b'=');
        buf.extend_from_slice(value.as_bytes());
        buf.push(b'\n');
    }
    buf.push(b'\n');

    writer.write_all(&buf)?;

    Ok(())
}

// ---------------------------------------------------------------------------
// URL construction
// ---------------------------------------------------------------------------

/// Build `scheme://host/path` from the `protocol`, `host` and `path`
/// properties. Whether the resulting host is trusted is the caller's concern.
pub fn construct_repository_url(properties: &PropertyMap) -> Result<String> {
    let Some(protocol) = properties.get("protocol") else {
        bail!("protocol/scheme must be present");
    };
    let Some(host) = properties.get("host") else {
        bail!("host must be present");
    };
    let Some(path) = properties.get("path") else {
        bail!("path must be present");
    };

    Ok(format!(
        "{protocol}://{host}/{}",
        path.trim_start_matches('/')
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
