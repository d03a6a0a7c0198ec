use std::io::{Error, ErrorKind};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::wire::MAX_HEADER_LEN;

/// Read one `\n`-terminated protocol line.
///
/// Returns `Ok(None)` if the peer closed the connection before sending
/// anything. A final line without a terminator is returned as-is.
pub(crate) async fn read_line<R>(reader: &mut R) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_HEADER_LEN as u64)
        .read_until(b'\n', &mut buf)
        .await?;

    if n == 0 {
        return Ok(None);
    }

    // Sanity check to prevent memory exhaustion
    if n >= MAX_HEADER_LEN && buf.last() != Some(&b'\n') {
        return Err(Error::new(ErrorKind::InvalidData, "header line too long"));
    }

    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}
