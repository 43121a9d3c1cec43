//! Bounded capture of child output streams.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Bytes read from one stream.
#[derive(Debug, Default)]
pub(crate) struct Captured {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl Captured {
    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Read `reader` to EOF, keeping at most `limit` bytes.
///
/// Reading continues past the limit so the child never blocks on a full
/// pipe; excess bytes are dropped.
pub(crate) async fn capture<R>(reader: Option<R>, limit: usize) -> Captured
where
    R: AsyncRead + Unpin,
{
    let mut captured = Captured::default();
    let Some(mut reader) = reader else {
        return captured;
    };
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(captured.bytes.len());
                let keep = n.min(room);
                captured.bytes.extend_from_slice(&buf[..keep]);
                if keep < n {
                    captured.truncated = true;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(error = %e, "output stream closed with error");
                break;
            }
        }
    }
    captured
}
