use std::path::Path;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{DmError, DmResult, Message};

/// Frames are a 4 byte length header followed by the serialized message.
const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

pub struct DmConnection {
    framed: Framed<UnixStream, LengthDelimitedCodec>,
}

impl DmConnection {
    pub const HEADER_LEN: usize = 4;

    pub fn new(sock: UnixStream) -> DmConnection {
        DmConnection {
            framed: LengthDelimitedCodec::builder()
                .length_field_length(Self::HEADER_LEN)
                .max_frame_length(MAX_FRAME_LEN)
                .new_framed(sock),
        }
    }

    pub async fn connect(socket_path: &Path) -> DmResult<DmConnection> {
        let sock = UnixStream::connect(socket_path).await.map_err(|e| {
            DmError::Comm(format!(
                "connect to {} failed: {}",
                socket_path.display(),
                e
            ))
        })?;
        Ok(DmConnection::new(sock))
    }

    pub async fn send(&mut self, msg: &Message) -> DmResult<()> {
        let data =
            serde_json::to_vec(msg).map_err(|e| DmError::Comm(format!("encode failed: {}", e)))?;
        self.framed
            .send(Bytes::from(data))
            .await
            .map_err(|e| DmError::Comm(format!("send failed: {}", e)))
    }

    pub async fn recv(&mut self) -> DmResult<Message> {
        match self.framed.next().await {
            Some(Ok(frame)) => serde_json::from_slice(&frame)
                .map_err(|e| DmError::Comm(format!("decode failed: {}", e))),
            Some(Err(e)) => Err(DmError::Comm(format!("recv failed: {}", e))),
            None => Err(DmError::Comm("connection closed".to_string())),
        }
    }
}

/// The key rendezvous file: written by the server at startup, read by
/// every client on the same host.
pub fn read_key(path: &Path) -> DmResult<i64> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        DmError::Comm(format!("reading key file {} failed: {}", path.display(), e))
    })?;
    content
        .trim()
        .parse::<i64>()
        .map_err(|e| DmError::Comm(format!("invalid key file {}: {}", path.display(), e)))
}

pub fn write_key(path: &Path, key: i64) -> DmResult<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    writeln!(file, "{}", key)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;
    use tempfile::TempDir;

    #[test]
    fn test_key_file_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("key");
        write_key(&path, 0x1122334455667788).unwrap();
        assert_eq!(read_key(&path).unwrap(), 0x1122334455667788);
    }

    #[tokio::test]
    async fn test_framed_message_exchange() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut client = DmConnection::new(a);
        let mut server = DmConnection::new(b);

        client
            .send(&Message::StatusRequest { key: 77 })
            .await
            .unwrap();
        match server.recv().await.unwrap() {
            Message::StatusRequest { key } => assert_eq!(key, 77),
            other => panic!("unexpected message: {:?}", other),
        }

        server
            .send(&Message::StatusResp {
                success: true,
                pid: 4711,
            })
            .await
            .unwrap();
        match client.recv().await.unwrap() {
            Message::StatusResp { success, pid } => {
                assert!(success);
                assert_eq!(pid, 4711);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_recv_on_closed_connection() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut server = DmConnection::new(b);
        drop(a);
        assert!(server.recv().await.is_err());
    }
}
