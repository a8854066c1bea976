//! Client-side TCP connect with handshake verification.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::protocol::{PackrpcError, Result, HANDSHAKE_BYTE};

/// Connect to a packrpc server and consume the handshake byte.
///
/// Resolves `addr`, attempts each resolved address until one connects, then
/// waits for the server's first byte. Anything other than the handshake
/// byte fails with `Unauthorized`; a server that stays silent past
/// `socket_timeout` milliseconds fails with `Timeout`. The returned stream
/// is positioned at the start of the frame stream.
pub async fn connect(addr: &str, socket_timeout: u64) -> Result<TcpStream> {
    let socket_addrs: Vec<_> = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| PackrpcError::Connection(format!("invalid address '{}': {}", addr, e)))?
        .collect();

    let mut last_err = None;
    for socket_addr in socket_addrs {
        match TcpStream::connect(&socket_addr).await {
            Ok(stream) => return await_handshake(stream, socket_timeout).await,
            Err(e) => last_err = Some(e),
        }
    }

    Err(PackrpcError::Connection(format!(
        "failed to connect to {}: {}",
        addr,
        last_err.map(|e| e.to_string()).unwrap_or_else(|| "no resolved address".to_string())
    )))
}

async fn await_handshake(mut stream: TcpStream, socket_timeout: u64) -> Result<TcpStream> {
    let mut byte = [0u8; 1];
    let read = tokio::time::timeout(
        Duration::from_millis(socket_timeout),
        stream.read_exact(&mut byte),
    );

    match read.await {
        Ok(Ok(_)) if byte[0] == HANDSHAKE_BYTE => Ok(stream),
        Ok(Ok(_)) => Err(PackrpcError::Unauthorized),
        Ok(Err(e)) => Err(PackrpcError::Connection(format!("handshake read failed: {}", e))),
        Err(_) => Err(PackrpcError::Timeout(socket_timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_accepts_handshake_byte() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&[HANDSHAKE_BYTE]).await.unwrap();
            // Hold the connection open until the client is done.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        assert!(connect(&addr, 1000).await.is_ok());
    }

    #[tokio::test]
    async fn connect_rejects_wrong_first_byte() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&[0x00]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        assert!(matches!(connect(&addr, 1000).await, Err(PackrpcError::Unauthorized)));
    }

    #[tokio::test]
    async fn connect_times_out_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        assert!(matches!(connect(&addr, 50).await, Err(PackrpcError::Timeout(50))));
    }

    #[tokio::test]
    async fn connect_fails_on_refused_connection() {
        // Bind then drop to get an address nothing is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(connect(&addr, 100).await.is_err());
    }
}
