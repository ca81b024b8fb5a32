//! Transporter handshake.
//!
//! Once a management connection has been converted, or a data-api
//! connection is set up directly, both sides run this short exchange
//! before the byte stream starts carrying messages:
//!
//! ```text
//! Client: ndbd
//! Client: ndbd passwd
//! Server: ok
//! Client: <client_node_id> <server_node_id>
//! Server: 1 1
//! ```

use crate::error::{Error, Result};
use crate::params::MAX_NODE_ID;
use crate::proto::Connection;

use super::proto_str;

/// Client side of the handshake.
pub async fn client_handshake(
    conn: &mut Connection,
    my_node_id: u32,
    server_node_id: u32,
) -> Result<()> {
    conn.send_with_cr(proto_str::NDBD).await?;
    conn.send_with_cr(proto_str::NDBD_PASSWD).await?;
    let line = conn.rec_with_cr().await?;
    if line != proto_str::OK {
        return Err(Error::Protocol(format!(
            "transporter handshake refused: '{}'",
            line
        )));
    }
    conn.send_with_cr(&format!("{} {}", my_node_id, server_node_id))
        .await?;
    let line = conn.rec_with_cr().await?;
    if line != proto_str::TRANSPORTER_TYPES {
        return Err(Error::Protocol(format!(
            "unexpected transporter type reply: '{}'",
            line
        )));
    }
    Ok(())
}

/// Server side of the handshake; returns the client's node id.
pub async fn server_handshake(conn: &mut Connection, my_node_id: u32) -> Result<u32> {
    let line = conn.rec_with_cr().await?;
    if line != proto_str::NDBD {
        return Err(Error::Protocol(format!("expected ndbd, got '{}'", line)));
    }
    let line = conn.rec_with_cr().await?;
    if line != proto_str::NDBD_PASSWD {
        return Err(Error::Protocol(format!(
            "expected ndbd passwd, got '{}'",
            line
        )));
    }
    conn.send_with_cr(proto_str::OK).await?;
    let line = conn.rec_with_cr().await?;
    let mut parts = line.split_whitespace();
    let client_id: u32 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("bad node id pair '{}'", line)))?;
    let server_id: u32 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("bad node id pair '{}'", line)))?;
    if parts.next().is_some() {
        return Err(Error::Protocol(format!("bad node id pair '{}'", line)));
    }
    if client_id == 0 || client_id > MAX_NODE_ID || server_id == 0 || server_id > MAX_NODE_ID {
        return Err(Error::Protocol(format!(
            "node id out of range in '{}'",
            line
        )));
    }
    if server_id != my_node_id {
        return Err(Error::Protocol(format!(
            "peer declared server node {} but we are {}",
            server_id, my_node_id
        )));
    }
    conn.send_with_cr(proto_str::TRANSPORTER_TYPES).await?;
    Ok(client_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        let client = client.await.unwrap();
        (Connection::from_stream(client), Connection::from_stream(server))
    }

    #[tokio::test]
    async fn test_handshake_both_sides() {
        let (mut c, mut s) = pair().await;
        let server_task = tokio::spawn(async move {
            let id = server_handshake(&mut s, 2).await.unwrap();
            assert_eq!(id, 3);
        });
        client_handshake(&mut c, 3, 2).await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_server_node_refused() {
        let (mut c, mut s) = pair().await;
        let server_task =
            tokio::spawn(async move { server_handshake(&mut s, 9).await });
        let client_result = client_handshake(&mut c, 3, 2).await;
        let server_result = server_task.await.unwrap();
        assert!(server_result.is_err());
        // client sees either a protocol error or a closed connection
        assert!(client_result.is_err());
    }

    #[tokio::test]
    async fn test_node_id_bounds_checked() {
        let (mut c, mut s) = pair().await;
        let server_task = tokio::spawn(async move { server_handshake(&mut s, 2).await });
        let _ = client_handshake(&mut c, 0, 2).await;
        assert!(server_task.await.unwrap().is_err());
    }
}
