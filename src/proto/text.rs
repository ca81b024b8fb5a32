//! Typed helpers for the CR-line protocols.
//!
//! Every request and reply on the management and process controller
//! protocols is a sequence of CR-terminated lines followed by an empty
//! line. These helpers receive a line and check it against an expected
//! literal, or a prefix followed by a decimal, boolean or string. The
//! optional variants push a non-matching line back so the next receive
//! sees it again.

use super::connection::Connection;
use crate::error::{Error, Result};

/// Receive a line and require it to equal `expected`.
pub async fn rec_simple_str(conn: &mut Connection, expected: &str) -> Result<()> {
    let line = conn.rec_with_cr().await?;
    if line != expected {
        return Err(Error::Protocol(format!(
            "expected '{}', received '{}'",
            expected, line
        )));
    }
    Ok(())
}

/// Receive the empty line terminating a message.
pub async fn rec_empty_line(conn: &mut Connection) -> Result<()> {
    rec_simple_str(conn, "").await
}

/// Receive a line `"<prefix><decimal>"`.
pub async fn rec_number(conn: &mut Connection, prefix: &str) -> Result<u64> {
    let line = conn.rec_with_cr().await?;
    parse_prefixed_num(&line, prefix)
        .ok_or_else(|| Error::Protocol(format!("expected '{}<number>', received '{}'", prefix, line)))
}

/// Optional variant of [`rec_number`]: a non-matching line is pushed
/// back and `None` returned.
pub async fn rec_opt_number(conn: &mut Connection, prefix: &str) -> Result<Option<u64>> {
    let line = conn.rec_with_cr().await?;
    match parse_prefixed_num(&line, prefix) {
        Some(v) => Ok(Some(v)),
        None => {
            conn.push_back_line(line);
            Ok(None)
        }
    }
}

/// Receive a line `"<prefix><string>"`.
pub async fn rec_string(conn: &mut Connection, prefix: &str) -> Result<String> {
    let line = conn.rec_with_cr().await?;
    match line.strip_prefix(prefix) {
        Some(rest) => Ok(rest.to_string()),
        None => Err(Error::Protocol(format!(
            "expected '{}<string>', received '{}'",
            prefix, line
        ))),
    }
}

/// Optional variant of [`rec_string`].
pub async fn rec_opt_string(conn: &mut Connection, prefix: &str) -> Result<Option<String>> {
    let line = conn.rec_with_cr().await?;
    match line.strip_prefix(prefix) {
        Some(rest) => Ok(Some(rest.to_string())),
        None => {
            conn.push_back_line(line);
            Ok(None)
        }
    }
}

/// Receive a line `"<prefix>true"` or `"<prefix>false"`.
pub async fn rec_boolean(conn: &mut Connection, prefix: &str) -> Result<bool> {
    let line = conn.rec_with_cr().await?;
    match line.strip_prefix(prefix) {
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        _ => Err(Error::Protocol(format!(
            "expected '{}true|false', received '{}'",
            prefix, line
        ))),
    }
}

/// Receive a line with `count` space-separated decimals after `prefix`.
pub async fn rec_number_list(conn: &mut Connection, prefix: &str, count: usize) -> Result<Vec<u64>> {
    let line = conn.rec_with_cr().await?;
    let rest = line
        .strip_prefix(prefix)
        .ok_or_else(|| Error::Protocol(format!("expected '{}...', received '{}'", prefix, line)))?;
    let nums: Vec<u64> = rest
        .split_whitespace()
        .map(|w| w.parse::<u64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| Error::Protocol(format!("bad number list in '{}'", line)))?;
    if nums.len() != count {
        return Err(Error::Protocol(format!(
            "expected {} numbers, received {}",
            count,
            nums.len()
        )));
    }
    Ok(nums)
}

/// Send a line `"<prefix><number>"`.
pub async fn send_with_num(conn: &mut Connection, prefix: &str, number: u64) -> Result<()> {
    conn.send_with_cr(&format!("{}{}", prefix, number)).await
}

/// Send a line `"<prefix><value>"`.
pub async fn send_two_strings(conn: &mut Connection, prefix: &str, value: &str) -> Result<()> {
    conn.send_with_cr(&format!("{}{}", prefix, value)).await
}

/// Send a line composed of several parts.
pub async fn send_composed(conn: &mut Connection, parts: &[&str]) -> Result<()> {
    conn.send_with_cr(&parts.concat()).await
}

fn parse_prefixed_num(line: &str, prefix: &str) -> Option<u64> {
    line.strip_prefix(prefix)?.trim().parse::<u64>().ok()
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
    async fn test_number_helpers() {
        let (mut a, mut b) = pair().await;
        send_with_num(&mut a, "nodeid: ", 4).await.unwrap();
        assert_eq!(rec_number(&mut b, "nodeid: ").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_opt_number_pushback() {
        let (mut a, mut b) = pair().await;
        a.send_with_cr("cluster_id: 3").await.unwrap();
        // Looking for a different prefix leaves the line readable.
        assert!(rec_opt_number(&mut b, "nodeid: ").await.unwrap().is_none());
        assert_eq!(rec_number(&mut b, "cluster_id: ").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_boolean() {
        let (mut a, mut b) = pair().await;
        a.send_with_cr("autorestart: false").await.unwrap();
        assert!(!rec_boolean(&mut b, "autorestart: ").await.unwrap());
    }

    #[tokio::test]
    async fn test_simple_str_mismatch_is_protocol_error() {
        let (mut a, mut b) = pair().await;
        a.send_with_cr("list next").await.unwrap();
        let err = rec_simple_str(&mut b, "list stop").await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_number_list() {
        let (mut a, mut b) = pair().await;
        a.send_with_cr("data:  27 2 11").await.unwrap();
        let nums = rec_number_list(&mut b, "data: ", 3).await.unwrap();
        assert_eq!(nums, vec![27, 2, 11]);
    }
}
