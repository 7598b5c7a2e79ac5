//! Minimal SOCKS5 CONNECT client.
//!
//! Outbound connections reach peers through the local proxy of the
//! anonymizing daemon. Only the CONNECT command with a domain-name target
//! is needed, and only the no-authentication method: the proxy is always
//! loopback.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Open a TCP stream to `host:port` through the SOCKS5 proxy at `proxy`.
pub async fn connect(proxy: SocketAddr, host: &str, port: u16) -> Result<TcpStream> {
    if host.len() > 255 {
        return Err(Error::Protocol("target host name too long for SOCKS5".into()));
    }

    let mut stream = TcpStream::connect(proxy).await?;

    // Method negotiation: we offer exactly "no authentication".
    stream
        .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
        .await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION || choice[1] != METHOD_NO_AUTH {
        return Err(Error::Protocol(format!(
            "proxy rejected authentication method: {:02x?}",
            choice
        )));
    }

    // CONNECT request with a domain-name target.
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
    request.push(host.len() as u8);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    // Reply: VER REP RSV ATYP BND.ADDR BND.PORT
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(Error::Protocol("proxy spoke a different version".into()));
    }
    if header[1] != 0x00 {
        return Err(Error::Protocol(format!(
            "proxy refused connection: {}",
            reply_message(header[1])
        )));
    }

    // Drain the bound address; its value is meaningless for us.
    let addr_len = match header[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(Error::Protocol(format!(
                "unknown address type in proxy reply: {other}"
            )))
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(stream)
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// A one-shot in-process SOCKS5 proxy that accepts the CONNECT and
    /// then echoes whatever the client sends.
    async fn fake_proxy(expect_host: &'static str, expect_port: u16) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut header = [0u8; 5];
            stream.read_exact(&mut header).await.unwrap();
            assert_eq!(&header[..4], &[0x05, 0x01, 0x00, 0x03]);
            let mut host = vec![0u8; header[4] as usize];
            stream.read_exact(&mut host).await.unwrap();
            assert_eq!(host, expect_host.as_bytes());
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await.unwrap();
            assert_eq!(u16::from_be_bytes(port), expect_port);

            // Success reply with a zero IPv4 bound address.
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        addr
    }

    #[tokio::test]
    async fn test_connect_through_proxy() {
        let proxy = fake_proxy("peeraddress.onion", 9878).await;

        let mut stream = connect(proxy, "peeraddress.onion", 9878).await.unwrap();
        stream.write_all(b"hello").await.unwrap();

        let mut echoed = [0u8; 5];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");
    }

    #[tokio::test]
    async fn test_refused_connection_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut header = [0u8; 5];
            stream.read_exact(&mut header).await.unwrap();
            let mut rest = vec![0u8; header[4] as usize + 2];
            stream.read_exact(&mut rest).await.unwrap();

            // Host unreachable.
            stream
                .write_all(&[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let result = connect(addr, "nowhere.onion", 9878).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_overlong_host_rejected() {
        let proxy: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let long_host = "a".repeat(300);
        assert!(matches!(
            connect(proxy, &long_host, 9878).await,
            Err(Error::Protocol(_))
        ));
    }
}
