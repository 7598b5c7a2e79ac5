//! Client for the daemon's local control endpoint.
//!
//! The anonymizing daemon is an external process; publishing a hidden
//! service happens over its line-oriented control socket with cookie
//! authentication. Only the handful of commands the supervisor needs are
//! implemented: `PROTOCOLINFO`, `AUTHENTICATE`, `ADD_ONION`, `DEL_ONION`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Error, Result};

/// An authenticated control-port session.
///
/// Hidden services published through a control connection live as long as
/// the connection does, so the session is kept open for the lifetime of
/// the overlay service.
pub struct ControlConnection {
    stream: BufReader<TcpStream>,
    service_id: Option<String>,
}

/// One reply from the control port: status code plus data lines.
struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl ControlConnection {
    /// Connect and authenticate against the control endpoint.
    ///
    /// The authentication cookie is read from `cookie_override` when set,
    /// otherwise from the path the daemon advertises via `PROTOCOLINFO`.
    pub async fn connect(addr: SocketAddr, cookie_override: Option<&Path>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let mut conn = Self {
            stream: BufReader::new(stream),
            service_id: None,
        };

        let cookie_path = match cookie_override {
            Some(path) => Some(path.to_path_buf()),
            None => conn.advertised_cookie_path().await?,
        };
        conn.authenticate(cookie_path.as_deref()).await?;
        Ok(conn)
    }

    /// Ask the daemon where its auth cookie lives.
    async fn advertised_cookie_path(&mut self) -> Result<Option<PathBuf>> {
        let reply = self.command("PROTOCOLINFO 1").await?;
        for line in &reply.lines {
            if let Some(rest) = line.strip_prefix("AUTH ") {
                if let Some(start) = rest.find("COOKIEFILE=\"") {
                    let tail = &rest[start + "COOKIEFILE=\"".len()..];
                    if let Some(end) = tail.find('"') {
                        return Ok(Some(PathBuf::from(&tail[..end])));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Run `AUTHENTICATE`, with the cookie when one is available.
    async fn authenticate(&mut self, cookie_path: Option<&Path>) -> Result<()> {
        let command = match cookie_path {
            Some(path) => {
                let cookie = tokio::fs::read(path).await?;
                format!("AUTHENTICATE {}", hex::encode(cookie))
            }
            None => "AUTHENTICATE".to_string(),
        };

        let reply = self.command(&command).await?;
        if reply.code != 250 {
            return Err(Error::Protocol(format!(
                "control authentication refused: {}",
                reply.lines.join("; ")
            )));
        }
        debug!("control endpoint authenticated");
        Ok(())
    }

    /// Publish an ephemeral hidden service mapping `virtual_port` to the
    /// local listener and return its onion address.
    pub async fn publish_hidden_service(
        &mut self,
        virtual_port: u16,
        local_port: u16,
    ) -> Result<String> {
        let command =
            format!("ADD_ONION NEW:BEST Port={virtual_port},127.0.0.1:{local_port}");
        let reply = self.command(&command).await?;
        if reply.code != 250 {
            return Err(Error::Protocol(format!(
                "hidden service rejected: {}",
                reply.lines.join("; ")
            )));
        }

        for line in &reply.lines {
            if let Some(id) = line.strip_prefix("ServiceID=") {
                self.service_id = Some(id.to_string());
                return Ok(format!("{id}.onion"));
            }
        }
        Err(Error::Protocol("control reply carried no ServiceID".into()))
    }

    /// Tear down the hidden service published by this session, if any.
    pub async fn remove_hidden_service(&mut self) -> Result<()> {
        let Some(id) = self.service_id.take() else {
            return Ok(());
        };
        let reply = self.command(&format!("DEL_ONION {id}")).await?;
        if reply.code != 250 {
            return Err(Error::Protocol(format!(
                "hidden service teardown failed: {}",
                reply.lines.join("; ")
            )));
        }
        Ok(())
    }

    /// Send one command and collect its full reply.
    async fn command(&mut self, command: &str) -> Result<Reply> {
        self.stream
            .get_mut()
            .write_all(format!("{command}\r\n").as_bytes())
            .await?;

        let mut lines = Vec::new();
        let code = loop {
            let mut line = String::new();
            let n = self.stream.read_line(&mut line).await?;
            if n == 0 {
                return Err(Error::Protocol("control connection closed".into()));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.len() < 4 {
                return Err(Error::Protocol(format!("malformed control line: {line:?}")));
            }

            let code: u16 = line[..3]
                .parse()
                .map_err(|_| Error::Protocol(format!("malformed control status: {line:?}")))?;
            let (separator, rest) = (line.as_bytes()[3], &line[4..]);
            lines.push(rest.to_string());

            // Space after the status code marks the final line.
            if separator == b' ' {
                break code;
            }
        };

        Ok(Reply { code, lines })
    }
}
