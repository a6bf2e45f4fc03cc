//! Anonymity service control port client
//!
//! License: 0BSD
//!
//! Speaks just enough of the line-based control protocol to authenticate
//! and request fresh circuits. Replies are `NNN-text` continuation lines
//! followed by a final `NNN text` line; `250` means success.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::error::AnonymityError;

/// Result type for control port operations
pub type ControlResult<T> = Result<T, AnonymityError>;

const MAX_REPLY_LINES: usize = 64;

/// An authenticated control port connection
#[derive(Debug)]
pub struct ControlConnection {
    stream: BufReader<TcpStream>,
    addr: SocketAddr,
    timeout: Duration,
}

impl ControlConnection {
    /// Connect and authenticate. Without a password an empty `AUTHENTICATE`
    /// is sent, which succeeds when the service has no control auth.
    pub async fn connect(
        addr: SocketAddr,
        password: Option<&str>,
        timeout: Duration,
    ) -> ControlResult<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| AnonymityError::ControlPort(format!("connection to {} timed out", addr)))?
            .map_err(|e| AnonymityError::ControlPort(format!("connect to {}: {}", addr, e)))?;

        let mut connection = Self {
            stream: BufReader::new(stream),
            addr,
            timeout,
        };

        let command = match password {
            Some(password) => format!("AUTHENTICATE \"{}\"", quote(password)),
            None => "AUTHENTICATE".to_string(),
        };
        connection.command(&command).await?;
        tracing::debug!("control port {} authenticated", addr);

        Ok(connection)
    }

    /// Address this connection talks to
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send one command and return the final reply line on `250`
    pub async fn command(&mut self, command: &str) -> ControlResult<String> {
        let timeout = self.timeout;
        let io = async {
            self.stream
                .get_mut()
                .write_all(format!("{}\r\n", command).as_bytes())
                .await?;
            self.read_reply().await
        };

        let reply = tokio::time::timeout(timeout, io)
            .await
            .map_err(|_| AnonymityError::ControlPort("control port reply timed out".to_string()))?
            .map_err(|e| AnonymityError::ControlPort(e.to_string()))?;

        if reply.starts_with("250") {
            Ok(reply)
        } else {
            let verb = command.split_whitespace().next().unwrap_or(command);
            Err(AnonymityError::ControlPort(format!("{} rejected: {}", verb, reply)))
        }
    }

    /// Ask the service to switch to clean circuits for new connections
    pub async fn new_circuit(&mut self) -> ControlResult<()> {
        self.command("SIGNAL NEWNYM").await.map(|_| ())
    }

    /// Say goodbye and drop the connection. Errors are only logged.
    pub async fn close(mut self) {
        if let Err(e) = self.command("QUIT").await {
            tracing::debug!("control port {} close: {}", self.addr, e);
        }
    }

    async fn read_reply(&mut self) -> std::io::Result<String> {
        for _ in 0..MAX_REPLY_LINES {
            let mut line = String::new();
            if self.stream.read_line(&mut line).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "control port closed the connection",
                ));
            }
            let line = line.trim_end();
            // Final line of a reply has a space after the status code.
            if line.len() >= 4 && line.as_bytes()[3] == b' ' {
                return Ok(line.to_string());
            }
            if line.len() == 3 {
                return Ok(line.to_string());
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "control port reply too long",
        ))
    }
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
