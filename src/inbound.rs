//! Server side of the SOCKS5 handshake on an accepted client connection.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{
    read_destination, Destination, ProtocolError, CMD_CONNECT, FAILURE_REPLY, GREETING_REPLY,
    SOCKS_VERSION, SUCCESS_REPLY,
};

/// Lifecycle of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Greeting,
    Connect,
    Tunnel,
    Closed,
}

/// Drives one client connection through greeting and CONNECT.
///
/// Protocol violations leave the connection to be dropped without a reply;
/// only the greeting reply and the final success/failure reply are written.
#[derive(Debug)]
pub struct ClientHandshake<S> {
    stream: S,
    phase: Phase,
}

impl<S> ClientHandshake<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            phase: Phase::Greeting,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Read `VER NMETHODS METHODS` and answer NO-AUTH.
    pub async fn greet(&mut self) -> Result<(), ProtocolError> {
        debug_assert_eq!(self.phase, Phase::Greeting);
        let version = self.stream.read_u8().await?;
        if version != SOCKS_VERSION {
            self.phase = Phase::Closed;
            return Err(ProtocolError::BadVersion(version));
        }
        let nmethods = self.stream.read_u8().await? as usize;
        let mut methods = [0u8; 255];
        self.stream.read_exact(&mut methods[..nmethods]).await?;

        self.stream.write_all(&GREETING_REPLY).await?;
        self.phase = Phase::Connect;
        Ok(())
    }

    /// Read `VER CMD RSV ATYP DST.ADDR DST.PORT`. Only CONNECT is accepted.
    pub async fn read_request(&mut self) -> Result<Destination, ProtocolError> {
        debug_assert_eq!(self.phase, Phase::Connect);
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await?;
        let [version, command, _reserved, atyp] = header;

        let result = if version != SOCKS_VERSION {
            Err(ProtocolError::BadVersion(version))
        } else if command != CMD_CONNECT {
            Err(ProtocolError::UnsupportedCommand(command))
        } else {
            read_destination(&mut self.stream, atyp).await
        };
        if result.is_err() {
            self.phase = Phase::Closed;
        }
        result
    }

    /// Send the fixed success reply and hand back the stream for relaying.
    pub async fn accept(mut self) -> std::io::Result<S> {
        debug_assert_eq!(self.phase, Phase::Connect);
        self.stream.write_all(&SUCCESS_REPLY).await?;
        self.stream.flush().await?;
        self.phase = Phase::Tunnel;
        Ok(self.stream)
    }

    /// Send the general-failure reply and close.
    pub async fn reject(mut self) {
        let _ = self.stream.write_all(&FAILURE_REPLY).await;
        let _ = self.stream.shutdown().await;
        self.phase = Phase::Closed;
    }
}
