use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::pool::{ActiveLease, BackendProxy, Credentials};
use crate::protocol::{
    read_destination, Destination, ProtocolError, ReplyCode, AUTH_VERSION, METHOD_NONE_ACCEPTABLE,
    METHOD_NO_AUTH, METHOD_USER_PASS, SOCKS_VERSION, UPSTREAM_GREETING,
};

/// Error type for the nested SOCKS5 handshake against a backend
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("backend connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("backend replied with SOCKS version {0:#04x}")]
    BadVersion(u8),

    #[error("backend rejected all offered authentication methods")]
    NoAcceptableMethods,

    #[error("backend selected unsupported method {0:#04x}")]
    UnsupportedMethod(u8),

    #[error("backend requires username/password but none are configured")]
    MissingCredentials,

    #[error("username or password longer than 255 bytes")]
    CredentialsTooLong,

    #[error("backend answered authentication with version {0:#04x}")]
    BadAuthVersion(u8),

    #[error("backend rejected credentials (status {0:#04x})")]
    AuthRejected(u8),

    #[error("backend refused CONNECT: {0}")]
    Rejected(ReplyCode),

    #[error("backend {0} timed out")]
    Timeout(&'static str),

    /// REP was success but BND.ADDR/BND.PORT could not be parsed
    #[error("backend success reply has a malformed bound address: {0}")]
    MalformedBound(#[source] ProtocolError),

    #[error("backend i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Bounds on the two blocking phases of opening a backend leg
#[derive(Debug, Clone, Copy)]
pub struct UpstreamTimeouts {
    pub connect: Duration,
    pub handshake: Duration,
}

impl Default for UpstreamTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            handshake: Duration::from_secs(30),
        }
    }
}

/// An established backend leg, ready to relay.
///
/// The lease keeps the backend's active counter raised until the tunnel ends.
#[derive(Debug)]
pub struct UpstreamConnection {
    pub stream: TcpStream,
    pub lease: ActiveLease,
}

/// Opens nested SOCKS5 connections through pool backends
#[derive(Debug, Clone, Default)]
pub struct UpstreamConnector {
    timeouts: UpstreamTimeouts,
}

impl UpstreamConnector {
    pub fn new(timeouts: UpstreamTimeouts) -> Self {
        Self { timeouts }
    }

    /// Open a tunnel to `destination` through `backend`.
    ///
    /// Success raises the backend's active and total counters; any failure
    /// raises its failed counter and drops the partially opened socket.
    /// No retry happens here.
    pub async fn connect(
        &self,
        backend: &Arc<BackendProxy>,
        destination: &Destination,
    ) -> UpstreamResult<UpstreamConnection> {
        match self.open(backend, destination).await {
            Ok(stream) => Ok(UpstreamConnection {
                stream,
                lease: backend.open_lease(),
            }),
            Err(e) => {
                backend.record_failure();
                Err(e)
            }
        }
    }

    async fn open(
        &self,
        backend: &BackendProxy,
        destination: &Destination,
    ) -> UpstreamResult<TcpStream> {
        let mut stream = timeout(
            self.timeouts.connect,
            TcpStream::connect((backend.host(), backend.port())),
        )
        .await
        .map_err(|_| UpstreamError::Timeout("connect"))?
        .map_err(UpstreamError::Connect)?;
        let _ = stream.set_nodelay(true);

        debug!(
            "Connected to backend {} ({}:{}), negotiating CONNECT {}",
            backend.id(),
            backend.host(),
            backend.port(),
            destination
        );

        timeout(
            self.timeouts.handshake,
            handshake(&mut stream, backend.credentials(), destination),
        )
        .await
        .map_err(|_| UpstreamError::Timeout("handshake"))??;

        Ok(stream)
    }
}

/// Client side of the SOCKS5 handshake: greeting, optional
/// username/password subnegotiation, then CONNECT.
pub async fn handshake<S>(
    stream: &mut S,
    credentials: Option<&Credentials>,
    destination: &Destination,
) -> UpstreamResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&UPSTREAM_GREETING).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(UpstreamError::BadVersion(choice[0]));
    }
    match choice[1] {
        METHOD_NO_AUTH => {}
        METHOD_USER_PASS => {
            let credentials = credentials.ok_or(UpstreamError::MissingCredentials)?;
            authenticate(stream, credentials).await?;
        }
        METHOD_NONE_ACCEPTABLE => return Err(UpstreamError::NoAcceptableMethods),
        other => return Err(UpstreamError::UnsupportedMethod(other)),
    }

    let request = Destination::new(destination.host.upstream_form(), destination.port);
    stream.write_all(&request.connect_request()).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(UpstreamError::BadVersion(header[0]));
    }
    match ReplyCode::from(header[1]) {
        ReplyCode::Succeeded => {}
        code => return Err(UpstreamError::Rejected(code)),
    }
    // Drain BND.ADDR/BND.PORT so relayed bytes start clean. A bound address
    // we cannot parse fails the attempt even though REP was success.
    read_destination(stream, header[3])
        .await
        .map_err(UpstreamError::MalformedBound)?;

    Ok(())
}

async fn authenticate<S>(stream: &mut S, credentials: &Credentials) -> UpstreamResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = credentials.username.as_bytes();
    let pass = credentials.password.as_bytes();
    if user.len() > 255 || pass.len() > 255 {
        return Err(UpstreamError::CredentialsTooLong);
    }

    let mut frame = Vec::with_capacity(3 + user.len() + pass.len());
    frame.push(AUTH_VERSION);
    frame.push(user.len() as u8);
    frame.extend_from_slice(user);
    frame.push(pass.len() as u8);
    frame.extend_from_slice(pass);
    stream.write_all(&frame).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != AUTH_VERSION {
        return Err(UpstreamError::BadAuthVersion(reply[0]));
    }
    if reply[1] != 0x00 {
        return Err(UpstreamError::AuthRejected(reply[1]));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TargetHost;
    use std::net::Ipv4Addr;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    fn example_dest() -> Destination {
        Destination::new(TargetHost::Domain("example.com".to_string()), 443)
    }

    #[tokio::test]
    async fn no_auth_handshake_sends_connect_and_drains_reply() {
        let (mut client, mut server) = duplex(1024);

        let backend = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x02, 0x00, 0x02]);
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = vec![0u8; 4 + 1 + 11 + 2];
            server.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[..5], &[0x05, 0x01, 0x00, 0x03, 11]);
            assert_eq!(&request[5..16], b"example.com");
            assert_eq!(&request[16..], &[0x01, 0xBB]);

            // Reply with a real bound address, then payload
            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 10, 0, 0, 1, 0x1F, 0x90])
                .await
                .unwrap();
            server.write_all(b"payload").await.unwrap();
        });

        handshake(&mut client, None, &example_dest()).await.unwrap();
        let mut payload = [0u8; 7];
        client.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"payload");
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn password_subnegotiation() {
        let (mut client, mut server) = duplex(1024);

        let backend = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x02]).await.unwrap();

            let mut auth = [0u8; 1 + 1 + 4 + 1 + 6];
            server.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth, b"\x01\x04user\x06secret");
            server.write_all(&[0x01, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            assert_eq!(&request, &[0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50]);
            server.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let creds = Credentials::new("user".into(), "secret".into());
        // IPv4 literal given as a domain travels as ATYP 0x01
        let dest = Destination::new(TargetHost::Domain("1.2.3.4".into()), 80);
        handshake(&mut client, Some(&creds), &dest).await.unwrap();
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn auth_failure_and_method_rejection() {
        let (mut client, mut server) = duplex(1024);
        tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x02]).await.unwrap();
            let mut auth = [0u8; 6];
            server.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth, b"\x01\x01u\x02pw");
            server.write_all(&[0x01, 0x01]).await.unwrap();
        });
        let creds = Credentials::new("u".into(), "pw".into());
        let err = handshake(&mut client, Some(&creds), &example_dest()).await.unwrap_err();
        assert!(matches!(err, UpstreamError::AuthRejected(0x01)));

        let (mut client, mut server) = duplex(1024);
        tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0xFF]).await.unwrap();
        });
        let err = handshake(&mut client, None, &example_dest()).await.unwrap_err();
        assert!(matches!(err, UpstreamError::NoAcceptableMethods));

        let (mut client, mut server) = duplex(1024);
        tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x02]).await.unwrap();
        });
        let err = handshake(&mut client, None, &example_dest()).await.unwrap_err();
        assert!(matches!(err, UpstreamError::MissingCredentials));
    }

    #[tokio::test]
    async fn nonzero_reply_code_fails() {
        let (mut client, mut server) = duplex(1024);
        tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();
            let mut request = [0u8; 18];
            server.read_exact(&mut request).await.unwrap();
            server.write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });
        let err = handshake(&mut client, None, &example_dest()).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Rejected(ReplyCode::ConnectionRefused)));
    }

    #[tokio::test]
    async fn auth_reply_with_socks_version_fails() {
        let (mut client, mut server) = duplex(1024);
        tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x02]).await.unwrap();
            let mut auth = [0u8; 6];
            server.read_exact(&mut auth).await.unwrap();
            // Status byte says success, version byte is wrong
            server.write_all(&[0x05, 0x00]).await.unwrap();
        });
        let creds = Credentials::new("u".into(), "pw".into());
        let err = handshake(&mut client, Some(&creds), &example_dest()).await.unwrap_err();
        assert!(matches!(err, UpstreamError::BadAuthVersion(0x05)));
    }

    #[tokio::test]
    async fn success_reply_with_unknown_bound_type_fails() {
        let (mut client, mut server) = duplex(1024);
        tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();
            let mut request = [0u8; 18];
            server.read_exact(&mut request).await.unwrap();
            server.write_all(&[0x05, 0x00, 0x00, 0x09, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });
        let err = handshake(&mut client, None, &example_dest()).await.unwrap_err();
        assert!(matches!(
            err,
            UpstreamError::MalformedBound(ProtocolError::UnsupportedAddressType(0x09))
        ));
    }

    #[tokio::test]
    async fn connector_updates_counters() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // First connection succeeds, second is refused
            for reply in [0x00u8, 0x02] {
                let (mut s, _) = listener.accept().await.unwrap();
                let mut greeting = [0u8; 4];
                s.read_exact(&mut greeting).await.unwrap();
                s.write_all(&[0x05, 0x00]).await.unwrap();
                let mut request = [0u8; 10];
                s.read_exact(&mut request).await.unwrap();
                s.write_all(&[0x05, reply, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await.unwrap();
                tokio::spawn(async move {
                    let mut sink = Vec::new();
                    let _ = s.read_to_end(&mut sink).await;
                });
            }
        });

        let backend = Arc::new(BackendProxy::new("a", "127.0.0.1", port, None, true, 0));
        let connector = UpstreamConnector::default();
        let dest = Destination::new(TargetHost::Ipv4(Ipv4Addr::new(93, 184, 216, 34)), 80);

        let conn = connector.connect(&backend, &dest).await.unwrap();
        assert_eq!(backend.active_connections(), 1);
        assert_eq!(backend.total_connections(), 1);
        assert_eq!(backend.failed_connections(), 0);

        let err = connector.connect(&backend, &dest).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Rejected(ReplyCode::NotAllowed)));
        assert_eq!(backend.active_connections(), 1);
        assert_eq!(backend.failed_connections(), 1);

        drop(conn);
        assert_eq!(backend.active_connections(), 0);
    }

    #[tokio::test]
    async fn unreachable_backend_counts_failure() {
        // Bind then drop to get a port with nothing listening
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let backend = Arc::new(BackendProxy::new("gone", "127.0.0.1", port, None, true, 0));
        let connector = UpstreamConnector::new(UpstreamTimeouts {
            connect: Duration::from_secs(2),
            handshake: Duration::from_secs(2),
        });

        let err = connector.connect(&backend, &example_dest()).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Connect(_) | UpstreamError::Timeout(_)));
        assert_eq!(backend.failed_connections(), 1);
        assert_eq!(backend.active_connections(), 0);
    }

    #[tokio::test]
    async fn silent_backend_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (s, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(s);
        });

        let backend = Arc::new(BackendProxy::new("slow", "127.0.0.1", port, None, true, 0));
        let connector = UpstreamConnector::new(UpstreamTimeouts {
            connect: Duration::from_secs(2),
            handshake: Duration::from_millis(200),
        });
        let err = connector.connect(&backend, &example_dest()).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Timeout("handshake")));
        assert_eq!(backend.failed_connections(), 1);
    }
}
