//! Session establishment: sockets, TLS negotiation, authentication,
//! parameter ingestion, host fallback.
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use bytes::BytesMut;

use crate::{
    config::{Config, HostConfig, TargetSessionAttrs, TlsConfig, SslMode},
    connection::Connection,
    error::{ConnectError, Error, Result},
    message::{frontend, Authentication, BackendMessage},
    net::{RemoteAddr, Stream},
    scram::ScramClient,
};

/// Authentication requests before giving up on the exchange settling.
const AUTH_LOOP_LIMIT: usize = 5;

/// Messages accepted between authentication and `ReadyForQuery`.
const STARTUP_MESSAGE_LIMIT: usize = 1000;

impl Connection {
    /// Connect using a keyword/value string or URI.
    pub async fn connect(url: &str) -> Result<Connection> {
        let config = Config::parse(url)?;
        Self::connect_config(&config).await
    }

    /// Connect using `PG*` environment variables.
    pub async fn connect_env() -> Result<Connection> {
        let config = Config::from_env()?;
        Self::connect_config(&config).await
    }

    /// Connect using an explicit configuration.
    ///
    /// Hosts are tried in order; the first to produce a working session
    /// wins. A credential rejection aborts the fallback, every other
    /// failure advances to the next candidate.
    pub async fn connect_config(config: &Config) -> Result<Connection> {
        config.check().map_err(Error::Config)?;

        let mut last_err = None;
        for host in &config.hosts {
            match connect_host(host, config).await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    tracing::debug!("connect to {}:{} failed: {err}", host.host, host.port);
                    if err.is_auth_rejection() {
                        return Err(Error::Connect(err));
                    }
                    last_err = Some(err);
                }
            }
        }
        Err(Error::Connect(last_err.expect("hosts checked non-empty")))
    }
}

async fn connect_host(host: &HostConfig, config: &Config) -> Result<Connection, ConnectError> {
    let remote = RemoteAddr::new(&host.host, host.port);
    let stream = Stream::connect(&remote, config.connect_timeout)
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::TimedOut => ConnectError::Timeout,
            _ => ConnectError::Io(err),
        })?;

    // without an upgrade function TLS cannot complete, so the request is
    // only worth sending when plaintext would be refused anyway
    let stream = match &host.tls {
        Some(tls)
            if tls.mode != SslMode::Disable
                && (tls.upgrade.is_some() || !tls.mode.allows_plaintext()) =>
        {
            negotiate_tls(stream, host, tls).await?
        }
        _ => stream,
    };

    let mut conn = Connection::new(stream, remote, config);
    if let Err(err) = startup(&mut conn, host, config).await {
        conn.close().await;
        return Err(err);
    }

    if let Some(hook) = config.hooks.after_connect.clone() {
        if let Err(err) = hook(&mut conn).await {
            conn.close().await;
            return Err(ConnectError::Hook(Box::new(err)));
        }
    }

    if config.target_session_attrs != TargetSessionAttrs::Any {
        if let Err(err) = check_session_attrs(&mut conn, config.target_session_attrs).await {
            conn.close().await;
            return Err(err);
        }
    }

    if let Some(hook) = config.hooks.validate_connect.clone() {
        if let Err(err) = hook(&mut conn).await {
            conn.close().await;
            return Err(ConnectError::Hook(Box::new(err)));
        }
    }

    tracing::debug!(
        "connected to {}:{} as {} (pid {})",
        host.host,
        host.port,
        config.user,
        conn.process_id(),
    );
    Ok(conn)
}

/// Send `SSLRequest` and act on the single-byte sentinel reply.
async fn negotiate_tls(
    mut stream: Stream,
    host: &HostConfig,
    tls: &TlsConfig,
) -> Result<Stream, ConnectError> {
    let mut buf = BytesMut::with_capacity(8);
    frontend::SslRequest.write(&mut buf);
    stream.write_all(&buf).await?;

    let mut reply = [0u8; 1];
    stream.read_exact(&mut reply).await?;
    match reply[0] {
        b'S' => {
            let upgrade = tls.upgrade.as_ref().ok_or(ConnectError::TlsMissingUpgrade)?;
            let upgraded = upgrade(stream, host.host.clone()).await?;
            Ok(Stream::Boxed(upgraded))
        }
        b'N' if tls.mode.allows_plaintext() => Ok(stream),
        b'N' => Err(ConnectError::TlsRefused),
        other => Err(ConnectError::UnexpectedTlsReply(other)),
    }
}

/// Drive the startup message, the authentication exchange and the initial
/// parameter ingestion up to `ReadyForQuery`.
async fn startup(
    conn: &mut Connection,
    host: &HostConfig,
    config: &Config,
) -> Result<(), ConnectError> {
    frontend::Startup {
        user: &config.user,
        database: config.database.as_deref(),
        params: &config.runtime_params,
    }
    .write(&mut conn.write_buf);
    conn.flush().await?;

    authenticate(conn, host, config).await?;

    for _ in 0..STARTUP_MESSAGE_LIMIT {
        match conn.receive_message(None).await? {
            BackendMessage::BackendKeyData { process_id, secret_key } => {
                conn.set_backend_key(process_id, secret_key);
            }
            // recorded by the receive primitive
            BackendMessage::ParameterStatus { .. } => {}
            BackendMessage::NoticeResponse(_) => {}
            BackendMessage::ReadyForQuery(_) => return Ok(()),
            other => {
                return Err(ConnectError::UnexpectedMessage {
                    message: other.name(),
                    phase: "startup",
                })
            }
        }
    }
    Err(ConnectError::Unsettled("startup"))
}

async fn authenticate(
    conn: &mut Connection,
    host: &HostConfig,
    config: &Config,
) -> Result<(), ConnectError> {
    for _ in 0..AUTH_LOOP_LIMIT {
        let auth = match conn.receive_message(None).await? {
            BackendMessage::Authentication(auth) => auth,
            other => {
                return Err(ConnectError::UnexpectedMessage {
                    message: other.name(),
                    phase: "authentication",
                })
            }
        };

        match auth {
            Authentication::Ok => return Ok(()),
            Authentication::CleartextPassword => {
                let password = password(host)?;
                conn.send(&frontend::PasswordMessage { password });
                conn.flush().await?;
            }
            Authentication::Md5Password { salt } => {
                let hashed = md5_password(&config.user, password(host)?, salt);
                conn.send(&frontend::PasswordMessage { password: &hashed });
                conn.flush().await?;
            }
            Authentication::Sasl { mechanisms } => {
                sasl_exchange(conn, host, &mechanisms).await?;
            }
            Authentication::SaslContinue { .. } | Authentication::SaslFinal { .. } => {
                return Err(ConnectError::UnexpectedMessage {
                    message: "Authentication",
                    phase: "authentication",
                })
            }
        }
    }
    Err(ConnectError::Unsettled("authentication"))
}

fn password(host: &HostConfig) -> Result<&str, ConnectError> {
    host.password.as_deref().ok_or(ConnectError::PasswordRequired)
}

/// `"md5" || md5hex(md5hex(password || user) || salt)`.
fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{password}{user}")));
    let mut outer = inner.into_bytes();
    outer.extend_from_slice(&salt);
    format!("md5{:x}", md5::compute(outer))
}

/// Run the SCRAM exchange; the caller's loop still expects the trailing
/// `AuthenticationOk`.
async fn sasl_exchange(
    conn: &mut Connection,
    host: &HostConfig,
    mechanisms: &[String],
) -> Result<(), ConnectError> {
    if !mechanisms.iter().any(|m| m == crate::scram::MECHANISM) {
        return Err(ConnectError::NoSaslMechanism(mechanisms.to_vec()));
    }

    let mut scram = ScramClient::new(password(host)?);

    let first = scram.client_first_message();
    conn.send(&frontend::SaslInitialResponse {
        mechanism: crate::scram::MECHANISM,
        data: first.as_bytes(),
    });
    conn.flush().await?;

    let data = match conn.receive_message(None).await? {
        BackendMessage::Authentication(Authentication::SaslContinue { data }) => data,
        other => {
            return Err(ConnectError::UnexpectedMessage {
                message: other.name(),
                phase: "SASL",
            })
        }
    };
    let final_message = scram.handle_server_first(&data).map_err(ConnectError::Sasl)?;

    conn.send(&frontend::SaslResponse { data: final_message.as_bytes() });
    conn.flush().await?;

    let data = match conn.receive_message(None).await? {
        BackendMessage::Authentication(Authentication::SaslFinal { data }) => data,
        other => {
            return Err(ConnectError::UnexpectedMessage {
                message: other.name(),
                phase: "SASL",
            })
        }
    };
    scram.verify_server_final(&data).map_err(ConnectError::Sasl)
}

/// Post-authentication validation of `target_session_attrs`.
async fn check_session_attrs(
    conn: &mut Connection,
    attrs: TargetSessionAttrs,
) -> Result<(), ConnectError> {
    let satisfied = match attrs {
        TargetSessionAttrs::Any => true,
        TargetSessionAttrs::ReadWrite => {
            show(conn, "hot_standby").await? == "off"
                && show(conn, "transaction_read_only").await? == "off"
        }
        TargetSessionAttrs::ReadOnly => {
            show(conn, "hot_standby").await? == "on"
                || show(conn, "transaction_read_only").await? == "on"
        }
        TargetSessionAttrs::Primary => show(conn, "hot_standby").await? == "off",
        TargetSessionAttrs::Standby => show(conn, "hot_standby").await? == "on",
    };
    match satisfied {
        true => Ok(()),
        false => Err(ConnectError::SessionAttrs(attrs.as_str())),
    }
}

async fn show(conn: &mut Connection, setting: &str) -> Result<String, ConnectError> {
    let sql = format!("show {setting}");
    let mut reader = conn.exec(&sql, None).await?;
    let results = reader.read_all().await?;
    let value = results
        .first()
        .and_then(|result| result.rows.first())
        .and_then(|row| row.first())
        .and_then(|value| value.as_ref());
    match value {
        Some(value) => Ok(String::from_utf8_lossy(value).into_owned()),
        None => Err(ConnectError::UnexpectedMessage {
            message: "EmptyQueryResponse",
            phase: "session validation",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_response_shape() {
        // md5(md5("secretalice") || salt), spelled out with the same
        // primitive to pin the concatenation order
        let hashed = md5_password("alice", "secret", [1, 2, 3, 4]);
        assert!(hashed.starts_with("md5"));
        assert_eq!(hashed.len(), 35);

        let inner = format!("{:x}", md5::compute("secretalice"));
        let mut outer = inner.into_bytes();
        outer.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(hashed, format!("md5{:x}", md5::compute(outer)));
    }
}
