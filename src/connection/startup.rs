//! Connection startup phase.
//!
//! <https://www.postgresql.org/docs/17/protocol-flow.html#PROTOCOL-FLOW-START-UP>
use crate::{
    Result,
    error::AuthError,
    postgres::{
        BackendMessage, ProtocolError,
        backend::{self, Authentication, BackendKeyData},
        frontend,
        sasl::{SCRAM_SHA_256, SaslClient},
    },
    stream::PgStream,
    transport::{PgTransport, PgTransportExt},
};

use super::config::Config;

pub(crate) struct StartupOutcome {
    pub key_data: BackendKeyData,
}

/// Perform the startup message exchange and authentication.
///
/// `ParameterStatus` and `NoticeResponse` frames are absorbed by the
/// stream; what remains here is the authentication negotiation, the cancel
/// key, and the final `ReadyForQuery`.
pub(crate) async fn startup(stream: &mut PgStream, config: &Config) -> Result<StartupOutcome> {
    // To begin a session, a frontend opens a connection to the server
    // and sends a startup message.

    let mut settings: Vec<(&str, &str)> = vec![("client_encoding", "UTF8")];
    for (name, value) in &config.settings {
        if name.as_str() == "client_encoding" {
            settings.clear();
        }
        settings.push((name.as_str(), value.as_str()));
    }

    stream.send_startup(frontend::Startup {
        user: &config.user,
        database: (!config.dbname.is_empty()).then_some(config.dbname.as_str()),
        settings: &settings,
    });
    stream.flush().await?;

    // The server then sends an appropriate authentication request message,
    // to which the frontend must reply with an appropriate authentication
    // response message. For GSSAPI, SSPI and SASL, multiple exchanges of
    // packets may be needed.

    let mut sasl: Option<SaslClient> = None;

    loop {
        use Authentication::*;
        match stream.recv().await? {
            Ok => break,
            CleartextPassword => {
                stream.send(frontend::PasswordMessage { password: &config.pass });
                stream.flush().await?;
            }
            MD5Password { salt } => {
                let response = md5_response(&config.user, &config.pass, salt);
                stream.send(frontend::PasswordMessage { password: &response });
                stream.flush().await?;
            }
            SASL { mechanisms } => {
                if !mechanisms.iter().any(|m| m.as_str() == SCRAM_SHA_256) {
                    let offered = mechanisms
                        .iter()
                        .map(|m| m.as_str())
                        .collect::<Vec<_>>()
                        .join(", ");
                    return Err(AuthError::Unsupported { mechanism: offered.into() }.into());
                }
                if config.pass.is_empty() {
                    return Err(AuthError::MissingPassword.into());
                }
                let client = sasl.insert(SaslClient::new(&config.user, &config.pass));
                let first = client.first().map_err(AuthError::from)?;
                stream.send(frontend::SaslInitialResponse {
                    mechanism: SCRAM_SHA_256,
                    data: first.as_bytes(),
                });
                stream.flush().await?;
            }
            SASLContinue { data } => {
                let Some(client) = sasl.as_mut() else {
                    return Err(ProtocolError::unexpected_phase(b'R', "sasl continue").into());
                };
                let data = std::str::from_utf8(&data).map_err(ProtocolError::non_utf8)?;
                client.server_first(data).map_err(AuthError::from)?;
                let last = client.last().map_err(AuthError::from)?;
                stream.send(frontend::SaslResponse { data: last.as_bytes() });
                stream.flush().await?;
            }
            SASLFinal { data } => {
                let Some(client) = sasl.as_mut() else {
                    return Err(ProtocolError::unexpected_phase(b'R', "sasl final").into());
                };
                let data = std::str::from_utf8(&data).map_err(ProtocolError::non_utf8)?;
                client.server_last(data).map_err(AuthError::from)?;
            }
            KerberosV5 => {
                return Err(AuthError::Unsupported { mechanism: "KerberosV5".into() }.into());
            }
            GSS => return Err(AuthError::Unsupported { mechanism: "GSS".into() }.into()),
            SSPI => return Err(AuthError::Unsupported { mechanism: "SSPI".into() }.into()),
        }
    }

    // After having received AuthenticationOk, the frontend must wait for
    // further messages from the server: ParameterStatus, BackendKeyData,
    // and finally ReadyForQuery.

    let mut key_data = None;

    loop {
        use BackendMessage::*;
        match stream.recv().await? {
            ReadyForQuery(_) => break,
            BackendKeyData(new_key_data) => key_data = Some(new_key_data),
            f => return Err(f.unexpected("startup phase").into()),
        }
    }

    // The codec layer reads `integer_datetimes` once here and keeps that
    // representation for the whole session. Servers past 9.2 always use
    // the integer representation; the floating one is refused.
    if stream
        .parameter("integer_datetimes")
        .is_some_and(|v| v.as_str() != "on")
    {
        return Err(ProtocolError::Unsupported {
            what: "floating point datetimes (server predates integer_datetimes=on)",
        }
        .into());
    }

    let key_data = key_data.ok_or(ProtocolError::Unsupported {
        what: "server did not send BackendKeyData",
    })?;

    tracing::debug!(
        pid = key_data.process_id,
        version = stream.parameter("server_version").map(|v| v.as_str()),
        "connection established",
    );

    Ok(StartupOutcome { key_data })
}

fn md5_response(user: &str, password: &str, salt: [u8; 4]) -> String {
    // md5(md5(password + user) + salt), hex encoded with an "md5" prefix
    let inner = format!("{:x}", md5::compute([password.as_bytes(), user.as_bytes()].concat()));
    let outer = md5::compute([inner.as_bytes(), &salt[..]].concat());
    format!("md5{outer:x}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn md5_response_shape() {
        let response = md5_response("alice", "secret", *b"salt");
        assert!(response.starts_with("md5"));
        assert_eq!(response.len(), 3 + 32);
        // deterministic
        assert_eq!(response, md5_response("alice", "secret", *b"salt"));
        assert_ne!(response, md5_response("alice", "other", *b"salt"));
    }
}
