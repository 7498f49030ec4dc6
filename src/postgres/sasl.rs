//! SCRAM-SHA-256 client flow.
use scram::{
    ScramClient,
    client::{ClientFinal, ServerFinal, ServerFirst},
};

/// The only SASL mechanism the runtime speaks.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

enum State<'a> {
    Initial(ScramClient<'a>),
    First(ServerFirst<'a>),
    Final(ClientFinal),
    ServerFinal(ServerFinal),
}

/// SASL SCRAM client.
///
/// Drives the four message exchange: client-first, server-first,
/// client-final, server-final.
pub struct SaslClient<'a> {
    state: Option<State<'a>>,
}

/// SCRAM exchange failure.
#[derive(Debug, thiserror::Error)]
pub enum SaslError {
    #[error("scram messages arrived out of order")]
    OutOfOrder,
    #[error("scram exchange failed: {0}")]
    Scram(#[from] scram::Error),
}

impl<'a> SaslClient<'a> {
    /// Create new SCRAM client.
    pub fn new(user: &'a str, password: &'a str) -> Self {
        Self {
            state: Some(State::Initial(ScramClient::new(user, password, None))),
        }
    }

    /// Client first message.
    pub fn first(&mut self) -> Result<String, SaslError> {
        let (scram, client_first) = match self.state.take() {
            Some(State::Initial(scram)) => scram.client_first(),
            _ => return Err(SaslError::OutOfOrder),
        };
        self.state = Some(State::First(scram));
        Ok(client_first)
    }

    /// Handle server first message.
    pub fn server_first(&mut self, message: &str) -> Result<(), SaslError> {
        let scram = match self.state.take() {
            Some(State::First(scram)) => scram.handle_server_first(message)?,
            _ => return Err(SaslError::OutOfOrder),
        };
        self.state = Some(State::Final(scram));
        Ok(())
    }

    /// Client last message.
    pub fn last(&mut self) -> Result<String, SaslError> {
        let (scram, client_final) = match self.state.take() {
            Some(State::Final(scram)) => scram.client_final(),
            _ => return Err(SaslError::OutOfOrder),
        };
        self.state = Some(State::ServerFinal(scram));
        Ok(client_final)
    }

    /// Verify server last message.
    pub fn server_last(&mut self, message: &str) -> Result<(), SaslError> {
        match self.state.take() {
            Some(State::ServerFinal(scram)) => scram.handle_server_final(message)?,
            _ => return Err(SaslError::OutOfOrder),
        };
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn out_of_order_is_rejected() {
        let mut client = SaslClient::new("user", "secret");
        assert!(matches!(client.last(), Err(SaslError::OutOfOrder)));
        assert!(client.first().is_ok());
        assert!(matches!(client.first(), Err(SaslError::OutOfOrder)));
    }
}
