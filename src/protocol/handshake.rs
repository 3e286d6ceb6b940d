//! Key-exchange messages.
//!
//! The exchange is one round trip and is carried in plaintext frames that
//! bypass the encrypted substitution:
//!
//! ```text
//! client -> server   [dh_pub] [sign_pub]
//! server -> client   [dh_pub] [sign_pub] [wrapped content key]
//! ```
//!
//! Each side moves from [`KeyExchange::Awaiting`] to
//! [`KeyExchange::Established`] exactly once. The connecting side sends the
//! opening message as soon as the socket is up; the listening side answers
//! the first frame it receives and expects nothing else until it has.
//!
//! State lives in the connection's own [`Security`], so concurrent
//! exchanges on different connections never share anything.

use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::protocol::security::Security;
use tracing::{debug, instrument};

/// Where a connection stands in the key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExchange {
    /// No application data may be processed yet.
    Awaiting,
    /// Content key installed; frames are sealed in both directions.
    Established,
}

impl KeyExchange {
    pub fn is_established(self) -> bool {
        self == KeyExchange::Established
    }
}

/// Build the connecting side's opening message.
#[instrument(skip_all)]
pub fn opening_packet(security: &Security) -> Result<Packet> {
    let mut packet = Packet::new();
    packet
        .append(security.public_dh_key())?
        .append(security.public_sign_key())?;
    packet.finalize()?;
    debug!("Client prepared opening key-exchange message");
    Ok(packet)
}

/// Answer an opening message on the listening side.
///
/// On success `security` holds the new content key and the returned packet
/// carries it, wrapped, back to the peer.
#[instrument(skip_all)]
pub fn respond(security: &mut Security, opening: &mut Packet) -> Result<Packet> {
    let peer_dh: Vec<u8> = opening.extract()?;
    let peer_sign: Vec<u8> = opening.extract()?;
    if opening.remaining() != 0 {
        return Err(ProtocolError::UnexpectedMessage);
    }

    let wrapped = security.compute_shared_key(&peer_dh, &peer_sign)?;

    let mut reply = Packet::new();
    reply
        .append(security.public_dh_key())?
        .append(security.public_sign_key())?
        .append(wrapped)?;
    reply.finalize()?;
    debug!("Server answered key exchange");
    Ok(reply)
}

/// Finish the exchange on the connecting side from the server's answer.
#[instrument(skip_all)]
pub fn complete(security: &mut Security, reply: &mut Packet) -> Result<()> {
    let peer_dh: Vec<u8> = reply.extract()?;
    let peer_sign: Vec<u8> = reply.extract()?;
    let wrapped: Vec<u8> = reply.extract()?;
    if reply.remaining() != 0 {
        return Err(ProtocolError::UnexpectedMessage);
    }

    security.agree(&peer_dh, &peer_sign)?;
    security.unwrap_content_key(&wrapped)?;
    debug!("Client completed key exchange");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::utils::crypto::WRAPPED_KEY_SIZE;

    #[test]
    fn test_opening_message_shape() {
        let security = Security::new();
        let mut opening = opening_packet(&security).unwrap();
        assert!(opening.is_finalized());

        let dh: Vec<u8> = opening.extract().unwrap();
        let sign: Vec<u8> = opening.extract().unwrap();
        assert_eq!(dh, security.public_dh_key());
        assert_eq!(sign, security.public_sign_key());
        assert_eq!(opening.remaining(), 0);
    }

    #[test]
    fn test_reply_carries_wrapped_key() {
        let client = Security::new();
        let mut server = Security::new();
        let mut opening = opening_packet(&client).unwrap();
        let mut reply = respond(&mut server, &mut opening).unwrap();

        let _: Vec<u8> = reply.extract().unwrap();
        let _: Vec<u8> = reply.extract().unwrap();
        let wrapped: Vec<u8> = reply.extract().unwrap();
        assert_eq!(wrapped.len(), WRAPPED_KEY_SIZE);
        assert!(server.is_ready());
    }

    #[test]
    fn test_full_exchange_converges() {
        let mut client = Security::new();
        let mut server = Security::new();
        let mut opening = opening_packet(&client).unwrap();
        let mut reply = respond(&mut server, &mut opening).unwrap();
        complete(&mut client, &mut reply).unwrap();

        let sealed = server.encrypt(b"established", b"").unwrap();
        assert_eq!(client.decrypt(&sealed, b"").unwrap(), b"established");
    }

    #[test]
    fn test_extra_field_in_opening_rejected() {
        let client = Security::new();
        let mut server = Security::new();
        let mut opening = Packet::new();
        opening
            .append(client.public_dh_key())
            .unwrap()
            .append(client.public_sign_key())
            .unwrap()
            .append("unexpected")
            .unwrap();
        opening.finalize().unwrap();

        assert!(matches!(
            respond(&mut server, &mut opening),
            Err(ProtocolError::UnexpectedMessage)
        ));
        assert!(!server.is_ready());
    }

    #[test]
    fn test_truncated_reply_rejected() {
        let mut client = Security::new();
        let server = Security::new();
        let mut reply = Packet::new();
        reply
            .append(server.public_dh_key())
            .unwrap()
            .append(server.public_sign_key())
            .unwrap();
        reply.finalize().unwrap();

        assert!(matches!(
            complete(&mut client, &mut reply),
            Err(ProtocolError::ExtractPastEnd { .. })
        ));
    }

    #[test]
    fn test_reply_from_other_session_rejected() {
        let mut client = Security::new();
        let impostor_client = Security::new();
        let mut server = Security::new();

        // Server answered someone else's opening.
        let mut opening = opening_packet(&impostor_client).unwrap();
        let mut reply = respond(&mut server, &mut opening).unwrap();

        assert!(matches!(
            complete(&mut client, &mut reply),
            Err(ProtocolError::KeyUnwrap)
        ));
    }
}
