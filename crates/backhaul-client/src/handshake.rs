//! Client half of the handshake

use crate::error::TunnelError;
use backhaul_connection::{ControlChannel, PayloadCodec};
use backhaul_crypto::{gzip, KeyPair};
use backhaul_proto::{Command, HandshakeFlags, ProtoMessage, ResponseStatus, TunnelRequest};
use tracing::debug;

/// What the server granted
#[derive(Debug, Clone)]
pub(crate) struct Granted {
    pub tunnel_id: i64,
    /// The request as registered, with server-assigned fields
    pub request: TunnelRequest,
    pub payload: PayloadCodec,
}

/// Negotiated per-connection parameters
#[derive(Debug, Clone, Copy)]
pub(crate) struct HandshakeParams {
    pub encrypt: bool,
    pub compress: bool,
    pub rsa_bits: usize,
    pub max_frame_size: usize,
}

/// HANDSHAKE, key exchange, then REQUEST
///
/// `on_sent` runs once the HANDSHAKE frame is queued.
pub(crate) async fn handshake(
    channel: &mut ControlChannel,
    request: &TunnelRequest,
    params: HandshakeParams,
    on_sent: impl FnOnce(),
) -> Result<Granted, TunnelError> {
    let mut flags = HandshakeFlags::new();
    if params.compress {
        flags = flags.with_compress_payload();
    }

    let (body, keypair) = if params.encrypt {
        let bits = params.rsa_bits;
        let keypair = tokio::task::spawn_blocking(move || KeyPair::generate_with_bits(bits))
            .await
            .map_err(|e| TunnelError::Crypto(format!("Key generation aborted: {}", e)))??;
        flags = flags.with_encrypt().with_key_compressed();
        (gzip(&keypair.public_key_der()?)?, Some(keypair))
    } else {
        (Vec::new(), None)
    };

    channel.send(ProtoMessage::handshake(flags, body)).await?;
    on_sent();

    let reply = expect_response(channel).await?;
    let key = match &keypair {
        Some(keypair) => Some(keypair.unwrap_aes_key(&reply.body)?),
        None => None,
    };
    debug!("Handshake accepted (encrypted: {})", key.is_some());

    let json = request
        .to_json()
        .map_err(|e| TunnelError::Protocol(format!("Cannot encode tunnel request: {}", e)))?;
    channel.send(ProtoMessage::request(json)).await?;

    let reply = expect_response(channel).await?;
    let granted = TunnelRequest::from_json(&reply.body)
        .map_err(|e| TunnelError::Protocol(format!("Malformed tunnel response: {}", e)))?;

    Ok(Granted {
        tunnel_id: reply.tunnel_id,
        request: granted,
        payload: PayloadCodec::new(key, params.compress).with_max_payload(params.max_frame_size),
    })
}

async fn expect_response(channel: &mut ControlChannel) -> Result<ProtoMessage, TunnelError> {
    let msg = channel.recv().await?.ok_or(TunnelError::Closed)?;
    if msg.command != Command::Response {
        return Err(TunnelError::Protocol(format!(
            "Expected RESPONSE, got {}",
            msg.command
        )));
    }
    match msg.status() {
        ResponseStatus::Ok => Ok(msg),
        ResponseStatus::Rejected => Err(TunnelError::Rejected(
            String::from_utf8_lossy(&msg.body).into_owned(),
        )),
    }
}
