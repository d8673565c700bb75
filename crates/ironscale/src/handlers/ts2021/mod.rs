//! the /ts2021 control-channel upgrade.
//!
//! native clients request a protocol switch with
//! `Upgrade: tailscale-control-protocol` and a base64 noise initiation in
//! `X-Tailscale-Handshake`. after the 101 response the raw connection
//! carries the noise handshake reply, an optional early payload, and
//! then http/2 over the encrypted transport.
//!
//! ## frame size limits
//!
//! frames on the wire are capped at 4096 bytes: a 3-byte header plus
//! ciphertext (up to 4077 bytes of plaintext and the 16-byte aead tag).
//! larger writes are chunked.

mod http_noise_stream;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::Engine;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};
use zeroize::Zeroizing;

use ironscale_proto::{
    CapabilityVersion, EARLY_PAYLOAD_MAGIC, EarlyNoise, MSG_TYPE_INITIATION, MSG_TYPE_RECORD,
    MSG_TYPE_RESPONSE, NoiseHandshake, version_label,
};

use http_noise_stream::HttpNoiseStream;

use super::MachineKeyContext;
use crate::AppState;

/// handle a ts2021 protocol switch.
pub async fn ts2021_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::http::Request<Body>,
) -> Response {
    let Some(private_key) = state.noise_private_key.clone() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Noise listener not configured",
        )
            .into_response();
    };

    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !upgrade.eq_ignore_ascii_case("tailscale-control-protocol") {
        return (
            StatusCode::BAD_REQUEST,
            "missing or invalid Upgrade header, expected tailscale-control-protocol",
        )
            .into_response();
    }

    let Some(handshake_b64) = headers
        .get("X-Tailscale-Handshake")
        .and_then(|v| v.to_str().ok())
    else {
        return (StatusCode::BAD_REQUEST, "missing X-Tailscale-Handshake header").into_response();
    };

    // peek at the protocol version before upgrading so unsupported
    // clients get a readable 400 instead of a failed handshake
    let init = match parse_initiation(handshake_b64) {
        Ok(init) => init,
        Err(msg) => return (StatusCode::BAD_REQUEST, msg).into_response(),
    };
    if u32::from(init.version) < state.config.min_capability_version {
        let label = version_label(CapabilityVersion(init.version.into()));
        return (
            StatusCode::BAD_REQUEST,
            format!("unsupported client version: {label} ({})", init.version),
        )
            .into_response();
    }

    info!(version = init.version, "ts2021 upgrade accepted");

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(request).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                error!(error = %e, "ts2021 upgrade failed");
                return;
            }
        };

        if let Err(e) = serve_noise_connection(upgraded, init, private_key, state).await {
            debug!(error = %e, "ts2021 connection ended with error");
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "tailscale-control-protocol")
        .header(header::CONNECTION, "upgrade")
        .body(Body::empty())
        .expect("valid status and headers")
}

/// a decoded handshake initiation.
struct Initiation {
    version: u16,
    payload: Vec<u8>,
}

/// decode `[version:2][type:1][len:2][payload]` from the header value.
fn parse_initiation(handshake_b64: &str) -> Result<Initiation, String> {
    let message = base64::engine::general_purpose::STANDARD
        .decode(handshake_b64)
        .map_err(|e| format!("invalid handshake encoding: {e}"))?;

    if message.len() < 5 {
        return Err("handshake initiation too short".to_string());
    }

    let version = u16::from_be_bytes([message[0], message[1]]);
    let msg_type = message[2];
    let payload_len = u16::from_be_bytes([message[3], message[4]]) as usize;

    if msg_type != MSG_TYPE_INITIATION {
        return Err(format!(
            "expected initiation type 0x{MSG_TYPE_INITIATION:02x}, got 0x{msg_type:02x}"
        ));
    }
    if message.len() != 5 + payload_len {
        return Err(format!(
            "initiation length mismatch: header says {}, got {}",
            5 + payload_len,
            message.len()
        ));
    }

    Ok(Initiation {
        version,
        payload: message[5..].to_vec(),
    })
}

/// run the noise handshake and serve http/2 over the transport.
async fn serve_noise_connection(
    upgraded: hyper::upgrade::Upgraded,
    init: Initiation,
    private_key: Zeroizing<Vec<u8>>,
    state: AppState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut io = TokioIo::new(upgraded);

    let mut handshake = NoiseHandshake::responder(&private_key, init.version)?;
    handshake.read_message(&init.payload)?;

    let response_payload = handshake.write_message(&[])?;
    let mut response = Vec::with_capacity(3 + response_payload.len());
    response.push(MSG_TYPE_RESPONSE);
    response.extend_from_slice(&(response_payload.len() as u16).to_be_bytes());
    response.extend_from_slice(&response_payload);
    io.write_all(&response).await?;
    io.flush().await?;

    if !handshake.is_complete() {
        return Err("handshake not complete after response".into());
    }

    let client_key = handshake
        .remote_static()
        .ok_or("missing client static key")?;
    debug!(
        machine_key = %short_key(&client_key),
        "noise handshake complete"
    );
    let machine_key_context = MachineKeyContext::from_bytes(client_key);

    let mut transport = handshake.into_transport()?;

    // early payload: magic, 4-byte be length, json node-key challenge.
    // sent encrypted before http/2 for protocol versions that know it.
    if u32::from(init.version) >= CapabilityVersion::EARLY_NOISE_MIN.0 {
        let challenge = ironscale_proto::generate_keypair()?;
        let early = EarlyNoise {
            node_key_challenge: format!("chalpub:{}", hex::encode(&challenge.public)),
        };
        let early_json = serde_json::to_vec(&early)?;

        let mut plaintext =
            Vec::with_capacity(EARLY_PAYLOAD_MAGIC.len() + 4 + early_json.len());
        plaintext.extend_from_slice(EARLY_PAYLOAD_MAGIC);
        plaintext.extend_from_slice(&(early_json.len() as u32).to_be_bytes());
        plaintext.extend_from_slice(&early_json);

        let ciphertext = transport.encrypt(&plaintext)?;
        let mut frame = Vec::with_capacity(3 + ciphertext.len());
        frame.push(MSG_TYPE_RECORD);
        frame.extend_from_slice(&(ciphertext.len() as u16).to_be_bytes());
        frame.extend_from_slice(&ciphertext);
        io.write_all(&frame).await?;
        io.flush().await?;
    }

    let noise_stream = HttpNoiseStream::new(io, transport);

    // the per-connection router, carrying the authenticated machine key
    let router = crate::create_app(state);
    let service = hyper::service::service_fn(move |req: Request<hyper::body::Incoming>| {
        let mut router = router.clone();
        let machine_key_context = machine_key_context.clone();
        async move {
            let (mut parts, body) = req.into_parts();
            parts.extensions.insert(machine_key_context);
            let req = Request::from_parts(parts, Body::new(body));
            tower::Service::call(&mut router, req).await
        }
    });

    let io = hyper_util::rt::TokioIo::new(noise_stream);
    let mut http2 = hyper::server::conn::http2::Builder::new(hyper_util::rt::TokioExecutor::new());
    http2.max_frame_size(16384);

    if let Err(e) = http2.serve_connection(io, service).await {
        debug!(error = %e, "http/2 over noise ended");
    }

    Ok(())
}

fn short_key(bytes: &[u8]) -> String {
    if bytes.len() >= 2 {
        format!("mkey:{:02x}{:02x}...", bytes[0], bytes[1])
    } else {
        "mkey:???".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_initiation(version: u16, payload: &[u8]) -> String {
        let mut msg = Vec::new();
        msg.extend_from_slice(&version.to_be_bytes());
        msg.push(MSG_TYPE_INITIATION);
        msg.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        msg.extend_from_slice(payload);
        base64::engine::general_purpose::STANDARD.encode(msg)
    }

    #[test]
    fn parse_valid_initiation() {
        let payload = vec![0u8; 96];
        let b64 = encode_initiation(106, &payload);

        let init = parse_initiation(&b64).unwrap();
        assert_eq!(init.version, 106);
        assert_eq!(init.payload.len(), 96);
    }

    #[test]
    fn reject_wrong_message_type() {
        let mut msg = Vec::new();
        msg.extend_from_slice(&106u16.to_be_bytes());
        msg.push(MSG_TYPE_RESPONSE);
        msg.extend_from_slice(&0u16.to_be_bytes());
        let b64 = base64::engine::general_purpose::STANDARD.encode(msg);

        assert!(parse_initiation(&b64).is_err());
    }

    #[test]
    fn reject_length_mismatch() {
        let mut msg = Vec::new();
        msg.extend_from_slice(&106u16.to_be_bytes());
        msg.push(MSG_TYPE_INITIATION);
        msg.extend_from_slice(&96u16.to_be_bytes());
        msg.extend_from_slice(&[0u8; 10]); // 86 bytes short
        let b64 = base64::engine::general_purpose::STANDARD.encode(msg);

        assert!(parse_initiation(&b64).is_err());
    }

    #[test]
    fn reject_garbage_base64() {
        assert!(parse_initiation("not base64 at all!!!").is_err());
    }
}
