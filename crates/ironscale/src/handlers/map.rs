//! handler for /machine/map.
//!
//! a non-streaming request answers once; a streaming request hands the
//! connection to the batcher as a long poll. responses are framed with a
//! 4-byte little-endian length prefix and optionally zstd-compressed.

use std::convert::Infallible;
use std::io::Write;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    extract::State,
    http::{StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use futures_util::Stream;
use futures_util::stream::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use ironscale_db::Database;
use ironscale_proto::{MapRequest, MapResponse, version_label};
use ironscale_types::{ChangeSet, Node, NodeId};

use super::{ApiError, OptionExt, ResultExt};
use crate::AppState;

/// compression requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    None,
    Zstd,
}

impl From<Option<&String>> for Compression {
    fn from(s: Option<&String>) -> Self {
        match s.map(String::as_str) {
            Some("zstd") => Compression::Zstd,
            _ => Compression::None,
        }
    }
}

/// handle map requests.
///
/// NOTE: the body is read as raw bytes because the client does not send
/// a content-type header over the control channel.
pub async fn map(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: MapRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::bad_request("invalid JSON request body"))?;

    if req.version.0 < state.config.min_capability_version {
        return Err(ApiError::bad_request(format!(
            "unsupported client version: {} ({})",
            version_label(req.version),
            req.version
        )));
    }

    let node = state
        .db
        .get_node_by_node_key(&req.node_key)
        .await
        .map_internal()?
        .or_unauthorized("node not found")?;

    if node.is_expired() {
        return Err(ApiError::unauthorized("node registration has expired"));
    }

    // fold the client's reported state into the node view
    if !req.read_only {
        apply_client_state(&state, &req, node.clone()).await?;
    }

    let compression = Compression::from(req.compress.as_ref());

    if req.stream {
        streaming_response(state, &req, node, compression).await
    } else {
        let change = if req.omit_peers {
            ChangeSet::self_update(node.id)
        } else {
            ChangeSet::full_self(node.id)
        };
        let resp = state
            .batcher
            .map_response_from_change(node.id, change)
            .await
            .map_internal()?
            .or_not_found("no map response produced")?;

        let bytes = encode_length_prefixed(&resp, compression)
            .ok_or_else(|| ApiError::internal("failed to encode response"))?;
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(bytes))
            .expect("valid status and headers"))
    }
}

/// persist endpoint/hostinfo/disco updates and fan out the consequences.
async fn apply_client_state(
    state: &AppState,
    req: &MapRequest,
    mut node: Node,
) -> Result<(), ApiError> {
    let mut needs_update = false;
    let mut routes_changed = false;

    if !req.disco_key.is_empty() && req.disco_key != node.disco_key {
        node.disco_key = req.disco_key.clone();
        needs_update = true;
    }

    if !req.endpoints.is_empty() && req.endpoints != node.endpoints {
        node.endpoints = req.endpoints.clone();
        needs_update = true;
    }

    if let Some(hostinfo) = &req.hostinfo
        && node.hostinfo.as_ref() != Some(hostinfo)
    {
        node.hostinfo = Some(hostinfo.clone());
        needs_update = true;
        routes_changed = true;
    }

    if needs_update {
        node.last_seen = Some(chrono::Utc::now());
        let node = state.db.update_node(&node).await.map_internal()?;
        if routes_changed {
            state.sync_node_routes(&node).await.map_internal()?;
        }
        state.batcher.add_work(ChangeSet::peer_changed(node.id)).await;
    }

    Ok(())
}

/// register the stream with the batcher and serve its channel.
async fn streaming_response(
    state: AppState,
    req: &MapRequest,
    node: Node,
    compression: Compression,
) -> Result<Response, ApiError> {
    let (tx, rx) = mpsc::channel::<MapResponse>(32);

    state
        .batcher
        .add_node(node.id, tx.clone(), req.version)
        .await
        .map_internal()?;

    // announce the transition through the ordered lane
    state
        .batcher
        .add_work(ChangeSet::node_came_online(node.id))
        .await;

    debug!(node_id = %node.id, "map stream opened");

    let inner = futures_util::stream::unfold(
        (rx, compression),
        |(mut rx, compression)| async move {
            let resp = rx.recv().await?;
            let bytes = encode_length_prefixed(&resp, compression)?;
            Some((bytes, (rx, compression)))
        },
    );

    // the guard fires the offline transition when the client goes away
    let guarded = StreamClosedGuard {
        inner: Box::pin(inner),
        state,
        node_id: node.id,
        tx,
    };

    let body_stream = guarded.map(Ok::<_, Infallible>);

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from_stream(body_stream))
        .expect("valid status and headers"))
}

/// stream wrapper that detaches the connection from the batcher when the
/// client disconnects and the response body is dropped.
struct StreamClosedGuard<S> {
    inner: Pin<Box<S>>,
    state: AppState,
    node_id: NodeId,
    tx: mpsc::Sender<MapResponse>,
}

impl<S, T> Stream for StreamClosedGuard<S>
where
    S: Stream<Item = T>,
{
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<S> Drop for StreamClosedGuard<S> {
    fn drop(&mut self) {
        let state = self.state.clone();
        let node_id = self.node_id;
        let tx = self.tx.clone();

        // drop cannot await; hand the cleanup to a task
        tokio::spawn(async move {
            debug!(node_id = %node_id, "map stream closed");
            state.handle_stream_closed(node_id, &tx).await;
        });
    }
}

/// frame a response: 4-byte little-endian length, then the payload,
/// zstd-compressed when requested.
fn encode_length_prefixed(response: &MapResponse, compression: Compression) -> Option<Bytes> {
    let json = serde_json::to_vec(response).ok()?;

    let payload = match compression {
        Compression::Zstd => compress_zstd(&json).ok()?,
        Compression::None => json,
    };

    let len = u32::try_from(payload.len()).ok()?;
    let mut body = Vec::with_capacity(4 + payload.len());
    body.extend_from_slice(&len.to_le_bytes());
    body.extend_from_slice(&payload);
    Some(Bytes::from(body))
}

fn compress_zstd(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = zstd::stream::Encoder::new(Vec::new(), 1)?;
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_prefix_framing() {
        let resp = MapResponse::keepalive();
        let framed = encode_length_prefixed(&resp, Compression::None).unwrap();

        let len = u32::from_le_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(len, framed.len() - 4);

        let parsed: MapResponse = serde_json::from_slice(&framed[4..]).unwrap();
        assert!(parsed.keep_alive);
    }

    #[test]
    fn zstd_framing_roundtrips() {
        let resp = MapResponse::keepalive();
        let framed = encode_length_prefixed(&resp, Compression::Zstd).unwrap();

        let len = u32::from_le_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(len, framed.len() - 4);

        let decompressed = zstd::stream::decode_all(&framed[4..]).unwrap();
        let parsed: MapResponse = serde_json::from_slice(&decompressed).unwrap();
        assert!(parsed.keep_alive);
    }

    #[test]
    fn compression_negotiation() {
        assert_eq!(Compression::from(None), Compression::None);
        assert_eq!(
            Compression::from(Some(&"zstd".to_string())),
            Compression::Zstd
        );
        assert_eq!(
            Compression::from(Some(&"gzip".to_string())),
            Compression::None
        );
    }
}
