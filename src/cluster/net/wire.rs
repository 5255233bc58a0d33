use std::io::Read;

use arrayref::array_ref;
use byteorder::{ByteOrder, LittleEndian};
use rkyv::{from_bytes, to_bytes, AlignedVec, Archive, Deserialize, Serialize};
use tracing::trace;

use crate::cluster::{
    agent::{AgentId, AgentMessage, AgentResponse, ComputeAgent},
    error::{Error, Result},
    handle::SessionSetup,
    proxy::{ProxyReply, ProxyRequest},
};

/// Bumped whenever an archived protocol type changes shape.
pub const PROTOCOL_VERSION: u16 = 2;

/// flags | len
pub const HEADER_LEN: usize = 1 + 4;

const FLAG_COMPRESSED: u8 = 0b0000_0001;

const ZSTD_LEVEL: i32 = 3;

/// Client to node, or user to proxy.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum Request {
    /// Install the session's partition and table on the node.
    Setup { version: u16, setup: SessionSetup },
    /// Enroll `agent` and start running it.
    Dispatch { version: u16, agent: ComputeAgent },
    /// Deliver `message` to an enrolled agent.
    Send { agent: AgentId, message: AgentMessage },
    Proxy(ProxyRequest),
}

/// Node to client.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum Reply {
    Ready,
    Enrolled(AgentId),
    Response(AgentResponse),
    /// The node refused the request; not a disconnect.
    Rejected(String),
    /// The addressed agent is gone for good.
    Gone(String),
    Proxy(ProxyReply),
}

impl Request {
    pub fn encode(&self, compress_threshold: usize) -> Result<Vec<u8>> {
        let bytes =
            to_bytes::<_, 4096>(self).map_err(|_| Error::CouldNotEncodeMessage)?;
        frame(&bytes, compress_threshold)
    }

    pub fn decode(buf: &[u8], max_len: usize) -> Result<Self> {
        let payload = unframe(buf, max_len)?;
        from_bytes::<Self>(&payload).map_err(|_| Error::CouldNotDecodeMessage)
    }
}

impl Reply {
    pub fn encode(&self, compress_threshold: usize) -> Result<Vec<u8>> {
        let bytes =
            to_bytes::<_, 4096>(self).map_err(|_| Error::CouldNotEncodeMessage)?;
        frame(&bytes, compress_threshold)
    }

    pub fn decode(buf: &[u8], max_len: usize) -> Result<Self> {
        let payload = unframe(buf, max_len)?;
        from_bytes::<Self>(&payload).map_err(|_| Error::CouldNotDecodeMessage)
    }

    /// Turns a reply to a `Send` into the agent's response.
    pub fn into_response(self) -> Result<AgentResponse> {
        match self {
            Reply::Response(response) => Ok(response),
            Reply::Gone(reason) => Err(Error::Disconnected(reason)),
            Reply::Rejected(reason) => Err(Error::UnexpectedMessage(reason)),
            other => Err(Error::UnexpectedMessage(format!(
                "{:?} in reply to a send",
                other
            ))),
        }
    }

    /// Turns a reply to a `Proxy` request into the proxy's answer.
    pub fn into_proxy_reply(self) -> Result<ProxyReply> {
        match self {
            Reply::Proxy(reply) => Ok(reply),
            Reply::Gone(reason) => Err(Error::Disconnected(reason)),
            Reply::Rejected(reason) => Err(Error::UnexpectedMessage(reason)),
            other => Err(Error::UnexpectedMessage(format!(
                "{:?} in reply to a proxy request",
                other
            ))),
        }
    }
}

fn frame(payload: &[u8], compress_threshold: usize) -> Result<Vec<u8>> {
    let (flags, body) = if payload.len() > compress_threshold {
        let compressed = zstd::encode_all(payload, ZSTD_LEVEL)?;
        (FLAG_COMPRESSED, compressed)
    } else {
        (0, payload.to_vec())
    };
    let len = u32::try_from(body.len()).map_err(|_| Error::MessageLengthOverflowed)?;
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.push(flags);
    let mut len_buf = [0u8; 4];
    LittleEndian::write_u32(&mut len_buf, len);
    buf.extend_from_slice(&len_buf);
    buf.extend_from_slice(&body);
    trace!(raw = payload.len(), framed = buf.len(), flags, "framed message");
    Ok(buf)
}

/// Checks the header and returns the payload, decompressed and copied into
/// an aligned buffer for validation.
fn unframe(buf: &[u8], max_len: usize) -> Result<AlignedVec> {
    if buf.len() < HEADER_LEN {
        Err(Error::CouldNotDecodeMessage)?
    }
    let flags = buf[0];
    let len = LittleEndian::read_u32(array_ref![buf, 1, 4]) as usize;
    if len > max_len {
        Err(Error::MessageLengthOverflowed)?
    }
    let body = buf
        .get(HEADER_LEN..HEADER_LEN + len)
        .ok_or(Error::CouldNotDecodeMessage)?;
    let mut aligned = AlignedVec::new();
    if flags & FLAG_COMPRESSED != 0 {
        // stop one byte past the limit instead of inflating the whole body
        let mut raw = Vec::new();
        zstd::stream::read::Decoder::new(body)?
            .take(max_len as u64 + 1)
            .read_to_end(&mut raw)?;
        if raw.len() > max_len {
            Err(Error::MessageLengthOverflowed)?
        }
        aligned.extend_from_slice(&raw);
    } else {
        aligned.extend_from_slice(body);
    }
    Ok(aligned)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cluster::{
        agent::{AgentTemplate, RenderStyle},
        scene::{Appearance, Geometry, Primitive, SceneFragment},
    };

    fn big_fragment() -> SceneFragment {
        let mut b = SceneFragment::builder();
        let leaf = b.leaf(Appearance::new(Geometry {
            primitive: Primitive::Points,
            coordinates: vec![0.5; 30_000],
            colors: vec![7; 40_000],
            texture_coords: vec![],
        }));
        let root = b.group(vec![leaf]);
        b.finish(root)
    }

    #[test]
    fn dispatch_survives_the_wire() {
        let agent = AgentTemplate::new("render", RenderStyle::Volume).instantiate(
            b"session",
            2,
            Duration::from_secs(1),
        );
        let request = Request::Dispatch {
            version: PROTOCOL_VERSION,
            agent,
        };
        let buf = request.encode(1 << 14).unwrap();
        assert_eq!(buf[0], 0);
        assert_eq!(Request::decode(&buf, 1 << 20).unwrap(), request);
    }

    #[test]
    fn large_replies_are_compressed() {
        let reply = Reply::Response(AgentResponse::Fragment(big_fragment()));
        let buf = reply.encode(1 << 14).unwrap();
        assert_eq!(buf[0] & FLAG_COMPRESSED, FLAG_COMPRESSED);
        assert!(buf.len() < 160_000);
        assert_eq!(Reply::decode(&buf, 1 << 20).unwrap(), reply);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let reply = Reply::Response(AgentResponse::Fragment(big_fragment()));
        let buf = reply.encode(usize::MAX).unwrap();
        assert!(matches!(
            Reply::decode(&buf, 1024),
            Err(Error::MessageLengthOverflowed)
        ));
    }

    #[test]
    fn compressed_frames_cannot_inflate_past_the_limit() {
        // a few kilobytes on the wire, many megabytes once inflated
        let zeros = vec![0u8; 32 * 1024 * 1024];
        let buf = frame(&zeros, 0).unwrap();
        assert_eq!(buf[0] & FLAG_COMPRESSED, FLAG_COMPRESSED);
        assert!(buf.len() < 64 * 1024);
        assert!(matches!(
            Reply::decode(&buf, 1 << 20),
            Err(Error::MessageLengthOverflowed)
        ));
    }

    #[test]
    fn truncated_frames_do_not_decode() {
        let buf = Reply::Response(AgentResponse::Stopped).encode(1024).unwrap();
        assert!(matches!(
            Reply::decode(&buf[..buf.len() - 1], 1024),
            Err(Error::CouldNotDecodeMessage)
        ));
        assert!(matches!(
            Reply::decode(&buf[..2], 1024),
            Err(Error::CouldNotDecodeMessage)
        ));
    }

    #[test]
    fn gone_maps_to_disconnect() {
        let err = Reply::Gone("node stopped".into()).into_response().unwrap_err();
        assert!(err.is_disconnect());
    }
}
