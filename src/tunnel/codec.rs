//! Wire codec for the tunnel: tagged, length-prefixed frames.
//!
//! Frame layout: `[tag: u8][len: u32 BE][payload: len bytes]`.
//!
//! Three tags are defined — Text (UTF-8), Request (JSON), Response (JSON).
//! The length prefix keeps message boundaries intact under partial reads and
//! makes the codec binary-transparent; JSON strings carry NULs fine and raw
//! bytes ride the base64 envelope one layer up. Both ends must agree on this
//! layout; there is no version negotiation.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{TunnelError, TunnelRequest, TunnelResponse};

const TAG_TEXT: u8 = 0x01;
const TAG_REQUEST: u8 = 0x02;
const TAG_RESPONSE: u8 = 0x03;

/// tag + u32 length prefix.
const HEADER_LEN: usize = 5;

/// A single tunnel message.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Handshake strings: token, name, `AUTH_SUCCESS` / `AUTH_FAILED`.
    Text(String),
    Request(TunnelRequest),
    Response(TunnelResponse),
}

/// HTTP verbs a confused client might send to the tunnel port. Matched
/// against the first four bytes of what should be a frame header.
const HTTP_VERB_PREFIXES: [&[u8; 4]; 6] = [b"GET ", b"POST", b"PUT ", b"HEAD", b"DELE", b"OPTI"];

fn io_gone(_: std::io::Error) -> TunnelError {
    // EOF, reset, broken pipe, and friends all mean the same thing here:
    // the peer is no longer usable.
    TunnelError::PeerGone
}

/// Write one frame. The caller must hold the session's connection mutex;
/// the codec itself does not serialize concurrent writers.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    let (tag, payload) = match frame {
        Frame::Text(s) => (TAG_TEXT, s.as_bytes().to_vec()),
        Frame::Request(r) => (
            TAG_REQUEST,
            serde_json::to_vec(r).map_err(|e| TunnelError::StreamCorrupt(e.to_string()))?,
        ),
        Frame::Response(r) => (
            TAG_RESPONSE,
            serde_json::to_vec(r).map_err(|e| TunnelError::StreamCorrupt(e.to_string()))?,
        ),
    };

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(tag);
    #[allow(clippy::cast_possible_truncation)]
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);

    writer.write_all(&buf).await.map_err(io_gone)?;
    writer.flush().await.map_err(io_gone)
}

/// Read one frame, blocking until it is complete.
///
/// Lengths above `max_len` and unknown tags are header-level corruption
/// ([`TunnelError::FrameCorrupt`]); a well-tagged payload that fails UTF-8 or
/// JSON decoding is [`TunnelError::StreamCorrupt`]. EOF at any point maps to
/// [`TunnelError::PeerGone`]. Deadlines are the caller's job.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Frame, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let header = read_header(reader).await?;
    decode_after_header(reader, header, max_len).await
}

/// Like [`read_frame`], but for the very first read on a fresh connection:
/// recognizes an HTTP request line and reports it as
/// [`TunnelError::HttpProbe`] so the listener can answer politely.
pub async fn read_frame_handshake<R>(reader: &mut R, max_len: usize) -> Result<Frame, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let header = read_header(reader).await?;
    if HTTP_VERB_PREFIXES.iter().any(|p| header[..4] == p[..]) {
        return Err(TunnelError::HttpProbe);
    }
    decode_after_header(reader, header, max_len).await
}

async fn read_header<R>(reader: &mut R) -> Result<[u8; HEADER_LEN], TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await.map_err(io_gone)?;
    Ok(header)
}

async fn decode_after_header<R>(
    reader: &mut R,
    header: [u8; HEADER_LEN],
    max_len: usize,
) -> Result<Frame, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let tag = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;

    if !matches!(tag, TAG_TEXT | TAG_REQUEST | TAG_RESPONSE) {
        return Err(TunnelError::FrameCorrupt(format!("unknown tag 0x{tag:02x}")));
    }
    if len > max_len {
        return Err(TunnelError::FrameCorrupt(format!(
            "frame length {len} exceeds cap {max_len}"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(io_gone)?;

    match tag {
        TAG_TEXT => {
            let text = String::from_utf8(payload)
                .map_err(|e| TunnelError::StreamCorrupt(e.to_string()))?;
            Ok(Frame::Text(text))
        }
        TAG_REQUEST => {
            let request = serde_json::from_slice(&payload)
                .map_err(|e| TunnelError::StreamCorrupt(e.to_string()))?;
            Ok(Frame::Request(request))
        }
        _ => {
            let response = serde_json::from_slice(&payload)
                .map_err(|e| TunnelError::StreamCorrupt(e.to_string()))?;
            Ok(Frame::Response(response))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024 * 1024;

    async fn round_trip(frame: Frame) -> Frame {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        write_frame(&mut client, &frame).await.unwrap();
        read_frame(&mut server, MAX).await.unwrap()
    }

    #[tokio::test]
    async fn test_text_round_trip() {
        match round_trip(Frame::Text("AUTH_SUCCESS".to_string())).await {
            Frame::Text(s) => assert_eq!(s, "AUTH_SUCCESS"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let request = TunnelRequest {
            client_name: "cam1".to_string(),
            method: "GET".to_string(),
            url: "http://lan/ok".to_string(),
            body: "x\u{0}y".to_string(),
        };
        match round_trip(Frame::Request(request)).await {
            Frame::Request(r) => {
                assert_eq!(r.client_name, "cam1");
                assert_eq!(r.method, "GET");
                assert_eq!(r.body, "x\u{0}y");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_response_round_trip() {
        let response = TunnelResponse {
            status: 200,
            body: "heartbeat_ok".to_string(),
        };
        match round_trip(Frame::Response(response)).await {
            Frame::Response(r) => {
                assert_eq!(r.status, 200);
                assert_eq!(r.body, "heartbeat_ok");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_message_boundaries_preserved() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        write_frame(&mut client, &Frame::Text("one".to_string()))
            .await
            .unwrap();
        write_frame(&mut client, &Frame::Text("two".to_string()))
            .await
            .unwrap();
        let Frame::Text(a) = read_frame(&mut server, MAX).await.unwrap() else {
            panic!("expected text");
        };
        let Frame::Text(b) = read_frame(&mut server, MAX).await.unwrap() else {
            panic!("expected text");
        };
        assert_eq!((a.as_str(), b.as_str()), ("one", "two"));
    }

    #[tokio::test]
    async fn test_unknown_tag_is_frame_corrupt() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[0x7f, 0, 0, 0, 0]).await.unwrap();
        match read_frame(&mut server, MAX).await {
            Err(TunnelError::FrameCorrupt(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversized_length_is_frame_corrupt() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut header = vec![TAG_TEXT];
        header.extend_from_slice(&u32::MAX.to_be_bytes());
        client.write_all(&header).await.unwrap();
        match read_frame(&mut server, MAX).await {
            Err(TunnelError::FrameCorrupt(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_json_is_stream_corrupt() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let payload = b"not json";
        let mut buf = vec![TAG_REQUEST];
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        client.write_all(&buf).await.unwrap();
        match read_frame(&mut server, MAX).await {
            Err(TunnelError::StreamCorrupt(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_peer_gone() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        // Announce 100 payload bytes, deliver 3, then hang up
        let mut buf = vec![TAG_TEXT];
        buf.extend_from_slice(&100u32.to_be_bytes());
        buf.extend_from_slice(b"abc");
        client.write_all(&buf).await.unwrap();
        drop(client);
        match read_frame(&mut server, MAX).await {
            Err(TunnelError::PeerGone) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_probe_detected_on_handshake_read() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        match read_frame_handshake(&mut server, MAX).await {
            Err(TunnelError::HttpProbe) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_probe_not_detected_on_normal_read() {
        // After the handshake, anything starting like an HTTP verb is just a
        // corrupt frame, not a probe.
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"POST / HTTP/1.1\r\n\r\n").await.unwrap();
        match read_frame(&mut server, MAX).await {
            Err(TunnelError::FrameCorrupt(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
