//! TCPROS framing and the text-header handshake.
//!
//! Every frame (header block or message body) is a little-endian u32 length
//! followed by that many bytes. Inside a header block each `key=value` line is
//! itself length-prefixed. Bodies are opaque to this module.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use log::*;
use rosnative_common::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Caps a header block; a peer sending more than this is broken or hostile.
pub(crate) const MAX_HEADER_LEN: usize = 16 * 1024;
/// Caps a message body frame.
pub(crate) const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Service response status bytes.
pub(crate) const SERVICE_OK: u8 = 1;
pub(crate) const SERVICE_ERROR: u8 = 0;

/// The key=value set exchanged during a TCPROS handshake.
///
/// One struct covers all four roles (topic subscriber/publisher, service
/// client/provider); only the populated fields are written to the wire.
#[derive(Clone, Debug, Default)]
pub(crate) struct ConnectionHeader {
    pub caller_id: String,
    pub topic: Option<String>,
    pub service: Option<String>,
    pub topic_type: String,
    pub md5sum: Option<String>,
    pub msg_definition: String,
    pub latching: Option<bool>,
    pub tcp_nodelay: Option<bool>,
    pub persistent: Option<bool>,
    pub request_type: Option<String>,
    pub response_type: Option<String>,
    pub error: Option<String>,
}

impl ConnectionHeader {
    /// A reply carrying only a diagnostic, sent before closing on a bad handshake.
    pub(crate) fn error_header(message: impl Into<String>) -> Self {
        ConnectionHeader {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    /// Serializes the populated fields, outer length prefix included.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut lines: Vec<String> = Vec::new();
        if !self.caller_id.is_empty() {
            lines.push(format!("callerid={}", self.caller_id));
        }
        if let Some(error) = &self.error {
            lines.push(format!("error={error}"));
        }
        if let Some(md5sum) = &self.md5sum {
            lines.push(format!("md5sum={md5sum}"));
        }
        if let Some(topic) = &self.topic {
            lines.push(format!("topic={topic}"));
        }
        if let Some(service) = &self.service {
            lines.push(format!("service={service}"));
        }
        if !self.topic_type.is_empty() {
            lines.push(format!("type={}", self.topic_type));
        }
        if !self.msg_definition.is_empty() {
            lines.push(format!("message_definition={}", self.msg_definition));
        }
        if let Some(latching) = self.latching {
            lines.push(format!("latching={}", latching as u8));
        }
        if let Some(tcp_nodelay) = self.tcp_nodelay {
            lines.push(format!("tcp_nodelay={}", tcp_nodelay as u8));
        }
        if let Some(persistent) = self.persistent {
            lines.push(format!("persistent={}", persistent as u8));
        }
        if let Some(request_type) = &self.request_type {
            lines.push(format!("request_type={request_type}"));
        }
        if let Some(response_type) = &self.response_type {
            lines.push(format!("response_type={response_type}"));
        }

        let inner_len: usize = lines.iter().map(|l| 4 + l.len()).sum();
        let mut out = Vec::with_capacity(4 + inner_len);
        WriteBytesExt::write_u32::<LittleEndian>(&mut out, inner_len as u32).unwrap();
        for line in &lines {
            WriteBytesExt::write_u32::<LittleEndian>(&mut out, line.len() as u32).unwrap();
            out.extend_from_slice(line.as_bytes());
        }
        out
    }

    /// Parses a header block from its inner bytes (outer length already stripped).
    /// Unknown keys are ignored so peers can extend the handshake.
    pub(crate) fn from_bytes(mut data: &[u8]) -> Result<Self> {
        let mut header = ConnectionHeader::default();
        while !data.is_empty() {
            if data.len() < 4 {
                return Err(Error::Malformed("truncated header line length".to_owned()));
            }
            let line_len = LittleEndian::read_u32(&data[..4]) as usize;
            data = &data[4..];
            if data.len() < line_len {
                return Err(Error::Malformed("truncated header line".to_owned()));
            }
            let line = std::str::from_utf8(&data[..line_len])
                .map_err(|_| Error::Malformed("header line is not valid utf-8".to_owned()))?;
            data = &data[line_len..];

            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::Malformed(format!(
                    "header line without separator: {line}"
                )));
            };
            match key {
                "callerid" => header.caller_id = value.to_owned(),
                "topic" => header.topic = Some(value.to_owned()),
                "service" => header.service = Some(value.to_owned()),
                "type" => header.topic_type = value.to_owned(),
                "md5sum" => header.md5sum = Some(value.to_owned()),
                "message_definition" => header.msg_definition = value.to_owned(),
                "latching" => header.latching = Some(value == "1"),
                "tcp_nodelay" => header.tcp_nodelay = Some(value == "1"),
                "persistent" => header.persistent = Some(value == "1"),
                "request_type" => header.request_type = Some(value.to_owned()),
                "response_type" => header.response_type = Some(value.to_owned()),
                "error" => header.error = Some(value.to_owned()),
                _ => trace!("Ignoring unknown connection header field: {key}"),
            }
        }
        Ok(header)
    }

    /// Checks the remote header against our own type and md5sum.
    ///
    /// `*` on either field is the wildcard sent by generic tooling
    /// (e.g. `rostopic echo`) and always matches.
    pub(crate) fn validate_against(
        &self,
        md5sum: &str,
        topic_type: &str,
    ) -> std::result::Result<(), String> {
        if let Some(remote_md5) = &self.md5sum {
            if remote_md5 != "*" && md5sum != "*" && remote_md5 != md5sum {
                return Err(format!(
                    "md5sums do not match, expected {md5sum} received {remote_md5}"
                ));
            }
        }
        if !self.topic_type.is_empty() && self.topic_type != "*" && self.topic_type != topic_type {
            return Err(format!(
                "types do not match, expected {topic_type} received {}",
                self.topic_type
            ));
        }
        Ok(())
    }
}

/// Maps peer-went-away io errors to [Error::TransportClosed], which callers
/// treat as a clean end-of-stream.
pub(crate) fn map_io_err(err: std::io::Error) -> Error {
    use std::io::ErrorKind::*;
    match err.kind() {
        UnexpectedEof | BrokenPipe | ConnectionReset | ConnectionAborted => Error::TransportClosed,
        _ => Error::IoError(err),
    }
}

/// Reads one length-prefixed frame and returns its payload.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(map_io_err)?;
    let len = LittleEndian::read_u32(&len_buf) as usize;
    if len > max_len {
        return Err(Error::Malformed(format!(
            "frame length {len} exceeds the {max_len} byte limit"
        )));
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(map_io_err)?;
    Ok(payload)
}

/// Reads one message body and returns it with its length prefix re-attached,
/// which is the form the message codec consumes.
pub(crate) async fn read_body<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let payload = read_frame(reader, MAX_BODY_LEN).await?;
    let mut body = Vec::with_capacity(4 + payload.len());
    WriteBytesExt::write_u32::<LittleEndian>(&mut body, payload.len() as u32).unwrap();
    body.extend_from_slice(&payload);
    Ok(body)
}

/// Writes one length-prefixed frame.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<()> {
    let mut len_buf = [0u8; 4];
    LittleEndian::write_u32(&mut len_buf, payload.len() as u32);
    writer.write_all(&len_buf).await?;
    writer.write_all(payload).await?;
    Ok(())
}

pub(crate) async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ConnectionHeader> {
    let block = read_frame(reader, MAX_HEADER_LEN).await?;
    ConnectionHeader::from_bytes(&block)
}

pub(crate) async fn write_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &ConnectionHeader,
) -> Result<()> {
    writer.write_all(&header.to_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn header_round_trips() {
        let header = ConnectionHeader {
            caller_id: "/talker".to_owned(),
            topic: Some("/chatter".to_owned()),
            topic_type: "std_msgs/String".to_owned(),
            md5sum: Some("992ce8a1687cec8c8bd883ec73ca41d1".to_owned()),
            msg_definition: "string data".to_owned(),
            tcp_nodelay: Some(true),
            ..Default::default()
        };
        let bytes = header.to_bytes();
        let mut cursor: &[u8] = &bytes;
        let decoded = read_header(&mut cursor).await.unwrap();
        assert_eq!(decoded.caller_id, "/talker");
        assert_eq!(decoded.topic.as_deref(), Some("/chatter"));
        assert_eq!(decoded.topic_type, "std_msgs/String");
        assert_eq!(
            decoded.md5sum.as_deref(),
            Some("992ce8a1687cec8c8bd883ec73ca41d1")
        );
        assert_eq!(decoded.msg_definition, "string data");
        assert_eq!(decoded.tcp_nodelay, Some(true));
        assert_eq!(decoded.latching, None);
    }

    #[test]
    fn error_header_encodes_single_line() {
        let bytes = ConnectionHeader::error_header("x").to_bytes();
        // outer length (11) + line length (7) + "error=x"
        assert_eq!(
            bytes,
            vec![11, 0, 0, 0, 7, 0, 0, 0, b'e', b'r', b'r', b'o', b'r', b'=', b'x']
        );
    }

    #[test]
    fn wildcard_md5sum_matches_anything() {
        let mut header = ConnectionHeader::default();
        header.md5sum = Some("*".to_owned());
        header.topic_type = "*".to_owned();
        assert!(header.validate_against("abc", "std_msgs/Int32").is_ok());
    }

    #[test]
    fn mismatched_md5sum_is_rejected() {
        let mut header = ConnectionHeader::default();
        header.md5sum = Some("aaa".to_owned());
        header.topic_type = "std_msgs/Int32".to_owned();
        assert!(header.validate_against("bbb", "std_msgs/Int32").is_err());
        header.md5sum = Some("bbb".to_owned());
        header.topic_type = "std_msgs/Int64".to_owned();
        assert!(header.validate_against("bbb", "std_msgs/Int32").is_err());
    }

    #[tokio::test]
    async fn eof_maps_to_transport_closed() {
        let mut cursor: &[u8] = &[1, 0, 0];
        match read_frame(&mut cursor, MAX_HEADER_LEN).await {
            Err(Error::TransportClosed) => {}
            other => panic!("expected TransportClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_malformed() {
        let mut bytes = Vec::new();
        WriteBytesExt::write_u32::<LittleEndian>(&mut bytes, u32::MAX).unwrap();
        let mut cursor: &[u8] = &bytes;
        match read_frame(&mut cursor, MAX_HEADER_LEN).await {
            Err(Error::Malformed(_)) => {}
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_body_reattaches_length_prefix() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &[1, 2, 3]).await.unwrap();
        let mut cursor: &[u8] = &wire;
        let body = read_body(&mut cursor).await.unwrap();
        assert_eq!(body, vec![3, 0, 0, 0, 1, 2, 3]);
    }
}
