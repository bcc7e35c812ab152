use bytes::{Buf, BufMut, BytesMut};
use gzdap_protocol::ProtocolMessage;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// A complete frame whose body failed to deserialize.  Framing state is
/// intact afterwards; the next frame decodes normally.
#[derive(Debug)]
pub struct DecoderError {
    pub error: serde_json::Error,
    pub raw: Vec<u8>,
}

pub type DecoderResult = Result<ProtocolMessage, DecoderError>;

enum State {
    ReadingHeaders,
    ReadingBody,
}

/// Framing codec for DAP messages: `Content-Length: <N>\r\n\r\n` followed by
/// N bytes of UTF-8 JSON.  Header lines tolerate bare `\n` separators.
pub struct DAPCodec {
    state: State,
    content_len: usize,
}

impl DAPCodec {
    pub fn new() -> DAPCodec {
        DAPCodec {
            state: State::ReadingHeaders,
            content_len: 0,
        }
    }
}

impl Decoder for DAPCodec {
    type Item = DecoderResult;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::ReadingHeaders => {
                    let Some(terminator) = src.windows(4).position(|w| w == b"\r\n\r\n") else {
                        return Ok(None);
                    };
                    let headers = src.split_to(terminator + 4);
                    let headers = std::str::from_utf8(&headers[..terminator])
                        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                    let mut content_len = None;
                    for line in headers.split('\n') {
                        let line = line.trim_end_matches('\r');
                        if let Some((name, value)) = line.split_once(':') {
                            if name == "Content-Length" {
                                content_len = value.trim().parse::<usize>().ok();
                            }
                        }
                    }
                    match content_len {
                        Some(len) => {
                            self.content_len = len;
                            self.state = State::ReadingBody;
                        }
                        None => {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "No Content-Length header in message frame.",
                            ))
                        }
                    }
                }
                State::ReadingBody => {
                    if src.len() < self.content_len {
                        src.reserve(self.content_len - src.len());
                        return Ok(None);
                    }
                    let body = src.split_to(self.content_len);
                    self.state = State::ReadingHeaders;
                    match serde_json::from_slice::<ProtocolMessage>(&body) {
                        Ok(message) => return Ok(Some(Ok(message))),
                        Err(error) => {
                            return Ok(Some(Err(DecoderError {
                                error,
                                raw: body.to_vec(),
                            })))
                        }
                    }
                }
            }
        }
    }
}

impl Encoder<ProtocolMessage> for DAPCodec {
    type Error = io::Error;

    fn encode(&mut self, message: ProtocolMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&message)?;
        dst.reserve(32 + body.len());
        dst.put_slice(b"Content-Length: ");
        dst.put_slice(body.len().to_string().as_bytes());
        dst.put_slice(b"\r\n\r\n");
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gzdap_protocol::ProtocolMessageType;

    fn make_messages() -> Vec<ProtocolMessage> {
        [
            br#"{"seq":1,"type":"request","command":"initialize","arguments":{"adapterID":"gzdoom"}}"#.as_slice(),
            br#"{"seq":2,"type":"response","request_seq":1,"success":true,"command":"initialize"}"#.as_slice(),
            br#"{"seq":3,"type":"event","event":"initialized"}"#.as_slice(),
        ]
        .iter()
        .map(|raw| serde_json::from_slice(raw).unwrap())
        .collect()
    }

    fn encode_all(messages: &[ProtocolMessage]) -> BytesMut {
        let mut codec = DAPCodec::new();
        let mut buf = BytesMut::new();
        for message in messages {
            codec.encode(message.clone(), &mut buf).unwrap();
        }
        buf
    }

    // Serializing then decoding, with the byte stream split at every possible
    // offset, reproduces the original sequence in order.
    #[test]
    fn test_roundtrip_arbitrary_splits() {
        let messages = make_messages();
        let bytes = encode_all(&messages);

        for split_at in 0..bytes.len() {
            let mut codec = DAPCodec::new();
            let mut buf = BytesMut::new();
            let mut decoded = vec![];

            buf.put_slice(&bytes[..split_at]);
            while let Some(result) = codec.decode(&mut buf).unwrap() {
                decoded.push(result.unwrap());
            }
            buf.put_slice(&bytes[split_at..]);
            while let Some(result) = codec.decode(&mut buf).unwrap() {
                decoded.push(result.unwrap());
            }

            assert_eq!(decoded.len(), messages.len(), "split at {}", split_at);
            for (decoded, original) in decoded.iter().zip(&messages) {
                assert_eq!(decoded.seq, original.seq);
            }
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_multiple_messages_in_one_chunk() {
        let messages = make_messages();
        let mut buf = encode_all(&messages);
        let mut codec = DAPCodec::new();
        for original in &messages {
            let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
            assert_eq!(decoded.seq, original.seq);
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_bare_newline_in_headers() {
        let body = br#"{"seq":7,"type":"event","event":"initialized"}"#;
        let mut buf = BytesMut::new();
        buf.put_slice(format!("User-Agent: gzdoom\nContent-Length: {}\r\n\r\n", body.len()).as_bytes());
        buf.put_slice(body);
        let mut codec = DAPCodec::new();
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(decoded.seq, 7);
    }

    // A bad body is reported with its raw bytes and does not corrupt the
    // framing of the message that follows.
    #[test]
    fn test_bad_json_does_not_poison_framing() {
        let bad = b"{not json";
        let mut buf = BytesMut::new();
        buf.put_slice(format!("Content-Length: {}\r\n\r\n", bad.len()).as_bytes());
        buf.put_slice(bad);
        let good = br#"{"seq":9,"type":"event","event":"initialized"}"#;
        buf.put_slice(format!("Content-Length: {}\r\n\r\n", good.len()).as_bytes());
        buf.put_slice(good);

        let mut codec = DAPCodec::new();
        let first = codec.decode(&mut buf).unwrap().unwrap();
        let err = first.unwrap_err();
        assert_eq!(err.raw, bad.to_vec());

        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(second.seq, 9);
        match second.type_ {
            ProtocolMessageType::Event(event) => assert_eq!(event.event, "initialized"),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
