use serde::Serialize;
use serde_json::Value;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    Line,
    Framed,
}

impl FramingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FramingMode::Line => "line",
            FramingMode::Framed => "framed",
        }
    }

    fn detect(first_line: &[u8]) -> Self {
        if first_line.trim_ascii_start().starts_with(b"{") {
            FramingMode::Line
        } else {
            FramingMode::Framed
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("unexpected EOF while reading headers")]
    EofInHeaders,

    #[error("missing Content-Length header (and not JSON line mode)")]
    MissingContentLength,

    #[error("invalid Content-Length header: {value:?}")]
    InvalidContentLength { value: String },

    #[error("message exceeds maximum size of {max_bytes} bytes")]
    MessageTooLarge { max_bytes: usize },

    #[error("unexpected EOF while reading message body (expected {expected} bytes, got {actual})")]
    TruncatedBody { expected: usize, actual: usize },

    #[error("malformed JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("framing mode is not known until a message has been read")]
    ModeUnknown,

    #[error("stdio error: {0}")]
    Io(#[from] io::Error),
}

impl FramingError {
    pub fn is_io(&self) -> bool {
        matches!(self, FramingError::Io(_))
    }
}

pub struct FrameReader<R> {
    inner: R,
    mode: Option<FramingMode>,
    max_message_bytes: usize,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limit(inner, MAX_MESSAGE_BYTES)
    }

    pub fn with_limit(inner: R, max_message_bytes: usize) -> Self {
        Self {
            inner,
            mode: None,
            max_message_bytes,
        }
    }

    pub fn mode(&self) -> Option<FramingMode> {
        self.mode
    }

    /// Returns `Ok(None)` on a clean end of stream between messages.
    pub async fn read_message(&mut self) -> Result<Option<Value>, FramingError> {
        let mut line = Vec::new();
        loop {
            if self.read_line_limited(&mut line).await? == 0 {
                return Ok(None);
            }
            if !line.trim_ascii().is_empty() {
                break;
            }
        }

        let mode = match self.mode {
            Some(mode) => mode,
            None => {
                let mode = FramingMode::detect(&line);
                self.mode = Some(mode);
                tracing::info!(mode = mode.as_str(), "detected stdio framing mode");
                mode
            }
        };

        match mode {
            FramingMode::Line => Ok(Some(serde_json::from_slice(line.trim_ascii())?)),
            FramingMode::Framed => {
                let body = self.read_framed_body(line).await?;
                Ok(Some(serde_json::from_slice(&body)?))
            }
        }
    }

    async fn read_framed_body(&mut self, first_line: Vec<u8>) -> Result<Vec<u8>, FramingError> {
        let mut content_length: Option<usize> = None;
        let mut bad_header: Option<FramingError> = None;
        let mut line = first_line;
        loop {
            let header = String::from_utf8_lossy(&line).into_owned();
            let header = header.trim_end_matches(['\r', '\n']);
            if header.is_empty() {
                break;
            }
            match parse_content_length(header) {
                Ok(Some(parsed)) => content_length = Some(parsed),
                Ok(None) => {}
                Err(e) => {
                    bad_header.get_or_insert(e);
                }
            }
            if self.read_line_limited(&mut line).await? == 0 {
                return Err(FramingError::EofInHeaders);
            }
        }
        // The header block is consumed, so the next read starts on a fresh frame.
        if let Some(e) = bad_header {
            return Err(e);
        }

        let expected = content_length.ok_or(FramingError::MissingContentLength)?;
        if expected > self.max_message_bytes {
            let mut body = (&mut self.inner).take(expected as u64);
            tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
            return Err(FramingError::MessageTooLarge {
                max_bytes: self.max_message_bytes,
            });
        }

        let mut body = Vec::with_capacity(expected);
        (&mut self.inner)
            .take(expected as u64)
            .read_to_end(&mut body)
            .await?;
        if body.len() != expected {
            return Err(FramingError::TruncatedBody {
                expected,
                actual: body.len(),
            });
        }
        Ok(body)
    }

    async fn read_line_limited(&mut self, buf: &mut Vec<u8>) -> Result<usize, FramingError> {
        buf.clear();
        let limit = self.max_message_bytes as u64 + 1;
        let n = (&mut self.inner).take(limit).read_until(b'\n', buf).await?;
        if buf.len() > self.max_message_bytes && !buf.ends_with(b"\n") {
            self.discard_rest_of_line().await?;
            return Err(FramingError::MessageTooLarge {
                max_bytes: self.max_message_bytes,
            });
        }
        Ok(n)
    }

    async fn discard_rest_of_line(&mut self) -> Result<(), FramingError> {
        let mut sink = Vec::new();
        loop {
            sink.clear();
            let n = (&mut self.inner)
                .take(64 * 1024)
                .read_until(b'\n', &mut sink)
                .await?;
            if n == 0 || sink.ends_with(b"\n") {
                return Ok(());
            }
        }
    }
}

fn parse_content_length(header: &str) -> Result<Option<usize>, FramingError> {
    let Some((key, value)) = header.split_once(':') else {
        return Ok(None);
    };
    if !key.trim().eq_ignore_ascii_case("content-length") {
        return Ok(None);
    }
    let value = value.trim();
    value
        .parse::<usize>()
        .map(Some)
        .map_err(|_| FramingError::InvalidContentLength {
            value: value.to_string(),
        })
}

pub async fn write_frame<W, T>(writer: &mut W, mode: FramingMode, message: &T) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let body = encode_ascii_json(message)?;
    match mode {
        FramingMode::Line => {
            writer.write_all(&body).await?;
            writer.write_all(b"\n").await?;
        }
        FramingMode::Framed => {
            let header = format!("Content-Length: {}\r\n\r\n", body.len());
            writer.write_all(header.as_bytes()).await?;
            writer.write_all(&body).await?;
        }
    }
    writer.flush().await?;
    Ok(())
}

pub struct Transport<R, W> {
    reader: FrameReader<R>,
    writer: W,
}

impl<R, W> Transport<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self::from_reader(FrameReader::new(reader), writer)
    }

    pub fn from_reader(reader: FrameReader<R>, writer: W) -> Self {
        Self { reader, writer }
    }

    pub fn mode(&self) -> Option<FramingMode> {
        self.reader.mode()
    }

    pub async fn read_message(&mut self) -> Result<Option<Value>, FramingError> {
        self.reader.read_message().await
    }

    pub async fn write_message<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<(), FramingError> {
        let mode = self.reader.mode().ok_or(FramingError::ModeUnknown)?;
        write_frame(&mut self.writer, mode, message).await
    }

    pub fn into_writer(self) -> W {
        self.writer
    }
}

pub fn encode_ascii_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = Vec::with_capacity(128);
    let mut ser = serde_json::Serializer::with_formatter(&mut out, AsciiFormatter);
    value.serialize(&mut ser)?;
    Ok(out)
}

struct AsciiFormatter;

impl serde_json::ser::Formatter for AsciiFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let bytes = fragment.as_bytes();
        let mut start = 0;
        for (i, ch) in fragment.char_indices() {
            if ch.is_ascii() {
                continue;
            }
            writer.write_all(&bytes[start..i])?;
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                write!(writer, "\\u{unit:04x}")?;
            }
            start = i + ch.len_utf8();
        }
        writer.write_all(&bytes[start..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn line_mode_is_detected_from_leading_brace() {
        let input: &[u8] = b"{\"id\":1,\"method\":\"ping\"}\n{\"id\":2,\"method\":\"ping\"}\n";
        let mut reader = FrameReader::new(input);

        let first = reader.read_message().await.unwrap().unwrap();
        assert_eq!(first["id"], json!(1));
        assert_eq!(reader.mode(), Some(FramingMode::Line));

        let second = reader.read_message().await.unwrap().unwrap();
        assert_eq!(second["id"], json!(2));
        assert_eq!(reader.mode(), Some(FramingMode::Line));

        assert!(reader.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn framed_mode_reads_exact_body_with_any_header_case() {
        let body = br#"{"id":"x","method":"tools/list"}"#;
        let mut input = format!(
            "content-type: application/json\r\nCONTENT-LENGTH: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        input.extend_from_slice(body);
        input.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
        input.extend_from_slice(body);

        let mut reader = FrameReader::new(&input[..]);
        let first = reader.read_message().await.unwrap().unwrap();
        assert_eq!(first["method"], json!("tools/list"));
        assert_eq!(reader.mode(), Some(FramingMode::Framed));
        let second = reader.read_message().await.unwrap().unwrap();
        assert_eq!(second["id"], json!("x"));
        assert!(reader.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_stream_is_a_clean_shutdown() {
        let mut reader = FrameReader::new(&b""[..]);
        assert!(reader.read_message().await.unwrap().is_none());
        assert_eq!(reader.mode(), None);

        let mut reader = FrameReader::new(&b"\n\r\n"[..]);
        assert!(reader.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_headers_is_an_error() {
        let mut reader = FrameReader::new(&b"Content-Length: 10\r\n"[..]);
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, FramingError::EofInHeaders));
    }

    #[tokio::test]
    async fn short_body_is_an_error() {
        let mut reader = FrameReader::new(&b"Content-Length: 50\r\n\r\n{\"id\":1}"[..]);
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(
            err,
            FramingError::TruncatedBody {
                expected: 50,
                actual: 8
            }
        ));
    }

    #[tokio::test]
    async fn headers_without_content_length_are_rejected() {
        let mut reader = FrameReader::new(&b"X-Foo: bar\r\n\r\n{}"[..]);
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, FramingError::MissingContentLength));

        let mut reader = FrameReader::new(&b"Content-Length: abc\r\n\r\n{}"[..]);
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, FramingError::InvalidContentLength { .. }));
    }

    #[tokio::test]
    async fn framed_stream_is_never_reinterpreted_as_lines() {
        let body = br#"{"id":1,"method":"ping"}"#;
        let mut input = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        input.extend_from_slice(body);
        input.extend_from_slice(b"\n{\"id\":2,\"method\":\"ping\"}\n");

        let mut reader = FrameReader::new(&input[..]);
        reader.read_message().await.unwrap().unwrap();
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, FramingError::EofInHeaders));
        assert_eq!(reader.mode(), Some(FramingMode::Framed));
    }

    #[tokio::test]
    async fn oversized_messages_are_rejected_and_skipped() {
        let mut input = Vec::new();
        input.extend_from_slice(b"{\"pad\":\"");
        input.extend(std::iter::repeat_n(b'a', 100));
        input.extend_from_slice(b"\"}\n{\"id\":3,\"method\":\"ping\"}\n");

        let mut reader = FrameReader::with_limit(&input[..], 64);
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, FramingError::MessageTooLarge { max_bytes: 64 }));
        let next = reader.read_message().await.unwrap().unwrap();
        assert_eq!(next["id"], json!(3));

        let mut reader = FrameReader::with_limit(&b"Content-Length: 65\r\n\r\n"[..], 64);
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, FramingError::MessageTooLarge { .. }));
    }

    fn framed(body: &str) -> String {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body)
    }

    #[tokio::test]
    async fn oversized_frame_body_is_skipped_whole() {
        let mut input = b"Content-Length: 100\r\n\r\n".to_vec();
        input.extend(std::iter::repeat_n(b'x', 100));
        input.extend_from_slice(framed(r#"{"id":2,"method":"ping"}"#).as_bytes());

        let mut reader = FrameReader::with_limit(&input[..], 64);
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, FramingError::MessageTooLarge { max_bytes: 64 }));
        let next = reader.read_message().await.unwrap().unwrap();
        assert_eq!(next["id"], json!(2));
        assert!(reader.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bad_content_length_consumes_its_header_block() {
        let mut input = b"Content-Length: abc\r\nX-Trace: 1\r\n\r\n".to_vec();
        input.extend_from_slice(framed(r#"{"id":3,"method":"ping"}"#).as_bytes());

        let mut reader = FrameReader::new(&input[..]);
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, FramingError::InvalidContentLength { ref value } if value == "abc"));
        let next = reader.read_message().await.unwrap().unwrap();
        assert_eq!(next["id"], json!(3));
    }

    #[tokio::test]
    async fn writer_mirrors_detected_mode() {
        let mut transport = Transport::new(&b"{\"id\":1,\"method\":\"ping\"}\n"[..], Vec::new());
        assert!(matches!(
            transport.write_message(&json!({})).await,
            Err(FramingError::ModeUnknown)
        ));
        transport.read_message().await.unwrap();
        transport.write_message(&json!({ "id": 1 })).await.unwrap();
        assert_eq!(transport.into_writer(), b"{\"id\":1}\n");

        let framed = b"Content-Length: 2\r\n\r\n{}";
        let mut transport = Transport::new(&framed[..], Vec::new());
        transport.read_message().await.unwrap();
        transport.write_message(&json!({ "id": 1 })).await.unwrap();
        assert_eq!(transport.into_writer(), b"Content-Length: 8\r\n\r\n{\"id\":1}");
    }

    #[test]
    fn non_ascii_is_escaped() {
        let encoded = encode_ascii_json(&json!({ "text": "café 😀" })).unwrap();
        assert!(encoded.is_ascii());
        assert_eq!(
            String::from_utf8(encoded.clone()).unwrap(),
            r#"{"text":"caf\u00e9 \ud83d\ude00"}"#
        );
        let decoded: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded["text"], json!("café 😀"));
    }
}
