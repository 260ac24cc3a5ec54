// THEORY:
// An MJPEG camera serves one endless HTTP response of type
// `multipart/x-mixed-replace`. Each section of that body is one JPEG image,
// separated from the next by a boundary line declared in the `Content-Type`
// header. This module turns that byte stream back into whole frames.
//
// Key architectural principles:
// 1.  **Incremental parsing**: Network chunks never line up with sections. The
//     reader keeps a small carry-over buffer and moves every byte that cannot be
//     the start of a delimiter straight into the caller's frame buffer, so a frame
//     is never held twice in memory.
// 2.  **Tolerant framing**: Delimiters are matched after a bare LF with an optional
//     CR, so servers using either line ending work. Anything before the first
//     boundary line (the preamble) is skipped. Section headers are read and ignored.
// 3.  **Strict completeness**: A section is only handed back once its terminating
//     delimiter has been seen. A body that ends or fails mid-section is an error;
//     resuming half a JPEG is meaningless.
// 4.  **Bounded memory**: Header blocks, preambles and section bodies all have
//     upper limits, and a stall timeout turns a silent half-open connection into an
//     error instead of a hang.

use crate::core_modules::buffer_pool::RawFrameBuffer;
use crate::error::{MultipartError, StreamError};
use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::io;
use std::time::Duration;

/// Upper bound for a section's header block, and for the preamble.
const MAX_HEADER_BYTES: usize = 8 * 1024;
pub const DEFAULT_MAX_PART_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Extracts the multipart boundary token from a `Content-Type` header value.
///
/// Leading hyphens are stripped because cameras disagree on whether the
/// declared boundary already includes the `--` delimiter prefix.
pub fn boundary_from_content_type(content_type: &str) -> Result<String, StreamError> {
    let bad = |reason| StreamError::ContentType {
        content_type: content_type.to_string(),
        reason,
    };

    let (media_type, params) = content_type.split_once(';').unwrap_or((content_type, ""));
    if !media_type.trim().to_ascii_lowercase().starts_with("multipart/") {
        return Err(bad("not a multipart media type"));
    }

    let boundary = params
        .split(';')
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').trim_start_matches('-'))
        .ok_or_else(|| bad("missing boundary parameter"))?;

    if boundary.is_empty() {
        return Err(bad("empty boundary"));
    }
    Ok(boundary.to_string())
}

/// Size and time limits applied while reading sections.
#[derive(Debug, Clone, Copy)]
pub struct PartLimits {
    pub max_part_size: usize,
    pub stall_timeout: Duration,
}

impl Default for PartLimits {
    fn default() -> Self {
        Self {
            max_part_size: DEFAULT_MAX_PART_SIZE,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }
}

enum ReaderState {
    /// Before the first boundary line.
    Preamble,
    /// Positioned at the header block of the next section.
    Headers,
    /// Close delimiter seen, or the body ended between sections.
    Done,
}

/// Splits a multipart body stream into sections.
pub struct MultipartReader<S> {
    body: S,
    buf: BytesMut,
    /// `--boundary`, as it appears on a delimiter line.
    dash_boundary: Vec<u8>,
    /// `\n--boundary`, the delimiter searched for inside a section body.
    nl_dash_boundary: Vec<u8>,
    limits: PartLimits,
    state: ReaderState,
}

impl<S> MultipartReader<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    pub fn new(body: S, boundary: &str, limits: PartLimits) -> Self {
        let dash_boundary = [b"--".as_slice(), boundary.as_bytes()].concat();
        let nl_dash_boundary = [b"\n".as_slice(), &dash_boundary].concat();
        Self {
            body,
            buf: BytesMut::with_capacity(64 * 1024),
            dash_boundary,
            nl_dash_boundary,
            limits,
            state: ReaderState::Preamble,
        }
    }

    /// Reads the next section body into `out`.
    ///
    /// Returns `Ok(false)` once the body is finished (close delimiter or a clean
    /// end between sections). On error `out` may hold a partial section and must
    /// not be forwarded.
    pub async fn next_part(&mut self, out: &mut RawFrameBuffer) -> Result<bool, MultipartError> {
        if matches!(self.state, ReaderState::Preamble) {
            self.state = if self.skip_preamble().await? {
                ReaderState::Headers
            } else {
                ReaderState::Done
            };
        }
        if matches!(self.state, ReaderState::Done) {
            return Ok(false);
        }

        if !self.skip_headers().await? {
            self.state = ReaderState::Done;
            return Ok(false);
        }
        self.read_body(out).await?;
        Ok(true)
    }

    /// Skips to the first delimiter line. `false` if the body closes first.
    async fn skip_preamble(&mut self) -> Result<bool, MultipartError> {
        let mut skipped = 0;
        loop {
            let Some(line) = self.read_line().await? else {
                return Ok(false);
            };
            let trimmed = trim_line_end(&line);
            if trimmed == self.dash_boundary.as_slice() {
                return Ok(true);
            }
            if trimmed.starts_with(&self.dash_boundary) && trimmed.ends_with(b"--") {
                return Ok(false);
            }

            skipped += line.len();
            if skipped > MAX_HEADER_BYTES {
                let shown = &trimmed[..trimmed.len().min(64)];
                return Err(MultipartError::MissingBoundary(
                    String::from_utf8_lossy(shown).into_owned(),
                ));
            }
        }
    }

    async fn skip_headers(&mut self) -> Result<bool, MultipartError> {
        let mut consumed = 0;
        loop {
            let Some(line) = self.read_line().await? else {
                return if consumed == 0 {
                    Ok(false)
                } else {
                    Err(MultipartError::UnexpectedEof)
                };
            };
            consumed += line.len();
            if consumed > MAX_HEADER_BYTES {
                return Err(MultipartError::HeadersTooLarge(MAX_HEADER_BYTES));
            }
            if trim_line_end(&line).is_empty() {
                return Ok(true);
            }
        }
    }

    async fn read_body(&mut self, out: &mut RawFrameBuffer) -> Result<(), MultipartError> {
        loop {
            if let Some(pos) = find(&self.buf, &self.nl_dash_boundary) {
                let mut end = pos;
                if end > 0 && self.buf[end - 1] == b'\r' {
                    end -= 1;
                }
                self.drain_into(out, end)?;
                self.buf.advance(pos - end + self.nl_dash_boundary.len());
                return self.finish_delimiter_line().await;
            }

            // Keep a tail long enough to hold a delimiter split across chunks,
            // including the CR in front of it.
            let safe = self.buf.len().saturating_sub(self.nl_dash_boundary.len());
            self.drain_into(out, safe)?;

            if !self.fill().await? {
                return Err(MultipartError::UnexpectedEof);
            }
        }
    }

    /// Consumes the remainder of a delimiter line: `--` marks the close delimiter.
    async fn finish_delimiter_line(&mut self) -> Result<(), MultipartError> {
        match self.read_line().await? {
            Some(rest) if trim_line_end(&rest).starts_with(b"--") => {
                self.state = ReaderState::Done;
            }
            Some(_) => self.state = ReaderState::Headers,
            None => self.state = ReaderState::Done,
        }
        Ok(())
    }

    fn drain_into(&mut self, out: &mut RawFrameBuffer, len: usize) -> Result<(), MultipartError> {
        if out.len() + len > self.limits.max_part_size {
            return Err(MultipartError::PartTooLarge(self.limits.max_part_size));
        }
        out.extend_from_slice(&self.buf[..len]);
        self.buf.advance(len);
        Ok(())
    }

    /// Next line including its terminator. `None` at a clean end of body.
    async fn read_line(&mut self) -> Result<Option<Bytes>, MultipartError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                return Ok(Some(self.buf.split_to(pos + 1).freeze()));
            }
            if self.buf.len() > MAX_HEADER_BYTES {
                return Err(MultipartError::HeadersTooLarge(MAX_HEADER_BYTES));
            }
            if !self.fill().await? {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(MultipartError::UnexpectedEof)
                };
            }
        }
    }

    async fn fill(&mut self) -> Result<bool, MultipartError> {
        match tokio::time::timeout(self.limits.stall_timeout, self.body.next()).await {
            Err(_) => Err(MultipartError::Stalled(self.limits.stall_timeout)),
            Ok(Some(Ok(chunk))) => {
                self.buf.extend_from_slice(&chunk);
                Ok(true)
            }
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(None) => Ok(false),
        }
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &line[..end]
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::buffer_pool::BufferPool;
    use futures::stream;

    fn body_stream(
        body: &[u8],
        chunk_size: usize,
    ) -> impl Stream<Item = io::Result<Bytes>> + Unpin + use<> {
        let chunks: Vec<io::Result<Bytes>> = body
            .chunks(chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(chunks)
    }

    async fn collect_parts<S>(reader: &mut MultipartReader<S>) -> Result<Vec<Vec<u8>>, MultipartError>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let pool = BufferPool::default();
        let mut parts = Vec::new();
        loop {
            let mut buffer = pool.acquire();
            if !reader.next_part(&mut buffer).await? {
                return Ok(parts);
            }
            parts.push(buffer.as_slice().to_vec());
            pool.release(buffer);
        }
    }

    const CAMERA_BODY: &[u8] = b"--frame\r\n\
Content-Type: image/jpeg\r\n\
Content-Length: 5\r\n\
\r\n\
\xFF\xD8AB\xFF\r\n\
--frame\r\n\
Content-Type: image/jpeg\r\n\
\r\n\
\xFF\xD8\r\n--fr\xFF\xD9\r\n\
--frame--\r\n";

    #[test]
    fn boundary_is_extracted_and_hyphens_stripped() {
        let plain = boundary_from_content_type("multipart/x-mixed-replace; boundary=frame").unwrap();
        assert_eq!(plain, "frame");

        let prefixed =
            boundary_from_content_type("multipart/x-mixed-replace;boundary=--myboundary").unwrap();
        assert_eq!(prefixed, "myboundary");

        let quoted =
            boundary_from_content_type(r#"Multipart/X-Mixed-Replace; charset=x; Boundary="--ab cd""#)
                .unwrap();
        assert_eq!(quoted, "ab cd");
    }

    #[test]
    fn content_type_without_usable_boundary_is_rejected() {
        for value in [
            "image/jpeg",
            "multipart/x-mixed-replace",
            "multipart/x-mixed-replace; boundary=",
            "multipart/x-mixed-replace; boundary=----",
            "",
        ] {
            assert!(
                matches!(
                    boundary_from_content_type(value),
                    Err(StreamError::ContentType { .. })
                ),
                "{value:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn sections_are_split_regardless_of_chunking() {
        for chunk_size in [1, 3, 7, 64, CAMERA_BODY.len()] {
            let mut reader =
                MultipartReader::new(body_stream(CAMERA_BODY, chunk_size), "frame", PartLimits::default());
            let parts = collect_parts(&mut reader).await.unwrap();
            assert_eq!(
                parts,
                vec![b"\xFF\xD8AB\xFF".to_vec(), b"\xFF\xD8\r\n--fr\xFF\xD9".to_vec()],
                "chunk size {chunk_size}"
            );
        }
    }

    #[tokio::test]
    async fn preamble_and_bare_newlines_are_accepted() {
        let body = b"camera preamble\n--cam\nContent-Type: image/jpeg\n\nJPEG1\n--cam\n\nJPEG2\n--cam--\n";
        let mut reader = MultipartReader::new(body_stream(body, 4), "cam", PartLimits::default());
        let parts = collect_parts(&mut reader).await.unwrap();
        assert_eq!(parts, vec![b"JPEG1".to_vec(), b"JPEG2".to_vec()]);
    }

    #[tokio::test]
    async fn truncated_section_is_an_error() {
        let body = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8partial jpeg";
        let mut reader = MultipartReader::new(body_stream(body, 5), "frame", PartLimits::default());
        let pool = BufferPool::default();
        let mut buffer = pool.acquire();
        let result = reader.next_part(&mut buffer).await;
        assert!(matches!(result, Err(MultipartError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn body_without_declared_boundary_never_yields_a_section() {
        let mut body = Vec::new();
        for _ in 0..2_000 {
            body.extend_from_slice(b"--other\r\n\r\nnot our frame\r\n");
        }
        let mut reader = MultipartReader::new(body_stream(&body, 512), "frame", PartLimits::default());
        let result = collect_parts(&mut reader).await;
        assert!(matches!(result, Err(MultipartError::MissingBoundary(_))));
    }

    #[tokio::test]
    async fn oversized_section_is_rejected() {
        let mut body = b"--frame\r\n\r\n".to_vec();
        body.extend(std::iter::repeat_n(0xAB, 10_000));
        body.extend_from_slice(b"\r\n--frame--\r\n");
        let limits = PartLimits {
            max_part_size: 4_096,
            ..PartLimits::default()
        };
        let mut reader = MultipartReader::new(body_stream(&body, 1_000), "frame", limits);
        let result = collect_parts(&mut reader).await;
        assert!(matches!(result, Err(MultipartError::PartTooLarge(4_096))));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_body_times_out() {
        let limits = PartLimits {
            stall_timeout: Duration::from_secs(5),
            ..PartLimits::default()
        };
        let mut reader = MultipartReader::new(stream::pending::<io::Result<Bytes>>(), "frame", limits);
        let pool = BufferPool::default();
        let mut buffer = pool.acquire();
        let result = reader.next_part(&mut buffer).await;
        assert!(matches!(result, Err(MultipartError::Stalled(d)) if d == Duration::from_secs(5)));
    }
}
