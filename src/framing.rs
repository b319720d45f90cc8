/// HTTP/1.x 消息分帧
///
/// 在没有外部帧格式的字节流中定位一条 HTTP 消息的边界：头部以空行结束，
/// 消息体由 `Content-Length` 或 chunked 终止块界定。读过边界的字节保留在
/// 分帧器内部，作为同一连接上下一条消息的开头。
use bytes::{Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// HTTP 头部最大大小（默认 8KB）
pub const DEFAULT_MAX_HEADER_SIZE: usize = 8 * 1024;

/// 单次从数据源读取的字节数
const READ_CHUNK_SIZE: usize = 4096;

/// 头部与消息体之间的分隔符
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// chunked 编码的终止块（前导 CRLF 属于上一个块或头部）
const CHUNKED_TERMINATOR: &[u8] = b"\r\n0\r\n\r\n";

/// 分帧错误
#[derive(Error, Debug)]
pub enum FrameError {
    /// 数据源在消息的第一个字节之前关闭
    #[error("Source closed before the message started")]
    SourceClosed,

    /// 数据源在头部结束之前关闭
    #[error("Source closed inside the header block after {received} bytes")]
    IncompleteHeaders { received: usize },

    /// 数据源在消息体结束之前关闭
    #[error("Source closed inside the body after {received} bytes (expected: {expected:?})")]
    IncompleteBody {
        expected: Option<u64>,
        received: u64,
    },

    /// 头部超过大小限制
    #[error("Header block exceeds {limit} bytes")]
    HeadersTooLarge { limit: usize },

    /// 消息体超过大小限制
    #[error("Body exceeds {limit} bytes")]
    BodyTooLarge { limit: u64 },

    /// 底层读取错误
    #[error("Read error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// 数据源提前关闭（包括一个字节都没有读到的情况）
    pub fn is_premature_close(&self) -> bool {
        matches!(
            self,
            Self::SourceClosed | Self::IncompleteHeaders { .. } | Self::IncompleteBody { .. }
        )
    }
}

/// 消息体的界定方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// 只有头部
    None,
    /// 固定长度
    Length(u64),
    /// chunked 传输编码
    Chunked,
}

impl BodyFraming {
    /// 从头部块中识别消息体的界定方式（头部名称不区分大小写）
    ///
    /// chunked 优先于 `Content-Length`；无法解析的长度按没有消息体处理。
    pub fn from_headers(head: &[u8]) -> Self {
        let text = String::from_utf8_lossy(head);
        let mut content_length = None;

        for line in text.split("\r\n").skip(1) {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim();

            if name.eq_ignore_ascii_case("transfer-encoding") {
                if value
                    .split(',')
                    .any(|enc| enc.trim().eq_ignore_ascii_case("chunked"))
                {
                    return Self::Chunked;
                }
            } else if name.eq_ignore_ascii_case("content-length") && content_length.is_none() {
                content_length = value.trim().parse::<u64>().ok();
            }
        }

        match content_length {
            Some(len) => Self::Length(len),
            None => Self::None,
        }
    }
}

/// 一条完整消息的分帧结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSummary {
    pub framing: BodyFraming,
    pub header_len: usize,
    pub body_len: u64,
}

impl FrameSummary {
    /// 消息总字节数
    pub fn total_len(&self) -> u64 {
        self.header_len as u64 + self.body_len
    }
}

/// 解析响应状态行中的状态码
pub fn response_status(head: &[u8]) -> Option<u16> {
    let line_end = find(head, b"\r\n").unwrap_or(head.len());
    let line = std::str::from_utf8(&head[..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// 这些状态码的响应永远没有消息体
fn is_bodyless_status(head: &[u8]) -> bool {
    matches!(response_status(head), Some(100..=199 | 204 | 304))
}

/// 有状态的消息分帧器
///
/// 每条连接持有一个分帧器；两次调用之间，读过消息边界的字节保存在内部缓冲区。
#[derive(Debug)]
pub struct MessageFramer {
    buffer: BytesMut,
    max_header_size: usize,
    max_body_size: Option<u64>,
}

impl MessageFramer {
    /// 创建新的分帧器
    pub fn new(max_header_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            max_header_size,
            max_body_size: None,
        }
    }

    /// 限制消息体大小
    ///
    /// 声明的 `Content-Length` 超限时读完头部立即失败，chunked 消息体在累计超限时失败。
    pub fn with_body_limit(mut self, limit: u64) -> Self {
        self.max_body_size = Some(limit);
        self
    }

    /// 使用已经读到的字节作为流的开头
    pub fn with_prefix(prefix: &[u8], max_header_size: usize) -> Self {
        let mut framer = Self::new(max_header_size);
        framer.buffer.extend_from_slice(prefix);
        framer
    }

    /// 缓冲区中尚未归属任何消息的字节数
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// 取走缓冲区中尚未归属任何消息的字节
    pub fn take_buffered(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    /// 读取一条完整的请求
    pub async fn read_request<R, F>(&mut self, reader: &mut R, emit: F) -> Result<FrameSummary, FrameError>
    where
        R: AsyncRead + Unpin,
        F: FnMut(Bytes),
    {
        self.read_message(reader, |_| false, emit).await
    }

    /// 读取一条完整的响应
    ///
    /// `HEAD` 请求的响应以及 1xx/204/304 响应只有头部。
    pub async fn read_response<R, F>(
        &mut self,
        reader: &mut R,
        request_method: &str,
        emit: F,
    ) -> Result<FrameSummary, FrameError>
    where
        R: AsyncRead + Unpin,
        F: FnMut(Bytes),
    {
        let head_request = request_method.eq_ignore_ascii_case("HEAD");
        self.read_message(reader, move |head| head_request || is_bodyless_status(head), emit)
            .await
    }

    /// 读取一条消息，按到达顺序通过 `emit` 输出各个片段
    ///
    /// 第一个片段总是完整的头部块。出错时已经读到的部分数据也会先输出。
    async fn read_message<R, B, F>(
        &mut self,
        reader: &mut R,
        bodyless: B,
        mut emit: F,
    ) -> Result<FrameSummary, FrameError>
    where
        R: AsyncRead + Unpin,
        B: FnOnce(&[u8]) -> bool,
        F: FnMut(Bytes),
    {
        let header_len = self.read_head(reader, &mut emit).await?;
        let head = self.buffer.split_to(header_len).freeze();

        let framing = if bodyless(&head) {
            BodyFraming::None
        } else {
            BodyFraming::from_headers(&head)
        };
        emit(head);

        if let (BodyFraming::Length(len), Some(limit)) = (framing, self.max_body_size) {
            if len > limit {
                return Err(FrameError::BodyTooLarge { limit });
            }
        }

        let body_len = match framing {
            BodyFraming::None => 0,
            BodyFraming::Length(len) => self.read_fixed_body(reader, len, &mut emit).await?,
            BodyFraming::Chunked => self.read_chunked_body(reader, &mut emit).await?,
        };

        Ok(FrameSummary {
            framing,
            header_len,
            body_len,
        })
    }

    /// 读到头部分隔符为止，返回头部块长度（包含分隔符）
    async fn read_head<R, F>(&mut self, reader: &mut R, emit: &mut F) -> Result<usize, FrameError>
    where
        R: AsyncRead + Unpin,
        F: FnMut(Bytes),
    {
        let mut scanned = 0;
        loop {
            if let Some(pos) = find(&self.buffer[scanned..], HEADER_TERMINATOR) {
                return Ok(scanned + pos + HEADER_TERMINATOR.len());
            }
            scanned = self
                .buffer
                .len()
                .saturating_sub(HEADER_TERMINATOR.len() - 1);

            if self.buffer.len() > self.max_header_size {
                emit(self.buffer.split().freeze());
                return Err(FrameError::HeadersTooLarge {
                    limit: self.max_header_size,
                });
            }

            if self.fill(reader).await? == 0 {
                if self.buffer.is_empty() {
                    return Err(FrameError::SourceClosed);
                }
                let received = self.buffer.len();
                emit(self.buffer.split().freeze());
                return Err(FrameError::IncompleteHeaders { received });
            }
        }
    }

    async fn read_fixed_body<R, F>(
        &mut self,
        reader: &mut R,
        len: u64,
        emit: &mut F,
    ) -> Result<u64, FrameError>
    where
        R: AsyncRead + Unpin,
        F: FnMut(Bytes),
    {
        let mut received = 0u64;
        loop {
            let wanted = len - received;
            if wanted == 0 {
                return Ok(received);
            }

            if !self.buffer.is_empty() {
                let take = (self.buffer.len() as u64).min(wanted) as usize;
                emit(self.buffer.split_to(take).freeze());
                received += take as u64;
                continue;
            }

            if self.fill(reader).await? == 0 {
                return Err(FrameError::IncompleteBody {
                    expected: Some(len),
                    received,
                });
            }
        }
    }

    async fn read_chunked_body<R, F>(&mut self, reader: &mut R, emit: &mut F) -> Result<u64, FrameError>
    where
        R: AsyncRead + Unpin,
        F: FnMut(Bytes),
    {
        let mut scanner = ChunkedTerminator::new();
        let mut received = 0u64;
        loop {
            if !self.buffer.is_empty() {
                match scanner.feed(&self.buffer) {
                    Some(end) => {
                        emit(self.buffer.split_to(end).freeze());
                        return Ok(received + end as u64);
                    }
                    None => {
                        received += self.buffer.len() as u64;
                        emit(self.buffer.split().freeze());
                        if let Some(limit) = self.max_body_size.filter(|&limit| received > limit) {
                            return Err(FrameError::BodyTooLarge { limit });
                        }
                    }
                }
            }

            if self.fill(reader).await? == 0 {
                return Err(FrameError::IncompleteBody {
                    expected: None,
                    received,
                });
            }
        }
    }

    async fn fill<R>(&mut self, reader: &mut R) -> io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        self.buffer.reserve(READ_CHUNK_SIZE);
        reader.read_buf(&mut self.buffer).await
    }
}

/// 跨读取边界检测 chunked 终止块
///
/// 只做结构检测，不解码块长度。
struct ChunkedTerminator {
    tail: Vec<u8>,
}

impl ChunkedTerminator {
    fn new() -> Self {
        // 头部以 CRLF 结束，消息体本身可以直接是终止块
        Self {
            tail: b"\r\n".to_vec(),
        }
    }

    /// 返回终止块结束位置（相对 `data`），未找到时记住末尾字节
    fn feed(&mut self, data: &[u8]) -> Option<usize> {
        let keep = CHUNKED_TERMINATOR.len() - 1;

        let mut boundary = self.tail.clone();
        boundary.extend_from_slice(&data[..data.len().min(keep)]);
        if let Some(pos) = find(&boundary, CHUNKED_TERMINATOR) {
            return Some(pos + CHUNKED_TERMINATOR.len() - self.tail.len());
        }
        if let Some(pos) = find(data, CHUNKED_TERMINATOR) {
            return Some(pos + CHUNKED_TERMINATOR.len());
        }

        self.tail = if data.len() >= keep {
            data[data.len() - keep..].to_vec()
        } else {
            boundary[boundary.len().saturating_sub(keep)..].to_vec()
        };
        None
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
