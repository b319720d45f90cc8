/// 代理与隧道对端之间的线路协议
///
/// 注册握手、固定响应以及请求行解析。隧道本身不加任何额外帧格式，
/// 请求和响应都是原样的 HTTP/1.x 消息。
use bytes::Bytes;

/// 默认注册路径
pub const DEFAULT_REGISTER_PATH: &str = "/register";

/// 注册成功后返回给隧道对端的确认消息正文
const REGISTRATION_BODY: &str = "Tunnel registered\n";

/// 无可用隧道时返回给客户端的正文
const NO_TUNNEL_BODY: &str = "No tunnel is open";

/// 隧道对端本地服务不可用时的正文
const BAD_GATEWAY_BODY: &str = "Local service unavailable";

/// 请求头超过上限时的正文
const HEADERS_TOO_LARGE_BODY: &str = "Request header block too large";

/// 请求体超过上限时的正文
const PAYLOAD_TOO_LARGE_BODY: &str = "Request body too large";

/// HTTP 请求行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub path: String,
    pub version: Option<String>,
}

impl RequestLine {
    /// 从连接上读到的第一块数据中解析请求行
    ///
    /// 少于两个空白分隔的字段时返回 `None`。
    pub fn parse(data: &[u8]) -> Option<Self> {
        let line_end = data
            .iter()
            .position(|&b| b == b'\n')
            .unwrap_or(data.len());
        let line = String::from_utf8_lossy(&data[..line_end]);

        let mut parts = line.split_whitespace();
        let method = parts.next()?;
        let path = parts.next()?;
        let version = parts.next();

        Some(Self {
            method: method.to_string(),
            path: path.to_string(),
            version: version.map(str::to_string),
        })
    }

    /// 是否为注册请求
    pub fn is_registration(&self, register_path: &str) -> bool {
        self.path == register_path
    }
}

/// 注册确认响应
pub fn registration_confirmation() -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n{}",
        REGISTRATION_BODY.len(),
        REGISTRATION_BODY
    ))
}

/// 无可用隧道时的 503 响应
pub fn service_unavailable() -> Bytes {
    plain_response("503 Service Unavailable", NO_TUNNEL_BODY)
}

/// 本地服务不可用时的 502 响应（由隧道对端生成）
pub fn bad_gateway() -> Bytes {
    plain_response("502 Bad Gateway", BAD_GATEWAY_BODY)
}

/// 请求头过大时的 431 响应
pub fn headers_too_large() -> Bytes {
    plain_response("431 Request Header Fields Too Large", HEADERS_TOO_LARGE_BODY)
}

/// 请求体过大时的 413 响应
pub fn payload_too_large() -> Bytes {
    plain_response("413 Payload Too Large", PAYLOAD_TOO_LARGE_BODY)
}

/// 隧道对端发起的注册请求
pub fn registration_request(register_path: &str, host: &str) -> Bytes {
    Bytes::from(format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: keep-alive\r\n\r\n",
        register_path, host
    ))
}

fn plain_response(status: &str, body: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{response_status, BodyFraming};

    #[test]
    fn test_parse_request_line() {
        let line = RequestLine::parse(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();
        assert_eq!(line.method, "GET");
        assert_eq!(line.path, "/index.html");
        assert_eq!(line.version.as_deref(), Some("HTTP/1.1"));
    }

    #[test]
    fn test_parse_two_tokens() {
        let line = RequestLine::parse(b"GET /register").unwrap();
        assert!(line.is_registration(DEFAULT_REGISTER_PATH));
        assert_eq!(line.version, None);
    }

    #[test]
    fn test_parse_malformed() {
        assert_eq!(RequestLine::parse(b""), None);
        assert_eq!(RequestLine::parse(b"GARBAGE\r\n"), None);
        assert_eq!(RequestLine::parse(b"   \r\nGET / HTTP/1.1"), None);
    }

    #[test]
    fn test_registration_path_is_exact() {
        let line = RequestLine::parse(b"GET /register/extra HTTP/1.1\r\n\r\n").unwrap();
        assert!(!line.is_registration(DEFAULT_REGISTER_PATH));
        let line = RequestLine::parse(b"POST /register HTTP/1.1\r\n\r\n").unwrap();
        assert!(line.is_registration(DEFAULT_REGISTER_PATH));
    }

    #[test]
    fn test_service_unavailable_is_well_framed() {
        let response = service_unavailable();
        let text = std::str::from_utf8(&response).unwrap();
        let (head, body) = text.split_once("\r\n\r\n").unwrap();

        assert_eq!(response_status(&response), Some(503));
        assert!(head.contains("Content-Type: text/plain"));
        assert!(head.contains("Connection: close"));
        assert_eq!(
            BodyFraming::from_headers(head.as_bytes()),
            BodyFraming::Length(body.len() as u64)
        );
    }

    #[test]
    fn test_rejection_responses() {
        assert_eq!(response_status(&headers_too_large()), Some(431));
        assert_eq!(response_status(&payload_too_large()), Some(413));
        assert!(payload_too_large().ends_with(PAYLOAD_TOO_LARGE_BODY.as_bytes()));
    }

    #[test]
    fn test_registration_confirmation() {
        let response = registration_confirmation();
        let text = std::str::from_utf8(&response).unwrap();
        assert_eq!(response_status(&response), Some(200));
        assert!(text.contains("Connection: keep-alive"));
        assert!(text.ends_with("\r\n\r\nTunnel registered\n"));
    }

    #[test]
    fn test_registration_request() {
        let request = registration_request("/register", "broker:10000");
        let line = RequestLine::parse(&request).unwrap();
        assert!(line.is_registration("/register"));
        assert!(request.ends_with(b"\r\n\r\n"));
    }
}
