//! Proxy settings shared by the HTTP and WebSocket channels.
//!
//! HTTP requests go through [`reqwest::Proxy::all`]. The WebSocket has no
//! proxy support of its own, so [`ProxyConfig::tunnel`] opens the TCP
//! stream through the proxy (HTTP `CONNECT` or SOCKS5) and the WebSocket
//! handshake runs over it.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{ComfyError, Result};

/// Longest CONNECT response header accepted from a proxy.
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    Http,
    Https,
    /// SOCKS5 with local name resolution.
    Socks5,
    /// SOCKS5 with resolution on the proxy.
    Socks5h,
}

/// A validated proxy URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    url: String,
    scheme: ProxyScheme,
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
}

impl ProxyConfig {
    /// Parse `http://`, `https://`, `socks5://` or `socks5h://` proxy URLs,
    /// optionally with `user:password@`.
    pub fn parse(url: &str) -> Result<Self> {
        let parsed = reqwest::Url::parse(url.trim())
            .map_err(|e| ComfyError::InvalidConfig(format!("proxy URL '{}': {}", url, e)))?;

        let (scheme, default_port) = match parsed.scheme() {
            "http" => (ProxyScheme::Http, 80),
            "https" => (ProxyScheme::Https, 443),
            "socks5" => (ProxyScheme::Socks5, 1080),
            "socks5h" => (ProxyScheme::Socks5h, 1080),
            other => {
                return Err(ComfyError::InvalidConfig(format!(
                    "unsupported proxy scheme '{}'; use http, https or socks5",
                    other
                )))
            }
        };
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ComfyError::InvalidConfig(format!("proxy URL '{}' has no host", url)))?
            .to_string();
        let credentials = (!parsed.username().is_empty()).then(|| {
            (
                parsed.username().to_string(),
                parsed.password().unwrap_or_default().to_string(),
            )
        });

        Ok(Self {
            url: url.trim().to_string(),
            scheme,
            port: parsed.port().unwrap_or(default_port),
            host,
            credentials,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn scheme(&self) -> ProxyScheme {
        self.scheme
    }

    pub(crate) fn to_reqwest(&self) -> Result<reqwest::Proxy> {
        reqwest::Proxy::all(&self.url)
            .map_err(|e| ComfyError::InvalidConfig(format!("proxy '{}': {}", self.url, e)))
    }

    /// Open a TCP stream to `target_host:target_port` through the proxy.
    pub(crate) async fn tunnel(
        &self,
        target_host: &str,
        target_port: u16,
        timeout: Duration,
    ) -> Result<TcpStream> {
        let attempt = async {
            if self.scheme == ProxyScheme::Https {
                return Err(ComfyError::InvalidConfig(
                    "HTTPS proxies carry HTTP requests only; use http:// or socks5:// for the event channel"
                        .into(),
                ));
            }
            let mut stream = TcpStream::connect((self.host.as_str(), self.port))
                .await
                .map_err(|e| {
                    ComfyError::io(format!("Failed to reach proxy {}:{}", self.host, self.port), e)
                })?;
            match self.scheme {
                ProxyScheme::Socks5 | ProxyScheme::Socks5h => {
                    self.socks5_handshake(&mut stream, target_host, target_port)
                        .await?
                }
                ProxyScheme::Http | ProxyScheme::Https => {
                    self.http_connect(&mut stream, target_host, target_port)
                        .await?
                }
            }
            Ok::<_, ComfyError>(stream)
        };

        tokio::time::timeout(timeout, attempt).await.map_err(|_| {
            ComfyError::ConnectionLost(format!(
                "proxy {} did not open a tunnel within {}s",
                self.url,
                timeout.as_secs()
            ))
        })?
    }

    async fn http_connect(&self, stream: &mut TcpStream, host: &str, port: u16) -> Result<()> {
        let mut request = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
            host = host,
            port = port
        );
        if let Some((user, pass)) = &self.credentials {
            let token = base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                format!("{}:{}", user, pass),
            );
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
        }
        request.push_str("\r\n");
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| ComfyError::io("Failed to send CONNECT to proxy", e))?;

        let mut head = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if head.len() >= MAX_CONNECT_RESPONSE {
                return Err(ComfyError::InvalidResponse(
                    "proxy CONNECT response header too large".into(),
                ));
            }
            let n = stream
                .read(&mut byte)
                .await
                .map_err(|e| ComfyError::io("Failed to read CONNECT response", e))?;
            if n == 0 {
                return Err(ComfyError::ConnectionLost(
                    "proxy closed the connection during CONNECT".into(),
                ));
            }
            head.push(byte[0]);
        }

        let head = String::from_utf8_lossy(&head);
        let status_line = head.lines().next().unwrap_or_default();
        let status = status_line.split_whitespace().nth(1).unwrap_or_default();
        if status != "200" {
            return Err(ComfyError::InvalidResponse(format!(
                "proxy refused tunnel to {}:{}: {}",
                host, port, status_line
            )));
        }
        Ok(())
    }

    async fn socks5_handshake(&self, stream: &mut TcpStream, host: &str, port: u16) -> Result<()> {
        let io = |context: &'static str| move |e| ComfyError::io(context, e);

        let greeting: &[u8] = if self.credentials.is_some() {
            &[0x05, 0x02, 0x00, 0x02]
        } else {
            &[0x05, 0x01, 0x00]
        };
        stream
            .write_all(greeting)
            .await
            .map_err(io("Failed to greet SOCKS5 proxy"))?;

        let mut choice = [0u8; 2];
        stream
            .read_exact(&mut choice)
            .await
            .map_err(io("Failed to read SOCKS5 method"))?;
        match choice {
            [0x05, 0x00] => {}
            [0x05, 0x02] => {
                let (user, pass) = self.credentials.as_ref().ok_or_else(|| {
                    ComfyError::InvalidResponse("SOCKS5 proxy requires credentials".into())
                })?;
                let mut auth = vec![0x01, user.len() as u8];
                auth.extend_from_slice(user.as_bytes());
                auth.push(pass.len() as u8);
                auth.extend_from_slice(pass.as_bytes());
                stream
                    .write_all(&auth)
                    .await
                    .map_err(io("Failed to authenticate with SOCKS5 proxy"))?;
                let mut reply = [0u8; 2];
                stream
                    .read_exact(&mut reply)
                    .await
                    .map_err(io("Failed to read SOCKS5 auth reply"))?;
                if reply[1] != 0x00 {
                    return Err(ComfyError::InvalidResponse(
                        "SOCKS5 proxy rejected the credentials".into(),
                    ));
                }
            }
            _ => {
                return Err(ComfyError::InvalidResponse(
                    "SOCKS5 proxy offered no acceptable auth method".into(),
                ))
            }
        }

        let mut request = vec![0x05, 0x01, 0x00];
        if self.scheme == ProxyScheme::Socks5h {
            request.push(0x03);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        } else {
            let addr: SocketAddr = tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| ComfyError::io(format!("Failed to resolve {}", host), e))?
                .next()
                .ok_or_else(|| ComfyError::InvalidConfig(format!("{} did not resolve", host)))?;
            match addr {
                SocketAddr::V4(v4) => {
                    request.push(0x01);
                    request.extend_from_slice(&v4.ip().octets());
                }
                SocketAddr::V6(v6) => {
                    request.push(0x04);
                    request.extend_from_slice(&v6.ip().octets());
                }
            }
        }
        request.extend_from_slice(&port.to_be_bytes());
        stream
            .write_all(&request)
            .await
            .map_err(io("Failed to send SOCKS5 connect"))?;

        let mut reply = [0u8; 4];
        stream
            .read_exact(&mut reply)
            .await
            .map_err(io("Failed to read SOCKS5 reply"))?;
        if reply[1] != 0x00 {
            return Err(ComfyError::InvalidResponse(format!(
                "SOCKS5 proxy refused {}:{} (code {})",
                host, port, reply[1]
            )));
        }
        let bound_len = match reply[3] {
            0x01 => 4,
            0x04 => 16,
            0x03 => {
                let mut len = [0u8; 1];
                stream
                    .read_exact(&mut len)
                    .await
                    .map_err(io("Failed to read SOCKS5 reply"))?;
                len[0] as usize
            }
            other => {
                return Err(ComfyError::InvalidResponse(format!(
                    "SOCKS5 reply has unknown address type {}",
                    other
                )))
            }
        };
        let mut bound = vec![0u8; bound_len + 2];
        stream
            .read_exact(&mut bound)
            .await
            .map_err(io("Failed to read SOCKS5 reply"))?;
        Ok(())
    }
}
