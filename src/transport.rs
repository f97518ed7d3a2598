//! HTTP transport seam: a narrow [`Transport`] trait wrapping
//! `embedded_svc::http::client::Client` over `EspHttpConnection`, plus a
//! [`FakeTransport`] for host tests (spec §5 "15s connect/read timeout",
//! C3/C8/C12).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("request submit failed: {0}")]
    Submit(String),
    #[error("read failed: {0}")]
    Read(String),
}

pub const CONNECT_TIMEOUT_SECS: u64 = 15;
pub const READ_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport-layer failures (`-1`) are distinguished from HTTP status codes
/// at the call site via [`crate::fault::classify_http`]; this trait itself
/// only ever returns [`TransportError`] for the former.
pub trait Transport {
    fn post(&mut self, url: &str, headers: &[(&str, &str)], body: &[u8]) -> Result<HttpResponse, TransportError>;
    fn get(&mut self, url: &str, headers: &[(&str, &str)]) -> Result<HttpResponse, TransportError>;
}

#[cfg(target_os = "espidf")]
pub use esp::EspHttpTransport;

#[cfg(target_os = "espidf")]
mod esp {
    use super::*;
    use embedded_svc::http::client::Client;
    use embedded_svc::http::Method;
    use esp_idf_svc::http::client::{Configuration, EspHttpConnection};

    pub struct EspHttpTransport {
        client: Client<EspHttpConnection>,
    }

    impl EspHttpTransport {
        pub fn new() -> Result<Self, TransportError> {
            let connection = EspHttpConnection::new(&Configuration {
                buffer_size: Some(4096),
                timeout: Some(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS)),
                ..Default::default()
            })
            .map_err(|e| TransportError::Connect(e.to_string()))?;
            Ok(Self { client: Client::wrap(connection) })
        }

        fn drain_body(response: &mut embedded_svc::http::client::Response<&mut EspHttpConnection>) -> Result<Vec<u8>, TransportError> {
            let mut out = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                match response.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => out.extend_from_slice(&buf[..n]),
                    Err(e) => return Err(TransportError::Read(e.to_string())),
                }
            }
            Ok(out)
        }
    }

    impl Transport for EspHttpTransport {
        fn post(&mut self, url: &str, headers: &[(&str, &str)], body: &[u8]) -> Result<HttpResponse, TransportError> {
            let content_length = body.len().to_string();
            let mut all_headers: Vec<(&str, &str)> = headers.to_vec();
            all_headers.push(("Content-Length", &content_length));

            let mut request = self
                .client
                .post(url, &all_headers)
                .map_err(|e| TransportError::Submit(e.to_string()))?;
            request.write_all(body).map_err(|e| TransportError::Submit(e.to_string()))?;
            let mut response = request.submit().map_err(|e| TransportError::Submit(e.to_string()))?;
            let status = response.status();
            let body = Self::drain_body(&mut response)?;
            Ok(HttpResponse { status, body })
        }

        fn get(&mut self, url: &str, headers: &[(&str, &str)]) -> Result<HttpResponse, TransportError> {
            let mut request = self
                .client
                .request(Method::Get, url, headers)
                .map_err(|e| TransportError::Submit(e.to_string()))?;
            let mut response = request.submit().map_err(|e| TransportError::Submit(e.to_string()))?;
            let status = response.status();
            let body = Self::drain_body(&mut response)?;
            Ok(HttpResponse { status, body })
        }
    }
}

#[cfg(not(target_os = "espidf"))]
pub use fake::{FakeTransport, SharedFakeTransport};

#[cfg(not(target_os = "espidf"))]
mod fake {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted transport for host tests: queue responses (or errors) up
    /// front, then drain them in call order while recording every request
    /// made for assertions.
    #[derive(Default)]
    pub struct FakeTransport {
        responses: VecDeque<Result<HttpResponse, TransportError>>,
        pub requests: Vec<(String, String, Vec<u8>)>, // (method, url, body)
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_response(&mut self, response: HttpResponse) {
            self.responses.push_back(Ok(response));
        }

        pub fn push_error(&mut self, error: TransportError) {
            self.responses.push_back(Err(error));
        }
    }

    impl Transport for FakeTransport {
        fn post(&mut self, url: &str, _headers: &[(&str, &str)], body: &[u8]) -> Result<HttpResponse, TransportError> {
            self.requests.push(("POST".to_string(), url.to_string(), body.to_vec()));
            self.responses
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Connect("no scripted response".to_string())))
        }

        fn get(&mut self, url: &str, _headers: &[(&str, &str)]) -> Result<HttpResponse, TransportError> {
            self.requests.push(("GET".to_string(), url.to_string(), Vec::new()));
            self.responses
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Connect("no scripted response".to_string())))
        }
    }

    /// A [`FakeTransport`] behind a shared handle, for tests that need to
    /// script responses and inspect recorded requests *after* handing the
    /// transport into something that takes ownership of it (e.g.
    /// `Gateway::new`, which stores it as a `Box<dyn Transport>`).
    #[derive(Clone, Default)]
    pub struct SharedFakeTransport(std::rc::Rc<std::cell::RefCell<FakeTransport>>);

    impl SharedFakeTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_response(&self, response: HttpResponse) {
            self.0.borrow_mut().push_response(response);
        }

        pub fn push_error(&self, error: TransportError) {
            self.0.borrow_mut().push_error(error);
        }

        pub fn requests(&self) -> Vec<(String, String, Vec<u8>)> {
            self.0.borrow().requests.clone()
        }
    }

    impl Transport for SharedFakeTransport {
        fn post(&mut self, url: &str, headers: &[(&str, &str)], body: &[u8]) -> Result<HttpResponse, TransportError> {
            self.0.borrow_mut().post(url, headers, body)
        }

        fn get(&mut self, url: &str, headers: &[(&str, &str)]) -> Result<HttpResponse, TransportError> {
            self.0.borrow_mut().get(url, headers)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_transport_scripts_responses_in_order() {
        let mut transport = FakeTransport::new();
        transport.push_response(HttpResponse { status: 200, body: b"ok".to_vec() });
        transport.push_error(TransportError::Read("truncated".to_string()));

        let first = transport.post("https://gw.example/upload", &[], b"payload").unwrap();
        assert_eq!(first.status, 200);
        assert!(transport.get("https://gw.example/commands", &[]).is_err());
        assert_eq!(transport.requests.len(), 2);
    }

    #[test]
    fn success_range_is_2xx_only() {
        assert!(HttpResponse { status: 200, body: vec![] }.is_success());
        assert!(HttpResponse { status: 299, body: vec![] }.is_success());
        assert!(!HttpResponse { status: 404, body: vec![] }.is_success());
        assert!(!HttpResponse { status: 503, body: vec![] }.is_success());
    }
}
