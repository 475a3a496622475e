/// Version string sent in the `User-Agent` header of every request.
pub const USER_AGENT: &str = "ipcam/0.1";

/// An outgoing HTTP/1.1 request.
///
/// Serializes to the standard text format:
///
/// ```text
/// GET /cgi-bin/snapshot.cgi HTTP/1.1\r\n
/// Host: 192.168.1.20:80\r\n
/// Connection: keep-alive\r\n
/// Authorization: Digest username="admin", ...\r\n
/// \r\n
/// ```
///
/// Uses a builder pattern: chain [`add_header`](Self::add_header) and
/// [`with_body`](Self::with_body), then call [`serialize`](Self::serialize).
/// `Content-Length` is computed automatically when a body is present.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    /// Origin-form target (`/path?query`).
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn new(method: &str, path: &str) -> Self {
        HttpRequest {
            method: method.to_string(),
            path: path.to_string(),
            headers: vec![("User-Agent".to_string(), USER_AGENT.to_string())],
            body: None,
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new("GET", path)
    }

    /// Adds the `Host` and keep-alive headers every camera request carries.
    pub fn for_host(self, host: &str, port: u16) -> Self {
        self.add_header("Host", &format!("{host}:{port}"))
            .add_header("Connection", "keep-alive")
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Replace a header (case-insensitive) or append it if absent.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => *existing = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize to the HTTP/1.1 wire format.
    pub fn serialize(&self) -> String {
        let mut request = format!("{} {} HTTP/1.1\r\n", self.method, self.path);

        for (name, value) in &self.headers {
            request.push_str(&format!("{}: {}\r\n", name, value));
        }

        if let Some(body) = &self.body {
            request.push_str(&format!("Content-Length: {}\r\n", body.len()));
            request.push_str("\r\n");
            request.push_str(body);
        } else {
            request.push_str("\r\n");
        }
        request
    }
}
