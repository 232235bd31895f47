use crate::prelude::*;

#[derive(Debug)]
pub struct HttpResponse {
    pub version: String,
    pub status_code: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        Self {
            version: "HTTP/1.1".to_string(),
            status_code,
            status_text: status_text.to_string(),
            headers: HashMap::from([("content-length".to_string(), "0".to_string())]),
            body: Vec::new(),
        }
    }

    pub fn set_header(&mut self, key: &str, value: &str) -> &mut Self {
        self.headers.insert(key.to_lowercase(), value.to_string());
        self
    }

    pub fn set_body(&mut self, body: Vec<u8>, content_type: &str) -> &mut Self {
        self.headers
            .insert("content-length".to_string(), body.len().to_string());
        self.headers
            .insert("content-type".to_string(), content_type.to_string());
        self.body = body;
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut res = self.to_bytes_headers_only();
        res.extend_from_slice(&self.body);
        res
    }

    pub fn status_text(code: u16) -> String {
        match code {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            HTTP_BAD_REQUEST => "Bad Request",
            HTTP_FORBIDDEN => "Forbidden",
            HTTP_NOT_FOUND => "Not Found",
            HTTP_METHOD_NOT_ALLOWED => "Method Not Allowed",
            HTTP_PAYLOAD_TOO_LARGE => "Payload Too Large",
            HTTP_URI_TOO_LONG => "URI Too Long",
            HTTP_INTERNAL_SERVER_ERROR => "Internal Server Error",
            HTTP_NOT_IMPLEMENTED => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            GATEWAY_TIMEOUT => "Gateway Timeout",
            _ => "OK",
        }
        .to_string()
    }

    pub fn set_status_code(&mut self, code: u16) -> &mut Self {
        self.status_code = code;
        self.status_text = HttpResponse::status_text(code);
        self
    }

    pub fn to_bytes_headers_only(&self) -> Vec<u8> {
        let mut res = format!("{} {} {}\r\n", self.version, self.status_code, self.status_text);
        for (k, v) in &self.headers {
            res.push_str(&format!("{}: {}\r\n", Self::to_pascal_case(k), v));
        }
        res.push_str("\r\n");
        res.into_bytes()
    }

    fn to_pascal_case(s: &str) -> String {
        s.split('-')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    None => String::new(),
                    Some(f) => f.to_uppercase().collect::<String>() + chars.as_str(),
                }
            })
            .collect::<Vec<String>>()
            .join("-")
    }

    pub fn redirect(code: u16, target_url: &str) -> Self {
        let mut res = HttpResponse::new(code, &Self::status_text(code));
        res.set_header("location", target_url)
            .set_header("content-length", "0");
        res
    }
}

pub fn get_mime_type(extension: Option<&str>) -> &'static str {
    match extension {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

pub fn get_ext_from_content_type(content_type: &str) -> &str {
    match content_type {
        "application/json" => ".json",
        "application/pdf" => ".pdf",
        "application/xml" => ".xml",
        "application/zip" => ".zip",
        "audio/mpeg" => ".mp3",
        "image/gif" => ".gif",
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/svg+xml" => ".svg",
        "image/webp" => ".webp",
        "text/css" => ".css",
        "text/html" => ".html",
        "text/javascript" => ".js",
        "text/plain" => ".txt",
        "video/mp4" => ".mp4",
        _ => ".bin",
    }
}

pub fn generate_autoindex(path: &Path, original_url: &str) -> HttpResponse {
    let mut html = format!("<html><body><h1>Index of {}</h1><ul>", original_url);
    if let Ok(entries) = path.read_dir() {
        for entry in entries.flatten() {
            if let Ok(name) = entry.file_name().into_string() {
                html.push_str(&format!(
                    "<li><a href=\"{}/{}\">{}</a></li>",
                    original_url.trim_end_matches('/'),
                    name,
                    name
                ));
            }
        }
    }

    html.push_str("</ul></body></html>");
    let mut res = HttpResponse::new(200, "OK");
    res.set_body(html.into_bytes(), "text/html");
    res
}

/// Maps a status code to a response, preferring a configured error page file
/// over the built-in plain-text body. Connection header follows §7: only
/// genuinely fatal statuses force `close`; 404/405 stay keep-alive-eligible.
pub fn handle_error(code: u16, s_cfg: Option<&ServerConfig>) -> HttpResponse {
    let mut res = HttpResponse::new(code, &HttpResponse::status_text(code));

    if let Some(cfg) = s_cfg {
        if let Some(path_str) = cfg.error_pages.get(&code) {
            if let Ok(content) = fs::read(path_str) {
                res.set_body(content, "text/html");
                apply_close_policy(&mut res, code);
                return res;
            }
        }
    }

    let body = format!("{} {}", code, HttpResponse::status_text(code)).into_bytes();
    res.set_body(body, "text/plain");
    apply_close_policy(&mut res, code);
    res
}

fn apply_close_policy(res: &mut HttpResponse, code: u16) {
    let close = code >= 400 && code != 404 && code != 405;
    res.set_header("connection", if close { "close" } else { "keep-alive" });
}
