use crate::prelude::*;

/// Any verb, not just the GET/POST/DELETE the teacher's draft special-cased.
/// Extension/CGI dispatch in `connection.rs` only inspects `as_str()`, so new
/// verbs never require a matching arm here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Method(pub String);

impl Method {
    pub fn is_allowed(&self, allowed_methods: &[String]) -> bool {
        allowed_methods.iter().any(|m| m == &self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn get() -> Self {
        Method("GET".to_string())
    }
}

impl FromStr for Method {
    type Err = ParseError;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(ParseError::InvalidMethod);
        }
        Ok(Method(s.to_string()))
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, PartialEq)]
pub enum ParsingState {
    RequestLine,
    Headers,
    HeadersDone,
    Body,
    ChunkedBody,
    Complete,
    Error,
}

const CRLN_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    IncompleteRequestLine,
    MalformedRequestLine,
    InvalidMethod,
    InvalidUtf8(std::string::FromUtf8Error),
    UnexpectedEof,
    HeaderTooLong,
    TooManyHeaders,
    InvalidHeaderName,
    InvalidHeaderValue,
    InvalidChunkSize,
    PayloadTooLarge,
    ParseHexError,
    Error(u16),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::IncompleteRequestLine => write!(f, "Incomplete request line"),
            ParseError::MalformedRequestLine => write!(f, "Malformed request line"),
            ParseError::InvalidMethod => write!(f, "Invalid HTTP method"),
            ParseError::InvalidUtf8(_) => write!(f, "Invalid UTF-8 in request"),
            ParseError::UnexpectedEof => write!(f, "Unexpected end of input"),
            ParseError::HeaderTooLong => write!(f, "Header line too long"),
            ParseError::TooManyHeaders => write!(f, "Too many headers"),
            ParseError::InvalidHeaderName => write!(f, "Invalid header name"),
            ParseError::InvalidHeaderValue => write!(f, "Invalid header value"),
            ParseError::PayloadTooLarge => write!(f, "Payload too large"),
            ParseError::ParseHexError => write!(f, "Parse Hex Error"),
            ParseError::Error(_) => write!(f, "other error"),
            ParseError::InvalidChunkSize => write!(f, "invalid chunk size"),
        }
    }
}

impl std::error::Error for ParseError {}

impl From<std::string::FromUtf8Error> for ParseError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        ParseError::InvalidUtf8(err)
    }
}

impl ParseError {
    /// Maps a parse failure to the status `connection.rs` should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ParseError::PayloadTooLarge => HTTP_PAYLOAD_TOO_LARGE,
            ParseError::InvalidMethod => HTTP_METHOD_NOT_ALLOWED,
            ParseError::HeaderTooLong | ParseError::TooManyHeaders => HTTP_URI_TOO_LONG,
            ParseError::Error(c) => *c,
            _ => HTTP_BAD_REQUEST,
        }
    }
}

#[derive(Debug)]
pub enum ChunkState {
    ReadSize,
    ReadData(usize),
    ReadTrailingCRLF,
    ReadTrailers,
}

/// Parses one HTTP/1.x request out of a connection's read buffer. Owns only
/// the wire-framing state; what to *do* with a parsed request (route lookup,
/// static file, FastCGI dispatch) is `connection.rs`'s job, not this module's.
#[derive(Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub trailers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub buffer: Vec<u8>,
    pub cursor: usize,
    pub state: ParsingState,
    pub chunk_state: ChunkState,
    pub body_remaining: usize,
    pub total_body_read: usize,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRequest {
    pub fn new() -> Self {
        HttpRequest {
            method: Method::get(),
            url: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            trailers: HashMap::new(),
            body: Vec::new(),
            buffer: Vec::with_capacity(4096),
            cursor: 0,
            state: ParsingState::RequestLine,
            chunk_state: ChunkState::ReadSize,
            body_remaining: 0,
            total_body_read: 0,
        }
    }

    pub fn clear(&mut self) {
        self.state = ParsingState::RequestLine;
        self.chunk_state = ChunkState::ReadSize;
        self.headers.clear();
        self.trailers.clear();
        self.body.clear();
        self.body_remaining = 0;
        self.total_body_read = 0;
    }

    pub fn finish_request(&mut self) {
        self.buffer.drain(..self.cursor);
        self.cursor = 0;
        self.clear();
    }

    pub fn content_length(&self) -> usize {
        self.headers
            .get("content-length")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0)
    }

    pub fn is_chunked(&self) -> bool {
        self.headers
            .get("transfer-encoding")
            .map(|v| v.contains("chunked"))
            .unwrap_or(false)
    }

    /// Runs the parser as far as the current buffer allows, advancing
    /// `state`. Returns `Ok(())` once a full request (headers + any body) has
    /// been framed, or `Err(IncompleteRequestLine)` when more bytes are
    /// needed from the socket.
    pub fn advance(&mut self, max_body_size: usize) -> core::result::Result<(), ParseError> {
        loop {
            let res = match self.state {
                ParsingState::RequestLine => self.parse_request_line(),
                ParsingState::Headers => self.parse_headers(),
                ParsingState::HeadersDone => {
                    if self.is_chunked() {
                        self.state = ParsingState::ChunkedBody;
                    } else {
                        let len = self.content_length();
                        if len > max_body_size {
                            return Err(ParseError::PayloadTooLarge);
                        }
                        self.body_remaining = len;
                        self.state = if len > 0 {
                            ParsingState::Body
                        } else {
                            ParsingState::Complete
                        };
                    }
                    Ok(())
                }
                ParsingState::Body => self.parse_unchunked_body(),
                ParsingState::ChunkedBody => match self.parse_chunked_body(max_body_size) {
                    Ok(true) => {
                        self.state = ParsingState::Complete;
                        Ok(())
                    }
                    Ok(false) => return Err(ParseError::IncompleteRequestLine),
                    Err(e) => Err(e),
                },
                ParsingState::Complete | ParsingState::Error => break,
            };

            match res {
                Ok(_) => {
                    if self.state == ParsingState::Complete {
                        break;
                    }
                }
                Err(ParseError::IncompleteRequestLine) => {
                    return Err(ParseError::IncompleteRequestLine);
                }
                Err(e) => {
                    self.state = ParsingState::Error;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn parse_request_line(&mut self) -> core::result::Result<(), ParseError> {
        if let Some(abs_index) = find_crlf(&self.buffer, self.cursor) {
            let line_bytes = &self.buffer[self.cursor..abs_index];
            let request_line =
                std::str::from_utf8(line_bytes).map_err(|_| ParseError::MalformedRequestLine)?;

            let parts: Vec<&str> = request_line.split_whitespace().collect();
            if parts.len() == 3 {
                self.method = Method::from_str(parts[0])?;
                self.url = parts[1].to_string();
                self.version = parts[2].to_string();

                self.cursor = abs_index + CRLN_LEN;
                self.state = ParsingState::Headers;
            } else {
                return Err(ParseError::MalformedRequestLine);
            }
        } else {
            return Err(ParseError::IncompleteRequestLine);
        }
        Ok(())
    }

    fn extract_and_parse_header(
        &mut self,
    ) -> core::result::Result<Option<(String, String)>, ParseError> {
        if let Some(abs_index) = find_crlf(&self.buffer, self.cursor) {
            let line_bytes = &self.buffer[self.cursor..abs_index];
            if line_bytes.is_empty() {
                self.cursor = abs_index + CRLN_LEN;
                return Ok(None);
            }
            let line =
                std::str::from_utf8(line_bytes).map_err(|_| ParseError::MalformedRequestLine)?;
            self.cursor = abs_index + CRLN_LEN;
            if let Some(sep) = line.find(':') {
                let key = line[..sep].trim().to_string();
                let val = line[sep + 1..].trim().to_string();
                return Ok(Some((key.to_ascii_lowercase(), val)));
            }
            Err(ParseError::MalformedRequestLine)
        } else {
            Err(ParseError::IncompleteRequestLine)
        }
    }

    fn parse_headers(&mut self) -> core::result::Result<(), ParseError> {
        loop {
            match self.extract_and_parse_header()? {
                Some((k, v)) => {
                    if self.headers.len() >= 128 {
                        return Err(ParseError::TooManyHeaders);
                    }
                    self.headers.insert(k, v);
                }
                None => {
                    self.buffer.drain(..self.cursor);
                    self.cursor = 0;
                    self.state = ParsingState::HeadersDone;
                    return Ok(());
                }
            };
        }
    }

    fn parse_unchunked_body(&mut self) -> core::result::Result<(), ParseError> {
        let available = self.buffer.len() - self.cursor;
        let to_process = std::cmp::min(available, self.body_remaining);
        if to_process > 0 {
            let start = self.cursor;
            self.body.extend_from_slice(&self.buffer[start..start + to_process]);
            self.buffer.drain(start..start + to_process);
            self.body_remaining -= to_process;
            self.total_body_read += to_process;
        }
        if self.body_remaining == 0 {
            self.state = ParsingState::Complete;
            Ok(())
        } else {
            Err(ParseError::IncompleteRequestLine)
        }
    }

    pub fn parse_chunked_body(
        &mut self,
        max_body_size: usize,
    ) -> core::result::Result<bool, ParseError> {
        loop {
            match self.chunk_state {
                ChunkState::ReadSize => {
                    let current_len = self.buffer.len();
                    if current_len == 0 {
                        return Ok(false);
                    }

                    let search_limit = std::cmp::min(current_len, 18);
                    match find_subsequence(&self.buffer[..search_limit], b"\r\n", 0) {
                        Some(line_end) => {
                            let hex_str = String::from_utf8_lossy(&self.buffer[..line_end]);
                            let chunk_size = usize::from_str_radix(hex_str.trim(), 16)
                                .map_err(|_| ParseError::ParseHexError)?;
                            if self.total_body_read + chunk_size > max_body_size {
                                return Err(ParseError::PayloadTooLarge);
                            }

                            if chunk_size == 0 {
                                if self.buffer.len() < line_end + 2 {
                                    return Ok(false);
                                }
                                self.buffer.drain(..line_end + 2);
                                self.chunk_state = ChunkState::ReadTrailers;
                                continue;
                            }

                            self.chunk_state = ChunkState::ReadData(chunk_size);
                            self.buffer.drain(..line_end + 2);
                        }
                        None => {
                            if current_len >= 18 {
                                return Err(ParseError::ParseHexError);
                            }
                            return Ok(false);
                        }
                    }
                }

                ChunkState::ReadData(remaining_size) => {
                    if self.buffer.is_empty() {
                        return Ok(false);
                    }

                    let available = self.buffer.len();
                    let to_read = std::cmp::min(available, remaining_size);

                    let data = self.buffer.drain(..to_read).collect::<Vec<u8>>();
                    self.body.extend_from_slice(&data);
                    self.total_body_read += to_read;

                    let new_remaining = remaining_size - to_read;
                    if new_remaining == 0 {
                        self.chunk_state = ChunkState::ReadTrailingCRLF;
                    } else {
                        self.chunk_state = ChunkState::ReadData(new_remaining);
                        return Ok(false);
                    }
                }

                ChunkState::ReadTrailingCRLF => {
                    if self.buffer.len() < 2 {
                        return Ok(false);
                    }
                    if &self.buffer[..2] != b"\r\n" {
                        return Err(ParseError::ParseHexError);
                    }
                    self.buffer.drain(..2);
                    self.chunk_state = ChunkState::ReadSize;
                }

                ChunkState::ReadTrailers => {
                    if self.buffer.len() > 8192 {
                        return Err(ParseError::HeaderTooLong);
                    }
                    match self.extract_and_parse_header() {
                        Ok(Some((k, v))) => {
                            if let Some(allowed_trailers) = self.headers.get("trailer") {
                                if allowed_trailers.to_lowercase().contains(&k) {
                                    self.trailers.insert(k, v);
                                }
                            }
                            continue;
                        }
                        Ok(None) => {
                            self.buffer.drain(..self.cursor);
                            self.cursor = 0;
                            return Ok(true);
                        }
                        Err(ParseError::IncompleteRequestLine) => return Ok(false),
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }
}

fn find_crlf(buffer: &[u8], start_offset: usize) -> Option<usize> {
    let search_area = buffer.get(start_offset..)?;

    let mut current_pos = 0;
    while let Some(r_pos) = search_area[current_pos..].iter().position(|&b| b == b'\r') {
        let abs_r_pos_in_search = current_pos + r_pos;

        if search_area.get(abs_r_pos_in_search + 1) == Some(&b'\n') {
            return Some(start_offset + abs_r_pos_in_search);
        }
        current_pos = abs_r_pos_in_search + 1;
    }
    None
}

pub fn find_subsequence(buffer: &[u8], needle: &[u8], start_offset: usize) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    let search_area = buffer.get(start_offset..)?;
    let first_byte = needle[0];
    let mut current_pos = 0;

    while let Some(rel_pos) = search_area[current_pos..]
        .iter()
        .position(|&b| b == first_byte)
    {
        let abs_pos_in_search = current_pos + rel_pos;

        if let Some(candidate) =
            search_area.get(abs_pos_in_search..abs_pos_in_search + needle.len())
        {
            if candidate == needle {
                return Some(start_offset + abs_pos_in_search);
            }
        } else {
            return None;
        }

        current_pos = abs_pos_in_search + 1;
    }
    None
}

impl Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- HTTP Request ---\n")?;
        writeln!(f, "{} {} {}", self.method, self.url, self.version)?;

        writeln!(f, "Headers:")?;
        for (key, value) in &self.headers {
            writeln!(f, "  {}: {}", key, value)?;
        }

        if !self.body.is_empty() {
            writeln!(f, "Body ({} bytes):", self.body.len())?;
            match String::from_utf8(self.body.clone()) {
                Ok(s) => writeln!(f, "  {}", s)?,
                Err(_) => writeln!(f, "  <binary data>")?,
            }
        } else {
            writeln!(f, "Body: <empty>")?;
        }
        writeln!(f, "--------------------")
    }
}
