use crate::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Ping,
    Generate,
    Poll,
    Abort,
    Status,
    Tokenize,
    Perf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandHeader {
    pub opcode: OpCode,
    pub content_length: usize,
}

impl CommandHeader {
    /// Parses a header line: `VERB [length]`, e.g. `GENERATE 212`.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().ok_or(ProtocolError::EmptyHeader)?;

        let opcode = match verb.to_uppercase().as_str() {
            "PING" => OpCode::Ping,
            "GENERATE" => OpCode::Generate,
            "POLL" => OpCode::Poll,
            "ABORT" => OpCode::Abort,
            "STATUS" => OpCode::Status,
            "TOKENIZE" => OpCode::Tokenize,
            "PERF" => OpCode::Perf,
            _ => return Err(ProtocolError::UnknownOpcode(verb.to_string())),
        };

        let content_length = match parts.next() {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| ProtocolError::InvalidLength(raw.to_string()))?,
            None => 0,
        };

        Ok(CommandHeader {
            opcode,
            content_length,
        })
    }
}

pub fn response_ok(msg: &str) -> Vec<u8> {
    format!("+OK {}\r\n", msg).into_bytes()
}

pub fn response_err(msg: &str) -> Vec<u8> {
    format!("-ERR {}\r\n", msg).into_bytes()
}

pub fn response_err_code(code: &str, msg: &str) -> Vec<u8> {
    format!("-ERR {} {}\r\n", code, msg).into_bytes()
}

pub fn response_data(data: &[u8]) -> Vec<u8> {
    let header = format!("DATA raw {}\r\n", data.len());
    let mut vec = header.into_bytes();
    vec.extend_from_slice(data);
    vec
}
