mod framing;
mod io;

use std::collections::VecDeque;

use inference_protocol::CommandHeader;

pub use framing::parse_available_commands;
pub use io::{handle_read, handle_write};

pub enum ClientState {
    WaitingForHeader,
    ReadingBody { header: CommandHeader },
}

#[derive(Debug, PartialEq)]
pub enum ParsedCommand {
    Ok {
        header: CommandHeader,
        payload: Vec<u8>,
    },
    Err(String),
}

pub struct Client {
    pub stream: mio::net::TcpStream,
    pub buffer: Vec<u8>,
    pub output_buffer: VecDeque<u8>,
    pub state: ClientState,
}

impl Client {
    pub fn new(stream: mio::net::TcpStream) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(4096),
            output_buffer: VecDeque::new(),
            state: ClientState::WaitingForHeader,
        }
    }
}
