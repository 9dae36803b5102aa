use std::io::{self, Read, Write};

use inference_protocol::response_err_code;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::commands::execute_command;
use crate::runtime::Kernel;

use super::{parse_available_commands, Client, ParsedCommand};

/// Reads what is available and executes every complete command. Returns
/// `true` when the connection should be closed.
pub fn handle_read<B: Backend + 'static>(client: &mut Client, kernel: &Kernel<B>) -> bool {
    let mut chunk = [0; 4096];
    loop {
        match client.stream.read(&mut chunk) {
            Ok(0) => return true,
            Ok(n) => client.buffer.extend_from_slice(&chunk[..n]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e)
                if e.kind() == io::ErrorKind::ConnectionReset
                    || e.kind() == io::ErrorKind::BrokenPipe =>
            {
                debug!(error = %e, "client went away");
                return true;
            }
            Err(e) => {
                warn!(error = %e, "read error");
                return true;
            }
        }
    }

    let parsed = parse_available_commands(&mut client.buffer, &mut client.state);
    for command in parsed {
        match command {
            ParsedCommand::Ok { header, payload } => execute_command(client, header, payload, kernel),
            ParsedCommand::Err(e) => client
                .output_buffer
                .extend(response_err_code("BAD_HEADER", &e)),
        }
    }
    false
}

/// Flushes queued output. Returns `true` when the connection should be
/// closed.
pub fn handle_write(client: &mut Client) -> bool {
    while !client.output_buffer.is_empty() {
        let (head, _) = client.output_buffer.as_slices();
        match client.stream.write(head) {
            Ok(n) => {
                client.output_buffer.drain(..n);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(_) => return true,
        }
    }
    false
}
