use inference_protocol::CommandHeader;

use super::{ClientState, ParsedCommand};

/// Drains every complete command (header line plus body) from `buffer`.
pub fn parse_available_commands(buffer: &mut Vec<u8>, state: &mut ClientState) -> Vec<ParsedCommand> {
    let mut parsed = Vec::new();

    loop {
        match state {
            ClientState::WaitingForHeader => {
                let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
                    break;
                };
                let header_bytes = buffer.drain(..=pos).collect::<Vec<u8>>();
                let header_str = String::from_utf8_lossy(&header_bytes).trim().to_string();
                if header_str.is_empty() {
                    continue;
                }

                match CommandHeader::parse(&header_str) {
                    Ok(header) if header.content_length == 0 => parsed.push(ParsedCommand::Ok {
                        header,
                        payload: Vec::new(),
                    }),
                    Ok(header) => *state = ClientState::ReadingBody { header },
                    Err(e) => parsed.push(ParsedCommand::Err(e.to_string())),
                }
            }
            ClientState::ReadingBody { header } => {
                if buffer.len() < header.content_length {
                    break;
                }
                let payload = buffer.drain(..header.content_length).collect::<Vec<u8>>();
                parsed.push(ParsedCommand::Ok {
                    header: header.clone(),
                    payload,
                });
                *state = ClientState::WaitingForHeader;
            }
        }
    }

    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use inference_protocol::OpCode;

    #[test]
    fn bodies_may_arrive_in_pieces() {
        let mut state = ClientState::WaitingForHeader;
        let mut buffer = b"PING\nGENERATE 6\n{\"pr".to_vec();

        let parsed = parse_available_commands(&mut buffer, &mut state);
        assert_eq!(parsed.len(), 1);
        assert!(matches!(&parsed[0], ParsedCommand::Ok { header, .. } if header.opcode == OpCode::Ping));
        assert!(matches!(state, ClientState::ReadingBody { .. }));

        buffer.extend_from_slice(b"o}POLL\n");
        let parsed = parse_available_commands(&mut buffer, &mut state);
        assert_eq!(parsed.len(), 2);
        match &parsed[0] {
            ParsedCommand::Ok { header, payload } => {
                assert_eq!(header.opcode, OpCode::Generate);
                assert_eq!(payload, b"{\"pro}");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn bad_headers_are_reported_and_skipped() {
        let mut state = ClientState::WaitingForHeader;
        let mut buffer = b"\r\nFLY\nPING\n".to_vec();
        let parsed = parse_available_commands(&mut buffer, &mut state);
        assert_eq!(parsed.len(), 2);
        assert!(matches!(parsed[0], ParsedCommand::Err(_)));
    }
}
