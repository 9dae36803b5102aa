mod parsing;

use inference_protocol::{
    response_data, response_err_code, response_ok, CommandHeader, GenerationStatus, OpCode,
};
use serde_json::json;
use tracing::info;

use crate::backend::Backend;
use crate::error::KernelError;
use crate::metrics;
use crate::runtime::Kernel;
use crate::transport::Client;

use self::parsing::{parse_generation_payload, parse_text_payload};

pub fn execute_command<B: Backend + 'static>(
    client: &mut Client,
    header: CommandHeader,
    payload: Vec<u8>,
    kernel: &Kernel<B>,
) {
    let response = dispatch(header.opcode, &payload, kernel);
    client.output_buffer.extend(response);
}

fn dispatch<B: Backend + 'static>(opcode: OpCode, payload: &[u8], kernel: &Kernel<B>) -> Vec<u8> {
    match opcode {
        OpCode::Ping => response_ok("PONG"),
        OpCode::Generate => {
            let request = match parse_generation_payload(payload) {
                Ok(request) => request,
                Err(e) => return response_err_code("BAD_REQUEST", &e),
            };
            info!(
                prompt_chars = request.prompt.len(),
                max_length = request.max_length,
                images = request.images.len(),
                "generation requested"
            );
            match kernel.start_generation(request) {
                // the handle is dropped; clients follow progress with POLL
                Ok(_handle) => response_ok("GENERATING"),
                Err(KernelError::Busy) => {
                    response_err_code("BUSY", "a generation is already in flight")
                }
                Err(e) => response_err_code("GENERATE_FAILED", &e.to_string()),
            }
        }
        OpCode::Poll => {
            let state = kernel.poll();
            let mut body = json!({
                "text": state.text,
                "finished": state.finished,
            });
            if state.finished {
                if let Some(last) = kernel.last_output() {
                    body["status"] = json!(match last.status {
                        GenerationStatus::Success => "success",
                        GenerationStatus::Failed => "failed",
                    });
                    body["metrics"] = json!(last.metrics);
                }
            }
            response_data(body.to_string().as_bytes())
        }
        OpCode::Abort => {
            if kernel.abort() {
                response_ok("ABORTING")
            } else {
                response_ok("IDLE")
            }
        }
        OpCode::Status => {
            let snapshot = metrics::snapshot();
            response_ok(&format!(
                "busy={} uptime_s={} total_generations={} total_failures={} total_tokens={}",
                kernel.is_busy(),
                snapshot.uptime_secs,
                snapshot.total_generations,
                snapshot.total_failures,
                snapshot.total_tokens
            ))
        }
        OpCode::Tokenize => {
            let text = match parse_text_payload(payload, "TOKENIZE") {
                Ok(text) => text,
                Err(e) => return response_err_code("BAD_REQUEST", &e),
            };
            match kernel.token_count(&text) {
                Ok(count) => response_ok(&count.to_string()),
                Err(KernelError::Busy) => response_err_code("BUSY", "engine is generating"),
                Err(e) => response_err_code("TOKENIZE_FAILED", &e.to_string()),
            }
        }
        OpCode::Perf => match serde_json::to_vec(&metrics::snapshot()) {
            Ok(body) => response_data(&body),
            Err(e) => response_err_code("PERF", &e.to_string()),
        },
    }
}
