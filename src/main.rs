use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use inference_kernel::backend::{load_backend, CandleBackend};
use inference_kernel::transport::{handle_read, handle_write, Client};
use inference_kernel::{Engine, Kernel, KernelConfig};

const SERVER: Token = Token(0);
const DEFAULT_CONFIG: &str = "kernel.toml";

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        KernelConfig::from_file(&config_path)?
    } else {
        warn!(path = %config_path, "config file not found, using defaults");
        KernelConfig::default()
    };

    let backend = load_backend(&config.model)?;
    let kernel = Kernel::new(Engine::new(backend, config.context.clone()));

    let addr: SocketAddr = config.server.addr.parse()?;
    serve(addr, &kernel)?;
    Ok(())
}

fn serve(addr: SocketAddr, kernel: &Kernel<CandleBackend>) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(128);
    let mut server = TcpListener::bind(addr)?;
    poll.registry()
        .register(&mut server, SERVER, Interest::READABLE)?;

    let mut clients: HashMap<Token, Client> = HashMap::new();
    let mut unique_token = Token(SERVER.0 + 1);
    info!(%addr, "inference kernel ready");

    loop {
        poll.poll(&mut events, Some(Duration::from_millis(50)))?;

        for event in events.iter() {
            match event.token() {
                SERVER => loop {
                    match server.accept() {
                        Ok((mut stream, peer)) => {
                            let token = unique_token;
                            unique_token.0 += 1;
                            info!(%peer, "new connection");
                            poll.registry()
                                .register(&mut stream, token, Interest::READABLE)?;
                            clients.insert(token, Client::new(stream));
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => error!(error = %e, "accept error"),
                    }
                },
                token => {
                    let Some(client) = clients.get_mut(&token) else {
                        continue;
                    };
                    let mut should_close = false;
                    if event.is_readable() && handle_read(client, kernel) {
                        should_close = true;
                    }
                    if event.is_writable() && handle_write(client) {
                        should_close = true;
                    }

                    if should_close {
                        clients.remove(&token);
                        continue;
                    }
                    let interest = if client.output_buffer.is_empty() {
                        Interest::READABLE
                    } else {
                        Interest::READABLE | Interest::WRITABLE
                    };
                    poll.registry()
                        .reregister(&mut client.stream, token, interest)?;
                }
            }
        }
    }
}
