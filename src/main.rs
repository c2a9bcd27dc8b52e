use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    os::fd::IntoRawFd,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use sockmux::{CallbackTypes, RunLoop, Socket, SocketEvent, SocketSignature};
use socket2::{Domain, SockAddr, Type};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Echo server on loopback, exercised by a few client threads.
fn main() -> sockmux::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let run_loop = Arc::new(RunLoop::new());
    let signature = SocketSignature {
        domain: Domain::IPV4,
        ty: Type::STREAM,
        protocol: None,
        address: SockAddr::from(SocketAddr::from(([127, 0, 0, 1], 0))),
    };

    let accept_loop = run_loop.clone();
    let listener = Socket::create_bound(&signature, CallbackTypes::ACCEPT, move |_, event| {
        let SocketEvent::Accept { handle, address } = event else {
            return;
        };
        info!(peer = ?address.as_ref().and_then(SockAddr::as_socket), "accepted");
        let echo = Socket::open(handle.into_raw_fd(), CallbackTypes::DATA, |socket, event| {
            if let SocketEvent::Data { data, .. } = event {
                if !data.is_empty() {
                    if let Err(e) = socket.send(None, &data, Duration::from_secs(1)) {
                        error!(error = %e, "echo failed");
                    }
                }
            }
        });
        match echo {
            Ok(echo) => {
                if let Err(e) = accept_loop.add_socket(&echo) {
                    error!(error = %e, "failed to schedule connection");
                }
            }
            Err(e) => error!(error = %e, "failed to wrap connection"),
        }
    })?;
    run_loop.add_socket(&listener)?;

    let address = listener
        .copy_address()
        .and_then(|a| a.as_socket())
        .ok_or(sockmux::SocketError::InvalidAddress)?;
    info!(%address, "echo server listening");

    let handle = run_loop.handle();
    let clients = thread::spawn(move || {
        for i in 0..3 {
            match echo_once(address, format!("hello #{i}").as_bytes()) {
                Ok(reply) => info!(reply = %String::from_utf8_lossy(&reply), "client got reply"),
                Err(e) => error!(error = %e, "client failed"),
            }
        }
        handle.stop();
    });

    let _ = run_loop.run_until(Instant::now() + Duration::from_secs(10));
    if clients.join().is_err() {
        error!("client thread panicked");
    }
    listener.invalidate();
    Ok(())
}

fn echo_once(address: SocketAddr, message: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(address)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(message)?;
    let mut reply = vec![0; message.len()];
    stream.read_exact(&mut reply)?;
    Ok(reply)
}
