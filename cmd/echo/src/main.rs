//! fibrio echo server
//!
//! Single-threaded TCP echo server driven entirely by io_uring through
//! the fibrio fiber runtime: one fiber per connection, a semaphore for
//! the connection cap, fixed buffers for the data path.
//!
//! Usage:
//!     cargo run --release -p fibrio-echo -- [port] [max_conns]
//!
//! Test with:
//!     echo "hello" | nc -q0 localhost 9999

use std::process::ExitCode;
use std::rc::Rc;

use fibrio::{io, net, Config, Semaphore};

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let port: u16 = args
        .next()
        .and_then(|a| a.parse().ok())
        .unwrap_or(9999);
    let max_conns: usize = args
        .next()
        .and_then(|a| a.parse().ok())
        .unwrap_or(64);

    match fibrio::run(Config::from_env(), serve(port, max_conns)) {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            eprintln!("echo: {}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("echo: runtime: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn serve(port: u16, max_conns: usize) -> fibrio::Result<()> {
    let listener = net::listen_tcp(([127, 0, 0, 1], port).into())?;
    eprintln!(
        "echo: listening on 127.0.0.1:{} (max {} connections)",
        port, max_conns
    );

    let sem = Semaphore::new(max_conns);
    loop {
        let permit = sem.acquire().await;
        let conn = Rc::new(io::accept(&listener).await?);
        fibrio::spawn(async move {
            let _permit = permit;
            let mut buf = vec![0u8; 4096];
            loop {
                match io::read_upto(&conn, &mut buf).await {
                    Ok(n) => {
                        if io::write_all(&conn, &buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break, // EOF or reset: drop the connection
                }
            }
            let _ = conn.close().await;
        });
    }
}
