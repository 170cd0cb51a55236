//! End-to-end echo scenario: 70 clients against a server that holds at
//! most 10 connections open at once. Each client sends a greeting,
//! half-closes, and expects exactly "Bye" back.

use std::cell::Cell;
use std::io::{Read, Write};
use std::rc::Rc;
use std::time::Duration;

use fibrio::{bridge, io, net, sleep, Config, Error, Semaphore};

const CLIENTS: usize = 70;
const MAX_CONNECTIONS: usize = 10;

#[test]
fn echo_server_serves_70_clients_with_cap_10() {
    let outcome = fibrio::run(Config::new(), async {
        let listener = Rc::new(net::listen_tcp("127.0.0.1:0".parse().unwrap())?);
        let addr = net::local_addr(&listener)?;

        let active = Rc::new(Cell::new(0usize));
        let peak = Rc::new(Cell::new(0usize));
        let served = Rc::new(Cell::new(0usize));

        let server = {
            let listener = Rc::clone(&listener);
            let active = Rc::clone(&active);
            let peak = Rc::clone(&peak);
            let served = Rc::clone(&served);
            fibrio::spawn(async move {
                let sem = Semaphore::new(MAX_CONNECTIONS);
                let mut handlers = Vec::new();
                for _ in 0..CLIENTS {
                    let permit = sem.acquire().await;
                    let conn = Rc::new(io::accept(&listener).await?);
                    let active = Rc::clone(&active);
                    let peak = Rc::clone(&peak);
                    let served = Rc::clone(&served);
                    handlers.push(fibrio::spawn(async move {
                        let _permit = permit;
                        active.set(active.get() + 1);
                        peak.set(peak.get().max(active.get()));

                        // Drain the request until the client half-closes.
                        let mut buf = [0u8; 256];
                        let mut got = Vec::new();
                        loop {
                            match io::read_upto(&conn, &mut buf).await {
                                Ok(n) => got.extend_from_slice(&buf[..n]),
                                Err(Error::EndOfFile) => break,
                                Err(e) => return Err(e),
                            }
                        }
                        assert_eq!(got, b"Hello from client");

                        sleep(Duration::from_millis(10)).await?;
                        io::write_all(&conn, b"Bye").await?;
                        conn.close().await?;

                        active.set(active.get() - 1);
                        served.set(served.get() + 1);
                        Ok::<(), Error>(())
                    }));
                }
                for h in handlers {
                    h.await?;
                }
                Ok::<(), Error>(())
            })
        };

        // Clients run as plain blocking sockets on their own OS threads.
        let client_errors = bridge::run_raw(move || {
            let mut threads = Vec::new();
            for _ in 0..CLIENTS {
                threads.push(std::thread::spawn(move || {
                    let mut stream = std::net::TcpStream::connect(addr)?;
                    stream.write_all(b"Hello from client")?;
                    stream.shutdown(std::net::Shutdown::Write)?;
                    let mut reply = Vec::new();
                    stream.read_to_end(&mut reply)?;
                    assert_eq!(reply, b"Bye");
                    Ok::<(), std::io::Error>(())
                }));
            }
            threads
                .into_iter()
                .map(|t| t.join())
                .filter(|r| !matches!(r, Ok(Ok(()))))
                .count()
        })
        .await?;

        server.await?;
        assert_eq!(client_errors, 0, "every client must receive Bye");
        assert_eq!(served.get(), CLIENTS);
        assert!(
            peak.get() <= MAX_CONNECTIONS,
            "peak concurrency {} exceeded the cap",
            peak.get()
        );
        Ok::<(), Error>(())
    });
    outcome.expect("runtime").expect("scenario");
}
