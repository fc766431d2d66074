use std::io;
use std::time::Duration;

use log::{debug, error, info, warn};
use reborn::Listener;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

enum Acceptor {
    Tcp(TcpListener),
    Unix(UnixListener),
}

enum Connection {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Acceptor {
    fn from_std(listener: Listener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(match listener {
            Listener::Tcp(l) => Acceptor::Tcp(TcpListener::from_std(l)?),
            Listener::Unix(l) => Acceptor::Unix(UnixListener::from_std(l)?),
        })
    }

    async fn accept(&self) -> io::Result<Connection> {
        match self {
            Acceptor::Tcp(l) => Ok(Connection::Tcp(l.accept().await?.0)),
            Acceptor::Unix(l) => Ok(Connection::Unix(l.accept().await?.0)),
        }
    }
}

/// Greet every connection on `listener` until `shutdown` flips, then give
/// in-flight connections up to `grace` to finish.
///
/// `listener` should be a clone: dropping it here must not close the socket
/// the restart loop still holds.
pub async fn serve(
    listener: Listener,
    greeting: watch::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
) -> io::Result<()> {
    let acceptor = Acceptor::from_std(listener)?;
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = acceptor.accept() => match accepted {
                Ok(conn) => {
                    let text = greeting.borrow().clone();
                    connections.spawn(greet(conn, text));
                }
                Err(e) if reborn::is_closing(&e) => {
                    info!("listener closed, no longer accepting");
                    break;
                }
                Err(e) => {
                    error!("accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(done) = connections.join_next(), if !connections.is_empty() => {
                if let Ok(Err(e)) = done {
                    debug!("connection ended with error: {e}");
                }
            }
        }
    }
    drop(acceptor);

    let in_flight = connections.len();
    if in_flight > 0 {
        info!("draining {in_flight} connection(s)");
    }
    let drain = async { while connections.join_next().await.is_some() {} };
    if tokio::time::timeout(grace, drain).await.is_err() {
        warn!("grace period of {grace:?} elapsed, dropping remaining connections");
        connections.abort_all();
    }
    Ok(())
}

async fn greet(conn: Connection, text: String) -> io::Result<()> {
    match conn {
        Connection::Tcp(stream) => write_greeting(stream, &text).await,
        Connection::Unix(stream) => write_greeting(stream, &text).await,
    }
}

async fn write_greeting<S>(mut stream: S, text: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(text.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn greets_until_shutdown() {
        let listener = Listener::bind("tcp:127.0.0.1:0").unwrap();
        let addr = listener.addr().unwrap();
        let (_greeting_tx, greeting_rx) = watch::channel(String::from("hello"));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let grace = Duration::from_secs(1);
        let server = tokio::spawn(serve(listener, greeting_rx, shutdown_rx, grace));

        let mut stream = TcpStream::connect(&addr).await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        assert_eq!(reply, "hello\n");

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
        assert!(TcpStream::connect(&addr).await.is_err());
    }

    #[tokio::test]
    async fn reloaded_greeting_applies_to_new_connections() {
        let listener = Listener::bind("tcp:127.0.0.1:0").unwrap();
        let addr = listener.addr().unwrap();
        let (greeting_tx, greeting_rx) = watch::channel(String::from("before"));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let grace = Duration::from_secs(1);
        let server = tokio::spawn(serve(listener, greeting_rx, shutdown_rx, grace));

        greeting_tx.send_replace(String::from("after"));
        let mut stream = TcpStream::connect(&addr).await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        assert_eq!(reply, "after\n");

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
