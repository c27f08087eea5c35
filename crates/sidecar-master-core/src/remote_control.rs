//! Remote control listener.
//!
//! Newline-delimited ASCII over TCP. Each request line gets exactly one reply
//! line and the connection stays open until the peer closes it:
//!
//! | request | reply |
//! |---------|-------|
//! | `start` | `OK <recording name>` or `*** <message>` |
//! | `stop`  | `OK` or `*** <message>` |
//! | other   | `*** Unknown command: '<line>'` |
//!
//! Requests are matched case-insensitively after trimming; blank lines are
//! ignored. Invalid UTF-8 is replaced before matching, and a line longer than
//! 1024 bytes is answered `*** Request too long` without being buffered.
//!
//! The listener only parses and frames. Every recognised request is handed to
//! the core loop as a [`RemoteCommand`] and the reply comes back on its
//! oneshot channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const MAX_REQUEST_LINE_BYTES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteRequest {
    Start,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteReply {
    Ok(Option<String>),
    Failed(String),
}

impl RemoteReply {
    /// Wire form, newline included.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Ok(None) => "OK\n".to_string(),
            Self::Ok(Some(detail)) => format!("OK {detail}\n"),
            Self::Failed(message) => format!("*** {message}\n"),
        }
    }
}

/// A request waiting for the core loop's answer.
#[derive(Debug)]
pub struct RemoteCommand {
    pub request: RemoteRequest,
    pub reply: oneshot::Sender<RemoteReply>,
}

/// Parse one request line. `None` for blank lines.
pub fn parse_request(line: &str) -> Option<Result<RemoteRequest, RemoteReply>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(match trimmed.to_ascii_lowercase().as_str() {
        "start" => Ok(RemoteRequest::Start),
        "stop" => Ok(RemoteRequest::Stop),
        _ => Err(RemoteReply::Failed(format!("Unknown command: '{trimmed}'"))),
    })
}

pub struct RemoteControlServer {
    listener: TcpListener,
}

impl RemoteControlServer {
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, command_tx: mpsc::Sender<RemoteCommand>, shutdown_flag: Arc<AtomicBool>) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "remote control listening");
        }
        loop {
            if shutdown_flag.load(Ordering::SeqCst) {
                break;
            }

            match tokio::time::timeout(ACCEPT_POLL_INTERVAL, self.listener.accept()).await {
                Ok(Ok((stream, peer))) => {
                    debug!(%peer, "remote control client connected");
                    let tx = command_tx.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, tx).await {
                            debug!(%peer, error = %err, "remote control connection closed with error");
                        }
                    });
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "remote control accept failed");
                }
                Err(_) => {}
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    command_tx: mpsc::Sender<RemoteCommand>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::with_capacity(MAX_REQUEST_LINE_BYTES + 1);

    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_REQUEST_LINE_BYTES as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            break;
        }

        let reply = if buf.len() > MAX_REQUEST_LINE_BYTES && buf.last() != Some(&b'\n') {
            warn!(len = buf.len(), "remote control request too long");
            discard_line(&mut reader).await?;
            RemoteReply::Failed("Request too long".to_string())
        } else {
            match parse_request(&String::from_utf8_lossy(&buf)) {
                None => continue,
                Some(Err(reply)) => reply,
                Some(Ok(request)) => forward(request, &command_tx).await,
            }
        };
        write_half.write_all(reply.render().as_bytes()).await?;
        write_half.flush().await?;
    }
    debug!("remote control client disconnected");
    Ok(())
}

/// Skip the rest of an oversized line, up to and including its newline.
async fn discard_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<()> {
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        if let Some(pos) = available.iter().position(|b| *b == b'\n') {
            reader.consume(pos + 1);
            return Ok(());
        }
        let len = available.len();
        reader.consume(len);
    }
}

async fn forward(request: RemoteRequest, command_tx: &mpsc::Sender<RemoteCommand>) -> RemoteReply {
    let (reply_tx, reply_rx) = oneshot::channel();
    let command = RemoteCommand {
        request,
        reply: reply_tx,
    };
    if command_tx.send(command).await.is_err() {
        return RemoteReply::Failed("Master is not running".to_string());
    }
    reply_rx
        .await
        .unwrap_or_else(|_| RemoteReply::Failed("Master is not running".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_trimmed_and_case_insensitive() {
        assert_eq!(parse_request("start\n"), Some(Ok(RemoteRequest::Start)));
        assert_eq!(parse_request("  STOP \r\n"), Some(Ok(RemoteRequest::Stop)));
        assert_eq!(parse_request("   \n"), None);
        assert_eq!(
            parse_request("record now\n"),
            Some(Err(RemoteReply::Failed(
                "Unknown command: 'record now'".to_string()
            )))
        );
    }

    #[test]
    fn replies_render_one_line() {
        assert_eq!(RemoteReply::Ok(None).render(), "OK\n");
        assert_eq!(
            RemoteReply::Ok(Some("20240101-120000-1".to_string())).render(),
            "OK 20240101-120000-1\n"
        );
        assert_eq!(
            RemoteReply::Failed("Not recording".to_string()).render(),
            "*** Not recording\n"
        );
    }

    async fn start_server() -> (
        SocketAddr,
        mpsc::Receiver<RemoteCommand>,
        Arc<AtomicBool>,
        tokio::task::JoinHandle<()>,
    ) {
        let server = RemoteControlServer::bind("127.0.0.1:0").await.expect("bind");
        let addr = server.local_addr().expect("addr");
        let (tx, rx) = mpsc::channel(8);
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(server.run(tx, Arc::clone(&shutdown)));
        (addr, rx, shutdown, handle)
    }

    #[tokio::test]
    async fn requests_round_trip_through_core() {
        let (addr, mut rx, shutdown, handle) = start_server().await;

        let core = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(command) = rx.recv().await {
                seen.push(command.request);
                let reply = match command.request {
                    RemoteRequest::Start => RemoteReply::Ok(Some("20240101-120000-7".to_string())),
                    RemoteRequest::Stop => RemoteReply::Ok(None),
                };
                let _ = command.reply.send(reply);
                if seen.len() == 2 {
                    break;
                }
            }
            seen
        });

        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_half.write_all(b"start\n\nbogus\nStop\n").await.expect("write");
        let mut replies = Vec::new();
        for _ in 0..3 {
            let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
                .await
                .expect("timeout")
                .expect("read")
                .expect("line");
            replies.push(line);
        }
        assert_eq!(
            replies,
            vec![
                "OK 20240101-120000-7".to_string(),
                "*** Unknown command: 'bogus'".to_string(),
                "OK".to_string(),
            ]
        );
        assert_eq!(
            core.await.expect("core task"),
            vec![RemoteRequest::Start, RemoteRequest::Stop]
        );

        shutdown.store(true, Ordering::SeqCst);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn dropped_core_reports_not_running() {
        let (addr, rx, shutdown, handle) = start_server().await;
        drop(rx);

        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        write_half.write_all(b"stop\n").await.expect("write");
        let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .expect("timeout")
            .expect("read")
            .expect("line");
        assert_eq!(line, "*** Master is not running");

        shutdown.store(true, Ordering::SeqCst);
        let _ = handle.await;
    }

    /// Answers every request with `OK`, counting stops.
    fn spawn_stop_core(mut rx: mpsc::Receiver<RemoteCommand>) -> tokio::task::JoinHandle<usize> {
        tokio::spawn(async move {
            let mut stops = 0;
            while let Some(command) = rx.recv().await {
                if command.request == RemoteRequest::Stop {
                    stops += 1;
                }
                let _ = command.reply.send(RemoteReply::Ok(None));
            }
            stops
        })
    }

    async fn read_replies(
        lines: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        count: usize,
    ) -> Vec<String> {
        let mut replies = Vec::new();
        for _ in 0..count {
            let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
                .await
                .expect("timeout")
                .expect("read")
                .expect("line");
            replies.push(line);
        }
        replies
    }

    #[tokio::test]
    async fn invalid_utf8_gets_a_reply_and_connection_stays_open() {
        let (addr, rx, shutdown, handle) = start_server().await;
        let core = spawn_stop_core(rx);

        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_half.write_all(b"st\xffart\nstop\n").await.expect("write");
        let replies = read_replies(&mut lines, 2).await;
        assert_eq!(
            replies,
            vec![
                "*** Unknown command: 'st\u{fffd}art'".to_string(),
                "OK".to_string(),
            ]
        );

        drop(write_half);
        drop(lines);
        shutdown.store(true, Ordering::SeqCst);
        let _ = handle.await;
        let _ = tokio::time::timeout(Duration::from_secs(2), core).await;
    }

    #[tokio::test]
    async fn oversized_line_is_rejected_without_buffering_it() {
        let (addr, rx, shutdown, handle) = start_server().await;
        let core = spawn_stop_core(rx);

        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let mut request = vec![b'x'; MAX_REQUEST_LINE_BYTES * 4];
        request.extend_from_slice(b"\nstop\n");
        write_half.write_all(&request).await.expect("write");
        let replies = read_replies(&mut lines, 2).await;
        assert_eq!(
            replies,
            vec!["*** Request too long".to_string(), "OK".to_string()]
        );

        // A line of exactly the limit is still parsed.
        let mut request = vec![b'y'; MAX_REQUEST_LINE_BYTES];
        request.push(b'\n');
        write_half.write_all(&request).await.expect("write");
        let reply = read_replies(&mut lines, 1).await;
        assert!(reply[0].starts_with("*** Unknown command: 'yyy"));

        drop(write_half);
        drop(lines);
        shutdown.store(true, Ordering::SeqCst);
        let _ = handle.await;
        let _ = tokio::time::timeout(Duration::from_secs(2), core).await;
    }

    #[tokio::test]
    async fn shutdown_flag_stops_listener() {
        let (_addr, _rx, shutdown, handle) = start_server().await;
        shutdown.store(true, Ordering::SeqCst);
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(result.is_ok(), "listener did not shut down in time");
    }
}
