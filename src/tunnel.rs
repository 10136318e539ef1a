use std::sync::Arc;

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::upstream::Upstream;

const BUFFER_SIZE: usize = 8 * 1024;

// A tunnel pairs one client socket with one upstream socket and runs two
// independent half-tunnels over them until both have exited. There is
// no coordination between the two halves beyond sharing the sockets:
// closing one unblocks the other's read with an error, which is the
// intended shutdown signal.
pub struct BidirectionalTunnel;

impl BidirectionalTunnel {
    // Spawns the two half-tunnel tasks and returns immediately, it does
    // not wait for either to finish.
    pub fn spawn(client: TcpStream, upstream_sock: TcpStream, upstream: Arc<Upstream>) {
        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream_sock.into_split();

        let up_a = Arc::clone(&upstream);
        tokio::spawn(half_tunnel(client_read, upstream_write, up_a, "client->upstream"));

        let up_b = Arc::clone(&upstream);
        tokio::spawn(half_tunnel(upstream_read, client_write, up_b, "upstream->client"));
    }
}

// One direction of a tunnel: forwards bytes from src to dst until EOF or
// an I/O error, then closes dst. Increments upstream.opened once per
// half-tunnel, so a full connection contributes +2, and likewise for
// closed, since each direction is tracked independently.
async fn half_tunnel(
    src: OwnedReadHalf,
    dst: OwnedWriteHalf,
    upstream: Arc<Upstream>,
    label: &'static str,
) {
    let mut reader = BufReader::new(src);
    let mut writer = BufWriter::new(dst);

    upstream.increment_opened_conn();

    let mut buf = [0u8; BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("{} half-tunnel read error on {}: {}", label, upstream.endpoint, e);
                break;
            }
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            debug!("{} half-tunnel write error on {}: {}", label, upstream.endpoint, e);
            break;
        }
        if let Err(e) = writer.flush().await {
            debug!("{} half-tunnel flush error on {}: {}", label, upstream.endpoint, e);
            break;
        }

        upstream.increment_byte_rate_by(n as u64);
    }

    let _ = writer.shutdown().await;
    upstream.increment_closed_conn();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept_res, connect_res) = tokio::join!(listener.accept(), connect);
        (accept_res.unwrap().0, connect_res.unwrap())
    }

    #[tokio::test]
    async fn forwards_bytes_and_updates_counters() {
        let (client_side, mut client_peer) = loopback_pair().await;
        let (upstream_side, mut upstream_peer) = loopback_pair().await;

        let upstream = Arc::new(Upstream::new(Endpoint::new("localhost", 1), None));
        BidirectionalTunnel::spawn(client_side, upstream_side, Arc::clone(&upstream));

        client_peer.write_all(b"HELLO\n").await.unwrap();
        let mut buf = [0u8; 6];
        upstream_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HELLO\n");

        upstream_peer.write_all(b"WORLD\n").await.unwrap();
        let mut buf2 = [0u8; 6];
        client_peer.read_exact(&mut buf2).await.unwrap();
        assert_eq!(&buf2, b"WORLD\n");

        drop(client_peer);
        drop(upstream_peer);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(upstream.byte_rate.total_count() >= 12);
        assert_eq!(upstream.opened.total_count(), 2);
        assert_eq!(upstream.closed.total_count(), 2);
    }
}
