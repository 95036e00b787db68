// ABOUTME: The Encode Server: accepts remote encode requests and answers discovery hellos
// ABOUTME: Async tasks throughout, matching the original's event loop but expressed with tokio rather than select(2)

use crate::codec::Codec;
use crate::config::{
    BATCH_SERVER_PRESENCE_PORT, ENCODE_FRAME_PORT, HELLO_PORT, HELLO_TOKEN,
    MAIN_SERVER_PRESENCE_PORT, SERVER_LINK_VERSION,
};
use crate::error::{EngineError, ExceptionStore, NetworkError};
use crate::frame::{read_encoding_request, write_server_available, ServerAvailableXml};
use crate::socket::Socket;
use crate::types::{Eye, PixelFormat, RawImage};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

fn bytes_per_pixel(format: PixelFormat) -> u32 {
    match format {
        PixelFormat::Rgb24 => 3,
        PixelFormat::Bgra => 4,
        PixelFormat::Yuv420P => 2,
    }
}

/// A running (or terminating) encode server. Cheap to clone: every clone
/// shares the same worker-count limit, codec, and exception store, the way
/// a `shared_ptr<EncodeServer>` would in the original.
#[derive(Clone)]
pub struct EncodeServer {
    threads: usize,
    codec: Arc<dyn Codec>,
    exceptions: Arc<ExceptionStore>,
    terminating: Arc<AtomicBool>,
    frames_encoded: Arc<AtomicU64>,
    in_flight: Arc<Semaphore>,
}

impl EncodeServer {
    pub fn new(threads: usize, codec: Arc<dyn Codec>) -> Self {
        let threads = threads.max(1);
        Self {
            threads,
            codec,
            exceptions: Arc::new(ExceptionStore::new()),
            terminating: Arc::new(AtomicBool::new(false)),
            frames_encoded: Arc::new(AtomicU64::new(0)),
            // Back-pressure ceiling: at most 2x worker_threads requests
            // in flight at once.
            in_flight: Arc::new(Semaphore::new(threads * 2)),
        }
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded.load(Ordering::Relaxed)
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Relaxed)
    }

    pub fn rethrow(&self) -> Result<(), EngineError> {
        self.exceptions.rethrow()
    }

    /// Runs until [`EncodeServer::shutdown`] is called from another task (or
    /// thread). Binds the encode-frame TCP listener and the UDP hello
    /// listener concurrently; both stop on the same flag.
    pub async fn run(&self) -> Result<(), NetworkError> {
        let tcp = TcpListener::bind(("0.0.0.0", ENCODE_FRAME_PORT)).await?;
        let udp = UdpSocket::bind(("0.0.0.0", HELLO_PORT)).await?;

        info!(threads = self.threads, "encode server listening");

        let accept = self.accept_loop(tcp);
        let hello = self.hello_loop(udp);

        tokio::join!(accept, hello);
        Ok(())
    }

    pub fn shutdown(&self) {
        self.terminating.store(true, Ordering::SeqCst);
    }

    async fn accept_loop(&self, listener: TcpListener) {
        loop {
            if self.is_terminating() {
                break;
            }
            let accepted = tokio::time::timeout(
                std::time::Duration::from_millis(200),
                listener.accept(),
            )
            .await;
            let (stream, peer) = match accepted {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
                Err(_timeout) => continue,
            };
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer).await {
                    server.exceptions.store(EngineError::Network(e));
                }
            });
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), NetworkError> {
        // Block until a worker frees capacity rather than rejecting the
        // connection outright; the accepting task just waits here, the way
        // `handle()` waits on `_full_condition` before pushing onto the
        // worker queue.
        let _permit = self
            .in_flight
            .acquire()
            .await
            .expect("in_flight semaphore is never closed");
        debug!(%peer, "accepted for encoding");

        let mut socket = Socket::new(stream);
        let request = read_encoding_request(&mut socket).await?;
        if request.server_link_version != SERVER_LINK_VERSION {
            return Err(NetworkError::Other(format!(
                "protocol mismatch: peer speaks version {}",
                request.server_link_version
            )));
        }

        let bpp = bytes_per_pixel(request.pixel_format.into());
        let expected_len = request.width as u64 * request.height as u64 * bpp as u64;
        let pixels = socket.read_exact(expected_len as usize).await?;

        let image = RawImage::new(
            request.width,
            request.height,
            request.pixel_format.into(),
            pixels,
        );
        let eye: Eye = request.eye.into();

        let started = std::time::Instant::now();
        let codec = self.codec.clone();
        let encoded = tokio::task::spawn_blocking(move || codec.encode(&image))
            .await
            .map_err(|e| NetworkError::Other(e.to_string()))?
            .map_err(|e| NetworkError::Other(e.to_string()))?;
        let elapsed = started.elapsed();

        socket.write_framed(&encoded).await?;
        self.frames_encoded.fetch_add(1, Ordering::Relaxed);
        debug!(
            %peer,
            frame_index = request.frame_index,
            ?eye,
            elapsed_ms = elapsed.as_millis() as u64,
            "encoded frame for remote client"
        );
        Ok(())
    }

    async fn hello_loop(&self, udp: UdpSocket) {
        let mut buf = [0u8; 256];
        loop {
            if self.is_terminating() {
                break;
            }
            let received =
                tokio::time::timeout(std::time::Duration::from_millis(200), udp.recv_from(&mut buf))
                    .await;
            let (len, peer) = match received {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    warn!(error = %e, "udp recv failed");
                    continue;
                }
                Err(_timeout) => continue,
            };
            if &buf[..len] != HELLO_TOKEN.as_bytes() {
                continue;
            }
            let server = self.clone();
            tokio::spawn(async move {
                server.answer_hello(peer.ip()).await;
            });
        }
    }

    async fn answer_hello(&self, peer_ip: std::net::IpAddr) {
        let reply = ServerAvailableXml {
            link_version: SERVER_LINK_VERSION,
            threads: self.threads,
        };
        for port in [MAIN_SERVER_PRESENCE_PORT, BATCH_SERVER_PRESENCE_PORT] {
            let addr = (peer_ip, port);
            match Socket::connect(addr).await {
                Ok(mut socket) => {
                    if let Err(e) = write_server_available(&mut socket, &reply).await {
                        warn!(%peer_ip, port, error = %e, "failed to announce availability");
                    }
                }
                Err(e) => {
                    warn!(%peer_ip, port, error = %e, "failed to connect for presence announcement");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DeterministicCodec;
    use crate::frame::{write_encoding_request, EncodingRequestXml};

    #[test]
    fn back_pressure_ceiling_tracks_thread_count() {
        let server = EncodeServer::new(3, Arc::new(DeterministicCodec));
        assert_eq!(server.in_flight.available_permits(), 6);
    }

    #[test]
    fn zero_threads_is_normalised_to_one() {
        let server = EncodeServer::new(0, Arc::new(DeterministicCodec));
        assert_eq!(server.threads, 1);
    }

    #[tokio::test]
    async fn handles_one_encode_request_end_to_end() {
        let server = EncodeServer::new(1, Arc::new(DeterministicCodec));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_server = server.clone();
        let accept = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            accept_server.handle_connection(stream, peer).await
        });

        let mut client = Socket::connect(addr).await.unwrap();
        let request = EncodingRequestXml {
            frame_index: 1,
            eye: crate::frame::EyeXml::Both,
            width: 4,
            height: 4,
            pixel_format: crate::frame::PixelFormatXml::Rgb24,
            colour_range: crate::frame::ColourRangeXml::Full,
            server_link_version: SERVER_LINK_VERSION,
        };
        write_encoding_request(&mut client, &request).await.unwrap();
        client.write_all(&vec![0u8; 4 * 4 * 3]).await.unwrap();

        let response = client
            .read_framed(crate::socket::MAX_PAYLOAD_SIZE)
            .await
            .unwrap();
        assert!(!response.is_empty());

        accept.await.unwrap().unwrap();
        assert_eq!(server.frames_encoded(), 1);
    }
}
