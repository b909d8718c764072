// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Connection handle over any async byte stream.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::debug;

use super::device::PeerDevice;
use super::transport::{CloseSignal, ConnectionHandle, TransportError};

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// A [`ConnectionHandle`] backed by a split byte stream.
///
/// The halves are dropped as soon as the handle is closed, which closes the
/// underlying socket. A read or write in flight at that moment returns
/// [`TransportError::Closed`] and drops its half on the way out.
pub struct StreamConnection<S> {
    peer: PeerDevice,
    reader: Mutex<Option<ReadHalf<S>>>,
    writer: Mutex<Option<WriteHalf<S>>>,
    closed: CloseSignal,
    on_release: parking_lot::Mutex<Option<ReleaseHook>>,
}

impl<S> StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(peer: PeerDevice, stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            peer,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed: CloseSignal::new(),
            on_release: parking_lot::Mutex::new(None),
        }
    }

    /// Run `hook` exactly once when the handle is closed or dropped.
    pub fn with_release(self, hook: impl FnOnce() + Send + 'static) -> Self {
        *self.on_release.lock() = Some(Box::new(hook));
        self
    }
}

impl<S> StreamConnection<S> {
    fn release(&self) {
        if let Some(hook) = self.on_release.lock().take() {
            hook();
        }
    }
}

#[async_trait]
impl<S> ConnectionHandle for StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn peer(&self) -> &PeerDevice {
        &self.peer
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut guard = self.writer.lock().await;
        let outcome = match guard.as_mut() {
            None => return Err(TransportError::Closed),
            Some(writer) => {
                tokio::select! {
                    biased;
                    _ = self.closed.closed() => None,
                    res = async {
                        writer.write_all(data).await?;
                        writer.flush().await
                    } => Some(res),
                }
            }
        };

        match outcome {
            None => {
                guard.take();
                Err(TransportError::Closed)
            }
            Some(res) => Ok(res?),
        }
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.closed.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut guard = self.reader.lock().await;
        let outcome = match guard.as_mut() {
            None => return Err(TransportError::Closed),
            Some(reader) => {
                tokio::select! {
                    biased;
                    _ = self.closed.closed() => None,
                    res = reader.read(buf) => Some(res),
                }
            }
        };

        match outcome {
            None => {
                guard.take();
                Err(TransportError::Closed)
            }
            Some(res) => Ok(res?),
        }
    }

    fn close(&self) {
        if !self.closed.close() {
            return;
        }
        debug!("Closing connection to {}", self.peer);

        // Halves held by an in-flight operation are dropped by that operation.
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        self.release();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }
}

impl<S> Drop for StreamConnection<S> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn pair() -> (StreamConnection<tokio::io::DuplexStream>, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(256);
        (
            StreamConnection::new(PeerDevice::named("Remote", "11:22"), local),
            remote,
        )
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (conn, mut remote) = pair();

        conn.send(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = remote.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        remote.write_all(b"world").await.unwrap();
        let n = conn.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[tokio::test]
    async fn test_remote_close_reads_eof() {
        let (conn, remote) = pair();
        drop(remote);

        let mut buf = [0u8; 16];
        assert_eq!(conn.receive(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_pending_receive() {
        let (conn, _remote) = pair();
        let conn = Arc::new(conn);

        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                conn.receive(&mut buf).await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        conn.close();

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("receive should be interrupted")
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_close_drops_stream_and_is_idempotent() {
        let (conn, mut remote) = pair();
        let released = Arc::new(AtomicUsize::new(0));
        let conn = {
            let released = released.clone();
            conn.with_release(move || {
                released.fetch_add(1, Ordering::SeqCst);
            })
        };

        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(released.load(Ordering::SeqCst), 1);

        let mut buf = [0u8; 4];
        assert_eq!(remote.read(&mut buf).await.unwrap(), 0);
        assert!(matches!(conn.send(b"x").await, Err(TransportError::Closed)));

        drop(conn);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
