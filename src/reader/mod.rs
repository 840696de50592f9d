// Copyright 2023. The Tari Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

mod worker;

use std::{
    cmp,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use log::*;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::{mpsc, mpsc::error::TryRecvError, oneshot},
    time,
};

use crate::{
    error::{LimitError, ReadError},
    limit::{Limit, LimitNotify, LimitRequest, TokenReceiver, GRANT_QUEUE_SIZE, REQUEST_BUFFER_SIZE},
    limiter::{Limiter, LimiterId},
    rate::Rate,
    reader::worker::LimitWorker,
};

const LOG_TARGET: &str = "limiter::reader";

/// Cloneable control surface of a [`LimitedReader`].
///
/// The handle carries only the reconfiguration capability, so a reader can be handed to a
/// [`LimitManager`](crate::LimitManager) (or any other supervisor) while its owner keeps
/// reading from it.
#[derive(Debug, Clone)]
pub struct LimitHandle {
    id: LimiterId,
    requests: mpsc::Sender<LimitRequest>,
    limited: Arc<AtomicBool>,
}

impl LimitHandle {
    fn new(id: LimiterId, requests: mpsc::Sender<LimitRequest>, limited: Arc<AtomicBool>) -> Self {
        Self { id, requests, limited }
    }

    /// Whether a limit is currently installed. Reconfiguration is asynchronous, so this flips
    /// once the event loop has applied the request.
    pub fn is_limited(&self) -> bool {
        self.limited.load(Ordering::Acquire)
    }

    /// Installs a smoothed rate limit of `count` bytes per `per`, superseding any current
    /// limit. A zero `count` clears the limit instead.
    pub async fn limit_rate(&self, count: u64, per: Duration) -> LimitNotify {
        let (observer, notify) = oneshot::channel();
        self.send_limit(Limit::Rate {
            rate: Rate::new(count, per),
            notify: Some(observer),
        })
        .await;
        notify
    }

    /// Installs an external feed of byte grants as the limit, superseding any current limit.
    pub async fn limit_with_channel(&self, tokens: TokenReceiver) -> LimitNotify {
        let (observer, notify) = oneshot::channel();
        self.send_limit(Limit::Channel {
            tokens,
            notify: Some(observer),
        })
        .await;
        notify
    }

    /// Removes any active limit; reads pass straight through to the source.
    pub async fn unlimit(&self) {
        self.send_limit(Limit::Clear).await;
    }

    /// Shuts the limit event loop down. The current limit's notifier resolves `true`. Closing
    /// leaves the reader itself usable as an unlimited passthrough to its source.
    pub async fn close(&self) -> Result<(), LimitError> {
        let (reply, done) = oneshot::channel();
        self.requests
            .send(LimitRequest::Close(reply))
            .await
            .map_err(|_| LimitError::Closed)?;
        // The worker acks just before it exits. A dropped reply also means it is gone.
        let _ = done.await;
        Ok(())
    }

    async fn send_limit(&self, limit: Limit) {
        // A failed send means the loop has already shut down. The request is dropped; any
        // notifier inside the request is dropped with it, which observers see as a closed
        // channel.
        if self.requests.send(LimitRequest::SetLimit(limit)).await.is_err() {
            debug!(target: LOG_TARGET, "Limit request ignored: limiter has shut down");
        }
    }
}

#[async_trait]
impl Limiter for LimitHandle {
    fn limiter_id(&self) -> LimiterId {
        self.id
    }

    async fn limit_with_channel(&self, tokens: TokenReceiver) -> LimitNotify {
        LimitHandle::limit_with_channel(self, tokens).await
    }

    async fn unlimit(&self) {
        LimitHandle::unlimit(self).await
    }
}

/// A byte stream wrapper that throttles reads according to a dynamically reconfigurable limit.
///
/// Reads pull from the underlying source only as fast as the installed limit issues byte
/// grants. With no limit installed reads pass straight through. The limit can be changed at any
/// time, including while a read is blocked waiting for budget.
///
/// Must be constructed from within a tokio runtime; the limit state is driven by a dedicated
/// event loop task.
#[derive(Debug)]
pub struct LimitedReader<R> {
    source: R,
    grants: mpsc::Receiver<u64>,
    limited: Arc<AtomicBool>,
    eof: bool,
    read_timeout: Option<Duration>,
    handle: LimitHandle,
}

impl<R> LimitedReader<R>
where R: AsyncRead + Unpin
{
    /// Creates a reader bound to `source` with no limit installed.
    pub fn new(source: R) -> Self {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_BUFFER_SIZE);
        let (grant_tx, grant_rx) = mpsc::channel(GRANT_QUEUE_SIZE);
        let limited = Arc::new(AtomicBool::new(false));

        tokio::spawn(LimitWorker::new(request_rx, grant_tx, limited.clone()).run());

        Self {
            source,
            grants: grant_rx,
            limited: limited.clone(),
            eof: false,
            read_timeout: None,
            handle: LimitHandle::new(LimiterId::next(), request_tx, limited),
        }
    }

    /// Whether a limit is currently installed on this reader.
    pub fn is_limited(&self) -> bool {
        self.handle.is_limited()
    }

    /// Reads up to `buf.len()` bytes from the source, honoring the current limit.
    ///
    /// Blocks only when nothing has been read yet and no grant is available; once at least one
    /// byte has been written the read returns rather than wait for more budget. End of stream
    /// is reported as `Ok(0)` and is permanent. Source errors other than end of stream are
    /// surfaced unchanged and leave the reader usable, so the caller may retry.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        if self.eof {
            return Ok(0);
        }

        let mut written = 0;
        while written < buf.len() {
            let remaining = buf.len() - written;
            let quantity = if self.limited.load(Ordering::Acquire) {
                match self.grants.try_recv() {
                    Ok(quantity) => quantity,
                    Err(TryRecvError::Empty) => {
                        if written > 0 {
                            return Ok(written);
                        }
                        self.await_grant().await?
                    },
                    // The event loop has shut down, so nothing limits this reader any more.
                    Err(TryRecvError::Disconnected) => 0,
                }
            } else {
                0
            };

            // A zero grant is the clear sentinel: the remainder of this read is unrestricted.
            let permit = match quantity {
                0 => remaining,
                n => cmp::min(n, remaining as u64) as usize,
            };

            let read = self.source.read(&mut buf[written..written + permit]).await?;
            if read == 0 {
                self.eof = true;
                break;
            }
            written += read;
        }

        Ok(written)
    }

    async fn await_grant(&mut self) -> Result<u64, ReadError> {
        let grant = match self.read_timeout {
            Some(timeout) => time::timeout(timeout, self.grants.recv())
                .await
                .map_err(|_| ReadError::Timeout)?,
            None => self.grants.recv().await,
        };
        // A closed grant queue means the loop has shut down; fall through to the sentinel.
        Ok(grant.unwrap_or(0))
    }

    /// Bounds how long a single `read` may wait for the limiter to issue a grant. A read that
    /// times out consumes no source bytes and does not advance the limit state; `None` removes
    /// the bound.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// See [`LimitHandle::limit_rate`].
    pub async fn limit_rate(&self, count: u64, per: Duration) -> LimitNotify {
        self.handle.limit_rate(count, per).await
    }

    /// See [`LimitHandle::limit_with_channel`].
    pub async fn limit_with_channel(&self, tokens: TokenReceiver) -> LimitNotify {
        self.handle.limit_with_channel(tokens).await
    }

    /// See [`LimitHandle::unlimit`].
    pub async fn unlimit(&self) {
        self.handle.unlimit().await
    }

    /// Shuts down the limit event loop and resolves the current limit's notifier with `true`.
    /// The reader remains readable afterwards as an unlimited passthrough. A second close
    /// returns [`LimitError::Closed`].
    pub async fn close(&mut self) -> Result<(), LimitError> {
        self.handle.close().await
    }

    /// Returns the cloneable control surface for this reader, for handing to a manager.
    pub fn limit_handle(&self) -> LimitHandle {
        self.handle.clone()
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::*;

    #[tokio::test]
    async fn eof_is_absorbing() {
        let mut reader = LimitedReader::new(Cursor::new(vec![7u8; 16]));
        let mut buf = [0u8; 32];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 16);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn close_twice_errors_without_hanging() {
        let mut reader = LimitedReader::new(Cursor::new(vec![0u8; 8]));
        reader.close().await.unwrap();
        match reader.close().await {
            Err(LimitError::Closed) => {},
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn limit_after_close_yields_closed_notifier() {
        let mut reader = LimitedReader::new(Cursor::new(vec![0u8; 8]));
        reader.close().await.unwrap();
        let notify = reader.limit_rate(100, Duration::from_secs(1)).await;
        assert!(notify.await.is_err());
    }
}
