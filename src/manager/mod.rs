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

use std::time::Duration;

use async_trait::async_trait;
use log::*;
use tokio::{
    io::AsyncRead,
    sync::{mpsc, oneshot},
};

use crate::{
    error::LimitError,
    limit::{Limit, LimitNotify, TokenReceiver, REQUEST_BUFFER_SIZE},
    limiter::{Limiter, LimiterId},
    manager::worker::ManagerWorker,
    rate::Rate,
    reader::LimitedReader,
};

const LOG_TARGET: &str = "limiter::manager";

pub(crate) enum ManagerRequest {
    Manage(Box<dyn Limiter>),
    Unmanage(LimiterId),
    SetLimit(Limit),
    Close(oneshot::Sender<()>),
}

/// A limiter that owns a dynamic set of child limiters and splits its own budget evenly
/// between them.
///
/// The manager implements [`Limiter`] itself, so managers can be nested to build hierarchies:
/// whatever budget a manager receives, through a rate limit or an external token feed, is
/// divided per tick across its children. Distribution is non blocking; a child that has not
/// drained its previous share forfeits the current round rather than stall its siblings.
///
/// Cloning the manager clones the control surface; all clones drive the same event loop.
/// Must be constructed from within a tokio runtime.
#[derive(Clone)]
pub struct LimitManager {
    id: LimiterId,
    requests: mpsc::Sender<ManagerRequest>,
}

impl LimitManager {
    /// Creates a new manager with no children and no limit.
    pub fn new() -> Self {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_BUFFER_SIZE);
        tokio::spawn(ManagerWorker::new(request_rx, request_tx.downgrade()).run());
        Self {
            id: LimiterId::next(),
            requests: request_tx,
        }
    }

    /// Adds a limiter to this manager's children. While the manager is limited the child is
    /// immediately switched onto a share of the manager's budget; otherwise it is unlimited.
    ///
    /// A manager refuses to manage itself.
    pub async fn manage<L>(&self, limiter: L) -> Result<(), LimitError>
    where L: Limiter + 'static {
        if limiter.limiter_id() == self.id {
            return Err(LimitError::ManageSelf);
        }
        self.requests
            .send(ManagerRequest::Manage(Box::new(limiter)))
            .await
            .map_err(|_| LimitError::Closed)
    }

    /// Removes a limiter from this manager's children and closes its token channel. The child
    /// keeps whatever limit it currently has; it simply receives no further budget from here.
    pub async fn unmanage<L>(&self, limiter: &L) -> Result<(), LimitError>
    where L: Limiter {
        self.requests
            .send(ManagerRequest::Unmanage(limiter.limiter_id()))
            .await
            .map_err(|_| LimitError::Closed)
    }

    /// Creates a [`LimitedReader`] over `source` and manages it in one step.
    pub async fn new_reader<R>(&self, source: R) -> Result<LimitedReader<R>, LimitError>
    where R: AsyncRead + Unpin {
        let reader = LimitedReader::new(source);
        self.manage(reader.limit_handle()).await?;
        Ok(reader)
    }

    /// Installs a smoothed rate limit on this manager, superseding any current limit. Every
    /// child is issued a fresh share of the budget. A zero `count` clears the limit instead.
    pub async fn limit_rate(&self, count: u64, per: Duration) -> LimitNotify {
        let (observer, notify) = oneshot::channel();
        self.send_limit(Limit::Rate {
            rate: Rate::new(count, per),
            notify: Some(observer),
        })
        .await;
        notify
    }

    /// Installs an external feed of byte grants as this manager's budget, superseding any
    /// current limit.
    pub async fn limit_with_channel(&self, tokens: TokenReceiver) -> LimitNotify {
        let (observer, notify) = oneshot::channel();
        self.send_limit(Limit::Channel {
            tokens,
            notify: Some(observer),
        })
        .await;
        notify
    }

    /// Removes any active limit and unlimits every child.
    pub async fn unlimit(&self) {
        self.send_limit(Limit::Clear).await;
    }

    /// Shuts the manager down: every child is unlimited and the current limit's notifier
    /// resolves `true`. Children stay alive; only the management of them ends. A second close
    /// returns [`LimitError::Closed`].
    pub async fn close(&self) -> Result<(), LimitError> {
        let (reply, done) = oneshot::channel();
        self.requests
            .send(ManagerRequest::Close(reply))
            .await
            .map_err(|_| LimitError::Closed)?;
        let _ = done.await;
        Ok(())
    }

    async fn send_limit(&self, limit: Limit) {
        if self.requests.send(ManagerRequest::SetLimit(limit)).await.is_err() {
            debug!(target: LOG_TARGET, "Limit request ignored: manager has shut down");
        }
    }
}

impl Default for LimitManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Limiter for LimitManager {
    fn limiter_id(&self) -> LimiterId {
        self.id
    }

    async fn limit_with_channel(&self, tokens: TokenReceiver) -> LimitNotify {
        LimitManager::limit_with_channel(self, tokens).await
    }

    async fn unlimit(&self) {
        LimitManager::unlimit(self).await
    }
}
