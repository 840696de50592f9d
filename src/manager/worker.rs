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

use std::collections::HashMap;

use log::*;
use tokio::{
    sync::mpsc,
    time::Interval,
};

use crate::{
    limit::{grant_ticker, next_tick, next_token, notify, Limit, NotifySender, TokenReceiver, TokenSender, TOKEN_CHANNEL_SIZE},
    limiter::{Limiter, LimiterId},
    manager::ManagerRequest,
    rate::DEFAULT_WINDOW,
};

const LOG_TARGET: &str = "limiter::manager::worker";

struct Child {
    limiter: Box<dyn Limiter>,
    tokens: Option<TokenSender>,
}

/// The event loop behind a [`LimitManager`](crate::LimitManager).
///
/// The same discipline as a reader's limit loop, with the child registry folded in: all
/// membership changes, reconfiguration and budget distribution happen on this single task, so
/// nothing else ever mutates the registry. Child token channels are owned here and closed
/// exactly once, by dropping the sender when the child is removed or the limit is cleared.
pub(crate) struct ManagerWorker {
    requests: mpsc::Receiver<ManagerRequest>,
    // Weak so that this loop does not keep its own request channel open; the loop ends once
    // every handle and supervisor is gone, not just on an explicit close.
    request_tx: mpsc::WeakSender<ManagerRequest>,
    children: HashMap<LimiterId, Child>,
    limited: bool,
    tokens: Option<TokenReceiver>,
    ticker: Option<Interval>,
    tick_grant: u64,
    observer: Option<NotifySender>,
}

impl ManagerWorker {
    pub fn new(requests: mpsc::Receiver<ManagerRequest>, request_tx: mpsc::WeakSender<ManagerRequest>) -> Self {
        Self {
            requests,
            request_tx,
            children: HashMap::new(),
            limited: false,
            tokens: None,
            ticker: None,
            tick_grant: 0,
            observer: None,
        }
    }

    pub async fn run(mut self) {
        trace!(target: LOG_TARGET, "Manager worker started");
        loop {
            tokio::select! {
                maybe_request = self.requests.recv() => match maybe_request {
                    Some(ManagerRequest::Manage(limiter)) => self.register_child(limiter).await,
                    Some(ManagerRequest::Unmanage(id)) => self.unregister_child(id),
                    Some(ManagerRequest::SetLimit(limit)) => self.apply_limit(limit).await,
                    Some(ManagerRequest::Close(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    },
                    None => {
                        self.shutdown().await;
                        break;
                    },
                },

                quantity = next_token(&mut self.tokens) => match quantity {
                    Some(quantity) => self.distribute_grant(quantity),
                    None => {
                        debug!(target: LOG_TARGET, "External token source closed");
                        self.tokens = None;
                    },
                },

                _ = next_tick(&mut self.ticker) => {
                    self.distribute_grant(self.tick_grant);
                },
            }
        }
        trace!(target: LOG_TARGET, "Manager worker shut down");
    }

    /// Splits a total grant evenly across the current children, non blocking. A child whose
    /// token slot is still full forfeits this round, and the division remainder is dropped;
    /// the next round recomputes against the then-current population.
    fn distribute_grant(&mut self, total: u64) {
        if self.children.is_empty() {
            return;
        }
        let each = total / self.children.len() as u64;
        if each == 0 {
            trace!(
                target: LOG_TARGET,
                "Grant of {} too small to split {} ways, dropping",
                total,
                self.children.len()
            );
            return;
        }
        for (id, child) in &self.children {
            if let Some(tokens) = &child.tokens {
                if tokens.try_send(each).is_err() {
                    trace!(target: LOG_TARGET, "{} is congested, dropping its share of {}", id, each);
                }
            }
        }
    }

    async fn apply_limit(&mut self, limit: Limit) {
        notify(self.observer.take(), false);
        self.ticker = None;

        match limit {
            Limit::Rate { rate, notify: observer } if !rate.is_zero() => {
                self.tokens = None;
                let smoothed = rate.distribute(DEFAULT_WINDOW);
                debug!(
                    target: LOG_TARGET,
                    "Rate limit installed: {} bytes per {:.0?} across {} children",
                    smoothed.count,
                    smoothed.per,
                    self.children.len()
                );
                self.ticker = Some(grant_ticker(smoothed.per));
                self.tick_grant = smoothed.count;
                self.observer = observer;
                self.adopt_children().await;
            },
            Limit::Rate { notify: observer, .. } => {
                debug!(target: LOG_TARGET, "Zero rate requested; clearing limit");
                self.clear_limit().await;
                notify(observer, false);
            },
            Limit::Channel { tokens, notify: observer } => {
                debug!(target: LOG_TARGET, "External token channel installed, feeding {} children", self.children.len());
                self.tokens = Some(tokens);
                self.observer = observer;
                self.adopt_children().await;
            },
            Limit::Clear => {
                debug!(target: LOG_TARGET, "Limit cleared; unlimiting {} children", self.children.len());
                self.clear_limit().await;
            },
        }
    }

    /// Issues every child a fresh token channel under the newly installed limit.
    async fn adopt_children(&mut self) {
        self.limited = true;
        let ids: Vec<LimiterId> = self.children.keys().copied().collect();
        for id in ids {
            self.limit_child(id).await;
        }
    }

    async fn clear_limit(&mut self) {
        self.limited = false;
        self.tokens = None;
        self.ticker = None;
        for child in self.children.values_mut() {
            child.tokens = None;
            child.limiter.unlimit().await;
        }
    }

    async fn register_child(&mut self, limiter: Box<dyn Limiter>) {
        let id = limiter.limiter_id();
        if self.children.contains_key(&id) {
            debug!(target: LOG_TARGET, "{} is already managed; replacing its registration", id);
        }
        self.children.insert(id, Child { limiter, tokens: None });
        if self.limited {
            self.limit_child(id).await;
        } else {
            // Newly adopted children start from a clean slate whether or not they carried a
            // limit of their own.
            if let Some(child) = self.children.get(&id) {
                child.limiter.unlimit().await;
            }
        }
        debug!(target: LOG_TARGET, "{} registered, now managing {} limiters", id, self.children.len());
    }

    fn unregister_child(&mut self, id: LimiterId) {
        // Dropping the child drops its token sender, closing the channel exactly once.
        if self.children.remove(&id).is_some() {
            debug!(target: LOG_TARGET, "{} unregistered, now managing {} limiters", id, self.children.len());
        }
    }

    /// Puts one child under this manager's budget and supervises its notifier: a terminal
    /// signal from the child is turned into an unregister event on the request channel, never
    /// into direct registry mutation from another task.
    async fn limit_child(&mut self, id: LimiterId) {
        let requests = self.request_tx.clone();
        let child = match self.children.get_mut(&id) {
            Some(child) => child,
            None => return,
        };
        let (token_tx, token_rx) = mpsc::channel(TOKEN_CHANNEL_SIZE);
        let done = child.limiter.limit_with_channel(token_rx).await;
        child.tokens = Some(token_tx);

        tokio::spawn(async move {
            if let Ok(true) = done.await {
                if let Some(requests) = requests.upgrade() {
                    let _ = requests.send(ManagerRequest::Unmanage(id)).await;
                }
            }
        });
    }

    async fn shutdown(&mut self) {
        for child in self.children.values_mut() {
            child.tokens = None;
            child.limiter.unlimit().await;
        }
        notify(self.observer.take(), true);
    }
}
