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

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use log::*;
use tokio::{
    sync::mpsc,
    time::Interval,
};

use crate::{
    limit::{grant_ticker, next_tick, next_token, notify, Limit, LimitRequest, NotifySender, TokenReceiver},
    rate::DEFAULT_WINDOW,
};

const LOG_TARGET: &str = "limiter::reader::worker";

/// The event loop behind a [`LimitedReader`](crate::LimitedReader).
///
/// A single task serializes every source of change to the limit state: reconfiguration
/// requests, ticks of the smoothed rate ticker, quantities arriving on an external token feed,
/// and shutdown. Grants flow out through a short bounded queue which the reader drains; pushes
/// are non blocking so a stalled reader can never stall this loop.
pub(crate) struct LimitWorker {
    requests: mpsc::Receiver<LimitRequest>,
    grants: mpsc::Sender<u64>,
    limited: Arc<AtomicBool>,
    tokens: Option<TokenReceiver>,
    ticker: Option<Interval>,
    tick_grant: u64,
    observer: Option<NotifySender>,
}

impl LimitWorker {
    pub fn new(
        requests: mpsc::Receiver<LimitRequest>,
        grants: mpsc::Sender<u64>,
        limited: Arc<AtomicBool>,
    ) -> Self {
        Self {
            requests,
            grants,
            limited,
            tokens: None,
            ticker: None,
            tick_grant: 0,
            observer: None,
        }
    }

    pub async fn run(mut self) {
        trace!(target: LOG_TARGET, "Limit worker started");
        loop {
            tokio::select! {
                maybe_request = self.requests.recv() => match maybe_request {
                    Some(LimitRequest::SetLimit(limit)) => self.apply_limit(limit),
                    Some(LimitRequest::Close(reply)) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    },
                    None => {
                        // Every handle has been dropped; treat it as a close.
                        self.shutdown();
                        break;
                    },
                },

                quantity = next_token(&mut self.tokens) => match quantity {
                    Some(quantity) => self.issue_grant(quantity),
                    None => {
                        // The token source was closed by its owner. The limit stays installed;
                        // it simply receives no further budget until reconfigured.
                        debug!(target: LOG_TARGET, "External token source closed");
                        self.tokens = None;
                    },
                },

                _ = next_tick(&mut self.ticker) => {
                    self.issue_grant(self.tick_grant);
                },
            }
        }
        trace!(target: LOG_TARGET, "Limit worker shut down");
    }

    fn apply_limit(&mut self, limit: Limit) {
        // Whatever was installed before is now superseded.
        notify(self.observer.take(), false);
        self.ticker = None;
        self.tokens = None;

        match limit {
            Limit::Rate { rate, notify: observer } if !rate.is_zero() => {
                let smoothed = rate.distribute(DEFAULT_WINDOW);
                debug!(
                    target: LOG_TARGET,
                    "Rate limit installed: {} bytes per {:.0?} (smoothed to {} bytes per {:.0?})",
                    rate.count,
                    rate.per,
                    smoothed.count,
                    smoothed.per
                );
                self.ticker = Some(grant_ticker(smoothed.per));
                self.tick_grant = smoothed.count;
                self.observer = observer;
                self.limited.store(true, Ordering::Release);
            },
            Limit::Rate { notify: observer, .. } => {
                // A zero rate carries no budget to mete out; it behaves as a clear. Its
                // observer is resolved immediately since the limit never took effect.
                debug!(target: LOG_TARGET, "Zero rate requested; clearing limit");
                self.clear_limit();
                notify(observer, false);
            },
            Limit::Channel { tokens, notify: observer } => {
                debug!(target: LOG_TARGET, "External token channel installed");
                self.tokens = Some(tokens);
                self.observer = observer;
                self.limited.store(true, Ordering::Release);
            },
            Limit::Clear => {
                debug!(target: LOG_TARGET, "Limit cleared");
                self.clear_limit();
            },
        }
    }

    fn clear_limit(&mut self) {
        self.limited.store(false, Ordering::Release);
        // A reader may be parked waiting for a grant from the limit that was just removed. The
        // zero grant is the wake-up sentinel: it lets the current read proceed unrestricted.
        let _ = self.grants.try_send(0);
    }

    fn issue_grant(&mut self, quantity: u64) {
        // Zero is reserved as the clear sentinel, and an over-full queue means the reader
        // already has a pipeline of unconsumed grants; dropping this one bounds the burst.
        if quantity == 0 {
            return;
        }
        if self.grants.try_send(quantity).is_err() {
            trace!(target: LOG_TARGET, "Grant queue full, dropping grant of {}", quantity);
        }
    }

    fn shutdown(&mut self) {
        self.limited.store(false, Ordering::Release);
        self.ticker = None;
        self.tokens = None;
        notify(self.observer.take(), true);
        // Dropping self closes the grant queue, waking any parked reader into unlimited
        // passthrough.
    }
}
