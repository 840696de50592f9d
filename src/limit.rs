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

use std::time::Duration;

use futures::future;
use tokio::{
    sync::{mpsc, oneshot},
    time,
    time::{Interval, MissedTickBehavior},
};

use crate::rate::Rate;

/// Maximum number of grants queued between a limit event loop and its reader. A short pipeline
/// lets grants survive a brief reader stall without ever stalling the loop.
pub(crate) const GRANT_QUEUE_SIZE: usize = 10;

/// Buffer size of the token channels a manager issues to its children. Delivery is non
/// blocking, so a child that has not drained its slot forfeits the next round.
pub(crate) const TOKEN_CHANNEL_SIZE: usize = 1;

/// Buffer size of the control request channel feeding each event loop.
pub(crate) const REQUEST_BUFFER_SIZE: usize = 16;

/// Sending half of an external token feed. Each value is a grant of that many bytes.
pub type TokenSender = mpsc::Sender<u64>;

/// Receiving half of an external token feed, installed on a limiter with `limit_with_channel`.
pub type TokenReceiver = mpsc::Receiver<u64>;

/// One-shot observer returned from every limit installation.
///
/// Resolves to `false` when the limit is superseded by a later reconfiguration and `true` when
/// the limited entity shuts down while this limit is current. The sender is dropped after at
/// most one value, so the channel closing is the definitive "no further notifications" signal.
pub type LimitNotify = oneshot::Receiver<bool>;

pub(crate) type NotifySender = oneshot::Sender<bool>;

/// A reconfiguration request for a limited entity.
#[derive(Debug)]
pub(crate) enum Limit {
    Rate {
        rate: Rate,
        notify: Option<NotifySender>,
    },
    Channel {
        tokens: TokenReceiver,
        notify: Option<NotifySender>,
    },
    Clear,
}

#[derive(Debug)]
pub(crate) enum LimitRequest {
    SetLimit(Limit),
    Close(oneshot::Sender<()>),
}

/// Delivers a supersession (`false`) or terminal (`true`) signal to an observer, if there is
/// one. Delivery is best effort; a dropped receiver is not an error. Dropping the sender closes
/// the channel, which observers treat as end of notifications.
pub(crate) fn notify(observer: Option<NotifySender>, terminal: bool) {
    if let Some(observer) = observer {
        let _ = observer.send(terminal);
    }
}

/// A ticker that fires one period from now and every period thereafter, dropping missed ticks
/// rather than bursting to catch up.
pub(crate) fn grant_ticker(period: Duration) -> Interval {
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Receives from an optional token feed. Pends forever when no feed is installed, so this can
/// be used directly as a `select!` branch.
pub(crate) async fn next_token(tokens: &mut Option<TokenReceiver>) -> Option<u64> {
    match tokens {
        Some(tokens) => tokens.recv().await,
        None => future::pending().await,
    }
}

/// Waits for the next tick of an optional ticker. Pends forever when no ticker is armed.
pub(crate) async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        },
        None => future::pending().await,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn notify_delivers_exactly_one_value_then_closes() {
        let (tx, rx) = oneshot::channel();
        notify(Some(tx), true);
        assert_eq!(rx.await, Ok(true));

        let (tx, rx) = oneshot::channel();
        notify(Some(tx), false);
        assert_eq!(rx.await, Ok(false));
    }

    #[test]
    fn notify_without_observer_is_a_noop() {
        notify(None, true);
        notify(None, false);
    }

    #[tokio::test]
    async fn dropped_observer_is_tolerated() {
        let (tx, rx) = oneshot::channel();
        drop(rx);
        notify(Some(tx), true);
    }
}
