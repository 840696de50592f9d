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

use tokio::sync::mpsc;

use crate::limit::{grant_ticker, TokenReceiver};

/// The minimum interval between grants issued under a smoothed rate.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(10);

/// A byte rate: `count` bytes for every `per` elapsed.
///
/// The zero rate (`count == 0`) is a sentinel meaning "no rate configured"; installing it on a
/// limiter clears any active limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rate {
    pub count: u64,
    pub per: Duration,
}

impl Rate {
    pub const fn new(count: u64, per: Duration) -> Self {
        Self { count, per }
    }

    pub const fn zero() -> Self {
        Self {
            count: 0,
            per: Duration::ZERO,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.count == 0
    }

    /// Evenly distributes this rate over intervals no shorter than `window`, preserving the
    /// average rate.
    ///
    /// A coarse rate such as 80 bytes per 100ms becomes 8 bytes every 10ms, so consumers see a
    /// steady trickle rather than a burst at the start of every period. A rate below one byte
    /// per window instead stretches the period: 5 bytes per second becomes 1 byte every 200ms.
    /// The distributed count is truncated, never rounded up.
    pub fn distribute(self, window: Duration) -> Rate {
        if self.count == 0 {
            return Rate::zero();
        }
        if self.per.is_zero() {
            // An instantaneous period cannot be smoothed. Grant the full count once per window.
            return Rate::new(self.count, window);
        }

        let ratio = self.per.as_secs_f64() / window.as_secs_f64();
        let per_window = self.count as f64 / ratio;
        if per_window >= 1.0 {
            Rate::new(per_window as u64, window)
        } else {
            Rate::new(1, window.div_f64(per_window))
        }
    }
}

/// Returns a free running channel of byte grants at the given rate, smoothed over
/// [`DEFAULT_WINDOW`], suitable for [`limit_with_channel`](crate::LimitedReader::limit_with_channel).
///
/// The backing task stops once the receiver is dropped. Must be called from within a tokio
/// runtime. A zero rate yields a channel that never produces a grant.
pub fn basic_rate_channel(count: u64, per: Duration) -> TokenReceiver {
    let (tx, rx) = mpsc::channel(1);
    let rate = Rate::new(count, per).distribute(DEFAULT_WINDOW);
    if rate.is_zero() {
        return rx;
    }

    tokio::spawn(async move {
        let mut ticker = grant_ticker(rate.per);
        loop {
            ticker.tick().await;
            if tx.send(rate.count).await.is_err() {
                break;
            }
        }
    });

    rx
}
