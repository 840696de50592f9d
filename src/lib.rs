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

//! # Tari stream limiter
//!
//! Rate limiting and flow control for arbitrary byte streams.
//!
//! A [`LimitedReader`] wraps any [`AsyncRead`](tokio::io::AsyncRead) source and throttles how fast
//! bytes may be pulled from it. The policy is reconfigurable at any time while reads are in
//! flight: a smoothed byte rate ([`LimitedReader::limit_rate`]), an external feed of byte grants
//! ([`LimitedReader::limit_with_channel`]), or no limit at all ([`LimitedReader::unlimit`]).
//!
//! A [`LimitManager`] is itself a [`Limiter`] that owns a dynamic set of child limiters and
//! divides whatever budget it is given evenly between them. Managers can manage other managers,
//! so a single coarse budget (say, per network interface) can be fanned out across finer ones
//! (say, per connection).
//!
//! Every limited entity is driven by a dedicated event loop task which serializes
//! reconfiguration, timer ticks, token feeds and shutdown, so no locks are held around the
//! throttling decisions themselves.

mod error;
mod limit;
mod limiter;
mod manager;
mod rate;
mod reader;
pub mod units;

pub use error::{LimitError, ReadError};
pub use limit::{LimitNotify, TokenReceiver, TokenSender};
pub use limiter::{Limiter, LimiterId};
pub use manager::LimitManager;
pub use rate::{basic_rate_channel, Rate, DEFAULT_WINDOW};
pub use reader::{LimitHandle, LimitedReader};
