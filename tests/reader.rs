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

use std::{io::Cursor, time::Duration};

use tari_limiter::{basic_rate_channel, LimitError, LimitHandle, LimitedReader, ReadError};
use tokio::{sync::mpsc, time::sleep};

fn source_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Reconfiguration is applied by the reader's event loop, so tests wait for the observable
/// limited flag to flip before asserting on read behavior.
async fn wait_limited(handle: &LimitHandle, limited: bool) {
    for _ in 0..1000 {
        if handle.is_limited() == limited {
            return;
        }
        sleep(Duration::from_millis(1)).await;
    }
    panic!("limited flag never became {}", limited);
}

#[tokio::test]
async fn unlimited_read_through() {
    let data = source_data(4000);
    let mut reader = LimitedReader::new(Cursor::new(data.clone()));

    let mut buf = vec![0u8; 4000];
    let read = reader.read(&mut buf).await.unwrap();
    assert_eq!(read, 4000);
    assert_eq!(buf, data);

    assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn external_token_burst() {
    let data = source_data(512);
    let mut reader = LimitedReader::new(Cursor::new(data.clone()));
    let handle = reader.limit_handle();

    let (tokens, token_rx) = mpsc::channel(4);
    reader.limit_with_channel(token_rx).await;
    wait_limited(&handle, true).await;

    tokens.send(20).await.unwrap();
    let mut buf = [0u8; 512];
    let read = reader.read(&mut buf).await.unwrap();
    assert_eq!(read, 20);
    assert_eq!(&buf[..20], &data[..20]);

    tokens.send(10).await.unwrap();
    tokens.send(10).await.unwrap();
    // Let both grants reach the reader's queue so a single read drains them.
    sleep(Duration::from_millis(50)).await;
    let read = reader.read(&mut buf).await.unwrap();
    assert_eq!(read, 20);
    assert_eq!(&buf[..20], &data[20..40]);
}

#[tokio::test]
async fn rate_limit_is_smoothed_over_the_window() {
    let data = source_data(4000);
    let mut reader = LimitedReader::new(Cursor::new(data.clone()));
    let handle = reader.limit_handle();

    // 80 bytes per 100ms comes out as 8 bytes every 10ms.
    reader.limit_rate(80, Duration::from_millis(100)).await;
    wait_limited(&handle, true).await;

    let mut buf = [0u8; 512];
    let read = reader.read(&mut buf).await.unwrap();
    assert_eq!(read, 8);
    assert_eq!(&buf[..8], &data[..8]);

    let read = reader.read(&mut buf).await.unwrap();
    assert_eq!(read, 8);
    assert_eq!(&buf[..8], &data[8..16]);
}

#[tokio::test]
async fn new_limit_supersedes_the_previous_notifier() {
    let reader = LimitedReader::new(Cursor::new(source_data(64)));

    let first = reader.limit_rate(100, Duration::from_secs(1)).await;
    let _second = reader.limit_rate(200, Duration::from_secs(1)).await;

    assert_eq!(first.await, Ok(false));
}

#[tokio::test]
async fn current_notifier_resolves_true_on_close() {
    let mut reader = LimitedReader::new(Cursor::new(source_data(64)));

    let first = reader.limit_rate(100, Duration::from_secs(1)).await;
    let second = reader.limit_rate(200, Duration::from_secs(1)).await;
    assert_eq!(first.await, Ok(false));

    reader.close().await.unwrap();
    assert_eq!(second.await, Ok(true));
}

#[tokio::test]
async fn close_leaves_the_reader_as_a_passthrough() {
    let data = source_data(1024);
    let mut reader = LimitedReader::new(Cursor::new(data.clone()));
    reader.close().await.unwrap();

    let mut buf = vec![0u8; 1024];
    assert_eq!(reader.read(&mut buf).await.unwrap(), 1024);
    assert_eq!(buf, data);
    assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn close_while_limited_unblocks_reads() {
    let data = source_data(1024);
    let mut reader = LimitedReader::new(Cursor::new(data.clone()));
    let handle = reader.limit_handle();

    let (_tokens, token_rx) = mpsc::channel(4);
    reader.limit_with_channel(token_rx).await;
    wait_limited(&handle, true).await;

    reader.close().await.unwrap();

    let mut buf = vec![0u8; 1024];
    assert_eq!(reader.read(&mut buf).await.unwrap(), 1024);
}

#[tokio::test]
async fn unlimit_restores_passthrough() {
    let data = source_data(512);
    let mut reader = LimitedReader::new(Cursor::new(data.clone()));
    let handle = reader.limit_handle();

    let (tokens, token_rx) = mpsc::channel(4);
    tokens.send(20).await.unwrap();
    reader.limit_with_channel(token_rx).await;
    wait_limited(&handle, true).await;

    let mut buf = vec![0u8; 512];
    assert_eq!(reader.read(&mut buf).await.unwrap(), 20);

    reader.unlimit().await;
    wait_limited(&handle, false).await;

    let read = reader.read(&mut buf).await.unwrap();
    assert_eq!(read, 512 - 20);
    assert_eq!(&buf[..read], &data[20..]);
    assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn unlimit_wakes_a_parked_reader() {
    let data = source_data(256);
    let mut reader = LimitedReader::new(Cursor::new(data.clone()));
    let handle = reader.limit_handle();

    let (_tokens, token_rx) = mpsc::channel(4);
    reader.limit_with_channel(token_rx).await;
    wait_limited(&handle, true).await;

    // The read parks waiting for a grant that never comes; unlimiting must release it.
    let unlimiter = tokio::spawn(async move {
        sleep(Duration::from_millis(50)).await;
        handle.unlimit().await;
    });

    let mut buf = vec![0u8; 256];
    assert_eq!(reader.read(&mut buf).await.unwrap(), 256);
    unlimiter.await.unwrap();
}

#[tokio::test]
async fn zero_rate_clears_the_limit() {
    let data = source_data(512);
    let mut reader = LimitedReader::new(Cursor::new(data.clone()));
    let handle = reader.limit_handle();

    let first = reader.limit_rate(100, Duration::from_secs(1)).await;
    wait_limited(&handle, true).await;

    let zero = reader.limit_rate(0, Duration::from_secs(1)).await;
    assert_eq!(first.await, Ok(false));
    assert_eq!(zero.await, Ok(false));
    wait_limited(&handle, false).await;

    let mut buf = vec![0u8; 512];
    assert_eq!(reader.read(&mut buf).await.unwrap(), 512);
}

#[tokio::test]
async fn read_times_out_without_consuming_bytes() {
    let data = source_data(512);
    let mut reader = LimitedReader::new(Cursor::new(data.clone()));
    let handle = reader.limit_handle();

    let (tokens, token_rx) = mpsc::channel(4);
    reader.limit_with_channel(token_rx).await;
    wait_limited(&handle, true).await;

    reader.set_read_timeout(Some(Duration::from_millis(50)));
    let mut buf = [0u8; 512];
    match reader.read(&mut buf).await {
        Err(ReadError::Timeout) => {},
        other => panic!("expected timeout, got {:?}", other),
    }

    // The timed out read consumed nothing; the next grant reads from the very start.
    tokens.send(30).await.unwrap();
    let read = reader.read(&mut buf).await.unwrap();
    assert_eq!(read, 30);
    assert_eq!(&buf[..30], &data[..30]);
}

#[tokio::test]
async fn zero_tokens_on_the_feed_are_ignored() {
    let data = source_data(512);
    let mut reader = LimitedReader::new(Cursor::new(data.clone()));
    let handle = reader.limit_handle();

    let (tokens, token_rx) = mpsc::channel(4);
    reader.limit_with_channel(token_rx).await;
    wait_limited(&handle, true).await;

    // A zero quantity is not a grant; only the 20 should come through.
    tokens.send(0).await.unwrap();
    tokens.send(20).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    let mut buf = [0u8; 512];
    assert_eq!(reader.read(&mut buf).await.unwrap(), 20);
}

#[tokio::test]
async fn grants_are_clamped_to_the_buffer() {
    let data = source_data(512);
    let mut reader = LimitedReader::new(Cursor::new(data.clone()));
    let handle = reader.limit_handle();

    let (tokens, token_rx) = mpsc::channel(4);
    reader.limit_with_channel(token_rx).await;
    wait_limited(&handle, true).await;

    tokens.send(100).await.unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(reader.read(&mut buf).await.unwrap(), 16);
    assert_eq!(&buf[..], &data[..16]);
}

#[tokio::test]
async fn basic_rate_channel_drives_a_reader() {
    let data = source_data(4000);
    let mut reader = LimitedReader::new(Cursor::new(data.clone()));
    let handle = reader.limit_handle();

    let tokens = basic_rate_channel(80, Duration::from_millis(100));
    reader.limit_with_channel(tokens).await;
    wait_limited(&handle, true).await;

    let mut buf = [0u8; 512];
    let read = reader.read(&mut buf).await.unwrap();
    assert!(read >= 8 && read % 8 == 0, "unexpected read size {}", read);
    assert_eq!(&buf[..read], &data[..read]);
}

#[tokio::test]
async fn second_close_errors() {
    let mut reader = LimitedReader::new(Cursor::new(source_data(8)));
    reader.close().await.unwrap();
    match reader.close().await {
        Err(LimitError::Closed) => {},
        other => panic!("expected already closed, got {:?}", other),
    }
}
